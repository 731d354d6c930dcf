//! Composite key derivation.
//!
//! Every scope the engine scores against (network, network + client,
//! device, account, account + device) is reduced to an opaque key:
//! `hex(HMAC-SHA256(secret, policy : key_type : scope parts))`. Keys are
//! stable across processes sharing the secret and never reveal the scope.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::types::{DeviceIdentity, RateLimitContext};

type HmacSha256 = Hmac<Sha256>;

/// Prefix length used as the "IP prefix" scope for IPv6 clients.
const IPV6_CLIENT_PREFIX: u8 = 64;

/// The kind of scope a composite key covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyType {
    /// Client network (IPv4 address or IPv6 /64)
    K1,
    /// IPv6 /48
    K1_48,
    /// IPv6 /40
    K1_40,
    /// IPv6 /32
    K1_32,
    /// Network + normalized user agent
    K2,
    /// Network + device fingerprint
    K3,
    /// Account
    K4,
    /// Account + device fingerprint
    K5,
}

/// Scope class used to pick a decay rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeClass {
    Ip,
    Device,
    Account,
}

impl KeyType {
    /// Name used in key derivation and in policy tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::K1 => "k1",
            KeyType::K1_48 => "k1_48",
            KeyType::K1_40 => "k1_40",
            KeyType::K1_32 => "k1_32",
            KeyType::K2 => "k2",
            KeyType::K3 => "k3",
            KeyType::K4 => "k4",
            KeyType::K5 => "k5",
        }
    }

    pub fn scope_class(&self) -> ScopeClass {
        match self {
            KeyType::K4 => ScopeClass::Account,
            KeyType::K3 | KeyType::K5 => ScopeClass::Device,
            _ => ScopeClass::Ip,
        }
    }

    /// Whether this key carries device-scoped state.
    pub fn is_device_scoped(&self) -> bool {
        matches!(self, KeyType::K3 | KeyType::K5)
    }

    /// Whether this key belongs to the network (`k1`) family.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            KeyType::K1 | KeyType::K1_48 | KeyType::K1_40 | KeyType::K1_32
        )
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of composite keys derived for one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeKeySet {
    pub k1: String,
    pub k1_48: Option<String>,
    pub k1_40: Option<String>,
    pub k1_32: Option<String>,
    pub k2: String,
    pub k3: Option<String>,
    pub k4: Option<String>,
    pub k5: Option<String>,
}

impl CompositeKeySet {
    /// All present keys, coarse network scopes first.
    pub fn entries(&self) -> Vec<(KeyType, &str)> {
        let mut entries = vec![(KeyType::K1, self.k1.as_str())];
        let optional = [
            (KeyType::K1_48, &self.k1_48),
            (KeyType::K1_40, &self.k1_40),
            (KeyType::K1_32, &self.k1_32),
        ];
        entries.extend(optional.into_iter().filter_map(|(kt, k)| k.as_deref().map(|k| (kt, k))));
        entries.push((KeyType::K2, self.k2.as_str()));
        let scoped = [
            (KeyType::K3, &self.k3),
            (KeyType::K4, &self.k4),
            (KeyType::K5, &self.k5),
        ];
        entries.extend(scoped.into_iter().filter_map(|(kt, k)| k.as_deref().map(|k| (kt, k))));
        entries
    }

    /// Look up a key by type.
    pub fn get(&self, key_type: KeyType) -> Option<&str> {
        match key_type {
            KeyType::K1 => Some(self.k1.as_str()),
            KeyType::K1_48 => self.k1_48.as_deref(),
            KeyType::K1_40 => self.k1_40.as_deref(),
            KeyType::K1_32 => self.k1_32.as_deref(),
            KeyType::K2 => Some(self.k2.as_str()),
            KeyType::K3 => self.k3.as_deref(),
            KeyType::K4 => self.k4.as_deref(),
            KeyType::K5 => self.k5.as_deref(),
        }
    }

    /// The same set with device-scoped keys removed.
    pub fn without_device_scope(&self) -> Self {
        Self {
            k3: None,
            k5: None,
            ..self.clone()
        }
    }
}

/// Derives composite keys with a shared HMAC secret.
#[derive(Clone)]
pub struct KeyBuilder {
    secret: Vec<u8>,
}

impl fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBuilder").finish_non_exhaustive()
    }
}

impl KeyBuilder {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Build every key applicable to this request.
    pub fn build(
        &self,
        policy_name: &str,
        context: &RateLimitContext,
        device: &DeviceIdentity,
    ) -> CompositeKeySet {
        let parsed = context.ip.trim().parse::<IpAddr>().ok();
        let ip_prefix = match parsed {
            Some(IpAddr::V4(v4)) => v4.to_string(),
            Some(IpAddr::V6(v6)) => ipv6_prefix(v6, IPV6_CLIENT_PREFIX),
            None => context.ip.trim().to_string(),
        };
        let v6_variant = |key_type: KeyType, bits: u8| match parsed {
            Some(IpAddr::V6(v6)) => {
                Some(self.derive(policy_name, key_type, &[ipv6_prefix(v6, bits).as_str()]))
            }
            _ => None,
        };
        let fingerprint = device.fingerprint_hash.as_deref();
        let account = context.account_id.map(|id| id.to_string());

        CompositeKeySet {
            k1: self.derive(policy_name, KeyType::K1, &[ip_prefix.as_str()]),
            k1_48: v6_variant(KeyType::K1_48, 48),
            k1_40: v6_variant(KeyType::K1_40, 40),
            k1_32: v6_variant(KeyType::K1_32, 32),
            k2: self.derive(policy_name, KeyType::K2, &[ip_prefix.as_str(), device.normalized_ua.as_str()]),
            k3: fingerprint.map(|fp| self.derive(policy_name, KeyType::K3, &[ip_prefix.as_str(), fp])),
            k4: account
                .as_deref()
                .map(|acct| self.derive(policy_name, KeyType::K4, &[acct])),
            k5: account
                .as_deref()
                .zip(fingerprint)
                .map(|(acct, fp)| self.derive(policy_name, KeyType::K5, &[acct, fp])),
        }
    }

    /// Derive one key. Scope parts are length-prefixed so that no two
    /// distinct part lists feed the MAC the same bytes.
    pub fn derive(&self, policy_name: &str, key_type: KeyType, parts: &[&str]) -> String {
        // HMAC accepts keys of any length, including empty.
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        };
        mac.update(policy_name.as_bytes());
        mac.update(b":");
        mac.update(key_type.as_str().as_bytes());
        for part in parts {
            mac.update(b":");
            mac.update(part.len().to_string().as_bytes());
            mac.update(b"#");
            mac.update(part.as_bytes());
        }
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Render the `/bits` network prefix of an IPv6 address.
fn ipv6_prefix(addr: Ipv6Addr, bits: u8) -> String {
    let mask = match bits {
        0 => 0,
        b if b >= 128 => u128::MAX,
        b => u128::MAX << (128 - u32::from(b)),
    };
    format!("{}/{}", Ipv6Addr::from(u128::from(addr) & mask), bits)
}
