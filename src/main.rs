use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use adaptive_ratelimit::clock::{Clock, SystemClock};
use adaptive_ratelimit::config::RateLimiterConfig;
use adaptive_ratelimit::device::HintDeviceResolver;
use adaptive_ratelimit::error::RateLimiterError;
use adaptive_ratelimit::ratelimit::{
    Backends, PolicySet, RateLimitContext, RateLimitRequest, RateLimiterEngine,
};
use adaptive_ratelimit::store::MemoryStore;

/// How often expired in-memory store entries are purged.
const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "adaptive-ratelimit")]
#[command(about = "Evaluate newline-delimited JSON requests against adaptive rate limit policies")]
struct Args {
    /// Engine configuration file (YAML or TOML)
    #[arg(long)]
    config: Option<String>,

    /// Policy file, overriding `policies_path` from the configuration
    #[arg(long)]
    policies: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// One evaluation request read from stdin.
#[derive(Debug, Deserialize)]
struct EvaluationLine {
    policy: String,
    ip: String,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    account_id: Option<i64>,
    #[serde(default)]
    device_hint: Option<String>,
    #[serde(default)]
    trusted_session: bool,
    #[serde(default)]
    pre_check: bool,
    #[serde(default)]
    failure: bool,
    #[serde(default)]
    cost: Option<f64>,
}

impl EvaluationLine {
    fn into_parts(self) -> (RateLimitContext, RateLimitRequest) {
        let mut context = RateLimitContext::new(self.ip, self.user_agent, self.account_id)
            .with_trusted_session(self.trusted_session);
        if let Some(hint) = self.device_hint {
            context = context.with_device_hint(hint);
        }

        let mut request = RateLimitRequest::new(self.policy);
        if self.pre_check {
            request = request.pre_check();
        }
        if self.failure {
            request = request.failure();
        }
        if let Some(cost) = self.cost {
            request = request.with_cost(cost);
        }
        (context, request)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Adaptive Ratelimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = RateLimiterConfig::load(args.config.as_deref()).context("loading configuration")?;
    let policies_path = args
        .policies
        .or_else(|| config.policies_path.clone())
        .context("no policy file given (--policies or policies_path)")?;
    let policies = PolicySet::from_file(&policies_path)
        .with_context(|| format!("loading policies from {}", policies_path))?;
    info!(policies = policies.len(), path = %policies_path, "Policies loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let sweeper = store.spawn_sweeper(STORE_SWEEP_INTERVAL);
    let engine = RateLimiterEngine::new(
        &config,
        policies,
        Backends::from_memory(store),
        Arc::new(HintDeviceResolver::new()),
        clock,
    )?;
    info!("Rate limiter engine initialized, reading requests from stdin");

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.context("reading stdin")?;
        if let Some(out) = evaluate_line(&engine, &line).await? {
            stdout.write_all(&out).await?;
            stdout.flush().await?;
        }
    }

    sweeper.abort();
    info!("Adaptive Ratelimit stopped");
    Ok(())
}

/// Evaluate one input line, returning the verdict to print. Blank,
/// malformed and unknown-policy lines are logged and produce nothing.
async fn evaluate_line(engine: &RateLimiterEngine, line: &str) -> anyhow::Result<Option<Vec<u8>>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let (context, request) = match serde_json::from_str::<EvaluationLine>(line) {
        Ok(parsed) => parsed.into_parts(),
        Err(e) => {
            warn!(error = %e, "Skipping malformed request line");
            return Ok(None);
        }
    };

    match engine.limit(&context, &request).await {
        Ok(result) => {
            let mut out = serde_json::to_vec(&result)?;
            out.push(b'\n');
            Ok(Some(out))
        }
        Err(RateLimiterError::UnknownPolicy(name)) => {
            warn!(policy = %name, "Unknown policy");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Logs go to stderr; stdout carries verdicts only.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
