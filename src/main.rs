use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tollgate::config::TollgateConfig;
use tollgate::edge::{EdgeHandler, EdgeRequest, Stage};
use tollgate::quota::{Clock, SystemClock};
use tollgate::store::InMemoryStore;

/// How often expired records are swept from the in-process store.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Edge admission control: reads request events as JSON lines on stdin and
/// writes one forward/respond outcome per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file, overridable with TOLLGATE__* variables
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Admission tiers to run: viewer, origin or full
    #[arg(short, long, default_value_t = Stage::Full)]
    stage: Stage,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Tollgate admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(args.config.as_deref())?;
    info!(stage = %args.stage, policy = ?config.policy, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let handler = EdgeHandler::from_config(&config, store.clone(), clock, args.stage)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut purge = tokio::time::interval(PURGE_INTERVAL);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = purge.tick() => {
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, remaining = store.len(), "Purged expired records");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let request: EdgeRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed request event");
                        continue;
                    }
                };

                let span = info_span!("request", request_id = %Uuid::new_v4(), uri = %request.uri);
                let outcome = handler.handle(request).instrument(span).await;

                let mut encoded = serde_json::to_vec(&outcome)?;
                encoded.push(b'\n');
                stdout.write_all(&encoded).await?;
                stdout.flush().await?;
            }
        }
    }

    info!("Tollgate admission control stopped");
    Ok(())
}

/// Install the global subscriber; logs go to stderr since stdout carries
/// outcomes.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
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
