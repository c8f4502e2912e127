use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::ratelimit::{spawn_cleanup, Enforcement, RateLimiter};
use gatekeeper::store::{CounterStore, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version)]
#[command(about = "Multi-strategy admission control engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and compile every rule, then print a summary
    Validate {
        /// Path to the configuration file
        #[arg(long, short, value_name = "FILE")]
        config: PathBuf,
    },
    /// Read `identifier endpoint [cost]` lines from stdin and print one JSON
    /// verdict per line
    Check {
        /// Path to the configuration file
        #[arg(long, short, value_name = "FILE")]
        config: PathBuf,

        /// Redis URL, overriding `store.redis_url`
        #[arg(long, value_name = "URL")]
        redis_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Check { config, redis_url } => check(config, redis_url).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<GatekeeperConfig> {
    GatekeeperConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&path)?;
    init_tracing(&config.logging);
    info!(path = %path.display(), "Configuration loaded");

    let matcher = config.build_matcher().context("Invalid rule configuration")?;

    println!("{} rule(s) in {}", matcher.len(), path.display());
    for rule in matcher.rules() {
        println!(
            "  {:<20} {:<24} {:<15} {:>6}/{:<6}s {}",
            rule.name(),
            rule.pattern(),
            rule.strategy().as_str(),
            rule.max_requests(),
            rule.window().as_secs(),
            rule.action().as_str(),
        );
    }
    Ok(())
}

async fn check(path: PathBuf, redis_url: Option<String>) -> anyhow::Result<()> {
    let mut config = load_config(&path)?;
    if redis_url.is_some() {
        config.store.redis_url = redis_url;
    }
    init_tracing(&config.logging);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(path = %path.display(), "Configuration loaded");

    let matcher = config.build_matcher().context("Invalid rule configuration")?;
    info!(rules = matcher.len(), "Rules loaded");

    let mut limiter = RateLimiter::new(matcher).with_settings(&config.limiter);

    if let Some(url) = &config.store.redis_url {
        match RedisStore::connect(url, &config.store.key_prefix, config.store.timeout()).await {
            Ok(store) => {
                let store: Arc<dyn CounterStore> = Arc::new(store);
                limiter = limiter.with_distributed(store, config.store.timeout());
            }
            Err(e) if config.limiter.graceful_degradation => {
                warn!(error = %e, "Redis unavailable, serving from the local store until it connects");
                let store: Arc<dyn CounterStore> =
                    Arc::new(RedisStore::lazy(url, &config.store.key_prefix)?);
                limiter = limiter.with_distributed_pending(store, config.store.timeout());
            }
            Err(e) => {
                return Err(e).context("Failed to connect to Redis and graceful degradation is off");
            }
        }
    } else {
        info!("No distributed store configured, running on the local store only");
    }

    let limiter = Arc::new(limiter);
    let cleanup = spawn_cleanup(limiter.clone(), config.limiter.cleanup_interval());

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
            None => break,
        };

        let Some((identifier, endpoint, cost)) = parse_request(&line) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Expected `identifier endpoint [cost]`");
            }
            continue;
        };

        let result = limiter.check(identifier, endpoint, cost).await;
        let enforcement = Enforcement::from(&result);
        let verdict = serde_json::json!({
            "identifier": identifier,
            "endpoint": endpoint,
            "status": enforcement.status_code(),
            "result": result,
        });

        stdout.write_all(format!("{}\n", verdict).as_bytes()).await?;
        stdout.flush().await?;
    }

    cleanup.shutdown().await;

    let snapshot = limiter.metrics().snapshot();
    stdout
        .write_all(format!("{}\n", serde_json::json!({ "metrics": snapshot })).as_bytes())
        .await?;
    stdout.flush().await?;

    info!("Gatekeeper stopped");
    Ok(())
}

/// Split `identifier endpoint [cost]`. A missing or unparsable cost is 1.
fn parse_request(line: &str) -> Option<(&str, &str, u32)> {
    let mut parts = line.split_whitespace();
    let identifier = parts.next()?;
    let endpoint = parts.next()?;
    let cost = parts.next().and_then(|c| c.parse().ok()).unwrap_or(1);
    Some((identifier, endpoint, cost))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
