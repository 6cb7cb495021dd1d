/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Running alignment gateway with graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use umfutures_adapter::{ExchangeDriver, SimExchange};
use umfutures_align::{Engine, GatewayConfig, RuleTable};

#[derive(Parser, Debug)]
#[command(
    name = "umfutures-align",
    version,
    about = "Position alignment gateway for USD-margined futures"
)]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Write daily-rolled log files here instead of stdout
    #[arg(long = "log-dir", value_name = "DIR")]
    log_dir: Option<PathBuf>,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Trade against the in-process simulated venue instead of a live driver
    #[arg(long = "paper")]
    paper: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let _log_guard = init_tracing(&args.log_level, args.log_dir.as_deref())?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        paper = args.paper,
        "starting umfutures-align"
    );

    let config = load_config(&args.config_path)?;
    let rules = load_rules(&config)?;
    info!(symbols = rules.len(), "trading rules loaded");

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    // Initialisation order: rules -> driver -> caches/engine -> workers.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let driver: Arc<dyn ExchangeDriver> = if args.paper {
        Arc::new(SimExchange::new(event_tx))
    } else {
        // A live wire driver plugs in here behind the same trait.
        return Err(anyhow!(
            "no live exchange driver is wired into this build; run with --paper"
        ));
    };

    let engine = Engine::new(config, rules, driver, event_rx);
    let shutdown = engine.shutdown_token();
    setup_signal_handlers(shutdown.clone());

    let handle = engine.start();
    info!("engine running");

    shutdown.cancelled().await;
    info!("shutdown signal received");

    handle.shutdown_and_wait().await.context("shutdown engine")?;
    info!("engine shutdown complete");

    Ok(())
}

fn init_tracing(
    log_level: &str,
    log_dir: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "umfutures-align.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|err| anyhow!(err))
                .context("initialize tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|err| anyhow!(err))
                .context("initialize tracing subscriber")?;
            Ok(None)
        }
    }
}

fn load_config(path: &PathBuf) -> Result<GatewayConfig> {
    let path_str = path.to_str().context("config path must be valid utf-8")?;
    GatewayConfig::from_file(path_str).context("load config")
}

fn load_rules(config: &GatewayConfig) -> Result<Arc<RuleTable>> {
    let path = config
        .exchange_info_file
        .as_ref()
        .context("exchange_info_file must be set so trading rules can load")?;
    let blob = std::fs::read_to_string(path)
        .with_context(|| format!("read exchange info {}", path.display()))?;
    let table = RuleTable::from_json(&blob).context("parse exchange info")?;
    if table.is_empty() {
        return Err(anyhow!("exchange info produced no usable trading rules"));
    }
    Ok(Arc::new(table))
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
