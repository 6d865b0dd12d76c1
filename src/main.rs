use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use md_session::gateway::sim::SimGateway;
use md_session::market_data::{JsonLinesHandler, LogHandler, Pipeline, TickHandler};
use md_session::session::{Driver, Session};
use md_session::settings::Settings;
use md_session::telemetry;

#[derive(Parser, Debug)]
#[command(name = "md-session", version, about = "Market-data session client")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "md-session.toml")]
    config: PathBuf,
    /// Tracing filter directive, overrides log.level.
    #[arg(long)]
    log_filter: Option<String>,
    /// Extra instruments to subscribe after login.
    #[arg(long, value_delimiter = ',')]
    instruments: Vec<String>,
    /// Write processed records to stdout as JSON lines.
    #[arg(long)]
    json: bool,
    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.check().context("invalid configuration")?;

    let filter = cli
        .log_filter
        .clone()
        .unwrap_or_else(|| telemetry::level_filter(settings.log.level).to_string());
    let log_file = settings.log.path.as_deref().map(|p| (p, settings.log.rotation()));
    telemetry::init_tracing(&filter, log_file)?;
    telemetry::init_metrics();

    if cli.check {
        info!(config = %cli.config.display(), "Configuration ok");
        return Ok(());
    }

    std::fs::create_dir_all(&settings.gateway.flow_path)
        .with_context(|| format!("creating flow path {}", settings.gateway.flow_path))?;

    let mut session_settings = settings.session_settings()?;
    session_settings.instruments.extend(cli.instruments.iter().cloned());

    let handler: Arc<dyn TickHandler> = if cli.json {
        Arc::new(JsonLinesHandler::new(std::io::stdout()))
    } else {
        Arc::new(LogHandler)
    };
    let pipeline = Pipeline::start(settings.pipeline_config(), handler)?;
    let session = Session::new(session_settings, pipeline)?;

    let gateway = Arc::new(SimGateway::new(settings.sim_config()));
    session.init(gateway.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let driver = Driver::new(Arc::clone(&session), settings.driver_config(), Arc::clone(&shutdown));
    let mut run = tokio::task::spawn_blocking(move || driver.run());

    tokio::select! {
        res = &mut run => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            shutdown.store(true, Ordering::Release);
            // unblocks a driver parked in gateway.join()
            let stopper = Arc::clone(&gateway);
            let joined = tokio::task::spawn_blocking(move || {
                std::thread::sleep(std::time::Duration::from_millis(200));
                stopper.release();
            });
            run.await??;
            joined.await?;
        }
    }

    gateway.release();
    session.shutdown();
    let stats = session.pipeline().stats();
    info!(
        received = stats.received,
        processed = stats.processed,
        evicted = stats.evicted,
        rejected = stats.rejected,
        p99_us = stats.latency_p99_us,
        "Stopped"
    );
    Ok(())
}
