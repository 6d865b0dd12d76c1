// Standalone run against the simulated venue
// Run with: cargo run --example sim_session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use md_session::gateway::sim::{SimConfig, SimGateway};
use md_session::market_data::{MarketDataRecord, Pipeline, PipelineConfig};
use md_session::session::{Driver, DriverConfig, Session, SessionSettings};
use md_session::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info,md_session=debug", None)?;

    println!("Simulated market-data session");
    println!("=============================");
    println!("1. Connect and log in to the simulated venue");
    println!("2. Subscribe to rb2405, cu2403, ag2406");
    println!("3. Print best bid/ask per tick for a few seconds");
    println!("4. Drop the connection once and watch the driver recover");
    println!();

    let pipeline = Pipeline::start(
        PipelineConfig { workers: 2, ..PipelineConfig::default() },
        Arc::new(|r: &MarketDataRecord| {
            if let (Some(bid), Some(ask)) = (r.best_bid(), r.best_ask()) {
                println!("#{:<6} {:<8} {:>8.1} | {:>8.1} x {:<3} {:>8.1} x {:<3}", r.sequence, r.instrument, r.last_price, bid.price, bid.volume, ask.price, ask.volume);
            }
        }),
    )?;
    let session = Session::new(
        SessionSettings {
            instruments: vec!["rb2405".into(), "cu2403".into(), "ag2406".into()],
            ..SessionSettings::default()
        },
        pipeline,
    )?;

    let gateway = Arc::new(SimGateway::new(SimConfig { tick_interval: Duration::from_millis(200), ..SimConfig::default() }));
    session.init(gateway.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let driver = Driver::new(
        Arc::clone(&session),
        DriverConfig { addresses: vec!["tcp://127.0.0.1:41213".into()], ..DriverConfig::default() },
        Arc::clone(&shutdown),
    );
    let run = tokio::task::spawn_blocking(move || driver.run());

    tokio::time::sleep(Duration::from_secs(2)).await;
    gateway.drop_connection(0x2001);
    tokio::time::sleep(Duration::from_secs(3)).await;

    shutdown.store(true, Ordering::Release);
    run.await??;
    gateway.release();
    session.shutdown();

    let stats = session.pipeline().stats();
    println!();
    println!("received {} processed {} evicted {} p99 queue wait {}us", stats.received, stats.processed, stats.evicted, stats.latency_p99_us);
    Ok(())
}
