//! feed-scheduler — periodic scheduling pass over due feeds.
//!
//! Scans for enabled feeds whose next run is due and enqueues one
//! feed-run job per (feed, window). Running more than one instance is
//! harmless: windowed job identity collapses the duplicates at the
//! queue.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use feedmill_core::{load_dotenv, Config};
use feedmill_ingest::pg::PgStore;
use feedmill_ingest::Scheduler;
use feedmill_queue::{JobProducer, MemoryJobQueue, SqsJobQueue};

/// Feed scheduler — turns due feeds into queued run jobs.
#[derive(Parser, Debug)]
#[command(name = "feed-scheduler", version, about)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let store = Arc::new(PgStore::connect(&config.postgres).await?);

    let producer: Arc<dyn JobProducer> = match config.queue.provider.as_str() {
        "sqs" => Arc::new(SqsJobQueue::new(&config.queue).await?),
        _ => Arc::new(MemoryJobQueue::new()),
    };

    let scheduler = Scheduler::new(store, producer, config.ingest.clone());

    info!("feed-scheduler starting");
    scheduler.run().await;
    Ok(())
}
