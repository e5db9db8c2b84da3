//! ingest-worker — consumes feed-run jobs and executes ingestion runs.
//!
//! Pipeline flow: scheduler → queue → ingest-worker → records + match
//! batches. Safe to run as many replicas as the queue can feed: job
//! bindings and per-feed advisory locks keep duplicate deliveries from
//! doing duplicate work.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use feedmill_core::{load_dotenv, Config};
use feedmill_ingest::fetch::{AlwaysEligible, TransportFetcher};
use feedmill_ingest::pg::PgStore;
use feedmill_ingest::{IngestWorker, Orchestrator};
use feedmill_notify::{Dispatcher, WebhookNotifier};
use feedmill_queue::{JobConsumer, JobProducer, MemoryJobQueue, SqsJobQueue};

/// Feed ingestion worker — runs fetched feeds through the pipeline.
#[derive(Parser, Debug)]
#[command(name = "ingest-worker", version, about)]
struct Cli {
    /// Messages to pull per poll.
    #[arg(long, env = "INGEST_BATCH_SIZE", default_value_t = 10)]
    batch_size: u32,

    /// Seconds to sleep between empty polls.
    #[arg(long, env = "INGEST_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let store = Arc::new(PgStore::connect(&config.postgres).await?);

    let (producer, consumer): (Arc<dyn JobProducer>, Arc<dyn JobConsumer>) =
        match config.queue.provider.as_str() {
            "sqs" => {
                let queue = Arc::new(SqsJobQueue::new(&config.queue).await?);
                (queue.clone(), queue)
            }
            _ => {
                let queue = Arc::new(MemoryJobQueue::new());
                (queue.clone(), queue)
            }
        };

    let mut dispatcher = Dispatcher::empty();
    if let Some(url) = &config.alert.webhook_url {
        dispatcher = Dispatcher::with_defaults(vec![Box::new(WebhookNotifier::new(
            url.clone(),
            None,
            Default::default(),
        )?)]);
        if let Err(e) = dispatcher.test_notify("run_failed", 0).await {
            warn!(error = %e, "webhook connectivity check failed; continuing");
        }
    }

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(TransportFetcher::new(&config.fetch)?),
        Arc::new(AlwaysEligible),
        producer,
        Arc::new(dispatcher),
        config.ingest.clone(),
    ));

    let worker = IngestWorker::new(orchestrator, consumer, cli.batch_size);

    info!("ingest-worker starting");
    worker.run(Duration::from_secs(cli.poll_interval)).await;
    Ok(())
}
