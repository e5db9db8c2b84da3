//! alert-worker — consumes evaluation jobs and delivers notifications
//! through the claim protocol.
//!
//! Safe to run as many replicas as needed: the claim on each
//! (subscription, rule) slot is what serializes delivery, not the
//! worker count.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use feedmill_alert::{AlertDelivery, AlertWorker, PgSlotStore};
use feedmill_core::{load_dotenv, Config};
use feedmill_notify::{Dispatcher, WebhookNotifier};
use feedmill_queue::{JobConsumer, MemoryJobQueue, SqsJobQueue};

/// Alert delivery worker — claims, sends, commits.
#[derive(Parser, Debug)]
#[command(name = "alert-worker", version, about)]
struct Cli {
    /// Messages to pull per poll.
    #[arg(long, env = "ALERT_BATCH_SIZE", default_value_t = 10)]
    batch_size: u32,

    /// Seconds to sleep between empty polls.
    #[arg(long, env = "ALERT_POLL_INTERVAL_SECS", default_value_t = 5)]
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

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.connection_string())
        .await?;
    let slots = Arc::new(PgSlotStore::new(pool));

    let consumer: Arc<dyn JobConsumer> = match config.queue.provider.as_str() {
        "sqs" => Arc::new(SqsJobQueue::new(&config.queue).await?),
        _ => Arc::new(MemoryJobQueue::new()),
    };

    let mut dispatcher = Dispatcher::empty();
    if let Some(url) = &config.alert.webhook_url {
        dispatcher = Dispatcher::with_defaults(vec![Box::new(WebhookNotifier::new(
            url.clone(),
            None,
            Default::default(),
        )?)]);
        if let Err(e) = dispatcher.test_notify("price_drop", 0).await {
            warn!(error = %e, "webhook connectivity check failed; continuing");
        }
    }

    let delivery = Arc::new(AlertDelivery::new(
        slots,
        Arc::new(dispatcher),
        config.alert.cooldown(),
        config.alert.stale_threshold(),
    ));

    let worker = AlertWorker::new(delivery, consumer, cli.batch_size);

    info!("alert-worker starting");
    worker.run(Duration::from_secs(cli.poll_interval)).await;
    Ok(())
}
