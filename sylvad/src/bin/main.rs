use std::sync::Arc;

use actix::Actor;
use sylva_broker::{BleClient, BtleClient};
use sylvad::{Activate, Aggregator, AggregatorResult, Shutdown};
use sylvadb::SqliteStoreFactory;

use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

const DATABASE_URL: &str = "sylva_cache.db";

#[actix::main]
async fn main() -> AggregatorResult<()> {
    LogTracer::init().expect("Unable to set up log tracer");

    let log = rolling::daily("./logs", "debug");
    let (nb, _guard) = tracing_appender::non_blocking(log);

    let sub = FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(nb)
        .finish();

    tracing::subscriber::set_global_default(sub).expect("Unable to set up tracing subscriber");

    log::info!("Starting sylva aggregator");

    let db = Arc::new(SqliteStoreFactory::new(DATABASE_URL)?);
    let client: Arc<dyn BleClient> = Arc::new(BtleClient::new().await?);

    let aggregator = Aggregator::new(db, client)?;
    let addr = aggregator.start();

    addr.send(Activate).await.ok();

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupt received, shutting down");

    addr.send(Shutdown).await.ok();

    Ok(())
}
