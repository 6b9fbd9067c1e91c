//! End-to-end collection driver: a full scheduler pass over simulated
//! probes (one unclassified soil probe, one known pH probe) against a
//! real sqlite store, followed by the session-end offload. Prints the
//! archived records framed the way the line-protocol handler would
//! serve them.

mod sim;

use std::sync::Arc;

use sylva_broker::{
    collector, BleDeviceFactory, CollectorConfig, CollectorContext, DeviceKind, NodeClass,
    NodeRecord, Store,
};
use sylvadb::{fetch_records, Consolidator, SqliteStoreFactory};

const ADDR_SOIL: &str = "A0:14:3D:08:B1:21";
const ADDR_PH: &str = "C4:BE:84:28:89:4A";

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    log::info!("Initializing database");
    let path = std::env::temp_dir().join(format!("sylva-collect-sim-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let db = Arc::new(SqliteStoreFactory::new(path.to_str().expect("utf8 path"))?);

    {
        let mut store = db.open_store()?;

        // SN-SOIL starts unclassified and must be resolved by service
        // discovery before it is sampled
        store.upsert_node(&NodeRecord::new("SN-SOIL", ADDR_SOIL))?;
        store.upsert_node(&NodeRecord {
            kind: DeviceKind::Bluno,
            class: NodeClass::Sensor,
            ..NodeRecord::new("SN-PH", ADDR_PH)
        })?;

        // Tighten the sampling parameters for the simulation
        store.set_param("MAX_SAMPLE_COUNT", "3")?;
        store.set_param("READ_INTERVAL", "0.05")?;
        store.set_param("MAX_SAMPLING_DURATION", "30")?;
    }

    log::info!("Initializing simulated radio pool");
    let client = Arc::new(sim::SimBleClient::new());
    client.add_soil_probe(ADDR_SOIL);
    client.add_ph_probe(ADDR_PH, &["pH=6.52;", "pH=6.49;", "pH=6.61;"]);

    let config = {
        let mut store = db.open_store()?;
        CollectorConfig::load(&mut store)?
    };

    let ctx = CollectorContext {
        config,
        store: db.clone(),
        client: client.clone(),
        devices: Arc::new(BleDeviceFactory::new(client.clone())),
    };

    let (signals_tx, mut signals_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(signal) = signals_rx.recv().await {
            log::info!("Task signal: {signal:?}");
        }
    });

    log::info!("Starting collection pass");
    let handle = collector::spawn(ctx, signals_tx);
    let summary = handle.join().await?;

    log::info!(
        "Collection finished: {} succeeded / {} attempted, {} skipped",
        summary.succeeded,
        summary.attempted,
        summary.skipped
    );

    assert_eq!(summary.succeeded, 2, "both probes should be sampled");
    assert!(
        client.max_concurrent() <= config.max_concurrent_connections,
        "connection cap violated"
    );

    // Classification verdict must be cached
    {
        let mut store = db.open_store()?;
        let soil = store.get_node("SN-SOIL")?.expect("soil node present");
        assert_eq!(soil.kind, DeviceKind::Parrot);
        assert_eq!(soil.class, NodeClass::Sensor);
    }

    log::info!("Closing session and offloading");
    let mut store = db.open_store()?;
    store.terminate_session(chrono::Utc::now().timestamp())?;

    let consolidator = Consolidator::new(config.expected_fields_soil, config.expected_fields_ph);
    let stats = consolidator.offload_session(&mut store, summary.session_id)?;

    log::info!(
        "Offload: {} records written ({} partial), {} staged rows cleared",
        stats.records_written,
        stats.partials_flushed,
        stats.staged_cleared
    );

    assert!(stats.records_written > 0, "no records archived");

    let records = fetch_records(&mut store, None, None, 0, i32::MAX)?;
    let mut sources = records
        .iter()
        .map(|r| r.origin.name.clone())
        .collect::<Vec<_>>();
    sources.sort();
    sources.dedup();
    assert_eq!(sources, vec!["SN-PH".to_string(), "SN-SOIL".to_string()]);

    for record in &records {
        println!("RDATA:{};", serde_json::to_string(record)?);
    }

    log::info!("collect-sim-test passed");
    Ok(())
}
