//! Node pool scheduler / collect controller.
//!
//! Drives one [`ReadTask`] per collectable node while holding the number
//! of simultaneous BLE connections at or below the configured cap.
//! Admission is gated by a fair semaphore, so a finishing task frees its
//! slot for the next queued node immediately (sliding window), never in
//! batches. Unclassified nodes are resolved inline, one at a time,
//! before their task is admitted; the probe link is made while holding a
//! slot so classification traffic also counts against the cap.
//!
//! Each worker is joined under a long timeout; a task that exceeds it is
//! told to cancel (the device is stopped on its own exit path) and, if
//! truly wedged, aborted. A wedged radio never blocks the session
//! forever, and one device's failure never takes down the pass.

use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{mpsc::UnboundedSender, watch, Semaphore},
    task::JoinHandle,
    time::Duration,
};

use crate::{
    client::BleClient,
    config::{CollectorConfig, SamplingConfig},
    device::{
        discover_device_kind, instantiate_device, ConnectPolicy, DeviceError, NodeClass,
        SensorDevice,
    },
    read_task::{ReadTask, ReadTaskReport, TaskSignal},
    store::{NodeRecord, StoreError, StoreFactory},
    NodeId, SessionId,
};

/// Upper bound on one worker's lifetime before forced cancellation
const JOIN_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// How long a cancelled worker gets to run its stop path before abort
const CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Monitor join error: {0}")]
    Join(String),
}

/// Builds a concrete driver for a classified node; the seam that lets
/// tests run the scheduler against simulated devices
pub trait DeviceFactory: Send + Sync {
    fn create(
        &self,
        record: &NodeRecord,
        config: SamplingConfig,
    ) -> Option<Box<dyn SensorDevice>>;
}

/// Production factory: real drivers over the BLE client
pub struct BleDeviceFactory {
    client: Arc<dyn BleClient>,
}

impl BleDeviceFactory {
    pub fn new(client: Arc<dyn BleClient>) -> Self {
        Self { client }
    }
}

impl DeviceFactory for BleDeviceFactory {
    fn create(
        &self,
        record: &NodeRecord,
        config: SamplingConfig,
    ) -> Option<Box<dyn SensorDevice>> {
        instantiate_device(record, self.client.clone(), config)
    }
}

/// Everything a collection pass needs, threaded explicitly instead of
/// living in process globals
pub struct CollectorContext {
    pub config: CollectorConfig,
    pub store: Arc<dyn StoreFactory>,
    pub client: Arc<dyn BleClient>,
    pub devices: Arc<dyn DeviceFactory>,
}

#[derive(Debug, Default)]
pub struct CollectSummary {
    pub session_id: SessionId,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub reports: Vec<ReadTaskReport>,
}

/// Cancel trigger for a running collection pass; cheap to clone around
#[derive(Clone)]
pub struct CollectCancel(Arc<watch::Sender<bool>>);

impl CollectCancel {
    pub fn cancel(&self) {
        log::debug!("Data collection cancelled");
        self.0.send(true).ok();
    }
}

pub struct CollectorHandle {
    cancel: CollectCancel,
    monitor: JoinHandle<Result<CollectSummary, CollectorError>>,
}

impl CollectorHandle {
    pub fn canceller(&self) -> CollectCancel {
        self.cancel.clone()
    }

    /// Cancels in-flight tasks and joins the monitor
    pub async fn cancel(self) -> Result<CollectSummary, CollectorError> {
        self.cancel.cancel();
        self.join().await
    }

    pub async fn join(self) -> Result<CollectSummary, CollectorError> {
        self.monitor
            .await
            .map_err(|e| CollectorError::Join(e.to_string()))?
    }
}

/// Spawns a collection pass and returns its handle
pub fn spawn(ctx: CollectorContext, signals: UnboundedSender<TaskSignal>) -> CollectorHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let monitor = tokio::spawn(collect(ctx, signals, cancel_rx));

    CollectorHandle {
        cancel: CollectCancel(Arc::new(cancel_tx)),
        monitor,
    }
}

/// Runs one full collection pass to completion
pub async fn collect(
    ctx: CollectorContext,
    signals: UnboundedSender<TaskSignal>,
    cancel: watch::Receiver<bool>,
) -> Result<CollectSummary, CollectorError> {
    let now = chrono::Utc::now().timestamp();

    let session_id = {
        let mut store = ctx.store.open()?;
        if let Some(stale) = store.current_session()? {
            log::error!("A previous session (id {}) is still active. Closing it...", stale.id);
        }
        store.open_session(now)?
    };

    let nodes = {
        let mut store = ctx.store.open()?;
        store.collectable_nodes()?
    };

    log::info!(
        "Data collection started: session {session_id:}, {} candidate nodes",
        nodes.len()
    );

    let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_connections));
    let mut workers: Vec<(NodeId, JoinHandle<Option<ReadTaskReport>>)> = Vec::new();
    let mut skipped = 0usize;
    let mut admission_cancel = cancel.clone();

    for mut node in nodes {
        if *admission_cancel.borrow() {
            log::info!("Admission halted by cancellation");
            break;
        }

        if node.id.is_empty() {
            log::info!("Skipping blank node with address {}", node.address);
            skipped += 1;
            continue;
        }

        // Sliding-window admission: hold here until a connection slot
        // frees up, in node-list order (the semaphore is fair)
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
            _ = admission_cancel.changed() => {
                log::info!("Admission halted by cancellation");
                break;
            }
        };

        if node.class == NodeClass::Unknown {
            match classify_node(&ctx, &node).await {
                Ok((kind, class)) => {
                    node.kind = kind;
                    node.class = class;
                }
                Err(e) => {
                    log::error!("[{}] Failed to discover node classification: {e:}", node.id);
                    skipped += 1;
                    continue;
                }
            }
        }

        let Some(device) = ctx.devices.create(&node, ctx.config.sampling) else {
            log::debug!("[{}] Not a sampling-capable device ({})", node.id, node.kind);
            skipped += 1;
            continue;
        };

        log::debug!("Processing {}...", node.id);

        let (task_cancel_tx, task_cancel_rx) = watch::channel(false);
        let task = ReadTask::new(
            device,
            ctx.config.sampling,
            ctx.store.clone(),
            signals.clone(),
            task_cancel_rx,
        );

        let source = node.id.clone();
        let mut global_cancel = cancel.clone();

        let worker = tokio::spawn(async move {
            // The permit spans the whole worker, classification link
            // included, so the connection cap holds at every instant
            let _permit = permit;

            let mut run = tokio::spawn(task.run());

            let joined = tokio::select! {
                res = &mut run => Some(res),
                _ = global_cancel.changed() => None,
                _ = tokio::time::sleep(JOIN_TIMEOUT) => {
                    log::error!("[{source:}] Worker exceeded join timeout");
                    None
                }
            };

            match joined {
                Some(Ok(report)) => Some(report),
                Some(Err(e)) => {
                    log::error!("[{source:}] Read task join failed: {e:}");
                    None
                }
                None => {
                    // Told to stop: let the task run its stop path,
                    // abort only if the transport is truly wedged
                    task_cancel_tx.send(true).ok();
                    match tokio::time::timeout(CANCEL_GRACE, &mut run).await {
                        Ok(Ok(report)) => Some(report),
                        Ok(Err(e)) => {
                            log::error!("[{source:}] Read task join failed: {e:}");
                            None
                        }
                        Err(_) => {
                            log::error!("[{source:}] Read task wedged, aborting");
                            run.abort();
                            None
                        }
                    }
                }
            }
        });

        workers.push((node.id, worker));
    }

    // Monitor: drain every started worker
    let mut summary = CollectSummary {
        session_id,
        skipped,
        ..CollectSummary::default()
    };

    for (id, worker) in workers {
        match worker.await {
            Ok(Some(report)) => {
                log::debug!("Processed {id:}");
                if report.succeeded() {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                }
                summary.reports.push(report);
            }
            Ok(None) => summary.failed += 1,
            Err(e) => {
                log::error!("[{id:}] Worker join error: {e:}");
                summary.failed += 1;
            }
        }
    }

    summary.attempted = summary.succeeded + summary.failed;
    log::info!(
        "All nodes processed: {} succeeded, {} failed, {} skipped",
        summary.succeeded,
        summary.failed,
        summary.skipped
    );

    Ok(summary)
}

/// Resolves an unknown node's device kind by probing its GATT services
/// and caches the verdict. Connect failures skip the node without
/// caching so an unreachable device is retried next session; a
/// reachable device with no recognizable service is cached UNUSED and
/// never probed again.
async fn classify_node(
    ctx: &CollectorContext,
    node: &NodeRecord,
) -> Result<(crate::device::DeviceKind, NodeClass), CollectorError> {
    let policy = ConnectPolicy::classification();
    let (kind, class) = discover_device_kind(ctx.client.as_ref(), &node.address, &policy).await?;

    let mut store = ctx.store.open()?;
    store.record_classification(&node.id, &node.address, kind, class)?;

    Ok((kind, class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;
    use crate::device::{
        DeviceKind, BATTERY_LEVEL_CHAR, BLUNO_CTRL_SERVICE, FIRMWARE_REVISION_CHAR,
        PARROT_LIVE_SERVICE,
    };
    use crate::store::Store as _;
    use crate::testing::{MemoryStore, SimClient, SimDevice, SimPeripheralSpec, SimTracker};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc::unbounded_channel;
    use uuid::uuid;

    /// Factory producing SimDevices with per-node scripted cycle counts
    struct SimDeviceFactory {
        tracker: Arc<SimTracker>,
        cycles: Mutex<HashMap<String, u32>>,
    }

    impl SimDeviceFactory {
        fn new(cycles: &[(&str, u32)]) -> Self {
            Self {
                tracker: Arc::new(SimTracker::default()),
                cycles: Mutex::new(
                    cycles
                        .iter()
                        .map(|(name, n)| (name.to_string(), *n))
                        .collect(),
                ),
            }
        }
    }

    impl DeviceFactory for SimDeviceFactory {
        fn create(
            &self,
            record: &NodeRecord,
            _config: SamplingConfig,
        ) -> Option<Box<dyn SensorDevice>> {
            let cycles = *self.cycles.lock().unwrap().get(&record.id).unwrap_or(&1);
            Some(Box::new(
                SimDevice::named(&record.id)
                    .disconnect_after(cycles)
                    .with_shared_tracker(self.tracker.clone()),
            ))
        }
    }

    fn sensor_node(id: &str, octet: u8) -> NodeRecord {
        NodeRecord {
            kind: DeviceKind::Bluno,
            class: NodeClass::Sensor,
            ..NodeRecord::new(id, format!("C4:BE:84:28:89:{octet:02X}"))
        }
    }

    fn quick_sampling() -> SamplingConfig {
        SamplingConfig {
            max_sample_count: 1000,
            max_sampling_duration: tokio::time::Duration::from_secs(3600),
            read_interval: tokio::time::Duration::from_millis(50),
            ..SamplingConfig::default()
        }
    }

    fn test_context(
        store: &MemoryStore,
        client: Arc<SimClient>,
        devices: Arc<dyn DeviceFactory>,
        cap: usize,
    ) -> CollectorContext {
        CollectorContext {
            config: CollectorConfig {
                sampling: quick_sampling(),
                max_concurrent_connections: cap,
                ..CollectorConfig::default()
            },
            store: Arc::new(store.clone()),
            client,
            devices,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_cap_is_never_exceeded() {
        let store = MemoryStore::shared();
        // Spread of finish times so the window slides at varied rates
        let factory = Arc::new(SimDeviceFactory::new(&[
            ("SN1", 2),
            ("SN2", 9),
            ("SN3", 1),
            ("SN4", 14),
            ("SN5", 3),
            ("SN6", 7),
            ("SN7", 1),
            ("SN8", 11),
        ]));
        let tracker = factory.tracker.clone();

        for (i, id) in (1..=8).map(|i| (i, format!("SN{i}"))) {
            store.add_node(sensor_node(&id, i as u8));
        }

        let (signals, _rx) = unbounded_channel();
        let ctx = test_context(&store, Arc::new(SimClient::new()), factory, 3);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let summary = collect(ctx, signals, cancel_rx)
            .await
            .expect("collect");

        assert_eq!(summary.attempted, 8);
        assert_eq!(summary.succeeded, 8);
        assert!(tracker.max_concurrent() <= 3, "cap exceeded");
        assert!(tracker.max_concurrent() >= 2, "window never filled");
    }

    #[tokio::test(start_paused = true)]
    async fn slot_reuse_happens_on_single_completion_not_batch() {
        let store = MemoryStore::shared();
        // A finishes fast, B is slow; with a cap of 2, C must start as
        // soon as A's slot frees, long before B completes
        let factory = Arc::new(SimDeviceFactory::new(&[
            ("SN-A", 1),
            ("SN-B", 200),
            ("SN-C", 1),
        ]));
        let tracker = factory.tracker.clone();

        store.add_node(sensor_node("SN-A", 1));
        store.add_node(sensor_node("SN-B", 2));
        store.add_node(sensor_node("SN-C", 3));

        let (signals, _rx) = unbounded_channel();
        let ctx = test_context(&store, Arc::new(SimClient::new()), factory, 2);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let summary = collect(ctx, signals, cancel_rx)
            .await
            .expect("collect");

        assert_eq!(summary.succeeded, 3);

        let c_started = tracker.started_at("SN-C").expect("C ran");
        let b_finished = tracker.finished_at("SN-B").expect("B ran");
        assert!(
            c_started < b_finished,
            "third task waited for the whole batch"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn admission_follows_node_list_order() {
        let store = MemoryStore::shared();
        let factory = Arc::new(SimDeviceFactory::new(&[
            ("SN1", 5),
            ("SN2", 5),
            ("SN3", 5),
            ("SN4", 5),
        ]));
        let tracker = factory.tracker.clone();

        for i in 1..=4u8 {
            store.add_node(sensor_node(&format!("SN{i}"), i));
        }

        let (signals, _rx) = unbounded_channel();
        let ctx = test_context(&store, Arc::new(SimClient::new()), factory, 1);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        collect(ctx, signals, cancel_rx)
            .await
            .expect("collect");

        let starts = (1..=4)
            .map(|i| tracker.started_at(&format!("SN{i}")).expect("started"))
            .collect::<Vec<_>>();
        for pair in starts.windows(2) {
            assert!(pair[0] <= pair[1], "admission out of list order");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_node_is_classified_then_sampled_sequentially() {
        let store = MemoryStore::shared();
        let client = Arc::new(SimClient::new());

        // Node A: unclassified Parrot; full characteristic table so the
        // real soil driver can sample it
        let mut soil_chars: HashMap<uuid::Uuid, Vec<u8>> = HashMap::new();
        soil_chars.insert(BATTERY_LEVEL_CHAR, vec![87]);
        soil_chars.insert(FIRMWARE_REVISION_CHAR, b"hw_v1-fw_v1.1.0".to_vec());
        soil_chars.insert(
            uuid!("39e1fa01-84a8-11e2-afba-0002a5d5c51b"),
            100u16.to_le_bytes().to_vec(),
        );
        soil_chars.insert(
            uuid!("39e1fa02-84a8-11e2-afba-0002a5d5c51b"),
            885u16.to_le_bytes().to_vec(),
        );
        soil_chars.insert(
            uuid!("39e1fa03-84a8-11e2-afba-0002a5d5c51b"),
            20u16.to_le_bytes().to_vec(),
        );
        soil_chars.insert(
            uuid!("39e1fa04-84a8-11e2-afba-0002a5d5c51b"),
            21u16.to_le_bytes().to_vec(),
        );
        soil_chars.insert(
            uuid!("39e1fa05-84a8-11e2-afba-0002a5d5c51b"),
            30u16.to_le_bytes().to_vec(),
        );
        client.add_device(
            "C4:BE:84:28:89:0A",
            SimPeripheralSpec {
                services: vec![PARROT_LIVE_SERVICE],
                char_values: soil_chars,
                ..SimPeripheralSpec::default()
            },
        );

        // Node B: known Bluno pH probe
        client.add_device(
            "C4:BE:84:28:89:0B",
            SimPeripheralSpec {
                services: vec![BLUNO_CTRL_SERVICE],
                serial_script: vec!["pH=6.52;".to_string(), "pH=6.49;".to_string()],
                ..SimPeripheralSpec::default()
            },
        );

        store.add_node(NodeRecord::new("SN-A", "C4:BE:84:28:89:0A"));
        store.add_node(NodeRecord {
            kind: DeviceKind::Bluno,
            class: NodeClass::Sensor,
            ..NodeRecord::new("SN-B", "C4:BE:84:28:89:0B")
        });

        let (signals, _rx) = unbounded_channel();
        let devices = Arc::new(BleDeviceFactory::new(client.clone()));
        let ctx = CollectorContext {
            config: CollectorConfig {
                sampling: SamplingConfig {
                    max_sample_count: 2,
                    max_sampling_duration: tokio::time::Duration::from_secs(3600),
                    read_interval: tokio::time::Duration::from_millis(50),
                    ..SamplingConfig::default()
                },
                max_concurrent_connections: 1,
                ..CollectorConfig::default()
            },
            store: Arc::new(store.clone()),
            client: client.clone(),
            devices,
        };

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let summary = collect(ctx, signals, cancel_rx)
            .await
            .expect("collect");

        assert_eq!(summary.succeeded, 2);

        // Classification was resolved and cached
        let node_a = store.node("SN-A").expect("node A");
        assert_eq!(node_a.kind, DeviceKind::Parrot);
        assert_eq!(node_a.class, NodeClass::Sensor);

        // Never more than one link open, classification included
        assert_eq!(client.gauge().max_concurrent(), 1);

        // Both sources landed in the staging buffer
        let staged = store.staged_rows();
        let mut sources = staged.iter().map(|r| r.source.clone()).collect::<Vec<_>>();
        sources.sort();
        sources.dedup();
        assert_eq!(sources, vec!["SN-A".to_string(), "SN-B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_connect_recovers_and_records_retry_count() {
        let store = MemoryStore::shared();
        let client = Arc::new(SimClient::new());

        client.add_device(
            "C4:BE:84:28:89:0C",
            SimPeripheralSpec {
                services: vec![BLUNO_CTRL_SERVICE],
                serial_script: vec!["pH=7.01;".to_string()],
                connect_failures: 2,
                ..SimPeripheralSpec::default()
            },
        );

        store.add_node(NodeRecord {
            kind: DeviceKind::Bluno,
            class: NodeClass::Sensor,
            ..NodeRecord::new("SN-C", "C4:BE:84:28:89:0C")
        });

        let (signals, _rx) = unbounded_channel();
        let devices = Arc::new(BleDeviceFactory::new(client.clone()));
        let ctx = CollectorContext {
            config: CollectorConfig {
                sampling: SamplingConfig {
                    max_conn_retries: 5,
                    max_sample_count: 1,
                    max_sampling_duration: tokio::time::Duration::from_secs(3600),
                    read_interval: tokio::time::Duration::from_millis(50),
                    ..SamplingConfig::default()
                },
                max_concurrent_connections: 1,
                ..CollectorConfig::default()
            },
            store: Arc::new(store.clone()),
            client: client.clone(),
            devices,
        };

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let summary = collect(ctx, signals, cancel_rx)
            .await
            .expect("collect");

        assert_eq!(summary.succeeded, 1);
        let report = &summary.reports[0];
        assert!(!report.readings.is_empty());
        assert_eq!(report.connect_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_cancel_stops_in_flight_tasks_and_joins() {
        let store = MemoryStore::shared();
        let factory = Arc::new(SimDeviceFactory::new(&[("SN1", 100_000), ("SN2", 100_000)]));
        let tracker = factory.tracker.clone();

        store.add_node(sensor_node("SN1", 1));
        store.add_node(sensor_node("SN2", 2));

        let (signals, _rx) = unbounded_channel();
        let ctx = test_context(&store, Arc::new(SimClient::new()), factory, 2);

        let handle = spawn(ctx, signals);
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

        let summary = handle.cancel().await.expect("cancelled pass");

        // Both tasks were told to stop and ran their stop paths
        assert!(tracker.stopped("SN1"));
        assert!(tracker.stopped("SN2"));
        assert_eq!(summary.reports.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_named_nodes_are_skipped() {
        let store = MemoryStore::shared();
        let factory = Arc::new(SimDeviceFactory::new(&[("SN1", 1)]));

        store.add_node(sensor_node("", 9));
        store.add_node(sensor_node("SN1", 1));

        let (signals, _rx) = unbounded_channel();
        let ctx = test_context(&store, Arc::new(SimClient::new()), factory, 2);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let summary = collect(ctx, signals, cancel_rx)
            .await
            .expect("collect");

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_open_session_is_terminated_on_start() {
        let store = MemoryStore::shared();
        {
            let mut handle = store.open_direct();
            handle.open_session(1000).expect("stale session");
        }

        let factory = Arc::new(SimDeviceFactory::new(&[("SN1", 1)]));
        store.add_node(sensor_node("SN1", 1));

        let (signals, _rx) = unbounded_channel();
        let ctx = test_context(&store, Arc::new(SimClient::new()), factory, 2);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        collect(ctx, signals, cancel_rx)
            .await
            .expect("collect");

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 2);
        // The stale session was closed; exactly one session remains open
        assert!(sessions[0].end_time.is_some());
        assert!(sessions[1].end_time.is_none());
    }
}
