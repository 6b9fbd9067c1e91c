//! Aggregator control actor.
//!
//! The actor's mailbox serializes every lifecycle transition: activate,
//! deactivate, start/stop collection, parameter updates, scans, idle
//! extension, shutdown. Collection itself runs in the background via
//! the broker's collector; its completion comes back to the mailbox as
//! [`CollectionEnded`], which closes the capture session, runs the
//! offload pass, and re-arms the collection timer while deployed.

use actix::prelude::*;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_stream::wrappers::UnboundedReceiverStream;

use sylva_broker::{
    collector, config::PARAM_DEPLOYMENT_STATUS, BleClient, BleDeviceFactory, CollectCancel,
    CollectSummary, CollectorConfig, CollectorContext, DeviceFactory, DeviceKind, DeviceRecord,
    NodeRecord, Store, StoreFactory, TaskSignal,
};
use sylvadb::{Consolidator, SqliteStoreFactory};

use crate::{AggregatorError, AggregatorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Unknown,
    Terminating,
    Inactive,
    Idle,
    Scanning,
    Gathering,
    Saving,
}

impl std::fmt::Display for AggregatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AggregatorState::Unknown => "UNKNOWN",
            AggregatorState::Terminating => "TERMINATING",
            AggregatorState::Inactive => "INACTIVE",
            AggregatorState::Idle => "IDLE",
            AggregatorState::Scanning => "SCANNING",
            AggregatorState::Gathering => "GATHERING",
            AggregatorState::Saving => "SAVING",
        };
        write!(f, "{name}")
    }
}

pub struct Aggregator {
    db: Arc<SqliteStoreFactory>,
    client: Arc<dyn BleClient>,
    devices: Arc<dyn DeviceFactory>,
    config: CollectorConfig,
    state: AggregatorState,
    deployed: bool,
    collector: Option<CollectCancel>,
    collection_timer: Option<SpawnHandle>,
    idle_out_timer: Option<SpawnHandle>,
}

impl Aggregator {
    pub fn new(db: Arc<SqliteStoreFactory>, client: Arc<dyn BleClient>) -> AggregatorResult<Self> {
        let devices = Arc::new(BleDeviceFactory::new(client.clone()));
        Self::with_device_factory(db, client, devices)
    }

    /// Seam for driving the daemon with simulated devices
    pub fn with_device_factory(
        db: Arc<SqliteStoreFactory>,
        client: Arc<dyn BleClient>,
        devices: Arc<dyn DeviceFactory>,
    ) -> AggregatorResult<Self> {
        let (config, deployed) = {
            let mut store = db.open_store()?;
            let config = CollectorConfig::load(&mut store)?;
            let deployed = matches!(
                store.get_param(PARAM_DEPLOYMENT_STATUS)?.as_deref(),
                Some("1")
            );
            (config, deployed)
        };

        Ok(Self {
            db,
            client,
            devices,
            config,
            state: AggregatorState::Unknown,
            deployed,
            collector: None,
            collection_timer: None,
            idle_out_timer: None,
        })
    }

    fn set_state(&mut self, state: AggregatorState) {
        self.state = state;
        log::debug!("[AGGREGATOR] State changed: {state:}");
    }

    fn persist_deployment_status(&self) {
        let value = if self.deployed { "1" } else { "0" };
        match self.db.open_store() {
            Ok(mut store) => {
                if let Err(e) = store.set_param(PARAM_DEPLOYMENT_STATUS, value) {
                    log::error!("Failed to persist deployment status: {e:}");
                }
            }
            Err(e) => log::error!("Failed to open store handle: {e:}"),
        }
    }

    fn reload_system_params(&mut self) {
        match self.db.open_store() {
            Ok(mut store) => match CollectorConfig::load(&mut store) {
                Ok(config) => {
                    log::debug!(
                        "[AGGREGATOR] Parameters: collection interval = {:?}, \
                        idle out interval = {:?}, max connections = {}",
                        config.collection_interval,
                        config.idle_out_interval,
                        config.max_concurrent_connections
                    );
                    self.config = config;
                }
                Err(e) => log::error!("Failed to reload system params: {e:}"),
            },
            Err(e) => log::error!("Failed to open store handle: {e:}"),
        }
    }

    fn arm_collection_timer(&mut self, ctx: &mut Context<Self>) {
        self.cancel_collection_timer(ctx);
        log::debug!("Starting collection timer...");
        self.collection_timer = Some(ctx.run_later(self.config.collection_interval, |_, ctx| {
            ctx.notify(StartCollect);
        }));
    }

    fn cancel_collection_timer(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.collection_timer.take() {
            ctx.cancel_future(handle);
        }
    }

    fn arm_idle_out_timer(&mut self, ctx: &mut Context<Self>) {
        self.cancel_idle_out_timer(ctx);
        self.idle_out_timer = Some(ctx.run_later(self.config.idle_out_interval, |_, ctx| {
            log::info!("System has idled out.");
            ctx.notify(Shutdown);
        }));
    }

    fn cancel_idle_out_timer(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.idle_out_timer.take() {
            ctx.cancel_future(handle);
        }
    }

    /// Closes the capture session and drains the staging buffer into
    /// permanent records
    fn close_session_and_offload(&mut self, summary: Option<&CollectSummary>) {
        let now = Utc::now().timestamp();

        let mut store = match self.db.open_store() {
            Ok(store) => store,
            Err(e) => {
                log::error!("Failed to open store handle: {e:}");
                return;
            }
        };

        use sylva_broker::Store;

        let session_id = summary.map(|s| s.session_id).or_else(|| {
            store
                .current_session()
                .ok()
                .flatten()
                .map(|session| session.id)
        });

        if let Err(e) = store.terminate_session(now) {
            log::error!("Failed to terminate session: {e:}");
        }

        let Some(session_id) = session_id else {
            log::warn!("No session to offload");
            return;
        };

        let consolidator = Consolidator::new(
            self.config.expected_fields_soil,
            self.config.expected_fields_ph,
        );

        if let Err(e) = consolidator.offload_session(&mut store, session_id) {
            log::error!("Offload failed for session {session_id:}: {e:}");
        }
    }

    fn spawn_signal_drain(receiver: UnboundedReceiver<TaskSignal>) {
        tokio::spawn(async move {
            let mut stream = UnboundedReceiverStream::new(receiver);
            while let Some(signal) = stream.next().await {
                match signal {
                    TaskSignal::Read { source } => log::debug!("[{source:}] Read event"),
                    TaskSignal::Error { source } => {
                        log::warn!("[{source:}] Device reported an error")
                    }
                    TaskSignal::Done { source } => {
                        log::debug!("[{source:}] Device finished sampling")
                    }
                }
            }
        });
    }
}

impl Actor for Aggregator {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.set_state(AggregatorState::Inactive);
        self.arm_idle_out_timer(ctx);

        if self.deployed {
            log::info!("Node was deployed before restart, reactivating");
            ctx.notify(Activate);
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Activate;

impl Handler<Activate> for Aggregator {
    type Result = ();

    fn handle(&mut self, _msg: Activate, ctx: &mut Self::Context) -> Self::Result {
        log::info!("[TASK] Activating node");
        self.set_state(AggregatorState::Idle);
        self.deployed = true;
        self.persist_deployment_status();
        self.arm_idle_out_timer(ctx);
        ctx.notify(StartCollect);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Deactivate;

impl Handler<Deactivate> for Aggregator {
    type Result = ();

    fn handle(&mut self, _msg: Deactivate, ctx: &mut Self::Context) -> Self::Result {
        log::info!("[TASK] Deactivating node");
        self.cancel_collection_timer(ctx);

        if matches!(
            self.state,
            AggregatorState::Idle | AggregatorState::Inactive | AggregatorState::Unknown
        ) {
            self.set_state(AggregatorState::Inactive);
        }

        self.deployed = false;
        self.persist_deployment_status();
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct StartCollect;

impl Handler<StartCollect> for Aggregator {
    type Result = ();

    fn handle(&mut self, _msg: StartCollect, ctx: &mut Self::Context) -> Self::Result {
        log::info!("[TASK] Starting data collection");

        if self.collector.is_some() {
            log::debug!("Data collection already running");
            return;
        }

        self.set_state(AggregatorState::Gathering);
        self.cancel_collection_timer(ctx);

        let store: Arc<dyn StoreFactory> = self.db.clone();
        let collect_ctx = CollectorContext {
            config: self.config,
            store,
            client: self.client.clone(),
            devices: self.devices.clone(),
        };

        let (signals_tx, signals_rx) = unbounded_channel();
        Self::spawn_signal_drain(signals_rx);

        let handle = collector::spawn(collect_ctx, signals_tx);
        self.collector = Some(handle.canceller());

        let addr = ctx.address();
        tokio::spawn(async move {
            let summary = match handle.join().await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    log::error!("Collection pass failed: {e:}");
                    None
                }
            };
            addr.do_send(CollectionEnded { summary });
        });
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct StopCollect;

impl Handler<StopCollect> for Aggregator {
    type Result = ();

    fn handle(&mut self, _msg: StopCollect, _ctx: &mut Self::Context) -> Self::Result {
        log::info!("[TASK] Stopping data collection");

        match &self.collector {
            Some(canceller) => canceller.cancel(),
            None => log::debug!("No data collection in progress"),
        }
    }
}

/// Sent back to the mailbox when a collection pass has fully drained
#[derive(Message)]
#[rtype(result = "()")]
pub struct CollectionEnded {
    pub summary: Option<CollectSummary>,
}

impl Handler<CollectionEnded> for Aggregator {
    type Result = ();

    fn handle(&mut self, msg: CollectionEnded, ctx: &mut Self::Context) -> Self::Result {
        self.collector = None;

        if let Some(summary) = &msg.summary {
            log::info!(
                "Sampling ended: {} of {} nodes succeeded ({} skipped)",
                summary.succeeded,
                summary.attempted,
                summary.skipped
            );
        }

        let terminating = self.state == AggregatorState::Terminating;
        if !terminating {
            self.set_state(AggregatorState::Saving);
        }

        self.close_session_and_offload(msg.summary.as_ref());

        if terminating {
            ctx.stop();
            return;
        }

        // Pick up any parameter changes made while gathering
        self.reload_system_params();

        if self.deployed {
            self.arm_collection_timer(ctx);
            self.set_state(AggregatorState::Idle);
        } else {
            self.set_state(AggregatorState::Inactive);
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct SetParam {
    pub name: String,
    pub value: String,
}

impl Handler<SetParam> for Aggregator {
    type Result = ();

    fn handle(&mut self, msg: SetParam, _ctx: &mut Self::Context) -> Self::Result {
        log::info!("[TASK] Setting system param {}", msg.name);

        match self.db.open_store() {
            Ok(mut store) => {
                if let Err(e) = store.set_param(&msg.name, &msg.value) {
                    log::error!("Failed to set param {}: {e:}", msg.name);
                    return;
                }
            }
            Err(e) => {
                log::error!("Failed to open store handle: {e:}");
                return;
            }
        }

        self.reload_system_params();
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ExtendIdle;

impl Handler<ExtendIdle> for Aggregator {
    type Result = ();

    fn handle(&mut self, _msg: ExtendIdle, ctx: &mut Self::Context) -> Self::Result {
        log::info!("[TASK] Extending idle period");
        self.arm_idle_out_timer(ctx);
    }
}

/// Scan for advertising devices and register any new ones as
/// unclassified nodes
#[derive(Message)]
#[rtype(result = "()")]
pub struct Scan {
    pub window: tokio::time::Duration,
}

impl Handler<Scan> for Aggregator {
    type Result = ();

    fn handle(&mut self, msg: Scan, ctx: &mut Self::Context) -> Self::Result {
        log::info!("[TASK] Updating network");
        self.set_state(AggregatorState::Scanning);

        let client = self.client.clone();
        let db = self.db.clone();
        let addr = ctx.address();
        let window = msg.window;

        tokio::spawn(async move {
            let mut found = 0usize;

            match client.scan(window).await {
                Ok(devices) => {
                    for device in devices {
                        let Some(name) = device.local_name else {
                            continue;
                        };

                        if let Err(e) = register_scanned(&db, &name, &device.address) {
                            log::error!("[{name:}] Failed to register scanned device: {e:}");
                        } else {
                            found += 1;
                        }
                    }
                }
                Err(e) => log::error!("Scan failed: {e:}"),
            }

            addr.do_send(ScanComplete { found });
        });
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub(crate) struct ScanComplete {
    found: usize,
}

impl Handler<ScanComplete> for Aggregator {
    type Result = ();

    fn handle(&mut self, msg: ScanComplete, _ctx: &mut Self::Context) -> Self::Result {
        log::info!("Scan finished: {} devices registered or refreshed", msg.found);

        if self.state == AggregatorState::Scanning {
            let state = if self.deployed {
                AggregatorState::Idle
            } else {
                AggregatorState::Inactive
            };
            self.set_state(state);
        }
    }
}

/// Known devices keep their cached classification; only unseen names
/// are registered, as unclassified
fn register_scanned(
    db: &Arc<SqliteStoreFactory>,
    name: &str,
    address: &str,
) -> Result<(), AggregatorError> {
    use sylva_broker::Store;

    let mut store = db.open_store()?;

    if store.get_node(name)?.is_some() {
        return Ok(());
    }

    store.upsert_node(&NodeRecord::new(name, address))?;
    store.upsert_device(&DeviceRecord {
        address: address.to_string(),
        node_id: name.to_string(),
        kind: DeviceKind::Unknown,
        last_scanned: Some(Utc::now().timestamp()),
        last_comms: None,
        battery: None,
    })?;

    log::info!("[{name:}] Registered new node at {address:}");
    Ok(())
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

impl Handler<Shutdown> for Aggregator {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) -> Self::Result {
        log::info!("System is shutting down");
        self.set_state(AggregatorState::Terminating);

        self.cancel_collection_timer(ctx);
        self.cancel_idle_out_timer(ctx);

        match &self.collector {
            Some(canceller) => {
                // CollectionEnded finishes the offload and stops the
                // actor once the pass has drained
                canceller.cancel();
            }
            None => ctx.stop(),
        }
    }
}

#[derive(Message)]
#[rtype(result = "AggregatorState")]
pub struct GetState;

impl Handler<GetState> for Aggregator {
    type Result = MessageResult<GetState>;

    fn handle(&mut self, _msg: GetState, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use sylva_broker::{
        AdvertisedDevice, BleClientError, BlePeripheral, SamplingConfig, SensorDevice, Store,
    };

    static DB_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_factory() -> Arc<SqliteStoreFactory> {
        let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "sylvad-test-{}-{n}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        Arc::new(SqliteStoreFactory::new(path.to_str().expect("utf8 path")).expect("db"))
    }

    struct StubClient {
        advertised: Vec<AdvertisedDevice>,
    }

    #[async_trait]
    impl sylva_broker::BleClient for StubClient {
        async fn connect(
            &self,
            address: &str,
        ) -> Result<Box<dyn BlePeripheral>, BleClientError> {
            Err(BleClientError::PeripheralNotFound(address.to_string()))
        }

        async fn scan(
            &self,
            _window: tokio::time::Duration,
        ) -> Result<Vec<AdvertisedDevice>, BleClientError> {
            Ok(self.advertised.clone())
        }
    }

    struct NoDevices;

    impl DeviceFactory for NoDevices {
        fn create(
            &self,
            _record: &NodeRecord,
            _config: SamplingConfig,
        ) -> Option<Box<dyn SensorDevice>> {
            None
        }
    }

    fn stub_aggregator(db: Arc<SqliteStoreFactory>) -> Aggregator {
        let client = Arc::new(StubClient { advertised: vec![] });
        Aggregator::with_device_factory(db, client, Arc::new(NoDevices)).expect("aggregator")
    }

    #[actix::test]
    async fn activation_runs_a_collection_cycle_to_idle() {
        let db = temp_factory();
        let addr = stub_aggregator(db.clone()).start();

        addr.send(Activate).await.expect("send");

        // The empty pass drains quickly; wait for CollectionEnded
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

        let state = addr.send(GetState).await.expect("state");
        assert_eq!(state, AggregatorState::Idle);

        // The session opened by the pass was closed again
        let mut store = db.open_store().expect("store");
        assert!(store.current_session().expect("query").is_none());
        assert_eq!(
            store
                .get_param(PARAM_DEPLOYMENT_STATUS)
                .expect("param")
                .as_deref(),
            Some("1")
        );
    }

    #[actix::test]
    async fn deactivation_persists_and_goes_inactive() {
        let db = temp_factory();
        let addr = stub_aggregator(db.clone()).start();

        addr.send(Deactivate).await.expect("send");

        let state = addr.send(GetState).await.expect("state");
        assert_eq!(state, AggregatorState::Inactive);

        let mut store = db.open_store().expect("store");
        assert_eq!(
            store
                .get_param(PARAM_DEPLOYMENT_STATUS)
                .expect("param")
                .as_deref(),
            Some("0")
        );
    }

    #[actix::test]
    async fn scan_registers_only_unseen_named_devices() {
        let db = temp_factory();

        {
            let mut store = db.open_store().expect("store");
            store
                .upsert_node(&NodeRecord::new("SN-KNOWN", "C4:BE:84:28:89:01"))
                .expect("node");
        }

        let client = Arc::new(StubClient {
            advertised: vec![
                AdvertisedDevice {
                    address: "C4:BE:84:28:89:01".to_string(),
                    local_name: Some("SN-KNOWN".to_string()),
                },
                AdvertisedDevice {
                    address: "C4:BE:84:28:89:02".to_string(),
                    local_name: Some("SN-NEW".to_string()),
                },
                AdvertisedDevice {
                    address: "C4:BE:84:28:89:03".to_string(),
                    local_name: None,
                },
            ],
        });
        let addr = Aggregator::with_device_factory(db.clone(), client, Arc::new(NoDevices))
            .expect("aggregator")
            .start();

        addr.send(Scan {
            window: tokio::time::Duration::from_millis(10),
        })
        .await
        .expect("send");

        tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;

        let mut store = db.open_store().expect("store");
        let new_node = store.get_node("SN-NEW").expect("query").expect("present");
        assert_eq!(new_node.kind, DeviceKind::Unknown);
        assert_eq!(new_node.class, sylva_broker::NodeClass::Unknown);

        // The unnamed advertisement was ignored
        assert!(store.get_node("").expect("query").is_none());
    }
}
