//! In-memory doubles for the capability seams: a scripted sensor
//! device, a scripted BLE client/peripheral, and a memory-backed store.
//! Only compiled for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::{
    client::{AdvertisedDevice, BleClient, BleClientError, BlePeripheral, Notification},
    device::{
        ConnectStats, DeviceError, DeviceKind, NodeClass, SensorDevice, BLUNO_SERIAL_CHAR,
    },
    store::{DeviceRecord, NodeRecord, SessionRecord, Store, StoreError, StoreFactory},
    SessionId,
};
use sylva_sensor::Reading;

/// Shared observation point for simulated devices: connection gauge,
/// per-device start/finish instants, stop bookkeeping
#[derive(Default)]
pub struct SimTracker {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    stopped: Vec<String>,
    started: HashMap<String, Instant>,
    finished: HashMap<String, Instant>,
}

impl SimTracker {
    pub fn link_opened(&self, name: &str) {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(current, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .started
            .insert(name.to_string(), Instant::now());
    }

    pub fn link_closed(&self, name: &str) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .finished
            .insert(name.to_string(), Instant::now());
    }

    pub fn mark_stopped(&self, name: &str) {
        self.state.lock().unwrap().stopped.push(name.to_string());
    }

    pub fn stopped(&self, name: &str) -> bool {
        self.state.lock().unwrap().stopped.iter().any(|n| n == name)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn started_at(&self, name: &str) -> Option<Instant> {
        self.state.lock().unwrap().started.get(name).copied()
    }

    pub fn finished_at(&self, name: &str) -> Option<Instant> {
        self.state.lock().unwrap().finished.get(name).copied()
    }
}

/// Scripted [`SensorDevice`] for exercising the read task and the
/// collector without a radio
pub struct SimDevice {
    name: String,
    address: String,
    connected: bool,
    refuse_connect: bool,
    simulated_retries: u32,
    fail_read_after: Option<u32>,
    disconnect_after: Option<u32>,
    gap: u32,
    battery: Option<f64>,
    cycles: u32,
    accepted: u32,
    max_samples: u32,
    readings: Vec<Reading>,
    stats: ConnectStats,
    tracker: Arc<SimTracker>,
}

impl SimDevice {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: format!("00:00:00:00:00:{:02X}", name.len()),
            connected: false,
            refuse_connect: false,
            simulated_retries: 0,
            fail_read_after: None,
            disconnect_after: None,
            gap: 0,
            battery: None,
            cycles: 0,
            accepted: 0,
            max_samples: 10,
            readings: Vec::new(),
            stats: ConnectStats::default(),
            tracker: Arc::new(SimTracker::default()),
        }
    }

    pub fn tracker(&self) -> Arc<SimTracker> {
        self.tracker.clone()
    }

    pub fn with_shared_tracker(mut self, tracker: Arc<SimTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Device always has another reading available
    pub fn with_endless_readings(self) -> Self {
        self
    }

    /// Link drops after `n` accepted readings
    pub fn disconnect_after(mut self, n: u32) -> Self {
        self.disconnect_after = Some(n);
        self
    }

    /// Every connect attempt fails
    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Report this many retries from the (simulated) connect sequence
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.simulated_retries = retries;
        self
    }

    /// `gap` empty cycles between every accepted reading
    pub fn with_gappy_readings(mut self, gap: u32) -> Self {
        self.gap = gap;
        self
    }

    /// Reads error out after `n` accepted readings
    pub fn fail_read_after(mut self, n: u32) -> Self {
        self.fail_read_after = Some(n);
        self
    }

    /// Readings carry a soil battery field at the given level
    pub fn with_battery_readings(mut self, level: f64) -> Self {
        self.battery = Some(level);
        self
    }

    fn next_reading(&self) -> Reading {
        let reading = Reading::new(self.name.clone(), Utc::now().timestamp());
        match self.battery {
            Some(level) => reading
                .with_field(sylva_sensor::FIELD_SOIL_BATTERY, level)
                .with_field("vwc", 30.0),
            None => reading.with_field("ph", 6.5).with_field("bl_battery", 80.0),
        }
    }
}

#[async_trait]
impl SensorDevice for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Bluno
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect_stats(&self) -> ConnectStats {
        self.stats
    }

    async fn connect(&mut self) -> Result<bool, DeviceError> {
        if self.refuse_connect {
            self.stats.retries = self.simulated_retries.max(1);
            return Ok(false);
        }

        self.stats.retries = self.simulated_retries;
        self.connected = true;
        self.tracker.link_opened(&self.name);
        Ok(true)
    }

    async fn start(&mut self, _read_until: Option<Instant>) -> Result<bool, DeviceError> {
        Ok(true)
    }

    async fn read_one(&mut self) -> Result<Option<Reading>, DeviceError> {
        self.cycles += 1;

        if let Some(n) = self.fail_read_after {
            if self.accepted >= n {
                return Err(DeviceError::Setup("simulated read failure".to_string()));
            }
        }

        if let Some(n) = self.disconnect_after {
            if self.accepted >= n {
                self.connected = false;
                self.tracker.link_closed(&self.name);
                return Ok(None);
            }
        }

        if self.gap > 0 && self.cycles % (self.gap + 1) != 0 {
            return Ok(None);
        }

        // Simulated sampling latency so paused-clock tests observe
        // overlapping connection windows
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reading = self.next_reading();
        self.accepted += 1;
        self.readings.push(reading.clone());
        Ok(Some(reading))
    }

    async fn stop(&mut self) -> Result<bool, DeviceError> {
        if self.connected {
            self.connected = false;
            self.tracker.link_closed(&self.name);
        }
        self.tracker.mark_stopped(&self.name);
        Ok(true)
    }

    fn set_max_samples(&mut self, n: u32) {
        self.max_samples = n;
    }

    fn max_samples(&self) -> u32 {
        self.max_samples
    }

    fn readings(&self) -> Vec<Reading> {
        self.readings.clone()
    }
}

/// Per-address scripted peripheral behavior for [`SimClient`]
#[derive(Default, Clone)]
pub struct SimPeripheralSpec {
    pub services: Vec<Uuid>,
    pub char_values: HashMap<Uuid, Vec<u8>>,
    pub serial_script: Vec<String>,
    pub connect_failures: u32,
}

/// Scripted [`BleClient`] with its own connection gauge
pub struct SimClient {
    devices: Mutex<HashMap<String, SimPeripheralSpec>>,
    gauge: Arc<SimTracker>,
}

impl SimClient {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            gauge: Arc::new(SimTracker::default()),
        }
    }

    pub fn add_device(&self, address: &str, spec: SimPeripheralSpec) {
        self.devices
            .lock()
            .unwrap()
            .insert(address.to_string(), spec);
    }

    pub fn gauge(&self) -> Arc<SimTracker> {
        self.gauge.clone()
    }
}

#[async_trait]
impl BleClient for SimClient {
    async fn connect(&self, address: &str) -> Result<Box<dyn BlePeripheral>, BleClientError> {
        let spec = {
            let mut devices = self.devices.lock().unwrap();
            let spec = devices
                .get_mut(address)
                .ok_or_else(|| BleClientError::PeripheralNotFound(address.to_string()))?;

            if spec.connect_failures > 0 {
                spec.connect_failures -= 1;
                return Err(BleClientError::PeripheralNotFound(address.to_string()));
            }
            spec.clone()
        };

        self.gauge.link_opened(address);

        Ok(Box::new(SimPeripheral {
            address: address.to_string(),
            services: spec.services,
            char_values: spec.char_values,
            serial_script: spec.serial_script.into_iter().collect(),
            notify: None,
            gauge: self.gauge.clone(),
            open: true,
        }))
    }

    async fn scan(&self, _window: Duration) -> Result<Vec<AdvertisedDevice>, BleClientError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .keys()
            .map(|address| AdvertisedDevice {
                address: address.clone(),
                local_name: Some(format!("sim-{address}")),
            })
            .collect())
    }
}

pub struct SimPeripheral {
    address: String,
    services: Vec<Uuid>,
    char_values: HashMap<Uuid, Vec<u8>>,
    serial_script: VecDeque<String>,
    notify: Option<UnboundedSender<Notification>>,
    gauge: Arc<SimTracker>,
    open: bool,
}

#[async_trait]
impl BlePeripheral for SimPeripheral {
    async fn discover_services(&mut self) -> Result<(), BleClientError> {
        Ok(())
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.services.contains(&service)
    }

    async fn read_characteristic(
        &mut self,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleClientError> {
        self.char_values
            .get(&characteristic)
            .cloned()
            .ok_or(BleClientError::CharacteristicNotFound(characteristic))
    }

    async fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleClientError> {
        // Answer QREAD with the next scripted serial line
        if characteristic == BLUNO_SERIAL_CHAR && value.starts_with(b"QREAD") {
            if let Some(notify) = &self.notify {
                let line = self
                    .serial_script
                    .pop_front()
                    .unwrap_or_else(|| "pH=6.8;".to_string());
                notify
                    .send(Notification {
                        characteristic: BLUNO_SERIAL_CHAR,
                        value: line.into_bytes(),
                    })
                    .ok();
            }
        }
        Ok(())
    }

    async fn subscribe_notifications(
        &mut self,
        _characteristic: Uuid,
    ) -> Result<UnboundedReceiver<Notification>, BleClientError> {
        let (tx, rx) = unbounded_channel();
        self.notify = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<(), BleClientError> {
        if self.open {
            self.open = false;
            self.gauge.link_closed(&self.address);
        }
        self.notify = None;
        Ok(())
    }
}

impl Drop for SimPeripheral {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            self.gauge.link_closed(&self.address);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub source: String,
    pub field: String,
    pub value: f64,
    pub ts: i64,
}

#[derive(Default)]
struct MemState {
    nodes: Vec<NodeRecord>,
    devices: HashMap<String, DeviceRecord>,
    sessions: Vec<SessionRecord>,
    next_session_id: SessionId,
    staged: Vec<StagedRow>,
    params: HashMap<String, String>,
    battery_updates: Vec<(String, f64, i64)>,
}

/// Memory-backed store; cloning shares the underlying state, and every
/// opened handle sees the same data (mirroring the shared database)
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    pub fn shared() -> Self {
        Self::default()
    }

    pub fn open_direct(&self) -> MemoryStoreHandle {
        MemoryStoreHandle {
            state: self.state.clone(),
        }
    }

    pub fn add_node(&self, record: NodeRecord) {
        self.state.lock().unwrap().nodes.push(record);
    }

    pub fn node(&self, id: &str) -> Option<NodeRecord> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    pub fn staged_rows(&self) -> Vec<StagedRow> {
        self.state.lock().unwrap().staged.clone()
    }

    pub fn battery_updates(&self) -> Vec<(String, f64, i64)> {
        self.state.lock().unwrap().battery_updates.clone()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().unwrap().sessions.clone()
    }
}

impl StoreFactory for MemoryStore {
    fn open(&self) -> Result<Box<dyn Store>, StoreError> {
        Ok(Box::new(self.open_direct()))
    }
}

pub struct MemoryStoreHandle {
    state: Arc<Mutex<MemState>>,
}

impl Store for MemoryStoreHandle {
    fn collectable_nodes(&mut self) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .filter(|n| matches!(n.class, NodeClass::Sensor | NodeClass::Unknown))
            .cloned()
            .collect())
    }

    fn get_node(&mut self, id: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned())
    }

    fn upsert_node(&mut self, node: &NodeRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.nodes.iter_mut().find(|n| n.id == node.id) {
            *existing = node.clone();
        } else {
            state.nodes.push(node.clone());
        }
        Ok(())
    }

    fn upsert_device(&mut self, device: &DeviceRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(device.address.clone(), device.clone());
        Ok(())
    }

    fn record_classification(
        &mut self,
        node_id: &str,
        address: &str,
        kind: DeviceKind,
        class: NodeClass,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        if let Some(node) = state.nodes.iter_mut().find(|n| n.id == node_id) {
            node.kind = kind;
            node.class = class;
        }

        state
            .devices
            .entry(address.to_string())
            .and_modify(|d| d.kind = kind)
            .or_insert(DeviceRecord {
                address: address.to_string(),
                node_id: node_id.to_string(),
                kind,
                last_scanned: None,
                last_comms: None,
                battery: None,
            });

        Ok(())
    }

    fn update_device_battery(
        &mut self,
        address: &str,
        battery: f64,
        ts: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .battery_updates
            .push((address.to_string(), battery, ts));
        if let Some(device) = state.devices.get_mut(address) {
            device.battery = Some(battery);
            device.last_comms = Some(ts);
        }
        Ok(())
    }

    fn open_session(&mut self, now: i64) -> Result<SessionId, StoreError> {
        let mut state = self.state.lock().unwrap();

        for session in state.sessions.iter_mut().filter(|s| s.end_time.is_none()) {
            session.end_time = Some(now);
        }

        state.next_session_id += 1;
        let id = state.next_session_id;
        state.sessions.push(SessionRecord {
            id,
            start_time: now,
            end_time: None,
        });

        Ok(id)
    }

    fn current_session(&mut self) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .rev()
            .find(|s| s.end_time.is_none())
            .copied())
    }

    fn terminate_session(&mut self, now: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for session in state.sessions.iter_mut().filter(|s| s.end_time.is_none()) {
            session.end_time = Some(now);
        }
        Ok(())
    }

    fn append_staged(
        &mut self,
        source: &str,
        field: &str,
        value: f64,
        ts: i64,
    ) -> Result<(), StoreError> {
        self.state.lock().unwrap().staged.push(StagedRow {
            source: source.to_string(),
            field: field.to_string(),
            value,
            ts,
        });
        Ok(())
    }

    fn get_param(&mut self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().unwrap().params.get(name).cloned())
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .params
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}
