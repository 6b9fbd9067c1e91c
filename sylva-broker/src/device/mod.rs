//! Device driver abstraction.
//!
//! Two kinds of commercial probe are supported: the DFRobot Bluno pH
//! probe ([`PhProbe`], serial-text-over-GATT) and the Parrot Flower
//! Power multi-sensor soil probe ([`SoilProbe`], one characteristic per
//! channel). Both implement [`SensorDevice`], which is all the read
//! task ever sees; tests drive the read task with simulated devices.
//!
//! Unknown radios are classified once by probing their GATT services
//! against [`SERVICE_CLASS_TABLE`]; the result is cached in the node
//! registry so a device is never re-probed within later sessions.

mod ph_probe;
mod soil_probe;

pub use ph_probe::PhProbe;
pub use soil_probe::SoilProbe;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use uuid::{uuid, Uuid};

use crate::{
    client::{BleClient, BleClientError},
    config::SamplingConfig,
    store::NodeRecord,
};
use sylva_sensor::Reading;

/// Bluno control service; its presence marks a pH probe
pub const BLUNO_CTRL_SERVICE: Uuid = uuid!("0000dfb0-0000-1000-8000-00805f9b34fb");
/// Serial channel characteristic: commands out, notification text in
pub const BLUNO_SERIAL_CHAR: Uuid = uuid!("0000dfb1-0000-1000-8000-00805f9b34fb");
pub const BLUNO_COMMAND_CHAR: Uuid = uuid!("0000dfb2-0000-1000-8000-00805f9b34fb");

/// Parrot live measurement service; its presence marks a soil probe
pub const PARROT_LIVE_SERVICE: Uuid = uuid!("39e1fa00-84a8-11e2-afba-0002a5d5c51b");

pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");
pub const FIRMWARE_REVISION_CHAR: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");
pub const BATTERY_LEVEL_CHAR: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("BLE client error: {0}")]
    Ble(#[from] BleClientError),
    #[error("Codec error: {0}")]
    Codec(#[from] sylva_sensor::CodecError),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("could not connect to {0} (retries: {1})")]
    ConnectFailed(String, u32),
    #[error("device setup failed: {0}")]
    Setup(String),
}

/// Physical radio classification, resolved once per device and cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Bluno,
    Parrot,
    SelfRadio,
    Unused,
    Unknown,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Bluno => "BLUNO",
            DeviceKind::Parrot => "PARROT",
            DeviceKind::SelfRadio => "SELF",
            DeviceKind::Unused => "UNUSED",
            DeviceKind::Unknown => "UNKNOWN",
        }
    }
}

impl From<&str> for DeviceKind {
    fn from(value: &str) -> Self {
        match value {
            "BLUNO" => DeviceKind::Bluno,
            "PARROT" => DeviceKind::Parrot,
            "SELF" => DeviceKind::SelfRadio,
            "UNUSED" => DeviceKind::Unused,
            _ => DeviceKind::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logical node classification in the node table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    Sensor,
    Aggregator,
    Mobile,
    SelfNode,
    Cache,
    Unused,
    Unknown,
}

impl NodeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeClass::Sensor => "SENSOR",
            NodeClass::Aggregator => "AGGREGATOR",
            NodeClass::Mobile => "MOBILE",
            NodeClass::SelfNode => "SELF",
            NodeClass::Cache => "CACHE",
            NodeClass::Unused => "UNUSED",
            NodeClass::Unknown => "UNKNOWN",
        }
    }
}

impl From<&str> for NodeClass {
    fn from(value: &str) -> Self {
        match value {
            "SENSOR" => NodeClass::Sensor,
            "AGGREGATOR" => NodeClass::Aggregator,
            "MOBILE" => NodeClass::Mobile,
            "SELF" => NodeClass::SelfNode,
            "CACHE" => NodeClass::Cache,
            "UNUSED" => NodeClass::Unused,
            _ => NodeClass::Unknown,
        }
    }
}

impl std::fmt::Display for NodeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Known GATT service ids and the device kind each one implies
pub struct ServiceClassEntry {
    pub service: Uuid,
    pub kind: DeviceKind,
}

pub const SERVICE_CLASS_TABLE: [ServiceClassEntry; 2] = [
    ServiceClassEntry {
        service: BLUNO_CTRL_SERVICE,
        kind: DeviceKind::Bluno,
    },
    ServiceClassEntry {
        service: PARROT_LIVE_SERVICE,
        kind: DeviceKind::Parrot,
    },
];

/// Bounded-retry connect parameters shared by both probe drivers
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub attempt_interval: Duration,
}

impl ConnectPolicy {
    /// Lighter policy used when probing an unclassified device; a
    /// classification pass should not stall the session the way a
    /// known sensor is allowed to
    pub fn classification() -> Self {
        Self {
            max_retries: 5,
            attempt_timeout: Duration::from_secs(35),
            attempt_interval: Duration::from_millis(1500),
        }
    }
}

impl From<&SamplingConfig> for ConnectPolicy {
    fn from(config: &SamplingConfig) -> Self {
        Self {
            max_retries: config.max_conn_retries,
            attempt_timeout: config.conn_attempt_timeout,
            attempt_interval: config.conn_attempt_interval,
        }
    }
}

/// Outcome bookkeeping for one connect sequence
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectStats {
    pub retries: u32,
    pub elapsed: Duration,
}

/// Runs `attempt` under the policy's retry budget: at most
/// `max_retries` attempts, aborting early once the cumulative elapsed
/// time passes `attempt_timeout` even with retries remaining, sleeping
/// a growing backoff (one `attempt_interval` per prior retry) between
/// attempts.
pub async fn connect_with_retry<T, F, Fut>(
    policy: &ConnectPolicy,
    label: &str,
    mut attempt: F,
) -> (Option<T>, ConnectStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BleClientError>>,
{
    let start = Instant::now();
    let mut retries = 0u32;
    let mut link = None;

    loop {
        match attempt().await {
            Ok(t) => {
                log::debug!(
                    "[{label:}] Overall connect time: {:?}, total retries: {retries:}",
                    start.elapsed()
                );
                link = Some(t);
                break;
            }
            Err(e) => {
                log::error!("[{label:}] Connection failed: {e:}");
            }
        }

        retries += 1;
        if retries >= policy.max_retries {
            log::debug!("[{label:}] Connect retry budget exhausted ({retries:})");
            break;
        }

        if start.elapsed() > policy.attempt_timeout {
            log::debug!(
                "[{label:}] Connect attempts took {:?} so far",
                start.elapsed()
            );
            log::warn!("[{label:}] Connect attempt exceeds threshold. Is the device nearby?");
            break;
        }

        tokio::time::sleep(policy.attempt_interval * retries).await;
        log::debug!("[{label:}] Attempting to connect ({retries:})...");
    }

    (
        link,
        ConnectStats {
            retries,
            elapsed: start.elapsed(),
        },
    )
}

/// Capability interface for one sampling-capable probe. The read task
/// depends only on this trait, never on a concrete driver.
#[async_trait]
pub trait SensorDevice: Send {
    /// Owning node identifier
    fn name(&self) -> &str;
    /// BLE hardware address
    fn address(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn is_connected(&self) -> bool;
    /// Bookkeeping from the most recent connect sequence
    fn connect_stats(&self) -> ConnectStats;

    /// Establish the link with bounded retry. Returns whether the
    /// device ended up connected.
    async fn connect(&mut self) -> Result<bool, DeviceError>;

    /// Post-connect setup/handshake (deploy command or characteristic
    /// discovery). `read_until` bounds any setup waits.
    async fn start(&mut self, read_until: Option<Instant>) -> Result<bool, DeviceError>;

    /// One timed read cycle. `Ok(None)` means no data this cycle,
    /// which is not an error.
    async fn read_one(&mut self) -> Result<Option<Reading>, DeviceError>;

    /// Undeploy and disconnect. Safe to call on every exit path,
    /// including after mid-loop errors.
    async fn stop(&mut self) -> Result<bool, DeviceError>;

    fn set_max_samples(&mut self, n: u32);
    fn max_samples(&self) -> u32;

    /// Readings accumulated since the device was started
    fn readings(&self) -> Vec<Reading>;
}

/// Connects to an unclassified radio and resolves its device kind by
/// matching discovered GATT services against [`SERVICE_CLASS_TABLE`].
/// Devices matching no known service are classified [`DeviceKind::Unused`]
/// so they are never probed again.
pub async fn discover_device_kind(
    client: &dyn BleClient,
    address: &str,
    policy: &ConnectPolicy,
) -> Result<(DeviceKind, NodeClass), DeviceError> {
    log::info!("[{address:}] Discovering device classification...");

    let (link, stats) = connect_with_retry(policy, address, || client.connect(address)).await;

    let Some(mut peripheral) = link else {
        return Err(DeviceError::ConnectFailed(address.to_string(), stats.retries));
    };

    let kind = match peripheral.discover_services().await {
        Ok(()) => {
            let mut kind = DeviceKind::Unknown;
            for entry in SERVICE_CLASS_TABLE {
                if peripheral.has_service(entry.service) {
                    log::info!("[{address:}] Service {} found, device type {}", entry.service, entry.kind);
                    kind = entry.kind;
                    break;
                }
                log::debug!("[{address:}] Service {} not present", entry.service);
            }
            kind
        }
        Err(e) => {
            log::error!("[{address:}] Service discovery failed: {e:}");
            DeviceKind::Unknown
        }
    };

    peripheral.disconnect().await.ok();

    // No recognizable service: flag the radio unusable so it is not
    // re-probed every session
    let kind = if kind == DeviceKind::Unknown {
        DeviceKind::Unused
    } else {
        kind
    };

    let class = match kind {
        DeviceKind::Bluno | DeviceKind::Parrot => NodeClass::Sensor,
        _ => NodeClass::Unused,
    };

    Ok((kind, class))
}

/// Builds the concrete driver for a classified node, or `None` when the
/// node's device kind cannot sample
pub fn instantiate_device(
    record: &NodeRecord,
    client: Arc<dyn BleClient>,
    config: SamplingConfig,
) -> Option<Box<dyn SensorDevice>> {
    match record.kind {
        DeviceKind::Bluno => Some(Box::new(PhProbe::new(
            record.id.clone(),
            record.address.clone(),
            client,
            config,
        ))),
        DeviceKind::Parrot => Some(Box::new(SoilProbe::new(
            record.id.clone(),
            record.address.clone(),
            client,
            config,
        ))),
        _ => None,
    }
}
