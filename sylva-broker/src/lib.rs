//! The `sylva-broker` crate is the sampling core of the sylva aggregator.
//! It owns everything between the BLE radio and the staging store:
//!
//! 1. A capability interface over the BLE transport ([`BleClient`] /
//!    [`BlePeripheral`]), with a btleplug-backed implementation for
//!    production and trait seams that let tests substitute simulated
//!    radios.
//! 2. The device drivers ([`device::PhProbe`], [`device::SoilProbe`])
//!    which hide characteristic/service specifics behind the
//!    [`SensorDevice`] trait, plus GATT-service-table classification
//!    of unknown devices.
//! 3. The per-device read task ([`ReadTask`]): bounded-retry connect,
//!    N timed read cycles, incremental caching into the session staging
//!    store, and read/error/done signaling.
//! 4. The collect controller ([`collector`]): admission of one read task
//!    per node under a hard cap on simultaneous BLE connections, with
//!    sliding-window slot reuse, per-task join timeouts, and a manual
//!    cancel path.
//!
//! Persistence is behind the [`Store`]/[`StoreFactory`] traits; the
//! `sylvadb` crate implements them over sqlite. Every component receives
//! its dependencies through a context object rather than globals, so the
//! whole pipeline can run against in-memory fakes.

pub mod client;
pub mod collector;
pub mod config;
pub mod device;
pub mod read_task;
pub mod store;

pub use client::{AdvertisedDevice, BleClient, BleClientError, BlePeripheral, BtleClient, Notification};
pub use collector::{
    collect, BleDeviceFactory, CollectCancel, CollectSummary, CollectorContext, CollectorError,
    CollectorHandle, DeviceFactory,
};
pub use config::{CollectorConfig, SamplingConfig};
pub use device::{
    discover_device_kind, ConnectPolicy, ConnectStats, DeviceError, DeviceKind, NodeClass,
    SensorDevice,
};
pub use read_task::{ReadTask, ReadTaskReport, TaskSignal};
pub use store::{DeviceRecord, NodeRecord, SessionRecord, Store, StoreError, StoreFactory};

/// Logical node identifier, unique within the node table
pub type NodeId = String;

/// BLE hardware address, colon-separated octet pairs
pub type DeviceAddr = String;

/// Row id of a capture session in the session table
pub type SessionId = i32;

/// Hard cap on simultaneous BLE connections; typical adapters only
/// support a handful of concurrent links
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 4;

#[cfg(test)]
pub(crate) mod testing;
