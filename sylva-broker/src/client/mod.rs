//! Capability interface over the BLE transport.
//!
//! The sampling core never talks to a BLE stack directly; it goes
//! through [`BleClient`] (adapter-level: scan, connect) and
//! [`BlePeripheral`] (link-level: service discovery, characteristic
//! read/write, notification subscription, disconnect). The production
//! implementation is [`BtleClient`] over btleplug; tests substitute
//! simulated implementations of the same traits.

mod btle;

pub use btle::BtleClient;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc::UnboundedReceiver, time::Duration};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BleClientError {
    #[error("BLE transport error: {0}")]
    Transport(#[from] btleplug::Error),
    #[error("no BLE adapter available")]
    AdapterUnavailable,
    #[error("peripheral {0} not found")]
    PeripheralNotFound(String),
    #[error("service {0} not present on peripheral")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not present on peripheral")]
    CharacteristicNotFound(Uuid),
    #[error("notification channel closed")]
    NotificationChannelClosed,
}

/// One value update pushed by a peripheral for a subscribed
/// characteristic
#[derive(Debug, Clone)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// A device seen during a scan window: hardware address plus the
/// advertised local name, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub address: String,
    pub local_name: Option<String>,
}

/// Adapter-level BLE operations
#[async_trait]
pub trait BleClient: Send + Sync {
    /// Establish a link to the peripheral with the given hardware
    /// address. A single attempt; retry policy belongs to the caller.
    async fn connect(&self, address: &str) -> Result<Box<dyn BlePeripheral>, BleClientError>;

    /// Scan for advertising peripherals for the given window
    async fn scan(&self, window: Duration) -> Result<Vec<AdvertisedDevice>, BleClientError>;
}

/// Link-level operations on a connected peripheral
#[async_trait]
pub trait BlePeripheral: Send {
    async fn discover_services(&mut self) -> Result<(), BleClientError>;

    /// Whether the peripheral exposes the given GATT service. Only
    /// meaningful after [`discover_services`](Self::discover_services).
    fn has_service(&self, service: Uuid) -> bool;

    async fn read_characteristic(&mut self, characteristic: Uuid)
        -> Result<Vec<u8>, BleClientError>;

    async fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleClientError>;

    /// Subscribe to value notifications for the characteristic; updates
    /// are delivered on the returned channel until disconnect
    async fn subscribe_notifications(
        &mut self,
        characteristic: Uuid,
    ) -> Result<UnboundedReceiver<Notification>, BleClientError>;

    async fn disconnect(&mut self) -> Result<(), BleClientError>;
}
