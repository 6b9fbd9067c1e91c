//! btleplug-backed implementation of the BLE capability traits.

use async_trait::async_trait;
use btleplug::api::{
    Central, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::{Duration, Instant},
};
use uuid::Uuid;

use crate::client::{
    AdvertisedDevice, BleClient, BleClientError, BlePeripheral, Notification,
};

/// How long to poll the adapter for a peripheral to show up in scan
/// results before a connect attempt is abandoned
const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct BtleClient {
    adapter: Adapter,
}

impl BtleClient {
    pub async fn new() -> Result<Self, BleClientError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleClientError::AdapterUnavailable)?;

        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, BleClientError> {
        let deadline = Instant::now() + DISCOVERY_WINDOW;

        self.adapter.start_scan(ScanFilter::default()).await?;

        let found = loop {
            let peripherals = self.adapter.peripherals().await?;
            let hit = peripherals
                .into_iter()
                .find(|p| p.address().to_string().eq_ignore_ascii_case(address));

            if let Some(p) = hit {
                break Some(p);
            }

            if Instant::now() >= deadline {
                break None;
            }

            tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
        };

        self.adapter.stop_scan().await.ok();

        found.ok_or_else(|| BleClientError::PeripheralNotFound(address.to_string()))
    }
}

#[async_trait]
impl BleClient for BtleClient {
    async fn connect(&self, address: &str) -> Result<Box<dyn BlePeripheral>, BleClientError> {
        let peripheral = self.find_peripheral(address).await?;

        peripheral.connect().await?;
        log::debug!("[{address:}] link established");

        Ok(Box::new(BtlePeripheral {
            peripheral,
            notify_forwarders: Vec::new(),
        }))
    }

    async fn scan(&self, window: Duration) -> Result<Vec<AdvertisedDevice>, BleClientError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(window).await;

        let peripherals = self.adapter.peripherals().await?;
        self.adapter.stop_scan().await.ok();

        let mut seen = Vec::new();
        for p in peripherals {
            let local_name = match p.properties().await {
                Ok(props) => props.and_then(|props| props.local_name),
                Err(e) => {
                    log::warn!("Unable to read advertisement properties: {e:}");
                    None
                }
            };
            seen.push(AdvertisedDevice {
                address: p.address().to_string(),
                local_name,
            });
        }

        Ok(seen)
    }
}

pub struct BtlePeripheral {
    peripheral: Peripheral,
    notify_forwarders: Vec<tokio::task::JoinHandle<()>>,
}

impl BtlePeripheral {
    fn find_characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<btleplug::api::Characteristic, BleClientError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BleClientError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl BlePeripheral for BtlePeripheral {
    async fn discover_services(&mut self) -> Result<(), BleClientError> {
        self.peripheral.discover_services().await?;
        Ok(())
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.peripheral.services().iter().any(|s| s.uuid == service)
    }

    async fn read_characteristic(
        &mut self,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleClientError> {
        let ch = self.find_characteristic(characteristic)?;
        Ok(self.peripheral.read(&ch).await?)
    }

    async fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleClientError> {
        let ch = self.find_characteristic(characteristic)?;
        self.peripheral
            .write(&ch, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe_notifications(
        &mut self,
        characteristic: Uuid,
    ) -> Result<UnboundedReceiver<Notification>, BleClientError> {
        let ch = self.find_characteristic(characteristic)?;
        self.peripheral.subscribe(&ch).await?;

        let mut stream = self.peripheral.notifications().await?;
        let (sender, receiver) = unbounded_channel();

        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if event.uuid != characteristic {
                    continue;
                }
                if sender
                    .send(Notification {
                        characteristic: event.uuid,
                        value: event.value,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        self.notify_forwarders.push(forwarder);

        Ok(receiver)
    }

    async fn disconnect(&mut self) -> Result<(), BleClientError> {
        for forwarder in self.notify_forwarders.drain(..) {
            forwarder.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BtlePeripheral {
    fn drop(&mut self) {
        for forwarder in &self.notify_forwarders {
            forwarder.abort();
        }
    }
}
