//! Scripted BLE client for the integration drivers: real probe drivers
//! run against these peripherals exactly as they would against radios.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use uuid::{uuid, Uuid};

use sylva_broker::device::{
    BATTERY_LEVEL_CHAR, BLUNO_CTRL_SERVICE, BLUNO_SERIAL_CHAR, FIRMWARE_REVISION_CHAR,
    PARROT_LIVE_SERVICE,
};
use sylva_broker::{
    AdvertisedDevice, BleClient, BleClientError, BlePeripheral, Notification,
};

#[derive(Default, Clone)]
pub struct DeviceSpec {
    pub services: Vec<Uuid>,
    pub char_values: HashMap<Uuid, Vec<u8>>,
    pub serial_script: Vec<String>,
    pub connect_failures: u32,
}

pub struct SimBleClient {
    devices: Mutex<HashMap<String, DeviceSpec>>,
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

impl SimBleClient {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            current: Arc::new(AtomicUsize::new(0)),
            max_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn add_device(&self, address: &str, spec: DeviceSpec) {
        self.devices
            .lock()
            .unwrap()
            .insert(address.to_string(), spec);
    }

    /// A Parrot-style soil probe with the full live characteristic set
    pub fn add_soil_probe(&self, address: &str) {
        let mut char_values: HashMap<Uuid, Vec<u8>> = HashMap::new();
        char_values.insert(BATTERY_LEVEL_CHAR, vec![88]);
        char_values.insert(FIRMWARE_REVISION_CHAR, b"hw_v2-fw_v1.1.0".to_vec());

        // Raw u16 channels
        char_values.insert(
            uuid!("39e1fa01-84a8-11e2-afba-0002a5d5c51b"),
            200u16.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa02-84a8-11e2-afba-0002a5d5c51b"),
            885u16.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa03-84a8-11e2-afba-0002a5d5c51b"),
            19u16.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa04-84a8-11e2-afba-0002a5d5c51b"),
            21u16.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa05-84a8-11e2-afba-0002a5d5c51b"),
            33u16.to_le_bytes().to_vec(),
        );

        // Calibrated f32 channels
        char_values.insert(
            uuid!("39e1fa09-84a8-11e2-afba-0002a5d5c51b"),
            31.5f32.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa0a-84a8-11e2-afba-0002a5d5c51b"),
            20.8f32.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa0b-84a8-11e2-afba-0002a5d5c51b"),
            12.2f32.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa0c-84a8-11e2-afba-0002a5d5c51b"),
            4.7f32.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa0d-84a8-11e2-afba-0002a5d5c51b"),
            3.9f32.to_le_bytes().to_vec(),
        );
        char_values.insert(
            uuid!("39e1fa0e-84a8-11e2-afba-0002a5d5c51b"),
            4.1f32.to_le_bytes().to_vec(),
        );

        self.add_device(
            address,
            DeviceSpec {
                services: vec![PARROT_LIVE_SERVICE],
                char_values,
                ..DeviceSpec::default()
            },
        );
    }

    /// A Bluno-style pH probe answering QREAD with the scripted lines
    pub fn add_ph_probe(&self, address: &str, lines: &[&str]) {
        self.add_device(
            address,
            DeviceSpec {
                services: vec![BLUNO_CTRL_SERVICE],
                serial_script: lines.iter().map(|l| l.to_string()).collect(),
                ..DeviceSpec::default()
            },
        );
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleClient for SimBleClient {
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

        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(current, Ordering::SeqCst);

        Ok(Box::new(SimPeripheral {
            services: spec.services,
            char_values: spec.char_values,
            serial_script: spec.serial_script.into_iter().collect(),
            notify: None,
            current: self.current.clone(),
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
    services: Vec<Uuid>,
    char_values: HashMap<Uuid, Vec<u8>>,
    serial_script: VecDeque<String>,
    notify: Option<UnboundedSender<Notification>>,
    current: Arc<AtomicUsize>,
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
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
        self.notify = None;
        Ok(())
    }
}

impl Drop for SimPeripheral {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
