//! Driver for the Bluno-based pH probe.
//!
//! The probe exposes a serial text channel over GATT: commands are
//! written to the serial characteristic and responses arrive as
//! notification text. One `QREAD` request yields at most one
//! `pH=<value>;` line; the probe also emits `bt=<value>;` battery
//! lines and `RDEPL`/`RUNDP`/`RDEND` acknowledgement markers.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{timeout, Duration, Instant},
};

use crate::{
    client::{BleClient, BlePeripheral, Notification},
    config::SamplingConfig,
    device::{
        connect_with_retry, ConnectPolicy, ConnectStats, DeviceError, DeviceKind, SensorDevice,
        BLUNO_COMMAND_CHAR, BLUNO_SERIAL_CHAR,
    },
};
use sylva_sensor::{Reading, FIELD_PH, FIELD_PH_BATTERY};

const CMD_DEPLOY: &[u8] = b"QDEPL;\r\n";
const CMD_UNDEPLOY: &[u8] = b"QUNDP;\r\n";
const CMD_START_READ: &[u8] = b"QREAD;\r\n";
const CMD_STOP_READ: &[u8] = b"QSTOP;\r\n";

// Serial bridge setup strings required by the DFRobot firmware
const DFR_PASSWORD: &[u8] = b"AT+PASSWOR=DFRobot\r\n";
const DFR_BAUD: &[u8] = b"AT+CURRUART=115200\r\n";

/// How long to wait for the notification answering one QREAD
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait for the deploy acknowledgement
const DEPLOY_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// One parsed line of serial notification text
#[derive(Debug, PartialEq)]
enum SerialEvent {
    Measurement(&'static str, f64),
    Deployed,
    Undeployed,
    ReadEnd,
    Malformed,
    Noise,
}

fn parse_serial_line(line: &str) -> SerialEvent {
    if line.contains("RDEPL:OK") {
        return SerialEvent::Deployed;
    }
    if line.contains("RUNDP:OK") {
        return SerialEvent::Undeployed;
    }
    if line.contains("RDEND:OK") {
        return SerialEvent::ReadEnd;
    }

    let field = if line.contains("pH") {
        FIELD_PH
    } else if line.contains("bt") {
        FIELD_PH_BATTERY
    } else {
        return SerialEvent::Noise;
    };

    let value = line
        .split('=')
        .nth(1)
        .and_then(|rest| rest.split(';').next())
        .map(str::trim)
        .and_then(|text| text.parse::<f64>().ok());

    match value {
        Some(value) => SerialEvent::Measurement(field, value),
        None => SerialEvent::Malformed,
    }
}

pub struct PhProbe {
    name: String,
    address: String,
    client: Arc<dyn BleClient>,
    config: SamplingConfig,
    peripheral: Option<Box<dyn BlePeripheral>>,
    notifications: Option<UnboundedReceiver<Notification>>,
    readings: Vec<Reading>,
    connected: bool,
    max_samples: u32,
    stats: ConnectStats,
}

impl PhProbe {
    pub fn new(
        name: String,
        address: String,
        client: Arc<dyn BleClient>,
        config: SamplingConfig,
    ) -> Self {
        let max_samples = config.max_sample_count;
        Self {
            name,
            address,
            client,
            config,
            peripheral: None,
            notifications: None,
            readings: Vec::new(),
            connected: false,
            max_samples,
            stats: ConnectStats::default(),
        }
    }

    async fn request(&mut self, contents: &[u8]) -> Result<(), DeviceError> {
        let peripheral = self
            .peripheral
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(self.name.clone()))?;

        peripheral
            .write_characteristic(BLUNO_SERIAL_CHAR, contents)
            .await?;

        log::debug!(
            "[{}] Sent request: {}",
            self.name,
            String::from_utf8_lossy(contents).trim_end()
        );
        Ok(())
    }

    /// Waits briefly for the deploy acknowledgement; absence is logged
    /// but not fatal, older probe firmware never acks
    async fn await_deploy_ack(&mut self) {
        let Some(notifications) = self.notifications.as_mut() else {
            return;
        };

        match timeout(DEPLOY_ACK_TIMEOUT, notifications.recv()).await {
            Ok(Some(n)) => {
                let text = String::from_utf8_lossy(&n.value).to_string();
                if let SerialEvent::Deployed = parse_serial_line(&text) {
                    log::info!("[{}] Deployed", self.name);
                } else {
                    log::debug!("[{}] Received during deploy: {}", self.name, text.trim_end());
                }
            }
            Ok(None) => log::warn!("[{}] Notification channel closed during deploy", self.name),
            Err(_) => log::debug!("[{}] No deploy acknowledgement", self.name),
        }
    }
}

#[async_trait]
impl SensorDevice for PhProbe {
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
        if self.connected {
            return Ok(true);
        }

        if self.address.is_empty() {
            log::info!("[{}] Cannot connect, no hardware address", self.name);
            return Ok(false);
        }

        log::info!("[{}] Attempting to connect to {}", self.name, self.address);

        let policy = ConnectPolicy::from(&self.config);
        let client = self.client.clone();
        let address = self.address.clone();

        let (link, stats) = connect_with_retry(&policy, &self.name, || {
            let client = client.clone();
            let address = address.clone();
            async move { client.connect(&address).await }
        })
        .await;

        self.stats = stats;

        match link {
            Some(peripheral) => {
                self.peripheral = Some(peripheral);
                self.connected = true;
                log::info!("[{}] Connected", self.name);
                Ok(true)
            }
            None => {
                log::error!("[{}] Failed to connect to device", self.name);
                Ok(false)
            }
        }
    }

    async fn start(&mut self, _read_until: Option<Instant>) -> Result<bool, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }

        {
            let peripheral = self
                .peripheral
                .as_mut()
                .ok_or_else(|| DeviceError::NotConnected(self.name.clone()))?;

            peripheral.discover_services().await?;

            peripheral
                .write_characteristic(BLUNO_COMMAND_CHAR, DFR_PASSWORD)
                .await?;
            peripheral
                .write_characteristic(BLUNO_COMMAND_CHAR, DFR_BAUD)
                .await?;

            let receiver = peripheral
                .subscribe_notifications(BLUNO_SERIAL_CHAR)
                .await?;
            self.notifications = Some(receiver);
        }

        self.request(CMD_DEPLOY).await?;
        self.await_deploy_ack().await;

        Ok(true)
    }

    async fn read_one(&mut self) -> Result<Option<Reading>, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }

        self.request(CMD_START_READ).await?;

        let Some(notifications) = self.notifications.as_mut() else {
            return Err(DeviceError::Setup("notification channel missing".to_string()));
        };

        let notification = match timeout(NOTIFICATION_TIMEOUT, notifications.recv()).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                // Channel closed under us: the link is gone and the
                // continue predicate will halt the read loop
                log::warn!("[{}] Notification channel closed", self.name);
                self.connected = false;
                return Ok(None);
            }
            Err(_) => {
                log::debug!("[{}] No notification this cycle", self.name);
                return Ok(None);
            }
        };

        let text = String::from_utf8_lossy(&notification.value).to_string();
        log::debug!("[{}] Received: {}", self.name, text.trim_end());

        match parse_serial_line(&text) {
            SerialEvent::Measurement(field, value) => {
                let reading =
                    Reading::new(self.name.clone(), Utc::now().timestamp()).with_field(field, value);
                self.readings.push(reading.clone());
                Ok(Some(reading))
            }
            SerialEvent::Malformed => {
                log::error!(
                    "[{}] Cannot convert measurement text to float: {}",
                    self.name,
                    text.trim_end()
                );
                Ok(None)
            }
            SerialEvent::ReadEnd => {
                log::info!("[{}] Read-end marker received", self.name);
                Ok(None)
            }
            SerialEvent::Deployed | SerialEvent::Undeployed | SerialEvent::Noise => Ok(None),
        }
    }

    async fn stop(&mut self) -> Result<bool, DeviceError> {
        log::debug!("[{}] Stop called", self.name);

        if !self.connected {
            log::info!("[{}] Already stopped", self.name);
            return Ok(true);
        }

        // Best-effort undeploy; a wedged link must not stop teardown
        if let Err(e) = self.request(CMD_STOP_READ).await {
            log::error!("[{}] Stop request failed: {e:}", self.name);
        }
        if let Err(e) = self.request(CMD_UNDEPLOY).await {
            log::error!("[{}] Undeploy request failed: {e:}", self.name);
        }

        self.notifications = None;
        if let Some(mut peripheral) = self.peripheral.take() {
            if let Err(e) = peripheral.disconnect().await {
                log::error!("[{}] Disconnect failed: {e:}", self.name);
            }
        }
        self.connected = false;

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
