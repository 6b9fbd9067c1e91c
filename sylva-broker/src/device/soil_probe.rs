//! Driver for the Parrot Flower Power multi-sensor soil probe.
//!
//! Each sampling cycle reads the battery level plus one characteristic
//! per live channel (five raw, six calibrated), converts raw counts
//! through the calibration curves, and yields a single [`Reading`]
//! carrying the full field set. The probe LED is switched on around
//! the read burst as a sampling-in-progress indicator.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::{uuid, Uuid};

use crate::{
    client::{BleClient, BlePeripheral},
    config::SamplingConfig,
    device::{
        connect_with_retry, ConnectPolicy, ConnectStats, DeviceError, DeviceKind, SensorDevice,
        BATTERY_LEVEL_CHAR, FIRMWARE_REVISION_CHAR,
    },
};
use sylva_sensor::{CodecError, DataTransform, Reading, FIELD_SOIL_BATTERY};

const SUNLIGHT_CHAR: Uuid = uuid!("39e1fa01-84a8-11e2-afba-0002a5d5c51b");
const SOIL_EC_CHAR: Uuid = uuid!("39e1fa02-84a8-11e2-afba-0002a5d5c51b");
const SOIL_TEMP_CHAR: Uuid = uuid!("39e1fa03-84a8-11e2-afba-0002a5d5c51b");
const AIR_TEMP_CHAR: Uuid = uuid!("39e1fa04-84a8-11e2-afba-0002a5d5c51b");
const VWC_CHAR: Uuid = uuid!("39e1fa05-84a8-11e2-afba-0002a5d5c51b");
const LIVE_MODE_PERIOD_CHAR: Uuid = uuid!("39e1fa06-84a8-11e2-afba-0002a5d5c51b");
const LED_CHAR: Uuid = uuid!("39e1fa07-84a8-11e2-afba-0002a5d5c51b");
const CAL_VWC_CHAR: Uuid = uuid!("39e1fa09-84a8-11e2-afba-0002a5d5c51b");
const CAL_AIR_TEMP_CHAR: Uuid = uuid!("39e1fa0a-84a8-11e2-afba-0002a5d5c51b");
const CAL_DLI_CHAR: Uuid = uuid!("39e1fa0b-84a8-11e2-afba-0002a5d5c51b");
const CAL_EA_CHAR: Uuid = uuid!("39e1fa0c-84a8-11e2-afba-0002a5d5c51b");
const CAL_ECB_CHAR: Uuid = uuid!("39e1fa0d-84a8-11e2-afba-0002a5d5c51b");
const CAL_EC_POROUS_CHAR: Uuid = uuid!("39e1fa0e-84a8-11e2-afba-0002a5d5c51b");

/// One-second live measurement period
const LIVE_MEASURE_PERIOD: [u8; 1] = [0x01];
const LED_ON: [u8; 1] = [0x01];
const LED_OFF: [u8; 1] = [0x00];

const NEW_FIRMWARE_VERSION: &str = "1.1.0";

/// Raw-count decoding applied to a live channel value
enum ChannelCodec {
    Light,
    Ec,
    Temp,
    Moisture,
    Calibrated,
}

struct LiveChannel {
    field: &'static str,
    characteristic: Uuid,
    codec: ChannelCodec,
}

const LIVE_CHANNELS: [LiveChannel; 11] = [
    LiveChannel {
        field: "sunlight",
        characteristic: SUNLIGHT_CHAR,
        codec: ChannelCodec::Light,
    },
    LiveChannel {
        field: "soil_ec",
        characteristic: SOIL_EC_CHAR,
        codec: ChannelCodec::Ec,
    },
    LiveChannel {
        field: "soil_temp",
        characteristic: SOIL_TEMP_CHAR,
        codec: ChannelCodec::Temp,
    },
    LiveChannel {
        field: "air_temp",
        characteristic: AIR_TEMP_CHAR,
        codec: ChannelCodec::Temp,
    },
    LiveChannel {
        field: "vwc",
        characteristic: VWC_CHAR,
        codec: ChannelCodec::Moisture,
    },
    LiveChannel {
        field: "cal_vwc",
        characteristic: CAL_VWC_CHAR,
        codec: ChannelCodec::Calibrated,
    },
    LiveChannel {
        field: "cal_air_temp",
        characteristic: CAL_AIR_TEMP_CHAR,
        codec: ChannelCodec::Calibrated,
    },
    LiveChannel {
        field: "cal_dli",
        characteristic: CAL_DLI_CHAR,
        codec: ChannelCodec::Calibrated,
    },
    LiveChannel {
        field: "cal_ea",
        characteristic: CAL_EA_CHAR,
        codec: ChannelCodec::Calibrated,
    },
    LiveChannel {
        field: "cal_ecb",
        characteristic: CAL_ECB_CHAR,
        codec: ChannelCodec::Calibrated,
    },
    LiveChannel {
        field: "cal_ec_porous",
        characteristic: CAL_EC_POROUS_CHAR,
        codec: ChannelCodec::Calibrated,
    },
];

fn decode_channel(codec: &ChannelCodec, raw: &[u8]) -> Result<f64, CodecError> {
    match codec {
        ChannelCodec::Light => Ok(DataTransform::conv_light(DataTransform::unpack_u16(raw)?)),
        ChannelCodec::Ec => Ok(DataTransform::conv_ec(DataTransform::unpack_u16(raw)?)),
        ChannelCodec::Temp => Ok(DataTransform::conv_temp(DataTransform::unpack_u16(raw)?)),
        ChannelCodec::Moisture => Ok(DataTransform::conv_moisture(DataTransform::unpack_u16(raw)?)),
        ChannelCodec::Calibrated => DataTransform::decode_float32(raw),
    }
}

/// Old-firmware probes lack the calibrated characteristics; mirror the
/// raw channel values into the calibrated fields so records still reach
/// the full field set
fn apply_firmware_fallbacks(reading: &mut Reading) {
    const MIRRORS: [(&str, &str); 2] = [("vwc", "cal_vwc"), ("air_temp", "cal_air_temp")];
    const EC_MIRRORS: [&str; 4] = ["cal_dli", "cal_ea", "cal_ecb", "cal_ec_porous"];

    for (from, to) in MIRRORS {
        if !reading.fields.contains_key(to) {
            if let Some(&value) = reading.fields.get(from) {
                reading.insert(to, value);
            }
        }
    }

    if let Some(&ec) = reading.fields.get("soil_ec") {
        for to in EC_MIRRORS {
            if !reading.fields.contains_key(to) {
                reading.insert(to, ec);
            }
        }
    }
}

pub struct SoilProbe {
    name: String,
    address: String,
    client: Arc<dyn BleClient>,
    config: SamplingConfig,
    peripheral: Option<Box<dyn BlePeripheral>>,
    readings: Vec<Reading>,
    connected: bool,
    is_new_firmware: bool,
    max_samples: u32,
    stats: ConnectStats,
}

impl SoilProbe {
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
            readings: Vec::new(),
            connected: false,
            is_new_firmware: false,
            max_samples,
            stats: ConnectStats::default(),
        }
    }

    async fn switch_led(&mut self, on: bool) {
        let Some(peripheral) = self.peripheral.as_mut() else {
            return;
        };

        let state = if on { LED_ON } else { LED_OFF };
        if let Err(e) = peripheral.write_characteristic(LED_CHAR, &state).await {
            // Indicator only; sampling proceeds without it
            log::debug!("[{}] LED switch failed: {e:}", self.name);
        }
    }
}

#[async_trait]
impl SensorDevice for SoilProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Parrot
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

        let peripheral = self
            .peripheral
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(self.name.clone()))?;

        peripheral.discover_services().await?;

        match peripheral.read_characteristic(FIRMWARE_REVISION_CHAR).await {
            Ok(raw) => {
                let version = String::from_utf8_lossy(&raw).to_string();
                self.is_new_firmware = version.contains(NEW_FIRMWARE_VERSION);
                log::info!(
                    "[{}] Firmware {} (calibrated channels: {})",
                    self.name,
                    version.trim_end(),
                    self.is_new_firmware
                );
            }
            Err(e) => {
                log::warn!("[{}] Firmware version unavailable: {e:}", self.name);
                self.is_new_firmware = false;
            }
        }

        peripheral
            .write_characteristic(LIVE_MODE_PERIOD_CHAR, &LIVE_MEASURE_PERIOD)
            .await?;

        Ok(true)
    }

    async fn read_one(&mut self) -> Result<Option<Reading>, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }

        let ts = Utc::now().timestamp();

        // Battery comes from the standard battery service; losing it is
        // treated as a skipped cycle, the same as the probe going quiet
        let battery = {
            let peripheral = self
                .peripheral
                .as_mut()
                .ok_or_else(|| DeviceError::NotConnected(self.name.clone()))?;

            match peripheral.read_characteristic(BATTERY_LEVEL_CHAR).await {
                Ok(raw) if !raw.is_empty() => f64::from(raw[0]),
                Ok(_) => {
                    log::error!("[{}] Empty battery level value", self.name);
                    return Ok(None);
                }
                Err(e) => {
                    log::error!("[{}] Battery level read failed: {e:}", self.name);
                    return Ok(None);
                }
            }
        };

        self.switch_led(true).await;

        let mut reading =
            Reading::new(self.name.clone(), ts).with_field(FIELD_SOIL_BATTERY, battery);

        for channel in &LIVE_CHANNELS {
            let peripheral = self
                .peripheral
                .as_mut()
                .ok_or_else(|| DeviceError::NotConnected(self.name.clone()))?;

            match peripheral.read_characteristic(channel.characteristic).await {
                Ok(raw) => match decode_channel(&channel.codec, &raw) {
                    Ok(value) => reading.insert(channel.field, value),
                    Err(e) => {
                        log::error!(
                            "[{}] Failed to decode {} value: {e:}",
                            self.name,
                            channel.field
                        );
                    }
                },
                Err(e) => {
                    // Calibrated channels are absent on old firmware
                    log::debug!("[{}] No {} characteristic: {e:}", self.name, channel.field);
                }
            }
        }

        apply_firmware_fallbacks(&mut reading);
        self.switch_led(false).await;

        self.readings.push(reading.clone());
        Ok(Some(reading))
    }

    async fn stop(&mut self) -> Result<bool, DeviceError> {
        log::debug!("[{}] Stop called", self.name);

        if !self.connected {
            log::info!("[{}] Already stopped", self.name);
            return Ok(true);
        }

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
