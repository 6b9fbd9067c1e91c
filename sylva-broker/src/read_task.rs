//! Per-device sampling task.
//!
//! One [`ReadTask`] drives one probe through its sampling lifecycle:
//! connect with bounded retry, setup, then timed read cycles until the
//! link drops, the sampling deadline passes, or the sample budget is
//! spent — whichever happens first. Each accepted reading is cached by
//! the driver and appended field-by-field to the session staging store.
//!
//! Signaling contract: the task emits [`TaskSignal::Read`] per accepted
//! reading, at most one [`TaskSignal::Error`], and exactly one
//! [`TaskSignal::Done`] on every exit path. The device is stopped on
//! every exit path as well, including after mid-loop errors.

use std::sync::Arc;
use tokio::{
    sync::{mpsc::UnboundedSender, watch},
    time::Instant,
};

use crate::{
    config::SamplingConfig,
    device::{DeviceError, SensorDevice},
    store::StoreFactory,
    DeviceAddr, NodeId,
};
use sylva_sensor::{Reading, FIELD_SOIL_BATTERY};

/// Progress signals emitted by a running read task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSignal {
    /// One reading was accepted and cached
    Read { source: NodeId },
    /// The task hit an unrecoverable error; a `Done` still follows
    Error { source: NodeId },
    /// The task finished; emitted exactly once per task
    Done { source: NodeId },
}

/// Final accounting for one read task
#[derive(Debug)]
pub struct ReadTaskReport {
    pub source: NodeId,
    pub address: DeviceAddr,
    pub readings: Vec<Reading>,
    pub connect_retries: u32,
    pub error: Option<String>,
}

impl ReadTaskReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The three-way continue predicate: reading proceeds only while the
/// device is connected AND the deadline has not passed AND samples
/// remain. Any one condition going false halts the loop.
pub fn should_continue_read(connected: bool, deadline: Instant, readings_left: u32) -> bool {
    if !connected {
        return false;
    }

    if Instant::now() >= deadline {
        log::debug!("Read time limit exceeded");
        return false;
    }

    if readings_left == 0 {
        log::debug!("Read sample limit exceeded");
        return false;
    }

    true
}

pub struct ReadTask {
    device: Box<dyn SensorDevice>,
    config: SamplingConfig,
    store: Arc<dyn StoreFactory>,
    signals: UnboundedSender<TaskSignal>,
    cancel: watch::Receiver<bool>,
}

impl ReadTask {
    pub fn new(
        device: Box<dyn SensorDevice>,
        config: SamplingConfig,
        store: Arc<dyn StoreFactory>,
        signals: UnboundedSender<TaskSignal>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            device,
            config,
            store,
            signals,
            cancel,
        }
    }

    /// Runs the task to completion. Never panics outward; errors are
    /// logged, signaled, and folded into the report.
    pub async fn run(mut self) -> ReadTaskReport {
        let source = self.device.name().to_string();
        let address = self.device.address().to_string();

        let result = self.sample().await;

        if let Err(e) = &result {
            log::error!("[{source:}] Read task error: {e:}");
            self.signals
                .send(TaskSignal::Error {
                    source: source.clone(),
                })
                .ok();
        }

        log::info!("[{source:}] Finished reading");
        self.signals
            .send(TaskSignal::Done {
                source: source.clone(),
            })
            .ok();

        log::info!("[{source:}] Stopping device");
        if let Err(e) = self.device.stop().await {
            log::error!("[{source:}] Stop device failed: {e:}");
        }

        ReadTaskReport {
            source,
            address,
            readings: self.device.readings(),
            connect_retries: self.device.connect_stats().retries,
            error: result.err().map(|e| e.to_string()),
        }
    }

    async fn sample(&mut self) -> Result<(), DeviceError> {
        if !self.device.is_connected() {
            let connected = self.device.connect().await?;
            if !connected {
                log::error!(
                    "[{}] Cannot read from unconnected device",
                    self.device.name()
                );
                return Err(DeviceError::ConnectFailed(
                    self.device.name().to_string(),
                    self.device.connect_stats().retries,
                ));
            }
        }

        let deadline = Instant::now() + self.config.max_sampling_duration;
        self.device.set_max_samples(self.config.max_sample_count);
        self.device.start(Some(deadline)).await?;

        let mut readings_left = self.config.max_sample_count;

        loop {
            if *self.cancel.borrow() {
                log::info!("[{}] Read task cancelled", self.device.name());
                break;
            }

            if !should_continue_read(self.device.is_connected(), deadline, readings_left) {
                break;
            }

            match self.device.read_one().await? {
                Some(reading) => {
                    self.cache_reading(&reading);
                    readings_left -= 1;
                    self.signals
                        .send(TaskSignal::Read {
                            source: reading.source.clone(),
                        })
                        .ok();
                    self.pace().await;
                }
                None => {
                    // No data this cycle: nothing cached, the counter
                    // holds, and the predicate decides next iteration
                    self.pace().await;
                }
            }
        }

        Ok(())
    }

    /// Inter-read sleep, cut short by cancellation
    async fn pace(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.read_interval) => {}
            _ = self.cancel.changed() => {}
        }
    }

    /// Stages every field of the reading; a failed write is logged and
    /// the rest still staged. Battery fields additionally refresh the
    /// owning device record.
    fn cache_reading(&self, reading: &Reading) {
        let mut store = match self.store.open() {
            Ok(store) => store,
            Err(e) => {
                log::error!("[{}] Failed to open store handle: {e:}", reading.source);
                return;
            }
        };

        for (field, value) in &reading.fields {
            if let Err(e) = store.append_staged(&reading.source, field, *value, reading.ts) {
                log::error!("[{}] Failed to stage {field:} reading: {e:}", reading.source);
            }
        }

        if let Some(&battery) = reading.fields.get(FIELD_SOIL_BATTERY) {
            if let Err(e) = store.update_device_battery(self.device.address(), battery, reading.ts)
            {
                log::error!("[{}] Failed to save power reading: {e:}", reading.source);
            }
        }
    }
}
