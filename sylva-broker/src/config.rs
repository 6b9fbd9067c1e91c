//! Sampling and collection configuration.
//!
//! Every parameter lives in the system-parameter table and is read
//! lazily with a safe baked-in default; a missing parameter is
//! persisted back on first access so deployed units expose their
//! effective configuration (the set-if-absent contract).

use tokio::time::Duration;

use crate::store::{Store, StoreError};
use crate::DEFAULT_MAX_CONCURRENT_CONNECTIONS;

pub const PARAM_MAX_CONN_RETRIES: &str = "MAX_CONN_RETRIES";
pub const PARAM_CONN_ATTEMPT_TIMEOUT: &str = "CONN_ATTEMPT_TIMEOUT";
pub const PARAM_CONN_ATTEMPT_INTERVAL: &str = "CONN_ATTEMPT_INTERVAL";
pub const PARAM_MAX_SAMPLE_COUNT: &str = "MAX_SAMPLE_COUNT";
pub const PARAM_MAX_SAMPLING_DURATION: &str = "MAX_SAMPLING_DURATION";
pub const PARAM_READ_INTERVAL: &str = "READ_INTERVAL";
pub const PARAM_COLLECTION_INTERVAL: &str = "COLLECTION_INTERVAL";
pub const PARAM_IDLE_OUT_INTERVAL: &str = "IDLE_OUT_INTERVAL";
pub const PARAM_MAX_CONCURRENT_CONNECTIONS: &str = "MAX_CONCURRENT_CONNECTIONS";
pub const PARAM_EXPECTED_FIELDS_SOIL: &str = "EXPECTED_FIELDS_SOIL";
pub const PARAM_EXPECTED_FIELDS_PH: &str = "EXPECTED_FIELDS_PH";
pub const PARAM_DEPLOYMENT_STATUS: &str = "DEPLOYMENT_STATUS";

const DEFAULT_MAX_CONN_RETRIES: u32 = 60;
const DEFAULT_CONN_ATTEMPT_TIMEOUT_SECS: f64 = 35.0;
const DEFAULT_CONN_ATTEMPT_INTERVAL_SECS: f64 = 0.1;
const DEFAULT_MAX_SAMPLE_COUNT: u32 = 10;
const DEFAULT_MAX_SAMPLING_DURATION_SECS: f64 = 60.0;
const DEFAULT_READ_INTERVAL_SECS: f64 = 20.0;
const DEFAULT_COLLECTION_INTERVAL_SECS: f64 = 60.0 * 60.0;
const DEFAULT_IDLE_OUT_INTERVAL_SECS: f64 = 60.0 * 20.0;
/// Full soil-probe channel set; see `sylva_sensor::SOIL_FIELDS`
const DEFAULT_EXPECTED_FIELDS_SOIL: usize = 12;
/// pH plus battery
const DEFAULT_EXPECTED_FIELDS_PH: usize = 2;

/// Per-device sampling parameters shared by both probe drivers
#[derive(Debug, Clone, Copy)]
pub struct SamplingConfig {
    pub max_conn_retries: u32,
    pub conn_attempt_timeout: Duration,
    pub conn_attempt_interval: Duration,
    pub max_sample_count: u32,
    pub max_sampling_duration: Duration,
    pub read_interval: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_conn_retries: DEFAULT_MAX_CONN_RETRIES,
            conn_attempt_timeout: Duration::from_secs_f64(DEFAULT_CONN_ATTEMPT_TIMEOUT_SECS),
            conn_attempt_interval: Duration::from_secs_f64(DEFAULT_CONN_ATTEMPT_INTERVAL_SECS),
            max_sample_count: DEFAULT_MAX_SAMPLE_COUNT,
            max_sampling_duration: Duration::from_secs_f64(DEFAULT_MAX_SAMPLING_DURATION_SECS),
            read_interval: Duration::from_secs_f64(DEFAULT_READ_INTERVAL_SECS),
        }
    }
}

impl SamplingConfig {
    /// Loads each parameter from the store, falling back to (and
    /// persisting) the default where absent
    pub fn load(store: &mut dyn Store) -> Result<Self, StoreError> {
        let defaults = Self::default();

        Ok(Self {
            max_conn_retries: param_or_default(
                store,
                PARAM_MAX_CONN_RETRIES,
                defaults.max_conn_retries,
            )?,
            conn_attempt_timeout: duration_param_or_default(
                store,
                PARAM_CONN_ATTEMPT_TIMEOUT,
                defaults.conn_attempt_timeout,
            )?,
            conn_attempt_interval: duration_param_or_default(
                store,
                PARAM_CONN_ATTEMPT_INTERVAL,
                defaults.conn_attempt_interval,
            )?,
            max_sample_count: param_or_default(
                store,
                PARAM_MAX_SAMPLE_COUNT,
                defaults.max_sample_count,
            )?,
            max_sampling_duration: duration_param_or_default(
                store,
                PARAM_MAX_SAMPLING_DURATION,
                defaults.max_sampling_duration,
            )?,
            read_interval: duration_param_or_default(
                store,
                PARAM_READ_INTERVAL,
                defaults.read_interval,
            )?,
        })
    }
}

/// Aggregator-level collection parameters
#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    pub sampling: SamplingConfig,
    pub max_concurrent_connections: usize,
    pub collection_interval: Duration,
    pub idle_out_interval: Duration,
    pub expected_fields_soil: usize,
    pub expected_fields_ph: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
            collection_interval: Duration::from_secs_f64(DEFAULT_COLLECTION_INTERVAL_SECS),
            idle_out_interval: Duration::from_secs_f64(DEFAULT_IDLE_OUT_INTERVAL_SECS),
            expected_fields_soil: DEFAULT_EXPECTED_FIELDS_SOIL,
            expected_fields_ph: DEFAULT_EXPECTED_FIELDS_PH,
        }
    }
}

impl CollectorConfig {
    pub fn load(store: &mut dyn Store) -> Result<Self, StoreError> {
        let defaults = Self::default();

        Ok(Self {
            sampling: SamplingConfig::load(store)?,
            max_concurrent_connections: param_or_default(
                store,
                PARAM_MAX_CONCURRENT_CONNECTIONS,
                defaults.max_concurrent_connections,
            )?,
            collection_interval: duration_param_or_default(
                store,
                PARAM_COLLECTION_INTERVAL,
                defaults.collection_interval,
            )?,
            idle_out_interval: duration_param_or_default(
                store,
                PARAM_IDLE_OUT_INTERVAL,
                defaults.idle_out_interval,
            )?,
            expected_fields_soil: param_or_default(
                store,
                PARAM_EXPECTED_FIELDS_SOIL,
                defaults.expected_fields_soil,
            )?,
            expected_fields_ph: param_or_default(
                store,
                PARAM_EXPECTED_FIELDS_PH,
                defaults.expected_fields_ph,
            )?,
        })
    }
}

/// Reads a parameter, persisting and returning the default when the
/// parameter is absent. An unparseable stored value is logged and the
/// default used without overwriting the stored text.
fn param_or_default<T>(store: &mut dyn Store, name: &str, default: T) -> Result<T, StoreError>
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match store.get_param(name)? {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => {
                log::error!("Unparseable value for param {name:}: {raw:}, using default");
                Ok(default)
            }
        },
        None => {
            store.set_param(name, &default.to_string())?;
            Ok(default)
        }
    }
}

fn duration_param_or_default(
    store: &mut dyn Store,
    name: &str,
    default: Duration,
) -> Result<Duration, StoreError> {
    let secs = param_or_default(store, name, default.as_secs_f64())?;
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn absent_params_are_persisted_with_defaults() {
        let factory = MemoryStore::shared();
        let mut store = factory.open_direct();

        let config = SamplingConfig::load(&mut store).expect("load");
        assert_eq!(config.max_conn_retries, 60);
        assert_eq!(config.max_sample_count, 10);

        // set-if-absent: the defaults are now stored
        assert_eq!(
            store.get_param(PARAM_MAX_CONN_RETRIES).unwrap().as_deref(),
            Some("60")
        );
        assert_eq!(
            store.get_param(PARAM_READ_INTERVAL).unwrap().as_deref(),
            Some("20")
        );
    }

    #[test]
    fn stored_params_override_defaults() {
        let factory = MemoryStore::shared();
        let mut store = factory.open_direct();

        store.set_param(PARAM_MAX_SAMPLE_COUNT, "3").unwrap();
        store.set_param(PARAM_READ_INTERVAL, "0.5").unwrap();

        let config = SamplingConfig::load(&mut store).expect("load");
        assert_eq!(config.max_sample_count, 3);
        assert_eq!(config.read_interval, Duration::from_millis(500));
    }

    #[test]
    fn unparseable_param_falls_back_without_overwrite() {
        let factory = MemoryStore::shared();
        let mut store = factory.open_direct();

        store.set_param(PARAM_MAX_CONN_RETRIES, "sixty").unwrap();

        let config = SamplingConfig::load(&mut store).expect("load");
        assert_eq!(config.max_conn_retries, 60);
        assert_eq!(
            store.get_param(PARAM_MAX_CONN_RETRIES).unwrap().as_deref(),
            Some("sixty")
        );
    }
}
