//! Raw-value calibration and byte decoding.
//!
//! Every conversion is a literal closed-form formula fit against the
//! deployed probe hardware; none of them may be approximated or
//! re-fit without re-running the field calibration. A raw value of 0
//! is the hardware's "no signal" sentinel and short-circuits to 0.0
//! instead of passing through the curve.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("truncated characteristic value: expected {expected} bytes, got {actual}")]
    TruncatedValue { expected: usize, actual: usize },
    #[error("hardware address has odd length {0}, cannot pair octets")]
    OddAddressLength(usize),
}

/// Temperature clamp range, degrees Celsius
pub const TEMP_MIN_C: f64 = -10.0;
pub const TEMP_MAX_C: f64 = 55.0;
/// Volumetric water content clamp range, %VWC
pub const MOISTURE_MIN: f64 = 0.0;
pub const MOISTURE_MAX: f64 = 60.0;
/// Raw EC counts above this saturate the probe
pub const EC_RAW_SATURATION: f64 = 1771.0;
pub const EC_MAX: f64 = 10.0;

/// Namespace for the calibration formulas. All functions are pure.
pub struct DataTransform;

impl DataTransform {
    /// Little-endian u16 characteristic value, widened to f64
    pub fn unpack_u16(raw: &[u8]) -> Result<f64, CodecError> {
        if raw.len() < 2 {
            return Err(CodecError::TruncatedValue {
                expected: 2,
                actual: raw.len(),
            });
        }
        Ok(f64::from(u16::from_le_bytes([raw[0], raw[1]])))
    }

    /// Little-endian f32 characteristic value, widened to f64
    pub fn decode_float32(raw: &[u8]) -> Result<f64, CodecError> {
        if raw.len() < 4 {
            return Err(CodecError::TruncatedValue {
                expected: 4,
                actual: raw.len(),
            });
        }
        Ok(f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
    }

    /// pH probe ADC counts to pH units
    pub fn conv_ph(adc_val: f64) -> f64 {
        let offset = 1.0;
        let val = (adc_val * 5.0) / 1024.0 / 6.0;
        val * 3.5 + offset
    }

    /// Probe battery ADC counts to volts
    pub fn conv_batt(adc_val: f64) -> f64 {
        let max_batt = 4.87;
        2.0 * adc_val * max_batt / 997.376
    }

    /// Temperature in raw degrees, clamped to the probe's rated range
    pub fn conv_temp(val: f64) -> f64 {
        if val == 0.0 {
            return 0.0;
        }
        val.clamp(TEMP_MIN_C, TEMP_MAX_C)
    }

    /// Electrical conductivity; saturates once the raw count passes
    /// [`EC_RAW_SATURATION`]
    pub fn conv_ec(val: f64) -> f64 {
        if val == 0.0 {
            return 0.0;
        }
        if val > EC_RAW_SATURATION {
            return EC_MAX;
        }
        (val / EC_RAW_SATURATION) * EC_MAX
    }

    pub fn conv_humidity(val: f64) -> f64 {
        val
    }

    /// Sunlight level via the empirically fit power curve
    pub fn conv_light(val: f64) -> f64 {
        if val == 0.0 {
            return 0.0;
        }
        16655.6019 * val.powf(-1.0606619)
    }

    /// Volumetric water content, clamped to %VWC bounds
    pub fn conv_moisture(val: f64) -> f64 {
        if val == 0.0 {
            return 0.0;
        }
        val.clamp(MOISTURE_MIN, MOISTURE_MAX)
    }

    /// Formats a flat hex hardware address ("C4BE8428894A") into
    /// colon-separated octet pairs. Odd-length input is rejected.
    pub fn conv_mac(ref_addr: &str) -> Result<String, CodecError> {
        if ref_addr.len() % 2 != 0 {
            return Err(CodecError::OddAddressLength(ref_addr.len()));
        }

        let chars = ref_addr.chars().collect::<Vec<_>>();
        let pairs = chars
            .chunks(2)
            .map(|pair| pair.iter().collect::<String>())
            .collect::<Vec<_>>();

        Ok(pairs.join(":"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_raw_value_short_circuits() {
        assert_eq!(DataTransform::conv_temp(0.0), 0.0);
        assert_eq!(DataTransform::conv_moisture(0.0), 0.0);
        assert_eq!(DataTransform::conv_light(0.0), 0.0);
        assert_eq!(DataTransform::conv_ec(0.0), 0.0);
    }

    #[test]
    fn clamp_bounds_are_exact() {
        assert_eq!(DataTransform::conv_temp(80.0), TEMP_MAX_C);
        assert_eq!(DataTransform::conv_temp(-40.0), TEMP_MIN_C);
        assert_eq!(DataTransform::conv_moisture(75.5), MOISTURE_MAX);
        assert_eq!(DataTransform::conv_moisture(-3.0), MOISTURE_MIN);
    }

    #[test]
    fn ec_saturates_past_raw_limit() {
        assert_eq!(DataTransform::conv_ec(1772.0), EC_MAX);
        assert_eq!(DataTransform::conv_ec(9999.0), EC_MAX);
        let mid = DataTransform::conv_ec(885.5);
        assert!((mid - 5.0).abs() < 1e-9);
    }

    #[test]
    fn light_curve_known_values() {
        // 16655.6019 * 1.0^-1.0606619 == the curve coefficient itself
        assert!((DataTransform::conv_light(1.0) - 16655.6019).abs() < 1e-6);
        let dim = DataTransform::conv_light(1000.0);
        assert!(dim > 0.0 && dim < 20.0);
    }

    #[test]
    fn ph_curve_known_values() {
        // Zero ADC counts leaves only the fixed probe offset
        assert!((DataTransform::conv_ph(0.0) - 1.0).abs() < 1e-12);
        let neutral = DataTransform::conv_ph(2048.0);
        assert!(neutral > 4.0 && neutral < 7.0);
    }

    #[test]
    fn mac_formatter_pairs_octets() {
        assert_eq!(
            DataTransform::conv_mac("C4BE8428894A").expect("even length"),
            "C4:BE:84:28:89:4A"
        );
    }

    #[test]
    fn mac_formatter_rejects_odd_length() {
        assert_eq!(
            DataTransform::conv_mac("C4BE8").unwrap_err(),
            CodecError::OddAddressLength(5)
        );
    }

    #[test]
    fn u16_unpack_is_little_endian() {
        assert_eq!(DataTransform::unpack_u16(&[0x34, 0x12]).unwrap(), 4660.0);
        assert!(DataTransform::unpack_u16(&[0x34]).is_err());
    }

    #[test]
    fn float32_decode_round_trips() {
        let bytes = 21.75_f32.to_le_bytes();
        assert_eq!(DataTransform::decode_float32(&bytes).unwrap(), 21.75);
        assert!(DataTransform::decode_float32(&bytes[..3]).is_err());
    }
}
