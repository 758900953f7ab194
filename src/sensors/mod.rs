use std::{fs, io, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Readings outside this window are treated as sensor faults.
pub const MIN_VALID_CELSIUS: f64 = -10.0;
pub const MAX_VALID_CELSIUS: f64 = 80.0;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("unparsable sensor output {raw:?}")]
    Parse { raw: String },

    #[error("sensor reported a failed checksum")]
    Checksum,

    #[error("reading {0} °C is outside the valid range")]
    OutOfRange(f64),
}

/// Instantaneous temperature source.
pub trait TemperatureSensor: Send + Sync {
    fn read_celsius(&mut self) -> Result<f64, SensorError>;
}

/// Accept a reading only if it lies within
/// [`MIN_VALID_CELSIUS`, `MAX_VALID_CELSIUS`].
pub fn validate(celsius: f64) -> Result<f64, SensorError> {
    if celsius.is_finite() && (MIN_VALID_CELSIUS..=MAX_VALID_CELSIUS).contains(&celsius) {
        Ok(celsius)
    } else {
        Err(SensorError::OutOfRange(celsius))
    }
}

/// Read and validate one sample. Any failure is logged and yields `None`.
pub fn sample(sensor: &mut dyn TemperatureSensor) -> Option<f64> {
    match sensor.read_celsius().and_then(validate) {
        Ok(celsius) => {
            debug!(celsius, "Temperature sampled");
            Some(celsius)
        }
        Err(e) => {
            warn!(error = %e, "Temperature reading unavailable");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// FileSensor
// ---------------------------------------------------------------------------

/// Sensor exposed by the kernel as a text file.
///
/// Handles plain numeric files (hwmon `temp*_input`, IIO
/// `in_temp_input`, 1-wire `temperature`) as well as the two-line 1-wire
/// `w1_slave` format:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
///
/// The raw number is divided by `scale` (1000 for millidegrees).
#[derive(Debug)]
pub struct FileSensor {
    path: PathBuf,
    scale: f64,
}

impl FileSensor {
    pub fn new(path: impl Into<PathBuf>, scale: f64) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}

impl TemperatureSensor for FileSensor {
    fn read_celsius(&mut self) -> Result<f64, SensorError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| SensorError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_reading(&raw, self.scale)
    }
}

fn parse_reading(raw: &str, scale: f64) -> Result<f64, SensorError> {
    let text = raw.trim();

    let number = match text.rsplit_once("t=") {
        Some((header, value)) => {
            if header.lines().next().is_some_and(|crc| !crc.trim_end().ends_with("YES")) {
                return Err(SensorError::Checksum);
            }
            value.trim()
        }
        None => text,
    };

    let value: f64 = number.parse().map_err(|_| SensorError::Parse {
        raw: text.to_owned(),
    })?;

    if scale == 0.0 {
        return Ok(value);
    }
    Ok(value / scale)
}

/// Build the configured sensor, if any.
pub fn open(config: &Config) -> Option<Box<dyn TemperatureSensor>> {
    let path = config.temp_sensor_path.as_ref()?;
    info!(path = %path.display(), scale = config.temp_sensor_scale, "Temperature sensor configured");
    Some(Box::new(FileSensor::new(path.clone(), config.temp_sensor_scale)))
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{stub::ScriptedSensor, *};

    #[test]
    fn validate_is_inclusive_at_both_ends() {
        assert_eq!(validate(-10.0).unwrap(), -10.0);
        assert_eq!(validate(80.0).unwrap(), 80.0);
        assert_eq!(validate(21.5).unwrap(), 21.5);
    }

    #[test]
    fn validate_rejects_out_of_range_and_nan() {
        assert!(matches!(validate(-10.1), Err(SensorError::OutOfRange(_))));
        assert!(matches!(validate(80.5), Err(SensorError::OutOfRange(_))));
        assert!(validate(f64::NAN).is_err());
        assert!(validate(f64::INFINITY).is_err());
    }

    #[test]
    fn sample_filters_errors_and_bad_values() {
        let mut sensor = ScriptedSensor::new([Some(22.0), None, Some(120.0), Some(-40.0)]);
        assert_eq!(sample(&mut sensor), Some(22.0));
        assert_eq!(sample(&mut sensor), None);
        assert_eq!(sample(&mut sensor), None);
        assert_eq!(sample(&mut sensor), None);
    }

    #[test]
    fn parse_plain_millidegrees() {
        assert_eq!(parse_reading("23437\n", 1000.0).unwrap(), 23.437);
    }

    #[test]
    fn parse_plain_degrees_with_unit_scale() {
        assert_eq!(parse_reading("21.5", 1.0).unwrap(), 21.5);
    }

    #[test]
    fn parse_w1_slave() {
        let raw = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                   72 01 4b 46 7f ff 0e 10 57 t=23125\n";
        assert_eq!(parse_reading(raw, 1000.0).unwrap(), 23.125);
    }

    #[test]
    fn parse_w1_slave_bad_crc() {
        let raw = "72 01 4b 46 7f ff 0e 10 57 : crc=00 NO\n\
                   72 01 4b 46 7f ff 0e 10 57 t=85000\n";
        assert!(matches!(parse_reading(raw, 1000.0), Err(SensorError::Checksum)));
    }

    #[test]
    fn parse_garbage() {
        let err = parse_reading("not a number", 1000.0).unwrap_err();
        assert!(err.to_string().contains("unparsable"));
    }

    #[test]
    fn file_sensor_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "19500").unwrap();

        let mut sensor = FileSensor::new(file.path(), 1000.0);
        assert_eq!(sensor.read_celsius().unwrap(), 19.5);
    }

    #[test]
    fn file_sensor_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sensor = FileSensor::new(dir.path().join("gone"), 1000.0);
        assert!(matches!(sensor.read_celsius(), Err(SensorError::Io { .. })));
    }
}
