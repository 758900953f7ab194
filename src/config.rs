use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

// ---------------------------------------------------------------------------
// CommandSource
// ---------------------------------------------------------------------------

/// Where the agent receives its on/off commands from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// Poll the `command` column of the device row.
    Poll,
    /// Subscribe to the device's MQTT command topic.
    Mqtt,
}

impl FromStr for CommandSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "polling" => Ok(Self::Poll),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(anyhow::anyhow!("unknown command source: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// RelayDriver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDriver {
    /// Linux `/sys/class/gpio` lines.
    Sysfs,
    /// In-memory pins; nothing is switched.
    Simulated,
}

impl FromStr for RelayDriver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sysfs" => Ok(Self::Sysfs),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(anyhow::anyhow!("unknown relay driver: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    /// Fully expanded topic (the `{device_id}` placeholder is already replaced).
    pub command_topic: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub supabase_url: String,
    pub supabase_key: String,
    pub device_id: String,
    pub device_table: String,
    pub history_table: String,
    /// BCM line numbers, one per motor channel.
    pub relay_pins: Vec<u32>,
    pub relay_active_high: bool,
    pub relay_driver: RelayDriver,
    pub gpio_sysfs_root: PathBuf,
    pub gpio_sysfs_base: u32,
    /// `None` means the device has no temperature sensor.
    pub temp_sensor_path: Option<PathBuf>,
    pub temp_sensor_scale: f64,
    /// Rated power of all motors together, in kW.
    pub power_kw: f64,
    pub command_source: CommandSource,
    pub command_poll_interval: Duration,
    pub telemetry_interval: Duration,
    pub temp_sample_interval: Duration,
    pub tick_interval: Duration,
    /// Present only when `command_source` is `Mqtt`.
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let device_id = optional("DEVICE_ID", "pi-default");
        let command_source: CommandSource = optional("COMMAND_SOURCE", "poll")
            .parse()
            .context("COMMAND_SOURCE must be 'poll' or 'mqtt'")?;

        let mqtt = match command_source {
            CommandSource::Poll => None,
            CommandSource::Mqtt => Some(MqttConfig {
                host: required("MQTT_HOST")?,
                port: optional("MQTT_PORT", "8883")
                    .parse()
                    .context("MQTT_PORT must be a valid port number")?,
                username: std::env::var("MQTT_USER").ok(),
                password: std::env::var("MQTT_PASS").ok(),
                tls: parse_bool(&optional("MQTT_TLS", "true")),
                command_topic: expand_topic(
                    &optional(
                        "MQTT_COMMAND_TOPIC",
                        "upaspiradores/maquinas/{device_id}/comandos",
                    ),
                    &device_id,
                ),
            }),
        };

        let power_kw: f64 = optional("VACUUM_POWER_KW", "2.4")
            .parse()
            .context("VACUUM_POWER_KW must be a number")?;
        if !power_kw.is_finite() || power_kw < 0.0 {
            bail!("VACUUM_POWER_KW must be a non-negative number, got {power_kw}");
        }

        Ok(Self {
            supabase_url: required("SUPABASE_URL")?,
            supabase_key: required("SUPABASE_KEY")?,
            device_id,
            device_table: optional("DEVICE_TABLE", "machines"),
            history_table: optional("HISTORY_TABLE", "activation_history"),
            relay_pins: parse_pins(&optional("RELAY_PINS", "19,21"))?,
            relay_active_high: parse_bool(&optional("RELAY_ACTIVE_HIGH", "true")),
            relay_driver: optional("RELAY_DRIVER", "sysfs")
                .parse()
                .context("RELAY_DRIVER must be 'sysfs' or 'simulated'")?,
            gpio_sysfs_root: PathBuf::from(optional("GPIO_SYSFS_ROOT", "/sys/class/gpio")),
            gpio_sysfs_base: optional("GPIO_SYSFS_BASE", "0")
                .parse()
                .context("GPIO_SYSFS_BASE must be a non-negative integer")?,
            temp_sensor_path: std::env::var("TEMP_SENSOR_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            temp_sensor_scale: optional("TEMP_SENSOR_SCALE", "1000")
                .parse()
                .context("TEMP_SENSOR_SCALE must be a number")?,
            power_kw,
            command_source,
            command_poll_interval: secs("COMMAND_POLL_INTERVAL_SECS", "5")?,
            telemetry_interval: secs("TELEMETRY_INTERVAL_SECS", "60")?,
            temp_sample_interval: secs("TEMP_SAMPLE_INTERVAL_SECS", "10")?,
            tick_interval: Duration::from_millis(positive("TICK_INTERVAL_MS", "1000")?),
            mqtt,
        })
    }

    pub fn has_temperature_sensor(&self) -> bool {
        self.temp_sensor_path.is_some()
    }
}

/// Parse `"19,21"` into line numbers. At least one line is required.
fn parse_pins(raw: &str) -> Result<Vec<u32>> {
    let pins = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("RELAY_PINS entry must be a GPIO line number, got: {s:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    if pins.is_empty() {
        bail!("RELAY_PINS must name at least one GPIO line");
    }
    Ok(pins)
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn expand_topic(template: &str, device_id: &str) -> String {
    template.replace("{device_id}", device_id)
}

fn secs(key: &str, default: &str) -> Result<Duration> {
    positive(key, default).map(Duration::from_secs)
}

fn positive(key: &str, default: &str) -> Result<u64> {
    let n: u64 = optional(key, default)
        .parse()
        .with_context(|| format!("{key} must be a positive integer"))?;
    if n == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(n)
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pins_two_channels() {
        assert_eq!(parse_pins("19,21").unwrap(), vec![19, 21]);
    }

    #[test]
    fn parse_pins_tolerates_spaces_and_trailing_comma() {
        assert_eq!(parse_pins(" 17 ,").unwrap(), vec![17]);
    }

    #[test]
    fn parse_pins_empty_errors() {
        let err = parse_pins("").unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn parse_pins_garbage_errors() {
        let err = parse_pins("19,abc").unwrap_err();
        assert!(err.to_string().contains("GPIO line number"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn command_source_from_str() {
        assert_eq!("poll".parse::<CommandSource>().unwrap(), CommandSource::Poll);
        assert_eq!("MQTT".parse::<CommandSource>().unwrap(), CommandSource::Mqtt);
        let err = "carrier-pigeon".parse::<CommandSource>().unwrap_err();
        assert!(err.to_string().contains("unknown command source"));
    }

    #[test]
    fn relay_driver_from_str() {
        assert_eq!("sysfs".parse::<RelayDriver>().unwrap(), RelayDriver::Sysfs);
        assert_eq!("simulated".parse::<RelayDriver>().unwrap(), RelayDriver::Simulated);
        assert!("spi".parse::<RelayDriver>().is_err());
    }

    #[test]
    fn expand_topic_substitutes_device_id() {
        assert_eq!(
            expand_topic("upaspiradores/maquinas/{device_id}/comandos", "7"),
            "upaspiradores/maquinas/7/comandos"
        );
        assert_eq!(expand_topic("fixed/topic", "7"), "fixed/topic");
    }
}
