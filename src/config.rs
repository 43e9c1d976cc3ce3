use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sensor::Transform;

/// Top-level configuration for the livemon agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Aggregator tick interval. Default: 100ms.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How to collapse a burst of samples into one representative sample.
    #[serde(default)]
    pub method: Method,

    /// Lines consumed per port before an inferred format freezes. Default: 15.
    #[serde(default = "default_infer_limit")]
    pub infer_limit: usize,

    /// CSV logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Serial port connection parameters, keyed by port name.
    #[serde(default)]
    pub ports: BTreeMap<String, PortConfig>,

    /// Sensor declarations, keyed by sensor name.
    #[serde(default)]
    pub sensors: BTreeMap<String, SensorConfig>,
}

/// Aggregation policy applied per sensor per tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Most recent sample verbatim.
    #[default]
    Last,
    /// Final sample's timestamp, arithmetic mean of every field.
    Average,
}

/// CSV logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for per-sensor CSV files. Unset disables logging.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// How often buffered rows are flushed to disk. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Connection parameters for one serial port.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// Device path. Defaults to `/dev/tty.<name>`, the usual naming for
    /// virtual port pairs on unix.
    #[serde(default)]
    pub device: Option<String>,

    /// Transfer rate in bits per second. Default: 9600.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Data bits per character (5-8). Default: 8.
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Stop bits (1 or 2). Default: 1.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Parity checking mode. Default: none.
    #[serde(default)]
    pub parity: Parity,

    /// Read timeout; bounds how quickly a reader reacts to stop. Default: 10ms.
    #[serde(default = "default_port_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Assert DTR/RTS handshake lines, required for virtual port pairs.
    #[serde(default, rename = "virtual")]
    pub virtual_port: bool,

    /// Field delimiter pattern. Default: whitespace.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Line text encoding. Default: utf-8.
    #[serde(default)]
    pub encoding: Encoding,

    /// Echo raw lines to the console and skip all parsing.
    #[serde(default)]
    pub listener: bool,
}

/// Serial parity modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Supported line encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Encoding {
    #[serde(rename = "ascii")]
    Ascii,
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
}

/// Declaration of one sensor channel.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Port the sensor's lines arrive on. Unused for aggregates.
    #[serde(default)]
    pub port: Option<String>,

    /// Wire key identifying this sensor's lines, or unset for keyless.
    #[serde(default)]
    pub key: Option<String>,

    /// Column layout: `key`, `int`, and `float` entries in wire order.
    #[serde(default = "default_dtype")]
    pub dtype: Vec<String>,

    /// Value column index/indices to plot.
    #[serde(default)]
    pub value_index: Option<Vec<usize>>,

    /// Plot y-axis label. Defaults to the sensor name.
    #[serde(default)]
    pub label: Option<String>,

    /// Zero-based column subset to include in the log file.
    #[serde(default)]
    pub logging: Option<Vec<usize>>,

    /// CSV column headings, aligned with `logging`.
    #[serde(default)]
    pub columns: Option<Vec<String>>,

    /// Legend labels when `value_index` plots multiple lines.
    #[serde(default)]
    pub legends: Option<Vec<String>>,

    /// Constituent sensor names for aggregate channels.
    #[serde(default)]
    pub sensors: Option<Vec<String>>,

    /// Transform applied across constituents for aggregate channels.
    #[serde(default)]
    pub transform: Option<Transform>,
}

impl PortConfig {
    /// Resolves the device path for the port named `name`.
    pub fn device_path(&self, name: &str) -> String {
        self.device
            .clone()
            .unwrap_or_else(|| format!("/dev/tty.{name}"))
    }

    /// Serial data bits. Validated range 5-8.
    pub fn serial_data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    /// Serial stop bits. Validated to 1 or 2.
    pub fn serial_stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        }
    }

    /// Serial parity mode.
    pub fn serial_parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_infer_limit() -> usize {
    15
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_port_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_delimiter() -> String {
    r"\s+".to_string()
}

fn default_dtype() -> Vec<String> {
    vec!["key".to_string(), "int".to_string(), "float".to_string()]
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            method: Method::default(),
            infer_limit: default_infer_limit(),
            logging: LoggingConfig::default(),
            ports: BTreeMap::new(),
            sensors: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            flush_interval: default_flush_interval(),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud: default_baud(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            timeout: default_port_timeout(),
            virtual_port: false,
            delimiter: default_delimiter(),
            encoding: Encoding::default(),
            listener: false,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.logging.flush_interval.is_zero() {
            bail!("logging.flush_interval must be positive");
        }

        if self.ports.is_empty() {
            bail!("at least one port must be configured");
        }

        for (name, port) in &self.ports {
            if port.baud == 0 {
                bail!("port {name}: baud must be positive");
            }
            if !(5..=8).contains(&port.data_bits) {
                bail!("port {name}: data_bits must be between 5 and 8");
            }
            if port.stop_bits != 1 && port.stop_bits != 2 {
                bail!("port {name}: stop_bits must be 1 or 2");
            }
            if port.timeout.is_zero() {
                bail!("port {name}: timeout must be positive");
            }
            regex::Regex::new(&port.delimiter)
                .with_context(|| format!("port {name}: invalid delimiter pattern"))?;
        }

        let mut keyless_per_port: BTreeMap<&str, &str> = BTreeMap::new();

        for (name, sensor) in &self.sensors {
            let is_aggregate = sensor.sensors.is_some() || sensor.transform.is_some();

            if is_aggregate {
                let Some(constituents) = &sensor.sensors else {
                    bail!("sensor {name}: aggregate sensors need a `sensors` list");
                };
                if sensor.transform.is_none() {
                    bail!("sensor {name}: aggregate sensors need a `transform`");
                }
                if constituents.is_empty() {
                    bail!("sensor {name}: aggregate `sensors` list is empty");
                }
                for constituent in constituents {
                    if !self.sensors.contains_key(constituent) {
                        bail!("sensor {name}: unknown constituent sensor {constituent}");
                    }
                    if constituent == name {
                        bail!("sensor {name}: aggregate cannot list itself");
                    }
                }
                continue;
            }

            let Some(port) = &sensor.port else {
                bail!("sensor {name}: a port is required for non-aggregate sensors");
            };
            if !self.ports.contains_key(port) {
                bail!("sensor {name}: unknown port {port}");
            }

            if sensor.key.is_none() {
                if let Some(other) = keyless_per_port.insert(port.as_str(), name.as_str()) {
                    bail!(
                        "port {port}: keyless sensors {other} and {name} are \
                         indistinguishable on the same port"
                    );
                }
            }

            let value_columns = sensor
                .dtype
                .iter()
                .filter(|entry| entry.as_str() != "key")
                .count();

            if let (Some(logging), Some(columns)) = (&sensor.logging, &sensor.columns) {
                if logging.len() != columns.len() {
                    bail!(
                        "sensor {name}: {} column headings for {} logging indices",
                        columns.len(),
                        logging.len()
                    );
                }
            }

            if let Some(logging) = &sensor.logging {
                for index in logging {
                    if *index >= value_columns {
                        bail!("sensor {name}: logging index {index} out of range");
                    }
                }
            }

            if let Some(value_index) = &sensor.value_index {
                for index in value_index {
                    if *index >= value_columns {
                        bail!("sensor {name}: value_index {index} out of range");
                    }
                }
            }
        }

        Ok(())
    }
}
