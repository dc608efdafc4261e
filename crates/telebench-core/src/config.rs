//! Run configuration.
//!
//! A [`Config`] is loaded from JSON or TOML (chosen by file extension),
//! validated once, and then shared read-only for the whole run.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::clock::saturating_secs;
use crate::error::ConfigError;
use crate::fault::FaultConfig;
use crate::generator::BurstPattern;
use crate::reading::{parse_sensor_list, SensorKind};
use crate::validator::QosRequirements;

/// Longest accepted run or burst phase, in seconds (30 days).
pub const MAX_DURATION_SECS: f64 = 30.0 * 24.0 * 3600.0;
/// Slowest accepted per-client rate: one message every ~17 minutes.
pub const MIN_RATE: f64 = 0.001;

/// Deployment role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Aggregator: runs the server, normally with no local clients.
    #[default]
    Core,
    /// Edge node: runs clients that publish to a core.
    Sensor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Core => "core",
            Role::Sensor => "sensor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub protocol: String,
    pub server_ip: String,
    pub server_port: u16,
    pub num_clients: usize,
    /// Run duration in seconds.
    pub duration: f64,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_sensors", deserialize_with = "deserialize_sensors")]
    pub sensors: Vec<SensorKind>,
    /// Messages per second per client.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Seed for generator and fault-injector randomness.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Pause after starting the server and after starting clients.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub qos_requirements: QosRequirements,
    #[serde(default)]
    pub failure_injection: FaultConfig,
    /// Alternating burst/idle traffic instead of a steady `rate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<BurstPattern>,
    /// Driver-specific settings, opaque to the core.
    #[serde(default)]
    pub options: Map<String, Value>,
}

fn default_sensors() -> Vec<SensorKind> {
    vec![SensorKind::Temperature, SensorKind::Humidity, SensorKind::Motion]
}

fn default_rate() -> f64 {
    1.0
}

fn default_settle_ms() -> u64 {
    500
}

fn deserialize_sensors<'de, D>(deserializer: D) -> Result<Vec<SensorKind>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SensorSpec {
        List(Vec<SensorKind>),
        Csv(String),
    }

    Ok(match SensorSpec::deserialize(deserializer)? {
        SensorSpec::List(list) => list,
        SensorSpec::Csv(csv) => parse_sensor_list(&csv),
    })
}

fn check_secs(field: &'static str, secs: f64) -> Result<(), ConfigError> {
    if secs > 0.0 && secs <= MAX_DURATION_SECS {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{secs} is outside (0, {MAX_DURATION_SECS}] seconds"),
        })
    }
}

fn check_rate(field: &'static str, rate: f64) -> Result<(), ConfigError> {
    if rate.is_finite() && rate >= MIN_RATE {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{rate} is below {MIN_RATE} messages per second or not finite"),
        })
    }
}

/// Non-fatal configuration oddities, logged at load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    SensorWithoutClients,
    CoreWithClients(usize),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::SensorWithoutClients => {
                write!(f, "sensor role with 0 clients will send nothing")
            }
            ConfigWarning::CoreWithClients(n) => {
                write!(f, "core role with {n} clients will publish to itself")
            }
        }
    }
}

impl Config {
    /// Reads, parses, and validates a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let cfg = Self::parse_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses a config file without validating it.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&text).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })
        } else {
            serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_json::from_str(text).map_err(|source| ConfigError::Json {
            path: "<inline>".into(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks field ranges. Returns warnings for suspicious but runnable setups.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if self.protocol.trim().is_empty() {
            return Err(ConfigError::Missing("protocol"));
        }
        if self.server_ip.trim().is_empty() {
            return Err(ConfigError::Missing("server_ip"));
        }
        if self.server_ip.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid {
                field: "server_ip",
                reason: format!("`{}` is not an IP address", self.server_ip),
            });
        }
        check_secs("duration", self.duration)?;
        check_rate("rate", self.rate)?;
        if let Some(burst) = &self.burst {
            check_rate("burst.burst_rate", burst.burst_rate)?;
            check_rate("burst.idle_rate", burst.idle_rate)?;
            check_secs("burst.burst_secs", burst.burst_secs)?;
            check_secs("burst.idle_secs", burst.idle_secs)?;
        }
        if self.sensors.is_empty() {
            return Err(ConfigError::Invalid {
                field: "sensors",
                reason: "at least one sensor type is required".into(),
            });
        }
        self.failure_injection.validate()?;
        self.qos_requirements.validate()?;

        let mut warnings = Vec::new();
        match (self.role, self.num_clients) {
            (Role::Sensor, 0) => warnings.push(ConfigWarning::SensorWithoutClients),
            (Role::Core, n) if n > 0 => warnings.push(ConfigWarning::CoreWithClients(n)),
            _ => {}
        }
        for w in &warnings {
            warn!(protocol = %self.protocol, "config: {w}");
        }
        Ok(warnings)
    }

    pub fn duration(&self) -> Duration {
        saturating_secs(self.duration)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Node identity; defaults to the role name.
    pub fn node_id(&self) -> &str {
        self.node_id.as_deref().unwrap_or(self.role.as_str())
    }

    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.server_ip.parse().map_err(|_| ConfigError::Invalid {
            field: "server_ip",
            reason: format!("`{}` is not an IP address", self.server_ip),
        })?;
        Ok(SocketAddr::new(ip, self.server_port))
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(Value::as_f64)
    }

    /// A string-array option, e.g. command arguments.
    pub fn option_strings(&self, key: &str) -> Option<Vec<String>> {
        self.options.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
    }

    /// Minimal valid config for the given protocol, used by tests and tooling.
    pub fn minimal(protocol: &str, num_clients: usize, duration: f64) -> Self {
        Config {
            protocol: protocol.to_string(),
            server_ip: "127.0.0.1".into(),
            server_port: 0,
            num_clients,
            duration,
            role: if num_clients == 0 { Role::Core } else { Role::Sensor },
            node_id: None,
            sensors: default_sensors(),
            rate: default_rate(),
            seed: None,
            settle_ms: 0,
            qos_requirements: QosRequirements::default(),
            failure_injection: FaultConfig::default(),
            burst: None,
            options: Map::new(),
        }
    }
}
