//! Protocol driver contract and name-based driver registry.
//!
//! A driver wraps one concrete protocol stack (an in-process transport, a
//! client library, or external binaries). The orchestrator only sees this
//! trait; `send` must be observably synchronous even if the driver runs its
//! own worker threads.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{DriverError, ParseError, RunError};
use crate::reading::{ClientId, Reading};

/// How traffic flows through a driver, declared once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverMode {
    /// The orchestrator calls `send` for every reading.
    Active,
    /// The driver generates traffic itself; results are harvested after the run.
    Passive,
}

impl fmt::Display for DriverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverMode::Active => f.write_str("active"),
            DriverMode::Passive => f.write_str("passive"),
        }
    }
}

/// Result of sending one reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SendOutcome {
    pub success: bool,
    /// Server receipt time, seconds since the Unix epoch.
    pub server_timestamp: Option<f64>,
}

impl SendOutcome {
    pub fn delivered(server_timestamp: f64) -> Self {
        Self {
            success: true,
            server_timestamp: Some(server_timestamp),
        }
    }

    /// Delivered, but the driver cannot observe a receipt time.
    pub fn delivered_untimed() -> Self {
        Self {
            success: true,
            server_timestamp: None,
        }
    }

    pub fn dropped() -> Self {
        Self {
            success: false,
            server_timestamp: None,
        }
    }

    /// Latency in milliseconds, or `None` unless the send succeeded and the
    /// server timestamp is strictly later than `send_timestamp`.
    pub fn latency_ms(&self, send_timestamp: f64) -> Option<f64> {
        match self.server_timestamp {
            Some(ts) if self.success && ts > send_timestamp => Some((ts - send_timestamp) * 1000.0),
            _ => None,
        }
    }
}

/// Driver-specific metrics, opaque to the core.
pub type DriverMetrics = BTreeMap<String, Value>;

/// Results read back from a passive driver's side channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Harvest {
    /// Messages the driver reports as sent, if it knows.
    pub sent: Option<u64>,
    pub latencies_ms: Vec<f64>,
}

/// Capability contract every protocol driver satisfies.
pub trait ProtocolDriver: Send {
    fn name(&self) -> &str;

    fn mode(&self) -> DriverMode;

    /// Binds and starts the server in the background. Must return quickly.
    fn start_server(&mut self) -> Result<(), DriverError>;

    /// Starts `n` clients in the background. May be a no-op.
    fn start_clients(&mut self, n: usize) -> Result<(), DriverError>;

    /// Sends one reading from `client` and waits for its outcome.
    ///
    /// Passive drivers keep the default, which reports the operation as unsupported.
    fn send(&mut self, client: &ClientId, reading: Reading) -> Result<SendOutcome, DriverError> {
        let _ = (client, reading);
        Err(DriverError::Unsupported("send"))
    }

    /// Terminates all background work. Idempotent.
    fn stop(&mut self) -> Result<(), DriverError>;

    fn is_alive(&self) -> bool;

    fn metrics(&self) -> DriverMetrics {
        DriverMetrics::new()
    }

    /// Reads passive-mode results back after the run.
    fn harvest(&mut self) -> Result<Harvest, ParseError> {
        Ok(Harvest::default())
    }
}

impl<D: ProtocolDriver + ?Sized> ProtocolDriver for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn mode(&self) -> DriverMode {
        (**self).mode()
    }

    fn start_server(&mut self) -> Result<(), DriverError> {
        (**self).start_server()
    }

    fn start_clients(&mut self, n: usize) -> Result<(), DriverError> {
        (**self).start_clients(n)
    }

    fn send(&mut self, client: &ClientId, reading: Reading) -> Result<SendOutcome, DriverError> {
        (**self).send(client, reading)
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        (**self).stop()
    }

    fn is_alive(&self) -> bool {
        (**self).is_alive()
    }

    fn metrics(&self) -> DriverMetrics {
        (**self).metrics()
    }

    fn harvest(&mut self) -> Result<Harvest, ParseError> {
        (**self).harvest()
    }
}

/// Builds a driver instance for one run.
pub type DriverFactory =
    Box<dyn Fn(&Config) -> Result<Box<dyn ProtocolDriver>, DriverError> + Send + Sync>;

/// Maps protocol names to driver factories.
#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name` (case-insensitive), replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config) -> Result<Box<dyn ProtocolDriver>, DriverError> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.to_ascii_lowercase(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Constructs a fresh driver for `cfg.protocol`.
    pub fn resolve(&self, cfg: &Config) -> Result<Box<dyn ProtocolDriver>, RunError> {
        let factory = self
            .factories
            .get(&cfg.protocol.to_ascii_lowercase())
            .ok_or_else(|| RunError::DriverLoad {
                protocol: cfg.protocol.clone(),
                available: self.names(),
            })?;
        factory(cfg).map_err(|source| RunError::DriverInit {
            protocol: cfg.protocol.clone(),
            source,
        })
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("protocols", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    impl ProtocolDriver for Null {
        fn name(&self) -> &str {
            "null"
        }
        fn mode(&self) -> DriverMode {
            DriverMode::Passive
        }
        fn start_server(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        fn start_clients(&mut self, _n: usize) -> Result<(), DriverError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        fn is_alive(&self) -> bool {
            true
        }
    }

    #[test]
    fn latency_requires_later_server_timestamp() {
        assert_eq!(SendOutcome::delivered(99.0).latency_ms(100.0), None);
        assert_eq!(SendOutcome::delivered(100.0).latency_ms(100.0), None);
        let lat = SendOutcome::delivered(100.25).latency_ms(100.0).unwrap();
        assert!((lat - 250.0).abs() < 1e-6);
        assert_eq!(SendOutcome::dropped().latency_ms(0.0), None);
        assert_eq!(SendOutcome::delivered_untimed().latency_ms(0.0), None);
    }

    #[test]
    fn passive_driver_send_is_unsupported() {
        let mut d = Null;
        let reading = Reading {
            client_id: ClientId::indexed(0),
            device_id: "temp_0".into(),
            sequence_no: 1,
            timestamp: 0.0,
            sensor: crate::reading::SensorValue::Switch { on: true },
            node_id: None,
        };
        assert!(matches!(
            d.send(&ClientId::indexed(0), reading),
            Err(DriverError::Unsupported("send"))
        ));
    }

    #[test]
    fn registry_resolves_case_insensitively() {
        let mut reg = DriverRegistry::new();
        reg.register("Null", |_| Ok(Box::new(Null)));
        assert!(reg.contains("NULL"));
        let cfg = Config::minimal("null", 0, 1.0);
        let driver = reg.resolve(&cfg).unwrap();
        assert_eq!(driver.name(), "null");
    }

    #[test]
    fn registry_unknown_protocol_is_load_error() {
        let mut reg = DriverRegistry::new();
        reg.register("null", |_| Ok(Box::new(Null)));
        let cfg = Config::minimal("mqtt", 0, 1.0);
        match reg.resolve(&cfg) {
            Err(RunError::DriverLoad { protocol, available }) => {
                assert_eq!(protocol, "mqtt");
                assert_eq!(available, vec!["null".to_string()]);
            }
            other => panic!("expected DriverLoad, got {:?}", other.map(|d| d.name().to_string())),
        }
    }

    #[test]
    fn registry_factory_failure_is_init_error() {
        let mut reg = DriverRegistry::new();
        reg.register("broken", |_| Err(DriverError::Start("no binary".into())));
        let cfg = Config::minimal("broken", 0, 1.0);
        assert!(matches!(reg.resolve(&cfg), Err(RunError::DriverInit { .. })));
    }
}
