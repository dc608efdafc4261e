//! Core of the telebench load harness.
//!
//! This crate contains:
//! - **Orchestrator** — run lifecycle state machine driving a protocol driver
//! - **Traffic generator** — lazy, time-bounded synthetic sensor readings
//! - **Fault injector** — send-path decorator for loss, corruption, crashes, partitions, spikes
//! - **Metrics pipeline** — ring-buffer percentiles plus a fixed-bucket histogram
//! - **Run summary / validator / aggregate / compare** — terminal artifacts and their consumers

pub mod aggregate;
pub mod clock;
pub mod compare;
pub mod config;
pub mod driver;
pub mod error;
pub mod fault;
pub mod generator;
pub mod metrics;
pub mod orchestrator;
pub mod passive;
pub mod reading;
pub mod summary;
pub mod validator;

pub use compare::{compare, Comparison};
pub use config::{Config, Role};
pub use driver::{DriverMetrics, DriverMode, DriverRegistry, Harvest, ProtocolDriver, SendOutcome};
pub use error::{ConfigError, DriverError, ParseError, RunError, SummaryError};
pub use fault::{FailureEvent, FailureKind, FaultConfig, FaultInjector};
pub use generator::{ScheduledReading, TrafficGenerator};
pub use metrics::{MetricsPipeline, MetricsSnapshot};
pub use orchestrator::{run_with_registry, Orchestrator, RunExit, RunReport, RunState};
pub use reading::{ClientId, Reading, SensorKind, SensorValue};
pub use summary::RunSummary;
pub use validator::{QosRequirements, ValidationReport};
