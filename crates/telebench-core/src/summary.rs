//! # Run Summary
//!
//! The terminal artifact of a run, persisted as a result directory:
//!
//! - `summary.json`: this struct
//! - `latencies.txt`: one latency sample (ms) per line, only if any exist
//! - `errors.txt`: one error per line, only if any exist
//! - `validation.txt`: the rendered QoS report, written by the CLI

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Config, Role};
use crate::driver::{DriverMetrics, DriverMode};
use crate::error::SummaryError;
use crate::fault::FailureSummary;
use crate::metrics::{ClientSummary, MetricsSnapshot};
use crate::orchestrator::RunExit;

pub const SUMMARY_FILE: &str = "summary.json";
pub const LATENCIES_FILE: &str = "latencies.txt";
pub const ERRORS_FILE: &str = "errors.txt";
pub const VALIDATION_FILE: &str = "validation.txt";

/// Immutable result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub protocol: String,
    pub mode: DriverMode,
    pub role: Role,
    pub node_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub exit: RunExit,
    pub metrics: MetricsSnapshot,
    #[serde(default)]
    pub clients: Vec<ClientSummary>,
    #[serde(default)]
    pub failures: FailureSummary,
    #[serde(default)]
    pub driver_metrics: DriverMetrics,
    pub config: Config,
    /// Raw samples, persisted to `latencies.txt` rather than the JSON.
    #[serde(skip)]
    pub latencies_ms: Vec<f64>,
    /// Error log, persisted to `errors.txt`.
    #[serde(skip)]
    pub error_log: Vec<String>,
}

impl RunSummary {
    /// A run is usable if it completed or sent at least one message.
    pub fn usable(&self) -> bool {
        self.exit == RunExit::Completed || self.metrics.sent > 0
    }

    /// `<base>/<protocol>_<unix seconds of start>`.
    pub fn output_dir(&self, base: impl AsRef<Path>) -> PathBuf {
        base.as_ref()
            .join(format!("{}_{}", self.protocol, self.started_at.timestamp()))
    }

    /// Writes the result files into `dir`, creating it if needed.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<(), SummaryError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| io_err(dir, source))?;

        let path = dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|source| SummaryError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| io_err(&path, source))?;

        if !self.latencies_ms.is_empty() {
            let path = dir.join(LATENCIES_FILE);
            let body: Vec<String> = self.latencies_ms.iter().map(f64::to_string).collect();
            std::fs::write(&path, body.join("\n")).map_err(|source| io_err(&path, source))?;
        }
        if !self.error_log.is_empty() {
            let path = dir.join(ERRORS_FILE);
            std::fs::write(&path, self.error_log.join("\n"))
                .map_err(|source| io_err(&path, source))?;
        }
        info!(dir = %dir.display(), "results saved");
        Ok(())
    }

    /// Reads a result directory written by [`RunSummary::write_to_dir`].
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, SummaryError> {
        let dir = dir.as_ref();
        let path = dir.join(SUMMARY_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
        let mut summary: RunSummary =
            serde_json::from_str(&text).map_err(|source| SummaryError::Json {
                path: path.clone(),
                source,
            })?;

        let path = dir.join(LATENCIES_FILE);
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
            summary.latencies_ms = text
                .lines()
                .filter_map(|l| l.trim().parse::<f64>().ok())
                .collect();
        }
        let path = dir.join(ERRORS_FILE);
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
            summary.error_log = text.lines().map(str::to_string).collect();
        }
        Ok(summary)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> SummaryError {
    SummaryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Best-effort host name for result attribution.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".into())
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.metrics;
        writeln!(
            f,
            "{} [{} / {}] node={} exit={}",
            self.protocol, self.mode, self.role, self.node_id, self.exit
        )?;
        writeln!(f, "  duration:   {:.2}s", m.duration_sec)?;
        writeln!(
            f,
            "  sent/recv:  {}/{} (lost {}, loss {:.2}%)",
            m.sent,
            m.recv,
            m.lost,
            m.loss_percent()
        )?;
        writeln!(f, "  throughput: {:.1} msg/s", m.throughput_msg_sec)?;
        writeln!(f, "  errors:     {}", m.errors)?;
        if let Some(lat) = &m.latency {
            let p = &lat.percentiles;
            writeln!(
                f,
                "  latency:    avg {:.2}ms p50 {:.2}ms p95 {:.2}ms p99 {:.2}ms",
                lat.avg_ms, p.p50, p.p95, p.p99
            )?;
        }
        if self.failures.total_events > 0 {
            writeln!(f, "  faults:     {} injected", self.failures.total_events)?;
        }
        Ok(())
    }
}
