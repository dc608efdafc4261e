//! QoS validation of a finished run.
//!
//! Runs a fixed set of checks against a [`RunSummary`] and renders a plain-text
//! verdict. Purely a consumer: nothing here feeds back into the run.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SummaryError};
use crate::summary::{RunSummary, VALIDATION_FILE};

/// Thresholds a run is judged against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosRequirements {
    /// P95 ceiling; P99 is allowed twice this.
    pub max_latency_ms: f64,
    pub max_loss_percent: f64,
    /// Minimum delivered messages.
    pub min_messages: u64,
}

impl Default for QosRequirements {
    fn default() -> Self {
        Self {
            max_latency_ms: 200.0,
            max_loss_percent: 1.0,
            min_messages: 10,
        }
    }
}

impl QosRequirements {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_latency_ms.is_finite() && self.max_latency_ms > 0.0) {
            return Err(ConfigError::Invalid {
                field: "qos_requirements.max_latency_ms",
                reason: "must be positive".into(),
            });
        }
        if !(0.0..=100.0).contains(&self.max_loss_percent) {
            return Err(ConfigError::Invalid {
                field: "qos_requirements.max_loss_percent",
                reason: format!("{} is not a percentage", self.max_loss_percent),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub message: String,
    /// `Info` for passing checks, otherwise the check's failure severity.
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Check {
    fn new(name: &str, passed: bool, on_fail: Severity, message: String, value: f64) -> Self {
        Self {
            name: name.to_string(),
            passed,
            message,
            severity: if passed { Severity::Info } else { on_fail },
            value: Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    AllPassed,
    CriticalIssues,
    Warnings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<Check>,
}

impl ValidationReport {
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Writes the rendered report to `validation.txt` in `dir`.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf, SummaryError> {
        let path = dir.as_ref().join(VALIDATION_FILE);
        std::fs::write(&path, self.to_string()).map_err(|source| SummaryError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn verdict(&self) -> Verdict {
        if self.passed() {
            Verdict::AllPassed
        } else if self
            .checks
            .iter()
            .any(|c| !c.passed && c.severity == Severity::Critical)
        {
            Verdict::CriticalIssues
        } else {
            Verdict::Warnings
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "QOS VALIDATION REPORT")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Checks passed: {}/{}", self.passed_count(), self.checks.len())?;
        writeln!(f)?;
        for c in &self.checks {
            let mark = match (c.passed, c.severity) {
                (true, _) => "[ok]  ",
                (false, Severity::Critical) => "[FAIL]",
                (false, _) => "[warn]",
            };
            writeln!(f, "{mark} {}: {}", c.name, c.message)?;
        }
        writeln!(f, "{rule}")?;
        let verdict = match self.verdict() {
            Verdict::AllPassed => "ALL CHECKS PASSED",
            Verdict::CriticalIssues => "CRITICAL ISSUES FOUND",
            Verdict::Warnings => "PASSED WITH WARNINGS",
        };
        writeln!(f, "{verdict}")?;
        write!(f, "{rule}")
    }
}

/// Evaluates `summary` against `qos`.
pub fn validate(summary: &RunSummary, qos: &QosRequirements) -> ValidationReport {
    let m = &summary.metrics;
    let mut checks = Vec::new();

    if let Some(lat) = &m.latency {
        let p95 = lat.percentiles.p95;
        checks.push(Check::new(
            "Latency (P95)",
            p95 <= qos.max_latency_ms,
            Severity::Critical,
            format!("P95 latency: {p95:.2}ms (threshold: {}ms)", qos.max_latency_ms),
            p95,
        ));
        let p99 = lat.percentiles.p99;
        let max_p99 = qos.max_latency_ms * 2.0;
        checks.push(Check::new(
            "Latency (P99)",
            p99 <= max_p99,
            Severity::Warning,
            format!("P99 latency: {p99:.2}ms (threshold: {max_p99}ms)"),
            p99,
        ));
    }

    let max_loss = qos.max_loss_percent / 100.0;
    checks.push(Check::new(
        "Packet Loss",
        m.loss <= max_loss,
        Severity::Critical,
        format!(
            "Loss rate: {:.2}% (threshold: {:.1}%)",
            m.loss_percent(),
            qos.max_loss_percent
        ),
        m.loss,
    ));

    checks.push(Check::new(
        "Throughput",
        m.recv >= qos.min_messages,
        Severity::Warning,
        format!(
            "Delivered {}/{} messages (min: {})",
            m.recv, m.sent, qos.min_messages
        ),
        m.recv as f64,
    ));

    checks.push(Check::new(
        "Concurrency Handling",
        m.errors == 0,
        Severity::Critical,
        format!("Errors during concurrent operation: {}", m.errors),
        m.errors as f64,
    ));

    checks.push(Check::new(
        "Error Handling",
        m.errors == 0,
        Severity::Warning,
        format!("Total errors: {}", m.errors),
        m.errors as f64,
    ));

    ValidationReport { checks }
}
