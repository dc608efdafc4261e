//! # Protocol Comparison
//!
//! Several protocols run the same scenario. Each metric is reported against
//! the first (baseline) protocol as a percent change, and one protocol is
//! named best overall by a simple score:
//!
//! ```text
//! score = recv - p95_ms - loss * 1000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SummaryError;
use crate::summary::RunSummary;

/// Subdirectory of the results base holding comparison reports.
pub const COMPARISONS_DIR: &str = "comparisons";

/// Loss is weighted so one percentage point costs as much as ten messages.
const LOSS_WEIGHT: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Sent,
    Recv,
    Loss,
    LatAvgMs,
    LatP50Ms,
    LatP95Ms,
    LatP99Ms,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Sent,
        Metric::Recv,
        Metric::Loss,
        Metric::LatAvgMs,
        Metric::LatP50Ms,
        Metric::LatP95Ms,
        Metric::LatP99Ms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Sent => "sent",
            Metric::Recv => "recv",
            Metric::Loss => "loss",
            Metric::LatAvgMs => "lat_avg_ms",
            Metric::LatP50Ms => "lat_p50_ms",
            Metric::LatP95Ms => "lat_p95_ms",
            Metric::LatP99Ms => "lat_p99_ms",
        }
    }

    /// Message counts improve upward; loss and latency improve downward.
    pub fn higher_is_better(&self) -> bool {
        matches!(self, Metric::Sent | Metric::Recv)
    }

    /// The metric's value in `summary`, or `None` when it has no latency samples.
    pub fn value(&self, summary: &RunSummary) -> Option<f64> {
        let m = &summary.metrics;
        let lat = m.latency.as_ref();
        match self {
            Metric::Sent => Some(m.sent as f64),
            Metric::Recv => Some(m.recv as f64),
            Metric::Loss => Some(m.loss),
            Metric::LatAvgMs => lat.map(|l| l.avg_ms),
            Metric::LatP50Ms => lat.map(|l| l.percentiles.p50),
            Metric::LatP95Ms => lat.map(|l| l.percentiles.p95),
            Metric::LatP99Ms => lat.map(|l| l.percentiles.p99),
        }
    }

    fn render(&self, value: Option<f64>) -> String {
        match (self, value) {
            (_, None) => "-".into(),
            (Metric::Sent | Metric::Recv, Some(v)) => format!("{v:.0}"),
            (Metric::Loss, Some(v)) => format!("{:.2}%", v * 100.0),
            (_, Some(v)) => format!("{v:.2}ms"),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One non-baseline protocol's value for a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub protocol: String,
    pub value: Option<f64>,
    /// Percent change from the baseline. `None` when either value is missing
    /// or the baseline is zero.
    pub delta_percent: Option<f64>,
    /// `None` when there is no delta or it is exactly zero.
    pub improved: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric: Metric,
    pub baseline: f64,
    pub others: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    pub protocol: String,
    pub score: f64,
    pub p95_ms: Option<f64>,
    pub loss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub generated_at: DateTime<Utc>,
    pub baseline: String,
    /// Every compared protocol, baseline first.
    pub protocols: Vec<String>,
    /// Metrics the baseline has a value for.
    pub rows: Vec<MetricRow>,
    pub winner: Winner,
}

/// Compares `summaries`, taking the first as the baseline.
///
/// Returns `None` for an empty slice.
pub fn compare(summaries: &[RunSummary]) -> Option<Comparison> {
    let (baseline, others) = summaries.split_first()?;

    let rows = Metric::ALL
        .iter()
        .filter_map(|&metric| {
            let base = metric.value(baseline)?;
            let others = others
                .iter()
                .map(|s| {
                    let value = metric.value(s);
                    let delta_percent = value
                        .filter(|_| base != 0.0)
                        .map(|v| (v - base) / base * 100.0);
                    Entry {
                        protocol: s.protocol.clone(),
                        value,
                        delta_percent,
                        improved: delta_percent
                            .filter(|d| *d != 0.0)
                            .map(|d| (d > 0.0) == metric.higher_is_better()),
                    }
                })
                .collect();
            Some(MetricRow {
                metric,
                baseline: base,
                others,
            })
        })
        .collect();

    let winner = summaries
        .iter()
        .map(|s| Winner {
            protocol: s.protocol.clone(),
            score: score(s),
            p95_ms: Metric::LatP95Ms.value(s),
            loss: s.metrics.loss,
        })
        .reduce(|best, w| if w.score > best.score { w } else { best })?;

    Some(Comparison {
        generated_at: Utc::now(),
        baseline: baseline.protocol.clone(),
        protocols: summaries.iter().map(|s| s.protocol.clone()).collect(),
        rows,
        winner,
    })
}

/// Higher is better. Ties go to the earlier protocol.
pub fn score(summary: &RunSummary) -> f64 {
    let m = &summary.metrics;
    m.recv as f64 - Metric::LatP95Ms.value(summary).unwrap_or(0.0) - m.loss * LOSS_WEIGHT
}

impl Comparison {
    /// `<base>/comparisons/comparison_<unix seconds>.txt`.
    pub fn report_path(&self, base: impl AsRef<Path>) -> PathBuf {
        base.as_ref()
            .join(COMPARISONS_DIR)
            .join(format!("comparison_{}.txt", self.generated_at.timestamp()))
    }

    /// Writes the rendered report under `base`, returning its path.
    pub fn write_report(&self, base: impl AsRef<Path>) -> Result<PathBuf, SummaryError> {
        let path = self.report_path(base);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| SummaryError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, self.to_string()).map_err(|source| SummaryError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), winner = %self.winner.protocol, "comparison saved");
        Ok(path)
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(80);
        writeln!(f, "{rule}")?;
        writeln!(f, "PROTOCOL COMPARISON REPORT")?;
        writeln!(f, "Date:     {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Baseline: {}", self.baseline)?;
        writeln!(f, "{rule}")?;

        write!(f, "{:<12} {:>12}", "Metric", self.baseline)?;
        for proto in self.protocols.iter().skip(1) {
            write!(f, " {proto:>12} {:>14}", format!("vs {}", self.baseline))?;
        }
        writeln!(f)?;
        writeln!(f, "{}", "-".repeat(80))?;

        for row in &self.rows {
            write!(
                f,
                "{:<12} {:>12}",
                row.metric.as_str(),
                row.metric.render(Some(row.baseline))
            )?;
            for entry in &row.others {
                let delta = match (entry.delta_percent, entry.improved) {
                    (Some(d), Some(true)) => format!("{d:+.1}% better"),
                    (Some(d), Some(false)) => format!("{d:+.1}% worse"),
                    (Some(d), None) => format!("{d:+.1}%"),
                    (None, _) => "n/a".into(),
                };
                write!(f, " {:>12} {delta:>14}", row.metric.render(entry.value))?;
            }
            writeln!(f)?;
        }

        writeln!(f, "{rule}")?;
        let w = &self.winner;
        let p95 = w
            .p95_ms
            .map(|v| format!("{v:.2}ms"))
            .unwrap_or_else(|| "n/a".into());
        writeln!(f, "Best overall: {}", w.protocol)?;
        write!(
            f,
            "  score {:.1}, p95 latency {p95}, loss {:.1}%",
            w.score,
            w.loss * 100.0
        )
    }
}
