//! Multi-node result aggregation.
//!
//! Merges the summaries written by several nodes of one deployment, keyed by
//! node id, and pools their raw latency samples.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Role;
use crate::metrics::loss_ratio;
use crate::summary::RunSummary;

/// Per-node totals. Summaries sharing a node id are summed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTotals {
    pub protocol: String,
    pub role: Role,
    pub hostname: String,
    pub runs: usize,
    pub sent: u64,
    pub recv: u64,
    pub errors: u64,
    pub loss: f64,
}

/// Statistics over the latency samples of every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledLatency {
    pub samples: usize,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub num_nodes: usize,
    pub total_sent: u64,
    pub total_recv: u64,
    pub loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<PooledLatency>,
    pub nodes: BTreeMap<String, NodeTotals>,
}

/// Merges `summaries` into deployment-wide totals.
pub fn aggregate<'a>(summaries: impl IntoIterator<Item = &'a RunSummary>) -> Aggregate {
    let mut nodes: BTreeMap<String, NodeTotals> = BTreeMap::new();
    let mut pooled = Vec::new();
    for s in summaries {
        let m = &s.metrics;
        let node = nodes.entry(s.node_id.clone()).or_insert_with(|| NodeTotals {
            protocol: s.protocol.clone(),
            role: s.role,
            hostname: s.hostname.clone(),
            runs: 0,
            sent: 0,
            recv: 0,
            errors: 0,
            loss: 0.0,
        });
        node.runs += 1;
        node.sent += m.sent;
        node.recv += m.recv;
        node.errors += m.errors;
        node.loss = loss_ratio(node.sent, node.recv);
        pooled.extend(s.latencies_ms.iter().copied().filter(|v| v.is_finite()));
    }

    let total_sent: u64 = nodes.values().map(|n| n.sent).sum();
    let total_recv: u64 = nodes.values().map(|n| n.recv).sum();
    Aggregate {
        num_nodes: nodes.len(),
        total_sent,
        total_recv,
        loss: loss_ratio(total_sent, total_recv),
        latency: pool(pooled),
        nodes,
    }
}

fn pool(mut samples: Vec<f64>) -> Option<PooledLatency> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let n = samples.len();
    let rank = |q: f64| samples[((n as f64 * q) as usize).min(n - 1)];
    let median = if n % 2 == 1 {
        samples[n / 2]
    } else {
        (samples[n / 2 - 1] + samples[n / 2]) / 2.0
    };
    Some(PooledLatency {
        samples: n,
        avg_ms: samples.iter().sum::<f64>() / n as f64,
        median_ms: median,
        p95_ms: rank(0.95),
        p99_ms: rank(0.99),
        min_ms: samples[0],
        max_ms: samples[n - 1],
    })
}

/// Loads every readable result directory and aggregates them.
/// Directories that fail to load are skipped with a warning.
pub fn aggregate_dirs<P: AsRef<Path>>(dirs: &[P]) -> Aggregate {
    let summaries: Vec<RunSummary> = dirs
        .iter()
        .filter_map(|dir| match RunSummary::load_dir(dir) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(dir = %dir.as_ref().display(), error = %e, "skipping result directory");
                None
            }
        })
        .collect();
    aggregate(&summaries)
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Nodes:          {}", self.num_nodes)?;
        writeln!(f, "Total sent:     {}", self.total_sent)?;
        writeln!(f, "Total received: {}", self.total_recv)?;
        writeln!(f, "Packet loss:    {:.2}%", self.loss * 100.0)?;
        if let Some(lat) = &self.latency {
            writeln!(f, "Latency:")?;
            writeln!(f, "  average: {:.2}ms", lat.avg_ms)?;
            writeln!(f, "  median:  {:.2}ms", lat.median_ms)?;
            writeln!(f, "  p95:     {:.2}ms", lat.p95_ms)?;
            writeln!(f, "  p99:     {:.2}ms", lat.p99_ms)?;
        }
        for (id, node) in &self.nodes {
            writeln!(
                f,
                "  {id:<16} {:<8} sent {:>8} recv {:>8} loss {:.2}%",
                node.role.as_str(),
                node.sent,
                node.recv,
                node.loss * 100.0
            )?;
        }
        Ok(())
    }
}
