//! Harvesting results written by passive drivers.
//!
//! External servers append one line per received message to a receive log:
//! `<sequence> <latency_us>`, whitespace separated. Malformed lines are skipped.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::driver::Harvest;
use crate::error::ParseError;

/// Parses a receive log into latency samples (milliseconds).
///
/// A missing file is [`ParseError::Missing`]; a non-empty file with no valid
/// record is [`ParseError::Empty`]. The sent count is left to the caller.
pub fn parse_recv_log(path: impl AsRef<Path>) -> Result<Harvest, ParseError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "receive log not found, no latency data");
        return Err(ParseError::Missing(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut latencies_ms = Vec::new();
    let mut skipped = 0usize;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match parse_line(line) {
            Some(us) => latencies_ms.push(us as f64 / 1000.0),
            None => skipped += 1,
        }
    }
    if latencies_ms.is_empty() && skipped > 0 {
        return Err(ParseError::Empty(path.to_path_buf()));
    }
    if skipped > 0 {
        debug!(skipped, "skipped malformed receive log lines");
    }
    info!(path = %path.display(), records = latencies_ms.len(), "parsed receive log");
    Ok(Harvest {
        sent: None,
        latencies_ms,
    })
}

fn parse_line(line: &str) -> Option<u64> {
    let mut fields = line.split_whitespace();
    let _seq: u64 = fields.next()?.parse().ok()?;
    let lat_us: u64 = fields.next()?.parse().ok()?;
    fields.next().is_none().then_some(lat_us)
}
