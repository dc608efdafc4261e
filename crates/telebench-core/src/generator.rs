//! Synthetic traffic generation.
//!
//! [`TrafficGenerator`] is a lazy, finite iterator of [`ScheduledReading`]s.
//! Each tick yields one reading per client, round-robin; the stream ends as
//! soon as the configured duration has elapsed, even mid-tick.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{saturating_secs, unix_timestamp, Clock, MonotonicClock};
use crate::config::Config;
use crate::reading::{ClientId, Reading, SensorKind, SensorValue};

/// Frame spacing of a camera while motion is active (~15 fps).
const CAMERA_BURST_INTERVAL: f64 = 0.067;
/// Per-frame probability that active motion ends.
const CAMERA_MOTION_END: f64 = 0.05;
/// Per-poll probability that an idle camera detects motion.
const CAMERA_MOTION_START: f64 = 0.2;

/// Alternating high/low activity phases for stress runs.
///
/// Loaded from the `burst` config section; `burst_duration`/`idle_duration`
/// are accepted for the phase lengths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstPattern {
    /// Messages per second per client while bursting.
    pub burst_rate: f64,
    /// Messages per second per client while idle.
    pub idle_rate: f64,
    #[serde(alias = "burst_duration")]
    pub burst_secs: f64,
    #[serde(alias = "idle_duration")]
    pub idle_secs: f64,
}

impl Default for BurstPattern {
    fn default() -> Self {
        Self {
            burst_rate: 10.0,
            idle_rate: 0.1,
            burst_secs: 5.0,
            idle_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum TrafficPattern {
    /// Fixed `rate` messages per second per client.
    #[default]
    Steady,
    Burst(BurstPattern),
}

/// Parameters for one generated stream.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub num_clients: usize,
    pub duration: Duration,
    pub sensors: Vec<SensorKind>,
    /// Messages per second per client.
    pub rate: f64,
    pub seed: Option<u64>,
    pub pattern: TrafficPattern,
}

impl GeneratorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            num_clients: cfg.num_clients,
            duration: cfg.duration(),
            sensors: cfg.sensors.clone(),
            rate: cfg.rate,
            seed: cfg.seed,
            pattern: cfg
                .burst
                .clone()
                .map_or(TrafficPattern::Steady, TrafficPattern::Burst),
        }
    }
}

/// A reading plus the pause to honour after sending it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledReading {
    pub client_id: ClientId,
    pub reading: Reading,
    pub delay: Duration,
}

#[derive(Debug)]
struct Device {
    client_id: ClientId,
    device_id: String,
    kind: SensorKind,
    seq: u16,
    motion: bool,
}

#[derive(Debug, Clone, Copy)]
struct BurstPhase {
    bursting: bool,
    since: Duration,
}

/// Lazy, time-bounded reading stream. Not restartable: build a new one per run.
pub struct TrafficGenerator {
    cfg: GeneratorConfig,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    devices: Vec<Device>,
    cursor: usize,
    started: Option<Duration>,
    phase: BurstPhase,
    emitted: u64,
    done: bool,
}

impl TrafficGenerator {
    pub fn new(cfg: GeneratorConfig) -> Self {
        Self::with_clock(cfg, Arc::new(MonotonicClock::new()))
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(GeneratorConfig::from_config(cfg))
    }

    /// Builds a generator measuring its duration on `clock`.
    pub fn with_clock(cfg: GeneratorConfig, clock: Arc<dyn Clock>) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed.unwrap_or_else(rand::random));
        let devices = if cfg.sensors.is_empty() {
            Vec::new()
        } else {
            (0..cfg.num_clients)
                .map(|i| {
                    let kind = cfg.sensors[i % cfg.sensors.len()].clone();
                    Device {
                        client_id: ClientId::indexed(i),
                        device_id: format!("{kind}_{i}"),
                        kind,
                        seq: 0,
                        motion: rng.random(),
                    }
                })
                .collect()
        };
        Self {
            cfg,
            clock,
            rng,
            devices,
            cursor: 0,
            started: None,
            phase: BurstPhase {
                bursting: true,
                since: Duration::ZERO,
            },
            emitted: 0,
            done: false,
        }
    }

    /// Readings yielded so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn base_interval(&mut self, elapsed: Duration) -> f64 {
        match &self.cfg.pattern {
            TrafficPattern::Steady => 1.0 / self.cfg.rate,
            TrafficPattern::Burst(burst) => {
                let in_phase = elapsed.saturating_sub(self.phase.since).as_secs_f64();
                let limit = if self.phase.bursting {
                    burst.burst_secs
                } else {
                    burst.idle_secs
                };
                if in_phase > limit {
                    self.phase = BurstPhase {
                        bursting: !self.phase.bursting,
                        since: elapsed,
                    };
                }
                let rate = if self.phase.bursting {
                    burst.burst_rate
                } else {
                    burst.idle_rate
                };
                1.0 / rate
            }
        }
    }

    fn finish(&mut self, elapsed: Duration) {
        self.done = true;
        debug!(
            readings = self.emitted,
            elapsed_s = elapsed.as_secs_f64(),
            "traffic stream complete"
        );
    }
}

impl Iterator for TrafficGenerator {
    type Item = ScheduledReading;

    fn next(&mut self) -> Option<ScheduledReading> {
        if self.done {
            return None;
        }
        let now = self.clock.now();
        let start = *self.started.get_or_insert(now);
        let elapsed = now.saturating_sub(start);
        if elapsed >= self.cfg.duration || self.devices.is_empty() {
            self.finish(elapsed);
            return None;
        }

        let interval = self.base_interval(elapsed);
        let clients = self.devices.len();
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % clients;

        let device = &mut self.devices[idx];
        device.seq = device.seq.wrapping_add(1);

        // Camera frame spacing is a per-reading pause; other sensors spread
        // their per-client interval across one round of clients.
        let (sensor, delay) = if device.kind == SensorKind::Camera {
            if device.motion {
                if self.rng.random::<f64>() < CAMERA_MOTION_END {
                    device.motion = false;
                }
                (SensorValue::camera_frame(&mut self.rng, true), CAMERA_BURST_INTERVAL)
            } else {
                if self.rng.random::<f64>() < CAMERA_MOTION_START {
                    device.motion = true;
                }
                let poll = self.rng.random_range(1.0..10.0);
                (SensorValue::camera_frame(&mut self.rng, false), poll)
            }
        } else {
            (device.kind.sample(&mut self.rng), interval / clients as f64)
        };

        let reading = Reading {
            client_id: device.client_id.clone(),
            device_id: device.device_id.clone(),
            sequence_no: device.seq,
            timestamp: unix_timestamp(),
            sensor,
            node_id: None,
        };
        self.emitted += 1;

        Some(ScheduledReading {
            client_id: reading.client_id.clone(),
            reading,
            delay: saturating_secs(delay),
        })
    }
}
