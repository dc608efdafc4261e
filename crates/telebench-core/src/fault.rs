//! # Fault Injection
//!
//! [`FaultInjector`] decorates a [`ProtocolDriver`]'s send path with
//! controlled failures. On every `send`, in order:
//!
//! 1. fire due crash / partition schedules,
//! 2. drop sends from crashed clients,
//! 3. drop sends from clients on the isolated side of an active partition,
//! 4. Bernoulli packet loss,
//! 5. Bernoulli payload corruption (still delivered),
//! 6. Bernoulli latency spike (blocks before delegating).
//!
//! Triggered faults are appended to an event log. With all probabilities at
//! zero and no schedules the injector is a pure passthrough.
//!
//! Scheduled times are matched against elapsed run time with a ±0.5 s
//! window, evaluated only when a send happens. A schedule with no send inside
//! its window never fires; each schedule fires at most once.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::clock::{saturating_secs, Clock, MonotonicClock};
use crate::driver::{DriverMetrics, DriverMode, Harvest, ProtocolDriver, SendOutcome};
use crate::error::{ConfigError, DriverError, ParseError};
use crate::reading::{ClientId, Reading};

/// Tolerance for matching a scheduled fault time to elapsed run time.
pub const SCHEDULE_WINDOW_SECS: f64 = 0.5;

/// Number of events kept in a [`FailureSummary`].
pub const EVENT_LOG_PREFIX: usize = 50;

/// Longest latency spike accepted by [`FaultConfig::validate`] (one minute).
pub const MAX_SPIKE_MS: f64 = 60_000.0;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Fault-injection parameters. All-default means no faults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Per-send drop probability (0.0-1.0).
    pub packet_loss: f64,
    /// Per-send corruption probability (0.0-1.0).
    pub message_corruption: f64,
    /// Elapsed-second marks at which one client crashes.
    pub client_crashes: Vec<f64>,
    pub network_partition: Option<PartitionConfig>,
    pub latency_spike: Option<LatencySpikeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub start_sec: f64,
    #[serde(default = "default_partition_secs")]
    pub duration_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySpikeConfig {
    #[serde(default = "default_spike_probability")]
    pub probability: f64,
    #[serde(default = "default_spike_ms")]
    pub duration_ms: f64,
}

fn default_partition_secs() -> f64 {
    10.0
}

fn default_spike_probability() -> f64 {
    0.01
}

fn default_spike_ms() -> f64 {
    500.0
}

fn check_probability(field: &'static str, p: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{p} is not a probability in [0, 1]"),
        })
    }
}

impl FaultConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_probability("packet_loss", self.packet_loss)?;
        check_probability("message_corruption", self.message_corruption)?;
        if let Some(t) = self.client_crashes.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
            return Err(ConfigError::Invalid {
                field: "client_crashes",
                reason: format!("crash time {t} must be a non-negative number of seconds"),
            });
        }
        if let Some(p) = &self.network_partition {
            if !(p.start_sec.is_finite() && p.start_sec >= 0.0) {
                return Err(ConfigError::Invalid {
                    field: "network_partition.start_sec",
                    reason: "must be non-negative".into(),
                });
            }
            if !(p.duration_sec.is_finite() && p.duration_sec > 0.0) {
                return Err(ConfigError::Invalid {
                    field: "network_partition.duration_sec",
                    reason: "must be positive".into(),
                });
            }
        }
        if let Some(s) = &self.latency_spike {
            check_probability("latency_spike.probability", s.probability)?;
            if !(0.0..=MAX_SPIKE_MS).contains(&s.duration_ms) {
                return Err(ConfigError::Invalid {
                    field: "latency_spike.duration_ms",
                    reason: format!("{} is outside [0, {MAX_SPIKE_MS}] ms", s.duration_ms),
                });
            }
        }
        Ok(())
    }

    /// True when the injector would never alter traffic.
    pub fn is_passthrough(&self) -> bool {
        self.packet_loss == 0.0
            && self.message_corruption == 0.0
            && self.client_crashes.is_empty()
            && self.network_partition.is_none()
            && self.latency_spike.as_ref().is_none_or(|s| s.probability == 0.0)
    }
}

// ─── Event Log ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PacketLoss,
    Corruption,
    ClientCrash,
    ClientRevive,
    NetworkPartition,
    PartitionHealed,
    LatencySpike,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PacketLoss => "packet_loss",
            FailureKind::Corruption => "corruption",
            FailureKind::ClientCrash => "client_crash",
            FailureKind::ClientRevive => "client_revive",
            FailureKind::NetworkPartition => "network_partition",
            FailureKind::PartitionHealed => "partition_healed",
            FailureKind::LatencySpike => "latency_spike",
        }
    }
}

/// One injected fault. Never mutated after it is logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub time_offset_sec: f64,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Per-kind fault counts plus a bounded prefix of the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub total_events: usize,
    pub counts: BTreeMap<String, usize>,
    /// Sends dropped because the client was crashed.
    pub crash_drops: u64,
    /// Sends dropped because the client was partitioned away.
    pub partition_drops: u64,
    pub events: Vec<FailureEvent>,
}

impl FailureSummary {
    pub fn count(&self, kind: FailureKind) -> usize {
        self.counts.get(kind.as_str()).copied().unwrap_or(0)
    }
}

// ─── Injector ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum PartitionState {
    Pending,
    Active { until_sec: f64 },
    Healed,
}

/// Send-path decorator that injects faults ahead of the wrapped driver.
pub struct FaultInjector<D> {
    inner: D,
    cfg: FaultConfig,
    rng: StdRng,
    clock: Arc<dyn Clock>,
    epoch: Duration,
    num_clients: usize,
    crashed: BTreeSet<ClientId>,
    crash_fired: Vec<bool>,
    partition: PartitionState,
    events: Vec<FailureEvent>,
    crash_drops: u64,
    partition_drops: u64,
}

impl<D: ProtocolDriver> FaultInjector<D> {
    /// Wraps `inner`. `seed` makes every random decision reproducible.
    pub fn new(inner: D, cfg: FaultConfig, seed: Option<u64>) -> Self {
        let rng = StdRng::seed_from_u64(seed.unwrap_or_else(rand::random));
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let epoch = clock.now();
        let crash_fired = vec![false; cfg.client_crashes.len()];
        if !cfg.is_passthrough() {
            info!(
                loss = cfg.packet_loss,
                corruption = cfg.message_corruption,
                crashes = cfg.client_crashes.len(),
                partition = cfg.network_partition.is_some(),
                "fault injection enabled"
            );
            if inner.mode() == DriverMode::Passive {
                warn!(
                    driver = inner.name(),
                    "passive driver never calls send; configured faults will not fire"
                );
            }
        }
        Self {
            inner,
            cfg,
            rng,
            clock,
            epoch,
            num_clients: 0,
            crashed: BTreeSet::new(),
            crash_fired,
            partition: PartitionState::Pending,
            events: Vec::new(),
            crash_drops: 0,
            partition_drops: 0,
        }
    }

    /// Replaces the time source and re-arms the schedule against it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.arm();
        self
    }

    /// Restarts the schedule timeline at the current instant.
    pub fn arm(&mut self) {
        self.epoch = self.clock.now();
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    pub fn events(&self) -> &[FailureEvent] {
        &self.events
    }

    pub fn is_crashed(&self, client: &ClientId) -> bool {
        self.crashed.contains(client)
    }

    pub fn partition_active(&self) -> bool {
        matches!(self.partition, PartitionState::Active { .. })
    }

    /// Brings a crashed client back. Returns `false` if it was not crashed.
    pub fn revive_client(&mut self, client: &ClientId) -> bool {
        if !self.crashed.remove(client) {
            return false;
        }
        let t = self.elapsed_secs();
        info!(client = %client, elapsed_s = t, "client revived");
        self.push_event(t, FailureKind::ClientRevive, Some(client.clone()), None, Map::new());
        true
    }

    pub fn failure_summary(&self) -> FailureSummary {
        let mut counts = BTreeMap::new();
        for e in &self.events {
            *counts.entry(e.kind.as_str().to_string()).or_insert(0) += 1;
        }
        FailureSummary {
            total_events: self.events.len(),
            counts,
            crash_drops: self.crash_drops,
            partition_drops: self.partition_drops,
            events: self.events.iter().take(EVENT_LOG_PREFIX).cloned().collect(),
        }
    }

    fn elapsed_secs(&self) -> f64 {
        self.clock.now().saturating_sub(self.epoch).as_secs_f64()
    }

    fn push_event(
        &mut self,
        time_offset_sec: f64,
        kind: FailureKind,
        target: Option<ClientId>,
        duration_sec: Option<f64>,
        metadata: Map<String, Value>,
    ) {
        self.events.push(FailureEvent {
            time_offset_sec,
            kind,
            target,
            duration_sec,
            metadata,
        });
    }

    /// Fires crash and partition schedules that fall inside the match window.
    fn poll_schedules(&mut self, elapsed: f64) {
        for idx in 0..self.cfg.client_crashes.len() {
            let at = self.cfg.client_crashes[idx];
            if self.crash_fired[idx] || (elapsed - at).abs() >= SCHEDULE_WINDOW_SECS {
                continue;
            }
            self.crash_fired[idx] = true;
            let victim = ClientId::indexed(self.rng.random_range(0..self.num_clients.max(1)));
            warn!(client = %victim, elapsed_s = elapsed, scheduled_s = at, "client crashed");
            self.crashed.insert(victim.clone());
            self.push_event(elapsed, FailureKind::ClientCrash, Some(victim), None, Map::new());
        }

        let Some(partition) = self.cfg.network_partition.clone() else {
            return;
        };
        match self.partition {
            PartitionState::Pending
                if (elapsed - partition.start_sec).abs() < SCHEDULE_WINDOW_SECS =>
            {
                warn!(
                    elapsed_s = elapsed,
                    duration_s = partition.duration_sec,
                    "network partition started"
                );
                self.partition = PartitionState::Active {
                    until_sec: elapsed + partition.duration_sec,
                };
                self.push_event(
                    elapsed,
                    FailureKind::NetworkPartition,
                    None,
                    Some(partition.duration_sec),
                    Map::new(),
                );
            }
            PartitionState::Active { until_sec } if elapsed >= until_sec => {
                info!(elapsed_s = elapsed, "network partition healed");
                self.partition = PartitionState::Healed;
                self.push_event(elapsed, FailureKind::PartitionHealed, None, None, Map::new());
            }
            _ => {}
        }
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.random::<f64>() < probability
    }

    fn corrupt(&mut self, mut reading: Reading) -> Reading {
        reading.sensor = reading.sensor.corrupted();
        if self.rng.random::<bool>() {
            let delta: i16 = self.rng.random_range(-100..=100);
            reading.sequence_no = reading.sequence_no.wrapping_add_signed(delta);
        }
        reading
    }
}

/// Side of a partition a client lands on. Clients on the `true` side are
/// unreachable while a partition is active.
pub fn partition_isolates(client: &ClientId) -> bool {
    let mut hasher = DefaultHasher::new();
    client.hash(&mut hasher);
    hasher.finish() % 2 == 0
}

impl<D: ProtocolDriver> ProtocolDriver for FaultInjector<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mode(&self) -> DriverMode {
        self.inner.mode()
    }

    fn start_server(&mut self) -> Result<(), DriverError> {
        self.inner.start_server()
    }

    fn start_clients(&mut self, n: usize) -> Result<(), DriverError> {
        self.num_clients = n;
        self.inner.start_clients(n)
    }

    fn send(&mut self, client: &ClientId, reading: Reading) -> Result<SendOutcome, DriverError> {
        let elapsed = self.elapsed_secs();
        self.poll_schedules(elapsed);

        if self.crashed.contains(client) {
            self.crash_drops += 1;
            debug!(client = %client, "send dropped: client crashed");
            return Ok(SendOutcome::dropped());
        }

        if self.partition_active() && partition_isolates(client) {
            self.partition_drops += 1;
            debug!(client = %client, "send dropped: network partition");
            return Ok(SendOutcome::dropped());
        }

        if self.roll(self.cfg.packet_loss) {
            debug!(client = %client, "send dropped: random loss");
            self.push_event(elapsed, FailureKind::PacketLoss, Some(client.clone()), None, Map::new());
            return Ok(SendOutcome::dropped());
        }

        let mut reading = reading;
        if self.roll(self.cfg.message_corruption) {
            debug!(client = %client, seq = reading.sequence_no, "payload corrupted");
            reading = self.corrupt(reading);
            self.push_event(elapsed, FailureKind::Corruption, Some(client.clone()), None, Map::new());
        }

        if let Some(spike) = self.cfg.latency_spike.clone() {
            if self.roll(spike.probability) {
                warn!(client = %client, delay_ms = spike.duration_ms, "latency spike");
                let mut metadata = Map::new();
                metadata.insert("delay_ms".into(), Value::from(spike.duration_ms));
                self.push_event(
                    elapsed,
                    FailureKind::LatencySpike,
                    Some(client.clone()),
                    Some(spike.duration_ms / 1000.0),
                    metadata,
                );
                let uninterruptible = AtomicBool::new(false);
                self.clock
                    .sleep(saturating_secs(spike.duration_ms / 1000.0), &uninterruptible);
            }
        }

        self.inner.send(client, reading)
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.inner.stop()
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    fn metrics(&self) -> DriverMetrics {
        self.inner.metrics()
    }

    fn harvest(&mut self) -> Result<Harvest, ParseError> {
        self.inner.harvest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::reading::SensorValue;

    /// Echo driver: every send is delivered with a fixed server timestamp.
    #[derive(Default)]
    struct Echo {
        sent: Vec<Reading>,
        stops: usize,
    }

    impl ProtocolDriver for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn mode(&self) -> DriverMode {
            DriverMode::Active
        }
        fn start_server(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        fn start_clients(&mut self, _n: usize) -> Result<(), DriverError> {
            Ok(())
        }
        fn send(&mut self, _client: &ClientId, reading: Reading) -> Result<SendOutcome, DriverError> {
            let ts = reading.timestamp + 0.01;
            self.sent.push(reading);
            Ok(SendOutcome::delivered(ts))
        }
        fn stop(&mut self) -> Result<(), DriverError> {
            self.stops += 1;
            Ok(())
        }
        fn is_alive(&self) -> bool {
            true
        }
    }

    fn reading(client: &ClientId, seq: u16) -> Reading {
        Reading {
            client_id: client.clone(),
            device_id: "temp_0".into(),
            sequence_no: seq,
            timestamp: 100.0 + seq as f64,
            sensor: SensorValue::Scalar {
                value: 21.5,
                unit: "C".into(),
            },
            node_id: None,
        }
    }

    fn injector(cfg: FaultConfig, clock: &ManualClock) -> FaultInjector<Echo> {
        FaultInjector::new(Echo::default(), cfg, Some(42)).with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn passthrough_is_identical_to_inner() {
        let clock = ManualClock::new();
        let mut inj = injector(FaultConfig::default(), &clock);
        let mut bare = Echo::default();
        let c = ClientId::indexed(0);
        for seq in 0..200 {
            let a = inj.send(&c, reading(&c, seq)).unwrap();
            let b = bare.send(&c, reading(&c, seq)).unwrap();
            assert_eq!(a, b);
            clock.advance(Duration::from_millis(100));
        }
        assert_eq!(inj.inner().sent, bare.sent);
        assert!(inj.events().is_empty());
    }

    #[test]
    fn full_loss_drops_everything() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            packet_loss: 1.0,
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        let c = ClientId::indexed(0);
        for seq in 0..50 {
            let out = inj.send(&c, reading(&c, seq)).unwrap();
            assert_eq!(out, SendOutcome::dropped());
        }
        assert!(inj.inner().sent.is_empty());
        assert_eq!(inj.failure_summary().count(FailureKind::PacketLoss), 50);
    }

    #[test]
    fn full_corruption_still_delivers() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            message_corruption: 1.0,
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        let c = ClientId::indexed(0);
        let out = inj.send(&c, reading(&c, 7)).unwrap();
        assert!(out.success);
        assert!(inj.inner().sent[0].sensor.is_corrupted());
        assert_eq!(inj.events()[0].kind, FailureKind::Corruption);
    }

    #[test]
    fn crash_fires_once_inside_window_and_persists() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            client_crashes: vec![5.0],
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        inj.start_clients(1).unwrap();
        let c = ClientId::indexed(0);

        let mut outcomes = Vec::new();
        for step in 0..100u16 {
            clock.set(Duration::from_millis(step as u64 * 100));
            outcomes.push(inj.send(&c, reading(&c, step)).unwrap().success);
        }

        let crashes: Vec<_> = inj
            .events()
            .iter()
            .filter(|e| e.kind == FailureKind::ClientCrash)
            .collect();
        assert_eq!(crashes.len(), 1);
        assert!((crashes[0].time_offset_sec - 5.0).abs() < SCHEDULE_WINDOW_SECS);
        assert_eq!(crashes[0].target.as_ref(), Some(&c));

        // 4.6 s is the first sample strictly inside the window; every later send fails.
        let first_fail = outcomes.iter().position(|ok| !ok).unwrap();
        assert_eq!(first_fail, 46);
        assert!(outcomes[first_fail..].iter().all(|ok| !ok));
    }

    #[test]
    fn revive_restores_sends() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            client_crashes: vec![0.0],
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        inj.start_clients(1).unwrap();
        let c = ClientId::indexed(0);
        assert!(!inj.send(&c, reading(&c, 1)).unwrap().success);
        assert!(inj.is_crashed(&c));
        assert!(inj.revive_client(&c));
        assert!(!inj.revive_client(&c));
        assert!(inj.send(&c, reading(&c, 2)).unwrap().success);
        let kinds: Vec<_> = inj.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![FailureKind::ClientCrash, FailureKind::ClientRevive]);
    }

    #[test]
    fn crash_window_missed_without_sends() {
        // No send lands inside [1.5, 2.5], so the crash never fires.
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            client_crashes: vec![2.0],
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        inj.start_clients(1).unwrap();
        let c = ClientId::indexed(0);
        clock.set(Duration::from_secs(1));
        inj.send(&c, reading(&c, 1)).unwrap();
        clock.set(Duration::from_secs(3));
        inj.send(&c, reading(&c, 2)).unwrap();
        assert!(inj.events().is_empty());
    }

    #[test]
    fn partition_isolates_hashed_half_then_heals() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            network_partition: Some(PartitionConfig {
                start_sec: 1.0,
                duration_sec: 2.0,
            }),
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        let clients: Vec<_> = (0..16).map(ClientId::indexed).collect();
        inj.start_clients(clients.len()).unwrap();
        let isolated: Vec<_> = clients.iter().filter(|c| partition_isolates(c)).collect();
        assert!(!isolated.is_empty() && isolated.len() < clients.len());

        clock.set(Duration::from_millis(1100));
        for c in &clients {
            let ok = inj.send(c, reading(c, 1)).unwrap().success;
            assert_eq!(ok, !partition_isolates(c), "{c}");
        }
        assert!(inj.partition_active());

        clock.set(Duration::from_millis(3200));
        for c in &clients {
            assert!(inj.send(c, reading(c, 2)).unwrap().success);
        }
        let summary = inj.failure_summary();
        assert_eq!(summary.count(FailureKind::NetworkPartition), 1);
        assert_eq!(summary.count(FailureKind::PartitionHealed), 1);
        assert_eq!(summary.partition_drops, isolated.len() as u64);
    }

    #[test]
    fn latency_spike_logs_delay() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            latency_spike: Some(LatencySpikeConfig {
                probability: 1.0,
                duration_ms: 5.0,
            }),
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        let c = ClientId::indexed(0);
        assert!(inj.send(&c, reading(&c, 1)).unwrap().success);
        let e = &inj.events()[0];
        assert_eq!(e.kind, FailureKind::LatencySpike);
        assert_eq!(e.metadata.get("delay_ms"), Some(&Value::from(5.0)));
    }

    #[test]
    fn double_stop_adds_no_events() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            packet_loss: 0.5,
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        let c = ClientId::indexed(0);
        for seq in 0..10 {
            inj.send(&c, reading(&c, seq)).unwrap();
        }
        let before = inj.events().len();
        inj.stop().unwrap();
        inj.stop().unwrap();
        assert_eq!(inj.events().len(), before);
    }

    #[test]
    fn seeded_injectors_agree() {
        let cfg = FaultConfig {
            packet_loss: 0.3,
            message_corruption: 0.3,
            ..Default::default()
        };
        let run = || {
            let clock = ManualClock::new();
            let mut inj = injector(cfg.clone(), &clock);
            let c = ClientId::indexed(0);
            (0..100)
                .map(|s| inj.send(&c, reading(&c, s)).unwrap().success)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn summary_caps_event_prefix() {
        let clock = ManualClock::new();
        let cfg = FaultConfig {
            packet_loss: 1.0,
            ..Default::default()
        };
        let mut inj = injector(cfg, &clock);
        let c = ClientId::indexed(0);
        for seq in 0..120 {
            inj.send(&c, reading(&c, seq)).unwrap();
        }
        let summary = inj.failure_summary();
        assert_eq!(summary.total_events, 120);
        assert_eq!(summary.events.len(), EVENT_LOG_PREFIX);
    }

    #[test]
    fn config_validation() {
        let bad = FaultConfig {
            client_crashes: vec![-1.0],
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = FaultConfig {
            network_partition: Some(PartitionConfig {
                start_sec: 1.0,
                duration_sec: 0.0,
            }),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(FaultConfig::default().is_passthrough());
    }

    #[test]
    fn oversized_spike_is_rejected() {
        let spike = |duration_ms| FaultConfig {
            latency_spike: Some(LatencySpikeConfig {
                probability: 0.5,
                duration_ms,
            }),
            ..Default::default()
        };
        assert!(spike(MAX_SPIKE_MS).validate().is_ok());
        for bad in [1e30, f64::INFINITY, f64::NAN, -1.0] {
            assert!(
                matches!(
                    spike(bad).validate(),
                    Err(ConfigError::Invalid { field: "latency_spike.duration_ms", .. })
                ),
                "{bad}"
            );
        }
    }
}
