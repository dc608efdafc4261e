//! # Run Orchestration
//!
//! [`Orchestrator`] owns one driver for one run and walks it through
//!
//! ```text
//! Created → ServerStarting → ClientsStarting → Running → Stopping → Finalized
//! ```
//!
//! with `Failed` reachable from any state before `Running`. `ClientsStarting`
//! is skipped for server-only nodes (0 clients). The driver is always wrapped
//! in a [`FaultInjector`], which is a passthrough when no faults are configured.
//!
//! `stop()` runs exactly once however `Running` ends, including on unwind.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::{unix_timestamp, Clock, MonotonicClock};
use crate::config::Config;
use crate::driver::{DriverMode, DriverRegistry, ProtocolDriver};
use crate::error::{DriverError, RunError};
use crate::fault::FaultInjector;
use crate::generator::{GeneratorConfig, ScheduledReading, TrafficGenerator};
use crate::metrics::MetricsPipeline;
use crate::summary::{hostname, RunSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    ServerStarting,
    ClientsStarting,
    Running,
    Stopping,
    Finalized,
    Failed,
}

/// How the `Running` state ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunExit {
    /// Traffic stream exhausted or listen period elapsed.
    Completed,
    /// The driver reported itself dead mid-run. Partial results are valid.
    DriverLost,
    /// External interrupt via the shutdown flag.
    Interrupted,
}

impl fmt::Display for RunExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunExit::Completed => "completed",
            RunExit::DriverLost => "driver_lost",
            RunExit::Interrupted => "interrupted",
        })
    }
}

/// Result of a run that reached `Finalized`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Every state the run passed through, in order.
    pub states: Vec<RunState>,
}

impl RunReport {
    pub fn exit(&self) -> RunExit {
        self.summary.exit
    }

    /// Whether the summary is worth persisting.
    pub fn usable(&self) -> bool {
        self.summary.usable()
    }
}

// ─── Stop Guard ─────────────────────────────────────────────────────────────

/// Calls `stop()` on drop unless [`StopGuard::stop`] already did.
struct StopGuard<'a, D: ProtocolDriver> {
    driver: &'a mut D,
    stopped: bool,
}

impl<'a, D: ProtocolDriver> StopGuard<'a, D> {
    fn new(driver: &'a mut D) -> Self {
        Self {
            driver,
            stopped: false,
        }
    }

    fn stop(mut self) {
        self.stopped = true;
        stop_quietly(self.driver);
    }
}

impl<D: ProtocolDriver> Deref for StopGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.driver
    }
}

impl<D: ProtocolDriver> DerefMut for StopGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.driver
    }
}

impl<D: ProtocolDriver> Drop for StopGuard<'_, D> {
    fn drop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            stop_quietly(self.driver);
        }
    }
}

fn stop_quietly<D: ProtocolDriver>(driver: &mut D) {
    if let Err(e) = driver.stop() {
        warn!(driver = driver.name(), error = %e, "driver did not stop cleanly");
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Drives one run of one protocol driver.
pub struct Orchestrator<D: ProtocolDriver> {
    cfg: Config,
    injector: FaultInjector<D>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    states: Vec<RunState>,
}

impl<D: ProtocolDriver> Orchestrator<D> {
    /// Wraps `driver` for a run of `cfg`, which must already be validated.
    pub fn new(cfg: Config, driver: D) -> Self {
        let injector = FaultInjector::new(driver, cfg.failure_injection.clone(), cfg.seed);
        Self {
            cfg,
            injector,
            clock: Arc::new(MonotonicClock::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            states: vec![RunState::Created],
        }
    }

    /// Measures run time (and waits) on `clock` instead of the real clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.injector = self.injector.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Shares an externally owned shutdown flag, e.g. one set by a signal handler.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Raising this flag stops the run after the current reading.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Runs with a [`TrafficGenerator`] built from the config.
    pub fn run_generated(self) -> Result<RunReport, RunError> {
        let generator = TrafficGenerator::with_clock(
            GeneratorConfig::from_config(&self.cfg),
            Arc::clone(&self.clock),
        );
        self.run(generator)
    }

    /// Runs the full lifecycle, feeding `readings` to an active driver.
    ///
    /// Passive drivers ignore `readings`. Only start failures are errors;
    /// liveness loss and interruption still produce a report.
    pub fn run<I>(self, readings: I) -> Result<RunReport, RunError>
    where
        I: IntoIterator<Item = ScheduledReading>,
    {
        let mode = self.injector.mode();
        info!(
            protocol = %self.cfg.protocol,
            %mode,
            role = %self.cfg.role,
            clients = self.cfg.num_clients,
            duration_s = self.cfg.duration,
            "starting run"
        );

        let Orchestrator {
            cfg,
            mut injector,
            clock,
            shutdown,
            mut states,
        } = self;
        let mut transition = |to: RunState| {
            let from = states.last().copied().unwrap_or(RunState::Created);
            info!(?from, ?to, "run state");
            states.push(to);
        };

        let mut driver = StopGuard::new(&mut injector);

        transition(RunState::ServerStarting);
        if let Err(e) = driver.start_server() {
            return Err(fail(&mut transition, e));
        }
        clock.sleep(cfg.settle(), &shutdown);

        if cfg.num_clients > 0 {
            transition(RunState::ClientsStarting);
            if let Err(e) = driver.start_clients(cfg.num_clients) {
                return Err(fail(&mut transition, e));
            }
            clock.sleep(cfg.settle(), &shutdown);
        } else {
            info!("server-only node, no clients started");
        }

        transition(RunState::Running);
        driver.arm();
        let metrics = MetricsPipeline::with_clock(Arc::clone(&clock));
        let started_at = Utc::now();
        let node_id = cfg.node_id().to_string();

        let exit = match mode {
            DriverMode::Active if cfg.num_clients == 0 => {
                listen(&mut *driver, &*clock, &cfg, &shutdown)
            }
            DriverMode::Active => drive(
                &mut *driver,
                readings,
                &metrics,
                &*clock,
                &shutdown,
                &node_id,
            ),
            DriverMode::Passive => observe(&mut *driver, &metrics, &*clock, &cfg, &shutdown),
        };
        metrics.finalize();

        transition(RunState::Stopping);
        driver.stop();

        let summary = RunSummary {
            protocol: cfg.protocol.clone(),
            mode,
            role: cfg.role,
            node_id,
            hostname: hostname(),
            started_at,
            exit,
            metrics: metrics.snapshot(),
            clients: metrics.client_summaries(),
            failures: injector.failure_summary(),
            driver_metrics: injector.metrics(),
            latencies_ms: metrics.latency_samples(),
            error_log: metrics.error_log(),
            config: cfg,
        };
        transition(RunState::Finalized);
        info!(
            %exit,
            sent = summary.metrics.sent,
            recv = summary.metrics.recv,
            errors = summary.metrics.errors,
            "run finished"
        );
        Ok(RunReport { summary, states })
    }
}

fn fail(transition: &mut impl FnMut(RunState), e: DriverError) -> RunError {
    error!(error = %e, "driver failed to start");
    transition(RunState::Failed);
    RunError::DriverStart(e)
}

/// Active mode: one send per reading, strictly sequential.
fn drive<D, I>(
    driver: &mut D,
    readings: I,
    metrics: &MetricsPipeline,
    clock: &dyn Clock,
    shutdown: &AtomicBool,
    node_id: &str,
) -> RunExit
where
    D: ProtocolDriver,
    I: IntoIterator<Item = ScheduledReading>,
{
    for item in readings {
        if shutdown.load(Ordering::Relaxed) {
            info!("interrupted, no further readings");
            return RunExit::Interrupted;
        }
        if !driver.is_alive() {
            warn!(driver = driver.name(), "driver no longer alive, ending run early");
            return RunExit::DriverLost;
        }

        let ScheduledReading {
            client_id,
            mut reading,
            delay,
        } = item;
        reading.node_id = Some(node_id.to_string());

        let sent_at = unix_timestamp();
        match driver.send(&client_id, reading) {
            Ok(outcome) => {
                metrics.record_send();
                if outcome.success {
                    metrics.record_recv();
                    if let Some(ms) = outcome.latency_ms(sent_at) {
                        metrics.record_latency(ms, Some(&client_id));
                    }
                } else {
                    metrics.record_loss(1);
                }
            }
            Err(e) => {
                debug!(client = %client_id, error = %e, "send failed");
                metrics.record_error("send", &e.to_string());
            }
        }

        if !clock.sleep(delay, shutdown) {
            info!("interrupted, no further readings");
            return RunExit::Interrupted;
        }
    }
    RunExit::Completed
}

/// Server-only node: keep the driver up for the run duration without sending.
fn listen<D: ProtocolDriver>(
    driver: &mut D,
    clock: &dyn Clock,
    cfg: &Config,
    shutdown: &AtomicBool,
) -> RunExit {
    info!(duration_s = cfg.duration, "listening");
    let deadline = clock.now() + cfg.duration();
    loop {
        let now = clock.now();
        if now >= deadline {
            return RunExit::Completed;
        }
        if !driver.is_alive() {
            warn!(driver = driver.name(), "driver no longer alive, ending run early");
            return RunExit::DriverLost;
        }
        let slice = (deadline - now).min(std::time::Duration::from_secs(1));
        if !clock.sleep(slice, shutdown) {
            return RunExit::Interrupted;
        }
    }
}

/// Passive mode: wait out the run, then harvest the driver's own results.
fn observe<D: ProtocolDriver>(
    driver: &mut D,
    metrics: &MetricsPipeline,
    clock: &dyn Clock,
    cfg: &Config,
    shutdown: &AtomicBool,
) -> RunExit {
    info!(duration_s = cfg.duration, "passive driver, waiting for run to elapse");
    let exit = if clock.sleep(cfg.duration(), shutdown) {
        RunExit::Completed
    } else {
        RunExit::Interrupted
    };

    match driver.harvest() {
        Ok(harvest) => {
            let recv = harvest.latencies_ms.len() as u64;
            let sent = harvest.sent.unwrap_or(recv.max(1)).max(recv);
            metrics.record_sends(sent);
            for ms in harvest.latencies_ms {
                metrics.record_recv();
                metrics.record_latency(ms, None);
            }
            metrics.record_loss(sent - recv);
            info!(sent, recv, "harvested passive results");
        }
        Err(e) => warn!(error = %e, "could not harvest passive results, reporting empty metrics"),
    }
    exit
}

/// Validates `cfg`, resolves its driver from `registry`, and runs it.
pub fn run_with_registry(
    cfg: Config,
    registry: &DriverRegistry,
    shutdown: Arc<AtomicBool>,
) -> Result<RunReport, RunError> {
    cfg.validate()?;
    let driver = registry.resolve(&cfg)?;
    Orchestrator::new(cfg, driver)
        .with_shutdown(shutdown)
        .run_generated()
}
