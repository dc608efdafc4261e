//! # Loopback Driver
//!
//! In-process active driver. The "server" is a worker thread fed through a
//! bounded crossbeam channel; every send waits for the worker's reply, so the
//! send path is synchronous from the orchestrator's side.
//!
//! Optional impairment, read from `options`:
//!
//! | key | meaning |
//! |---|---|
//! | `delay_ms` | fixed one-way delay applied by the server |
//! | `jitter_ms` | uniform extra delay in `[0, jitter_ms)` |
//! | `loss` | probability (0-1) the server silently drops a reading |
//! | `ack_timeout_ms` | how long a send waits for its reply (default 1000) |

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde_json::Value;
use tracing::{debug, info, warn};

use telebench_core::clock::unix_timestamp;
use telebench_core::driver::DriverMetrics;
use telebench_core::{
    ClientId, Config, DriverError, DriverMode, ProtocolDriver, Reading, SendOutcome,
};

const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;
const QUEUE_CAPACITY: usize = 64;

/// Simulated link between clients and the in-process server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopbackConfig {
    pub delay: Duration,
    pub jitter: Duration,
    pub loss: f64,
    pub ack_timeout: Duration,
    pub seed: Option<u64>,
}

impl LoopbackConfig {
    pub fn from_config(cfg: &Config) -> Result<Self, DriverError> {
        let loss = cfg.option_f64("loss").unwrap_or(0.0);
        if !(0.0..=1.0).contains(&loss) {
            return Err(DriverError::Start(format!(
                "loopback loss {loss} is not a probability"
            )));
        }
        Ok(Self {
            delay: Duration::from_millis(cfg.option_u64("delay_ms").unwrap_or(0)),
            jitter: Duration::from_millis(cfg.option_u64("jitter_ms").unwrap_or(0)),
            loss,
            ack_timeout: Duration::from_millis(
                cfg.option_u64("ack_timeout_ms")
                    .unwrap_or(DEFAULT_ACK_TIMEOUT_MS),
            ),
            seed: cfg.seed,
        })
    }
}

enum Request {
    Deliver {
        reading: Reading,
        reply: Sender<Option<f64>>,
    },
    Shutdown,
}

/// Counters kept by the server thread.
#[derive(Debug, Default)]
struct ServerStats {
    received: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
    devices: Mutex<BTreeSet<String>>,
}

/// In-process active driver backed by one worker thread.
pub struct LoopbackDriver {
    cfg: LoopbackConfig,
    request_tx: Option<Sender<Request>>,
    handle: Option<thread::JoinHandle<()>>,
    alive: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    clients: usize,
    timeouts: u64,
}

impl LoopbackDriver {
    pub fn new(cfg: LoopbackConfig) -> Self {
        Self {
            cfg,
            request_tx: None,
            handle: None,
            alive: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ServerStats::default()),
            clients: 0,
            timeouts: 0,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, DriverError> {
        Ok(Self::new(LoopbackConfig::from_config(cfg)?))
    }

    /// Readings the server has accepted so far.
    pub fn server_received(&self) -> u64 {
        self.stats.received.load(Ordering::Relaxed)
    }
}

impl ProtocolDriver for LoopbackDriver {
    fn name(&self) -> &str {
        "loopback"
    }

    fn mode(&self) -> DriverMode {
        DriverMode::Active
    }

    fn start_server(&mut self) -> Result<(), DriverError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let (request_tx, request_rx) = bounded(QUEUE_CAPACITY);
        let cfg = self.cfg.clone();
        let stats = Arc::clone(&self.stats);
        let alive = Arc::clone(&self.alive);
        alive.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("telebench-loopback".into())
            .spawn(move || server_worker(request_rx, cfg, stats, alive))
            .map_err(|e| DriverError::Start(format!("failed to spawn loopback server: {e}")))?;

        self.request_tx = Some(request_tx);
        self.handle = Some(handle);
        info!("loopback server started");
        Ok(())
    }

    fn start_clients(&mut self, n: usize) -> Result<(), DriverError> {
        self.clients = n;
        debug!(clients = n, "loopback clients ready");
        Ok(())
    }

    fn send(&mut self, client: &ClientId, reading: Reading) -> Result<SendOutcome, DriverError> {
        let tx = self.request_tx.as_ref().ok_or(DriverError::NotRunning)?;
        let (reply_tx, reply_rx) = bounded(1);
        tx.send(Request::Deliver {
            reading,
            reply: reply_tx,
        })
        .map_err(|_| DriverError::NotRunning)?;

        match reply_rx.recv_timeout(self.cfg.ack_timeout) {
            Ok(Some(server_ts)) => Ok(SendOutcome::delivered(server_ts)),
            Ok(None) => Ok(SendOutcome::dropped()),
            Err(RecvTimeoutError::Timeout) => {
                self.timeouts += 1;
                debug!(client = %client, "loopback reply timed out");
                Ok(SendOutcome::dropped())
            }
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::Send(
                "loopback server went away mid-send".into(),
            )),
        }
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        if let Some(tx) = self.request_tx.take() {
            let _ = tx.send(Request::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("loopback server thread panicked");
            }
            info!(received = self.server_received(), "loopback server stopped");
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> DriverMetrics {
        let devices = self
            .stats
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        let mut m = DriverMetrics::new();
        m.insert("server_received".into(), Value::from(self.server_received()));
        m.insert(
            "server_dropped".into(),
            Value::from(self.stats.dropped.load(Ordering::Relaxed)),
        );
        m.insert(
            "server_corrupted".into(),
            Value::from(self.stats.corrupted.load(Ordering::Relaxed)),
        );
        m.insert("devices".into(), Value::from(devices));
        m.insert("clients".into(), Value::from(self.clients));
        m.insert("reply_timeouts".into(), Value::from(self.timeouts));
        m
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn server_worker(
    request_rx: Receiver<Request>,
    cfg: LoopbackConfig,
    stats: Arc<ServerStats>,
    alive: Arc<AtomicBool>,
) {
    let mut rng = StdRng::seed_from_u64(cfg.seed.unwrap_or_else(rand::random));
    while let Ok(request) = request_rx.recv() {
        let (reading, reply) = match request {
            Request::Deliver { reading, reply } => (reading, reply),
            Request::Shutdown => break,
        };

        let mut delay = cfg.delay;
        if !cfg.jitter.is_zero() {
            delay += cfg.jitter.mul_f64(rng.random::<f64>());
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        if cfg.loss > 0.0 && rng.random::<f64>() < cfg.loss {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = reply.send(None);
            continue;
        }

        stats.received.fetch_add(1, Ordering::Relaxed);
        if reading.sensor.is_corrupted() {
            stats.corrupted.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reading.device_id);
        let _ = reply.send(Some(unix_timestamp()));
    }
    alive.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use telebench_core::SensorValue;

    fn reading(seq: u16) -> Reading {
        Reading {
            client_id: ClientId::indexed(0),
            device_id: "temp_0".into(),
            sequence_no: seq,
            timestamp: unix_timestamp(),
            sensor: SensorValue::Scalar {
                value: 20.0,
                unit: "C".into(),
            },
            node_id: None,
        }
    }

    #[test]
    fn send_before_start_is_not_running() {
        let mut d = LoopbackDriver::new(LoopbackConfig::default());
        assert!(matches!(
            d.send(&ClientId::indexed(0), reading(1)),
            Err(DriverError::NotRunning)
        ));
        assert!(!d.is_alive());
    }

    #[test]
    fn delivers_with_later_server_timestamp() {
        let mut d = LoopbackDriver::new(LoopbackConfig {
            delay: Duration::from_millis(2),
            ack_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        d.start_server().unwrap();
        assert!(d.is_alive());
        let r = reading(1);
        let sent_at = r.timestamp;
        let out = d.send(&ClientId::indexed(0), r).unwrap();
        assert!(out.success);
        assert!(out.latency_ms(sent_at).is_some());
        assert_eq!(d.server_received(), 1);
        d.stop().unwrap();
        d.stop().unwrap();
        assert!(!d.is_alive());
    }

    #[test]
    fn server_loss_drops_without_error() {
        let mut d = LoopbackDriver::new(LoopbackConfig {
            loss: 1.0,
            ack_timeout: Duration::from_secs(1),
            seed: Some(1),
            ..Default::default()
        });
        d.start_server().unwrap();
        for seq in 0..5 {
            let out = d.send(&ClientId::indexed(0), reading(seq)).unwrap();
            assert_eq!(out, SendOutcome::dropped());
        }
        assert_eq!(d.metrics()["server_dropped"], Value::from(5u64));
        d.stop().unwrap();
    }

    #[test]
    fn rejects_bad_loss_option() {
        let mut cfg = Config::minimal("loopback", 1, 1.0);
        cfg.options.insert("loss".into(), Value::from(2.0));
        assert!(LoopbackDriver::from_config(&cfg).is_err());
    }
}
