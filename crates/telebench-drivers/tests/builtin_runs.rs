//! Full runs of the built-in drivers through the registry and orchestrator.
//!
//! These use the real clock and real sockets/processes, so durations are kept
//! to a second or two.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};

use telebench_core::{run_with_registry, Config, DriverMode, RunExit, RunState, SensorKind};
use telebench_drivers::builtin_registry;

fn config(protocol: &str, clients: usize, duration: f64, rate: f64) -> Config {
    let mut cfg = Config::minimal(protocol, clients, duration);
    cfg.sensors = vec![SensorKind::Temperature, SensorKind::Gps];
    cfg.rate = rate;
    cfg.seed = Some(42);
    cfg
}

fn options(cfg: &mut Config, value: Value) {
    if let Value::Object(map) = value {
        cfg.options.extend(map);
    }
}

// ────────────────────────────────────────────────────────────────
// UDP over loopback
// ────────────────────────────────────────────────────────────────

#[test]
fn udp_round_trip_on_loopback() {
    let cfg = config("udp", 2, 2.0, 5.0);
    let report = run_with_registry(cfg, &builtin_registry(), Arc::new(AtomicBool::new(false)))
        .unwrap();
    let s = &report.summary;

    assert_eq!(s.exit, RunExit::Completed);
    assert_eq!(s.mode, DriverMode::Active);
    assert!(s.metrics.sent >= 15, "sent {}", s.metrics.sent);
    assert_eq!(s.metrics.recv, s.metrics.sent);
    assert_eq!(s.metrics.errors, 0);
    let latency = s.metrics.latency.as_ref().unwrap();
    assert!(latency.samples > 0);
    assert!(latency.avg_ms < 100.0, "avg {}", latency.avg_ms);
    assert_eq!(s.driver_metrics["server_received"], Value::from(s.metrics.recv));
    assert_eq!(s.clients.len(), 2);
    assert_eq!(report.states.last(), Some(&RunState::Finalized));
}

#[test]
fn udp_port_conflict_is_start_failure() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut cfg = config("udp", 1, 1.0, 1.0);
    cfg.server_port = taken.local_addr().unwrap().port();
    let err = run_with_registry(cfg, &builtin_registry(), Arc::new(AtomicBool::new(false)))
        .unwrap_err();
    assert!(matches!(err, telebench_core::RunError::DriverStart(_)), "{err}");
}

// ────────────────────────────────────────────────────────────────
// Loopback with impairment
// ────────────────────────────────────────────────────────────────

#[test]
fn loopback_loss_is_reflected_in_metrics() {
    let mut cfg = config("loopback", 1, 1.0, 40.0);
    options(&mut cfg, json!({ "loss": 0.5, "delay_ms": 1 }));
    let report = run_with_registry(cfg, &builtin_registry(), Arc::new(AtomicBool::new(false)))
        .unwrap();
    let s = &report.summary;

    assert!(s.metrics.sent > 0);
    assert!(s.metrics.recv < s.metrics.sent);
    assert!(s.metrics.recv > 0);
    let dropped = s.driver_metrics["server_dropped"].as_u64().unwrap();
    let received = s.driver_metrics["server_received"].as_u64().unwrap();
    assert_eq!(dropped + received, s.metrics.sent);
    assert_eq!(received, s.metrics.recv);
    // One ms of simulated delay per delivered reading.
    assert!(s.metrics.latency.as_ref().unwrap().min_ms >= 1.0);
}

// ────────────────────────────────────────────────────────────────
// Exec (passive)
// ────────────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn exec_server_log_is_harvested() {
    let log = format!("telebench-recv-{}.log", std::process::id());
    let workdir = std::env::temp_dir();
    let mut cfg = config("exec", 0, 1.0, 1.0);
    options(
        &mut cfg,
        json!({
            "server_bin": "sh",
            "server_args": ["-c", "printf '1 1500\\n2 2500\\nbad\\n' > {recv_log}; exec sleep 30"],
            "recv_log": log.clone(),
            "workdir": workdir.display().to_string(),
        }),
    );
    let report = run_with_registry(cfg, &builtin_registry(), Arc::new(AtomicBool::new(false)))
        .unwrap();
    let s = &report.summary;

    assert_eq!(s.mode, DriverMode::Passive);
    assert_eq!(s.exit, RunExit::Completed);
    assert_eq!((s.metrics.sent, s.metrics.recv), (2, 2));
    let latency = s.metrics.latency.as_ref().unwrap();
    assert_eq!(latency.samples, 2);
    assert!((latency.avg_ms - 2.0).abs() < 1e-9);
    std::fs::remove_file(workdir.join(&log)).ok();
}

#[test]
fn exec_without_server_bin_is_init_error() {
    let cfg = config("exec", 0, 1.0, 1.0);
    let err = run_with_registry(cfg, &builtin_registry(), Arc::new(AtomicBool::new(false)))
        .unwrap_err();
    assert!(matches!(err, telebench_core::RunError::DriverInit { .. }));
}
