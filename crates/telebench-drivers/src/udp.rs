//! # UDP Driver
//!
//! Active driver over plain UDP datagrams. Each reading is sent as one JSON
//! datagram; the server answers with a small JSON ack carrying its receipt
//! timestamp, which the client matches on `(device_id, sequence_no)`.
//!
//! A sensor node pointed at a non-local `server_ip` only runs clients and
//! talks to the remote core's server. Every other node hosts the server
//! itself. Set `local_server` in `options` to override.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use telebench_core::clock::unix_timestamp;
use telebench_core::driver::DriverMetrics;
use telebench_core::{
    ClientId, Config, DriverError, DriverMode, ProtocolDriver, Reading, Role, SendOutcome,
};

const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;
const SERVER_POLL: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 65_507;

/// Server reply to one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub device_id: String,
    pub seq: u16,
    pub server_ts: f64,
}

#[derive(Debug, Default)]
struct ServerStats {
    received: AtomicU64,
    corrupted: AtomicU64,
    parse_errors: AtomicU64,
    ack_errors: AtomicU64,
}

/// UDP driver state. One socket per logical client.
pub struct UdpDriver {
    bind_addr: SocketAddr,
    local_server: bool,
    ack_timeout: Duration,
    server_addr: Option<SocketAddr>,
    server: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    clients: BTreeMap<ClientId, UdpSocket>,
    stale_acks: u64,
}

impl UdpDriver {
    pub fn new(bind_addr: SocketAddr, local_server: bool, ack_timeout: Duration) -> Self {
        Self {
            bind_addr,
            local_server,
            ack_timeout,
            server_addr: None,
            server: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ServerStats::default()),
            clients: BTreeMap::new(),
            stale_acks: 0,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, DriverError> {
        let addr = cfg
            .server_addr()
            .map_err(|e| DriverError::Start(e.to_string()))?;
        let remote = cfg.role == Role::Sensor
            && !addr.ip().is_loopback()
            && !addr.ip().is_unspecified();
        let local_server = cfg
            .options
            .get("local_server")
            .and_then(Value::as_bool)
            .unwrap_or(!remote);
        let ack_timeout = Duration::from_millis(
            cfg.option_u64("ack_timeout_ms")
                .unwrap_or(DEFAULT_ACK_TIMEOUT_MS),
        );
        Ok(Self::new(addr, local_server, ack_timeout))
    }

    /// Address clients send to, known once the server is bound.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    fn client_bind_addr(&self, server: SocketAddr) -> SocketAddr {
        let ip = match server.ip() {
            ip if ip.is_loopback() => ip,
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, 0)
    }
}

impl ProtocolDriver for UdpDriver {
    fn name(&self) -> &str {
        "udp"
    }

    fn mode(&self) -> DriverMode {
        DriverMode::Active
    }

    fn start_server(&mut self) -> Result<(), DriverError> {
        if !self.local_server {
            info!(server = %self.bind_addr, "using remote udp server");
            self.server_addr = Some(self.bind_addr);
            return Ok(());
        }
        if self.server.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.bind_addr)
            .map_err(|e| DriverError::Start(format!("bind {}: {e}", self.bind_addr)))?;
        socket.set_read_timeout(Some(SERVER_POLL))?;
        let mut local = socket.local_addr()?;
        // Clients cannot send to a wildcard address.
        if local.ip().is_unspecified() {
            local.set_ip(match local.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let handle = thread::Builder::new()
            .name("telebench-udp-server".into())
            .spawn(move || serve(socket, running, stats))
            .map_err(|e| DriverError::Start(format!("failed to spawn udp server: {e}")))?;

        info!(addr = %local, "udp server listening");
        self.server_addr = Some(local);
        self.server = Some(handle);
        Ok(())
    }

    fn start_clients(&mut self, n: usize) -> Result<(), DriverError> {
        let server = self.server_addr.ok_or(DriverError::NotRunning)?;
        let bind = self.client_bind_addr(server);
        for i in 0..n {
            let socket = UdpSocket::bind(bind)
                .map_err(|e| DriverError::Start(format!("client {i} bind {bind}: {e}")))?;
            socket.connect(server)?;
            socket.set_read_timeout(Some(self.ack_timeout))?;
            self.clients.insert(ClientId::indexed(i), socket);
        }
        debug!(clients = n, server = %server, "udp clients connected");
        Ok(())
    }

    fn send(&mut self, client: &ClientId, reading: Reading) -> Result<SendOutcome, DriverError> {
        let socket = self
            .clients
            .get(client)
            .ok_or_else(|| DriverError::Send(format!("unknown client {client}")))?;
        let payload =
            serde_json::to_vec(&reading).map_err(|e| DriverError::Send(e.to_string()))?;
        socket.send(&payload)?;

        let deadline = Instant::now() + self.ack_timeout;
        let mut buf = [0u8; 1024];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(SendOutcome::dropped());
            }
            socket.set_read_timeout(Some(remaining))?;
            let n = match socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if is_timeout(&e) => return Ok(SendOutcome::dropped()),
                // ICMP port unreachable surfaces here on Linux.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    return Ok(SendOutcome::dropped())
                }
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<Ack>(&buf[..n]) {
                Ok(ack) if ack.device_id == reading.device_id && ack.seq == reading.sequence_no => {
                    return Ok(SendOutcome::delivered(ack.server_ts));
                }
                // Late ack for an earlier reading that already timed out.
                _ => self.stale_acks += 1,
            }
        }
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.running.store(false, Ordering::SeqCst);
        self.clients.clear();
        if let Some(handle) = self.server.take() {
            if handle.join().is_err() {
                warn!("udp server thread panicked");
            }
            info!(
                received = self.stats.received.load(Ordering::Relaxed),
                "udp server stopped"
            );
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        match &self.server {
            Some(handle) => !handle.is_finished(),
            None => !self.local_server,
        }
    }

    fn metrics(&self) -> DriverMetrics {
        let mut m = DriverMetrics::new();
        let load = |c: &AtomicU64| Value::from(c.load(Ordering::Relaxed));
        m.insert("server_received".into(), load(&self.stats.received));
        m.insert("server_corrupted".into(), load(&self.stats.corrupted));
        m.insert("server_parse_errors".into(), load(&self.stats.parse_errors));
        m.insert("server_ack_errors".into(), load(&self.stats.ack_errors));
        m.insert("stale_acks".into(), Value::from(self.stale_acks));
        m.insert("clients".into(), Value::from(self.clients.len()));
        if let Some(addr) = self.server_addr {
            m.insert("server_addr".into(), Value::from(addr.to_string()));
        }
        m
    }
}

impl Drop for UdpDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn serve(socket: UdpSocket, running: Arc<AtomicBool>, stats: Arc<ServerStats>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::Relaxed) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!(error = %e, "udp server receive failed");
                break;
            }
        };
        let reading: Reading = match serde_json::from_slice(&buf[..n]) {
            Ok(r) => r,
            Err(e) => {
                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(from = %from, error = %e, "unparseable datagram");
                continue;
            }
        };
        stats.received.fetch_add(1, Ordering::Relaxed);
        if reading.sensor.is_corrupted() {
            stats.corrupted.fetch_add(1, Ordering::Relaxed);
        }

        let ack = Ack {
            device_id: reading.device_id,
            seq: reading.sequence_no,
            server_ts: unix_timestamp(),
        };
        let sent = serde_json::to_vec(&ack)
            .map_err(io::Error::other)
            .and_then(|bytes| socket.send_to(&bytes, from));
        if let Err(e) = sent {
            stats.ack_errors.fetch_add(1, Ordering::Relaxed);
            debug!(to = %from, error = %e, "ack send failed");
        }
    }
    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use telebench_core::SensorValue;

    fn reading(device: &str, seq: u16) -> Reading {
        Reading {
            client_id: ClientId::indexed(0),
            device_id: device.into(),
            sequence_no: seq,
            timestamp: unix_timestamp(),
            sensor: SensorValue::Switch { on: true },
            node_id: Some("edge-1".into()),
        }
    }

    fn local() -> UdpDriver {
        UdpDriver::new("127.0.0.1:0".parse().unwrap(), true, Duration::from_millis(500))
    }

    #[test]
    fn acks_carry_matching_sequence() {
        let mut d = local();
        d.start_server().unwrap();
        assert_ne!(d.server_addr().unwrap().port(), 0);
        d.start_clients(2).unwrap();
        for seq in 1..=3 {
            let r = reading("temp_1", seq);
            let sent_at = r.timestamp;
            let out = d.send(&ClientId::indexed(1), r).unwrap();
            assert!(out.success);
            assert!(out.server_timestamp.unwrap() >= sent_at);
        }
        assert_eq!(d.metrics()["server_received"], Value::from(3u64));
        d.stop().unwrap();
        d.stop().unwrap();
        assert!(!d.is_alive());
    }

    #[test]
    fn unknown_client_is_send_error() {
        let mut d = local();
        d.start_server().unwrap();
        d.start_clients(1).unwrap();
        assert!(matches!(
            d.send(&ClientId::indexed(5), reading("temp_5", 1)),
            Err(DriverError::Send(_))
        ));
    }

    #[test]
    fn silent_server_times_out_as_drop() {
        // Bound but never read, so no ack ever comes back.
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut d = UdpDriver::new(sink.local_addr().unwrap(), false, Duration::from_millis(100));
        d.start_server().unwrap();
        assert!(d.is_alive());
        d.start_clients(1).unwrap();
        let out = d.send(&ClientId::indexed(0), reading("temp_0", 1)).unwrap();
        assert_eq!(out, SendOutcome::dropped());
    }

    #[test]
    fn garbage_datagrams_count_as_parse_errors() {
        let mut d = local();
        d.start_server().unwrap();
        let stray = UdpSocket::bind("127.0.0.1:0").unwrap();
        stray.send_to(b"not json", d.server_addr().unwrap()).unwrap();
        d.start_clients(1).unwrap();
        // The valid reading is processed after the garbage one.
        assert!(d.send(&ClientId::indexed(0), reading("temp_0", 9)).unwrap().success);
        assert_eq!(d.metrics()["server_parse_errors"], Value::from(1u64));
    }

    #[test]
    fn remote_sensor_skips_local_server() {
        let mut cfg = Config::minimal("udp", 2, 1.0);
        cfg.server_ip = "10.1.2.3".into();
        cfg.server_port = 9000;
        let d = UdpDriver::from_config(&cfg).unwrap();
        assert!(!d.local_server);

        cfg.server_ip = "127.0.0.1".into();
        assert!(UdpDriver::from_config(&cfg).unwrap().local_server);
    }
}
