//! # Exec Driver
//!
//! Passive driver that runs an external server binary and, optionally, one
//! external client process per logical client. The processes generate and
//! deliver traffic on their own; the server appends `<seq> <latency_us>` lines
//! to a receive log, which is parsed after the run.
//!
//! `options` keys:
//!
//! | key | default |
//! |---|---|
//! | `server_bin` | required |
//! | `server_args` | `["{ip}", "{port}"]` |
//! | `client_bin` | none (server only) |
//! | `client_args` | `["{ip}", "{port}", "{client}"]` |
//! | `recv_log` | `recv.log` |
//! | `workdir` | current directory |
//!
//! Arguments may contain `{ip}`, `{port}`, `{client}` and `{recv_log}`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, info, warn};

use telebench_core::driver::{DriverMetrics, Harvest};
use telebench_core::passive::parse_recv_log;
use telebench_core::{Config, DriverError, DriverMode, ParseError, ProtocolDriver};

const DEFAULT_RECV_LOG: &str = "recv.log";

/// Command line of one external process, before placeholder expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn build(&self, vars: &Placeholders<'_>, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| vars.expand(a)))
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

struct Placeholders<'a> {
    ip: &'a str,
    port: u16,
    client: Option<usize>,
    recv_log: &'a Path,
}

impl Placeholders<'_> {
    fn expand(&self, arg: &str) -> String {
        let client = self.client.map(|c| c.to_string()).unwrap_or_default();
        arg.replace("{ip}", self.ip)
            .replace("{port}", &self.port.to_string())
            .replace("{client}", &client)
            .replace("{recv_log}", &self.recv_log.to_string_lossy())
    }
}

#[derive(Default)]
struct Processes {
    server: Option<Child>,
    clients: Vec<Child>,
}

/// Passive driver backed by external processes.
pub struct ExecDriver {
    server_ip: String,
    server_port: u16,
    server: CommandSpec,
    client: Option<CommandSpec>,
    workdir: PathBuf,
    recv_log: PathBuf,
    procs: Mutex<Processes>,
    spawned_clients: usize,
}

impl ExecDriver {
    pub fn from_config(cfg: &Config) -> Result<Self, DriverError> {
        let server_bin = cfg
            .option_str("server_bin")
            .ok_or_else(|| DriverError::Start("exec driver needs `options.server_bin`".into()))?;
        let server = CommandSpec {
            program: server_bin.to_string(),
            args: cfg
                .option_strings("server_args")
                .unwrap_or_else(|| vec!["{ip}".into(), "{port}".into()]),
        };
        let client = cfg.option_str("client_bin").map(|bin| CommandSpec {
            program: bin.to_string(),
            args: cfg
                .option_strings("client_args")
                .unwrap_or_else(|| vec!["{ip}".into(), "{port}".into(), "{client}".into()]),
        });
        let workdir = cfg
            .option_str("workdir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let recv_log = workdir.join(cfg.option_str("recv_log").unwrap_or(DEFAULT_RECV_LOG));

        Ok(Self {
            server_ip: cfg.server_ip.clone(),
            server_port: cfg.server_port,
            server,
            client,
            workdir,
            recv_log,
            procs: Mutex::new(Processes::default()),
            spawned_clients: 0,
        })
    }

    pub fn recv_log(&self) -> &Path {
        &self.recv_log
    }

    fn placeholders(&self, client: Option<usize>) -> Placeholders<'_> {
        Placeholders {
            ip: &self.server_ip,
            port: self.server_port,
            client,
            recv_log: &self.recv_log,
        }
    }

    fn spawn(&self, spec: &CommandSpec, client: Option<usize>) -> Result<Child, DriverError> {
        spec.build(&self.placeholders(client), &self.workdir)
            .spawn()
            .map_err(|e| DriverError::Start(format!("failed to spawn `{}`: {e}", spec.program)))
    }
}

impl ProtocolDriver for ExecDriver {
    fn name(&self) -> &str {
        "exec"
    }

    fn mode(&self) -> DriverMode {
        DriverMode::Passive
    }

    fn start_server(&mut self) -> Result<(), DriverError> {
        let mut procs = self.procs.lock().unwrap_or_else(|e| e.into_inner());
        if procs.server.is_some() {
            return Ok(());
        }
        // A log left by a previous run would be harvested as ours.
        match std::fs::remove_file(&self.recv_log) {
            Ok(()) => debug!(path = %self.recv_log.display(), "removed stale receive log"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let child = self.spawn(&self.server, None)?;
        info!(pid = child.id(), program = %self.server.program, "exec server started");
        procs.server = Some(child);
        Ok(())
    }

    fn start_clients(&mut self, n: usize) -> Result<(), DriverError> {
        let Some(spec) = self.client.clone() else {
            debug!("no client_bin configured, server only");
            return Ok(());
        };
        for i in 0..n {
            let child = self.spawn(&spec, Some(i))?;
            debug!(client = i, pid = child.id(), "exec client started");
            self.procs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clients
                .push(child);
        }
        self.spawned_clients += n;
        info!(clients = n, program = %spec.program, "exec clients started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        let mut procs = self.procs.lock().unwrap_or_else(|e| e.into_inner());
        let mut children: Vec<Child> = procs.clients.drain(..).collect();
        children.extend(procs.server.take());
        for mut child in children {
            let pid = child.id();
            if let Err(e) = child.kill() {
                // InvalidInput means the process already exited.
                if e.kind() != io::ErrorKind::InvalidInput {
                    warn!(pid, error = %e, "failed to kill child process");
                }
            }
            match child.wait() {
                Ok(status) => debug!(pid, %status, "child process reaped"),
                Err(e) => warn!(pid, error = %e, "failed to reap child process"),
            }
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        let mut procs = self.procs.lock().unwrap_or_else(|e| e.into_inner());
        match procs.server.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn metrics(&self) -> DriverMetrics {
        let mut m = DriverMetrics::new();
        m.insert("clients_spawned".into(), Value::from(self.spawned_clients));
        m.insert(
            "recv_log".into(),
            Value::from(self.recv_log.display().to_string()),
        );
        m
    }

    fn harvest(&mut self) -> Result<Harvest, ParseError> {
        parse_recv_log(&self.recv_log)
    }
}

impl Drop for ExecDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
