//! Telebench CLI
//!
//! - `run`: executes one benchmark run from a config file and saves its results
//! - `protocols`: lists the registered protocol drivers
//! - `validate`: checks a saved result directory against its QoS requirements
//! - `aggregate`: merges result directories from several nodes
//! - `compare`: runs one scenario under several protocols and reports the deltas

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use telebench_core::aggregate::aggregate_dirs;
use telebench_core::clock::{saturating_secs, sleep_unless};
use telebench_core::validator::{validate, Verdict};
use telebench_core::{compare, run_with_registry, Config, RunSummary};
use telebench_drivers::builtin_registry;

#[derive(Parser, Debug)]
#[command(name = "telebench", about = "IoT protocol load and fault-tolerance benchmark")]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG).
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one benchmark from a JSON or TOML config.
    Run {
        /// Path to the run config.
        #[arg(short, long)]
        config: PathBuf,

        /// Protocol override.
        #[arg(short, long)]
        protocol: Option<String>,

        /// Base directory for result folders.
        #[arg(short, long, default_value = "results")]
        out: PathBuf,
    },

    /// List registered protocol drivers.
    Protocols,

    /// Validate a saved result directory against its QoS requirements.
    Validate {
        /// Result directory containing summary.json.
        dir: PathBuf,
    },

    /// Aggregate result directories from several nodes.
    Aggregate {
        /// Result directories to merge.
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Write the aggregate as JSON to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run one scenario under several protocols and compare them.
    Compare {
        /// Path to the scenario config; its protocol field is ignored.
        #[arg(short, long)]
        config: PathBuf,

        /// Comma-separated protocols, baseline first.
        #[arg(short, long, value_delimiter = ',', required = true)]
        protocols: Vec<String>,

        /// Base directory for result folders and `comparisons/`.
        #[arg(short, long, default_value = "results")]
        out: PathBuf,

        /// Pause between protocol runs, in seconds.
        #[arg(long, default_value_t = 2.0)]
        cooldown: f64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .compact()
        .with_target(true)
        .init();

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run {
            config,
            protocol,
            out,
        } => run(&config, protocol, &out),
        Command::Protocols => {
            for name in builtin_registry().names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { dir } => validate_dir(&dir),
        Command::Aggregate { dirs, output } => aggregate(&dirs, output.as_deref()),
        Command::Compare {
            config,
            protocols,
            out,
            cooldown,
        } => {
            let cfg = load_config(&config)?;
            let path = compare_protocols(&cfg, &protocols, &out, cooldown, interrupt_flag())?;
            println!("Comparison saved to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::parse_file(path).with_context(|| format!("loading config {}", path.display()))
}

/// Shutdown flag raised by Ctrl-C.
fn interrupt_flag() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt, stopping run...");
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }
    shutdown
}

fn run(config: &Path, protocol: Option<String>, out: &Path) -> Result<ExitCode> {
    let mut cfg = load_config(config)?;
    if let Some(protocol) = protocol {
        cfg.protocol = protocol;
    }
    Ok(match run_config(cfg, out, interrupt_flag())? {
        Some(_) => ExitCode::SUCCESS,
        None => ExitCode::FAILURE,
    })
}

/// Runs `cfg` and saves its results. Returns the result directory, or `None`
/// when the run produced nothing worth saving.
fn run_config(cfg: Config, out: &Path, shutdown: Arc<AtomicBool>) -> Result<Option<PathBuf>> {
    let report = run_with_registry(cfg, &builtin_registry(), shutdown)?;
    save_results(&report.summary, out)
}

fn save_results(summary: &RunSummary, out: &Path) -> Result<Option<PathBuf>> {
    let qos = validate(summary, &summary.config.qos_requirements);
    println!("{summary}");
    println!("{qos}");

    if !summary.usable() {
        warn!(protocol = %summary.protocol, "run interrupted before any message was sent, nothing saved");
        return Ok(None);
    }
    let dir = summary.output_dir(out);
    summary
        .write_to_dir(&dir)
        .with_context(|| format!("saving results to {}", dir.display()))?;
    qos.write_to_dir(&dir)
        .with_context(|| format!("saving validation report to {}", dir.display()))?;
    println!("Results saved to {}", dir.display());
    Ok(Some(dir))
}

/// Runs `base` once per protocol, then writes the comparison report under `out`.
///
/// A protocol that fails to run is skipped; the first one that produces
/// results is the baseline.
fn compare_protocols(
    base: &Config,
    protocols: &[String],
    out: &Path,
    cooldown: f64,
    shutdown: Arc<AtomicBool>,
) -> Result<PathBuf> {
    let registry = builtin_registry();
    let mut summaries = Vec::new();
    for (i, protocol) in protocols.iter().enumerate() {
        if i > 0 && !sleep_unless(saturating_secs(cooldown), &shutdown) {
            warn!("interrupted, skipping remaining protocols");
            break;
        }
        let mut cfg = base.clone();
        cfg.protocol = protocol.clone();
        info!(%protocol, run = i + 1, of = protocols.len(), "comparison run");
        match run_with_registry(cfg, &registry, Arc::clone(&shutdown)) {
            Ok(report) => {
                if save_results(&report.summary, out)?.is_some() {
                    summaries.push(report.summary);
                }
            }
            Err(e) => warn!(%protocol, error = %e, "comparison run failed, skipping"),
        }
    }

    let Some(comparison) = compare(&summaries) else {
        anyhow::bail!("none of {} protocols produced results", protocols.len());
    };
    println!("{comparison}");
    comparison
        .write_report(out)
        .with_context(|| format!("saving comparison under {}", out.display()))
}

fn validate_dir(dir: &Path) -> Result<ExitCode> {
    let summary = RunSummary::load_dir(dir)
        .with_context(|| format!("loading results from {}", dir.display()))?;
    let report = validate(&summary, &summary.config.qos_requirements);
    println!("{report}");
    Ok(match report.verdict() {
        Verdict::CriticalIssues => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

fn aggregate(dirs: &[PathBuf], output: Option<&Path>) -> Result<ExitCode> {
    let agg = aggregate_dirs(dirs);
    if agg.num_nodes == 0 {
        anyhow::bail!("no readable result directories among {} given", dirs.len());
    }
    println!("{agg}");
    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&agg)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), nodes = agg.num_nodes, "aggregate written");
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_protocol_override() {
        let cli = Cli::try_parse_from([
            "telebench", "run", "--config", "bench.toml", "--protocol", "udp", "--debug",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Run { config, protocol, out } => {
                assert_eq!(config, PathBuf::from("bench.toml"));
                assert_eq!(protocol.as_deref(), Some("udp"));
                assert_eq!(out, PathBuf::from("results"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn aggregate_requires_a_directory() {
        assert!(Cli::try_parse_from(["telebench", "aggregate"]).is_err());
    }

    #[test]
    fn compare_splits_protocol_list() {
        let cli = Cli::try_parse_from([
            "telebench", "compare", "-c", "scenario.json", "-p", "udp,loopback",
        ])
        .unwrap();
        match cli.command {
            Command::Compare {
                protocols,
                out,
                cooldown,
                ..
            } => {
                assert_eq!(protocols, ["udp", "loopback"]);
                assert_eq!(out, PathBuf::from("results"));
                assert_eq!(cooldown, 2.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["telebench", "compare", "-c", "scenario.json"]).is_err());
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("telebench-cli-{name}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    fn quick(protocol: &str) -> Config {
        let mut cfg = Config::minimal(protocol, 1, 0.5);
        cfg.rate = 10.0;
        cfg.seed = Some(5);
        cfg
    }

    #[test]
    fn saved_run_includes_validation_report() {
        let out = scratch("run");
        let dir = run_config(quick("loopback"), &out, Arc::new(AtomicBool::new(false)))
            .unwrap()
            .unwrap();
        assert!(dir.starts_with(&out));
        assert!(dir.join("summary.json").exists());
        let qos = std::fs::read_to_string(dir.join("validation.txt")).unwrap();
        assert!(qos.contains("QOS VALIDATION REPORT"));
        std::fs::remove_dir_all(&out).ok();
    }

    #[test]
    fn interrupted_run_with_nothing_sent_saves_nothing() {
        let out = scratch("interrupted");
        let saved = run_config(quick("loopback"), &out, Arc::new(AtomicBool::new(true))).unwrap();
        assert!(saved.is_none());
        assert!(!out.exists());
    }

    #[test]
    fn compare_runs_each_protocol() {
        let out = scratch("compare");
        let path = compare_protocols(
            &quick("ignored"),
            &["loopback".to_string(), "udp".to_string(), "mqtt".to_string()],
            &out,
            0.0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert!(path.starts_with(out.join("comparisons")));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Baseline: loopback"));
        assert!(text.contains("vs loopback"));
        assert!(text.contains("Best overall:"));
        std::fs::remove_dir_all(&out).ok();
    }

    #[test]
    fn compare_without_results_is_an_error() {
        let out = scratch("compare-none");
        let err = compare_protocols(
            &quick("ignored"),
            &["mqtt".to_string()],
            &out,
            0.0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("produced results"));
    }

    #[test]
    fn missing_config_is_an_error() {
        let err = run(Path::new("/nonexistent/bench.json"), None, Path::new("/tmp"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("loading config"));
    }
}
