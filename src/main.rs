//! QDaq - command-line runner
//!
//! Builds an object tree from a project file and either prints it (`check`) or
//! arms its loops and streams watched channel values (`run`).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use qdaq::{ComputationRegistry, Loop, ProjectConfig, UiBridge, UiMessage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "qdaq", version, about = "Real-time data acquisition and control scheduler")]
struct Cli {
    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the tree and arm its loops
    Run {
        /// Project file (.toml or .json)
        project: PathBuf,

        /// Additional loop to arm, by absolute path (repeatable)
        #[arg(long = "arm", value_name = "PATH")]
        arm: Vec<String>,

        /// Channel to print on every change, by absolute path (repeatable)
        #[arg(long = "watch", value_name = "PATH")]
        watch: Vec<String>,

        /// Stop after this many seconds
        #[arg(long, default_value_t = 10.0)]
        duration_secs: f64,
    },
    /// Build the tree and print it
    Check {
        /// Project file (.toml or .json)
        project: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_deref());

    match cli.command {
        Command::Check { project } => {
            let (_, root) = build(&project)?;
            print!("{}", root.describe());
            Ok(())
        }
        Command::Run {
            project,
            arm,
            watch,
            duration_secs,
        } => run(&project, &arm, &watch, duration_secs),
    }
}

fn init_logging(
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,qdaq=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "qdaq.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn build(path: &std::path::Path) -> anyhow::Result<(ProjectConfig, Arc<Loop>)> {
    let project = ProjectConfig::load(path)
        .with_context(|| format!("loading project {}", path.display()))?;
    let registry = ComputationRegistry::new();
    let root = project
        .build(&registry)
        .with_context(|| format!("building project '{}'", project.name))?;
    Ok((project, root))
}

/// Instant at which `run` stops; rejects negative, NaN and oversized values.
fn deadline_after(duration_secs: f64) -> anyhow::Result<Instant> {
    let duration = Duration::try_from_secs_f64(duration_secs)
        .with_context(|| format!("invalid --duration-secs {}", duration_secs))?;
    match Instant::now().checked_add(duration) {
        Some(deadline) => Ok(deadline),
        None => bail!("--duration-secs {} is too large", duration_secs),
    }
}

fn run(
    path: &std::path::Path,
    extra_arm: &[String],
    watch: &[String],
    duration_secs: f64,
) -> anyhow::Result<()> {
    let deadline = deadline_after(duration_secs)?;
    let (project, root) = build(path)?;

    let bridge = UiBridge::new();
    let mut bindings = Vec::new();
    for p in watch {
        let channel = root.resolve_channel(p)?;
        bindings.push(bridge.bind(&channel));
    }

    let mut armed: Vec<Arc<Loop>> = Vec::new();
    for p in project.armed_paths().iter().chain(extra_arm) {
        let node = root.resolve(p)?;
        let Some(l) = node.as_loop() else {
            bail!("'{}' is a {}, not a loop", p, node.kind());
        };
        if !l.has_engine() {
            l.create_loop_engine()?;
        }
        l.arm().with_context(|| format!("arming {}", p))?;
        armed.push(l.clone());
    }
    if armed.is_empty() {
        tracing::warn!("No loop armed; mark loops with `armed = true` or pass --arm");
    }

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match bridge.msg_rx.recv_timeout(deadline - now) {
            Ok(UiMessage::ValueChanged { path, sample }) => {
                println!("{} {} = {}", sample.timestamp.to_rfc3339(), path, sample.value);
            }
            Err(_) => continue,
        }
    }

    // Innermost first, so children stop before the loops that own them.
    for l in armed.iter().rev() {
        l.disarm()?;
        if let Some(stats) = l.stats() {
            tracing::info!(
                "{}: {} ticks, {} overruns, {} errors",
                l.full_path(),
                stats.ticks,
                stats.overruns,
                stats.errors()
            );
        }
    }
    for binding in bindings {
        binding.unbind();
    }
    let dropped = bridge.forwarder().dropped();
    if dropped > 0 {
        tracing::warn!("{} updates dropped by the console forwarder", dropped);
    }
    Ok(())
}
