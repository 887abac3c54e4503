//! nblog daemon - live execution logger for Jupyter kernels
//!
//! Watches the Jupyter runtime directory for kernel connection files,
//! attaches to every kernel it finds, and appends one JSON line per
//! observed event to the execution log.
//!
//! # Usage
//!
//! ```bash
//! # Start in the foreground
//! nblogd start
//!
//! # Start in the background
//! nblogd start -d
//!
//! # Launch a notebook server too, and echo records to the console log
//! nblogd start --launch --notebook-dir ~/notebooks --echo
//!
//! # Stop a background daemon
//! nblogd stop
//!
//! # Check daemon status
//! nblogd status
//!
//! # Enable debug logging
//! RUST_LOG=nblogd=debug nblogd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: graceful shutdown. Repeated signals are ignored.

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nblog_protocol::ZmqConnector;
use nblogd::config::MonitorConfig;
use nblogd::discovery::{DiscoveryLoop, RuntimeDirSource};
use nblogd::launcher::NotebookServer;
use nblogd::registry::spawn_registry;
use nblogd::sink::LogSink;

/// nblog daemon - Jupyter kernel execution logger
#[derive(Parser, Debug)]
#[command(name = "nblogd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start(StartArgs),
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        /// Configuration file to report paths from
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct StartArgs {
    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Execution log file (JSON lines)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Configuration file (default: $CONFIG_DIR/nblog/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory containing kernel-*.json connection files
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Print a one-line summary of every record
    #[arg(long)]
    echo: bool,

    /// Start `jupyter notebook` alongside the logger
    #[arg(long)]
    launch: bool,

    /// Notebook directory for --launch
    #[arg(long)]
    notebook_dir: Option<PathBuf>,

    /// Notebook server port for --launch
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

/// Returns `$STATE_DIR/nblog`, falling back to `/tmp/nblog`.
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nblog")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("nblogd.pid")
}

/// Returns the path of the diagnostic log used when daemonized.
fn log_file_path() -> PathBuf {
    state_dir().join("nblogd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}

/// Returns the daemon's PID if it is running, clearing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let target = i32::try_from(pid).context("PID out of range")?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let result = unsafe { libc::kill(target, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Makes `path` absolute against the current directory.
///
/// Daemonizing changes the working directory to `/`.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

/// Loads file and environment configuration, then applies CLI flags.
fn build_config(args: &StartArgs) -> Result<MonitorConfig> {
    let mut config = MonitorConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(output) = &args.output {
        config.log_file = output.clone();
    }
    if let Some(dir) = &args.runtime_dir {
        config.runtime_dir = Some(dir.clone());
    }
    if args.echo {
        config.echo = true;
    }
    if args.launch {
        config.server.launch = true;
    }
    if let Some(dir) = &args.notebook_dir {
        config.server.notebook_dir = dir.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    config.log_file = absolute(&config.log_file)?;
    config.server.notebook_dir = absolute(&config.server.notebook_dir)?;
    config.runtime_dir = config
        .resolve_runtime_dir()
        .map(|dir| absolute(&dir))
        .transpose()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start(StartArgs::default()));

    match command {
        Command::Start(start) => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {})", pid);
                eprintln!("Use 'nblogd stop' to stop it first.");
                process::exit(1);
            }

            let config = build_config(&start)?;

            if start.daemon {
                // Daemonize before starting the tokio runtime
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {})...", pid);
                stop_daemon(pid)?;

                // Wait for process to exit (up to 5 seconds)
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {})", pid);
            if let Ok(config) = MonitorConfig::load(config.as_deref()) {
                println!("Execution log: {}", config.log_file.display());
                if let Some(dir) = config.resolve_runtime_dir() {
                    println!("Runtime dir: {}", dir.display());
                }
            }
            let log = log_file_path();
            if log.exists() {
                println!("Daemon log: {}", log.display());
            }
            Ok(())
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: MonitorConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nblogd=info".parse()?)
                .add_directive("nblog_core=info".parse()?)
                .add_directive("nblog_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "nblog daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = if config.server.launch {
        Some(
            NotebookServer::launch(&config.server)
                .await
                .context("Failed to launch notebook server")?,
        )
    } else {
        None
    };

    let Some(runtime_dir) = config.runtime_dir.clone() else {
        bail!("Could not determine the Jupyter runtime directory; set JUPYTER_RUNTIME_DIR or pass --runtime-dir");
    };

    let (sink, sink_handle) = LogSink::open(&config.log_file, config.sink_options())
        .await
        .with_context(|| format!("Failed to open execution log {}", config.log_file.display()))?;

    let registry = spawn_registry();
    let session = config.session();
    let discovery = DiscoveryLoop::new(
        Arc::new(RuntimeDirSource::new(&runtime_dir)),
        Arc::new(ZmqConnector::with_timeout(session.connect_timeout)),
        registry,
        sink_handle,
        config.discovery(),
        session,
    );

    info!(
        runtime_dir = %runtime_dir.display(),
        log_file = %config.log_file.display(),
        "Monitoring Jupyter kernels"
    );

    let result = discovery.run(cancel_token).await;
    drop(discovery);

    let stats = sink.close(config.shutdown_grace()).await;

    if let Some(server) = server {
        server.shutdown(config.shutdown_grace()).await;
    }

    match result {
        Ok(totals) => {
            info!(
                kernels_seen = totals.discovered,
                cells_executed = stats.cells_executed,
                "nblog daemon stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Discovery loop failed");
            Err(e.into())
        }
    }
}

/// Waits for the first shutdown signal (SIGTERM or SIGINT).
///
/// The handlers stay installed afterwards, so later signals are absorbed
/// instead of killing the process mid-shutdown.
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = sigterm.recv() => received,
                    received = sigint.recv() => received,
                };
                if received.is_none() {
                    break;
                }
                warn!("Already shutting down");
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
