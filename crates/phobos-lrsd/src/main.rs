// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Phobos LRS daemon.
//!
//! Startup order: parse arguments, install tracing, fork unless
//! interactive, take the single-instance lock file, load the configuration,
//! connect the DSS, assemble the [`phobos_lrs::Lrs`] core (device locks,
//! workers, family loops, request socket). SIGTERM/SIGINT raise a flag;
//! the main thread then tears the core down in reverse order, removes the
//! lock file and exits zero.
//!
//! # Usage
//!
//! ```bash
//! # Foreground with a custom configuration
//! phobos-lrsd --interactive --config /etc/phobos.conf
//!
//! # Daemonized, TCP socket instead of the Unix default
//! phobos-lrsd --tcp 0.0.0.0:7800
//! ```

use anyhow::{bail, Context as _};
use clap::Parser;
use phobos_dss_sqlite::SqliteDssFactory;
use phobos_lrs::config::Config;
use phobos_lrs::context;
use phobos_lrs::transport::ListenAddr;
use phobos_lrs::Lrs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod lockfile;

use lockfile::LockFile;

/// Phobos local resource scheduler daemon.
#[derive(Parser, Debug)]
#[command(name = "phobos-lrsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML; defaults to /etc/phobos.conf or
    /// $PHOBOS_CFG_FILE)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stay in the foreground (no fork)
    #[arg(short, long, default_value = "false")]
    interactive: bool,

    /// Unix socket path override (lrs.server_socket otherwise)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Listen on TCP instead of the Unix socket
    #[arg(long)]
    tcp: Option<std::net::SocketAddr>,

    /// Lock file override (lrs.lock_file otherwise)
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// SQLite DSS database path override ([dss] path otherwise)
    #[arg(long)]
    dss: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Raised by the signal handler, polled by the main thread.
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // SAFETY: the handler only touches an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, on_stop_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_stop_signal as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Classic double-step daemonization: fork, parent exits, child leads its
/// own session.
fn daemonize() -> anyhow::Result<()> {
    // SAFETY: single-threaded at this point (before any runtime threads).
    match unsafe { libc::fork() } {
        -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            // SAFETY: child process detaches from the controlling terminal.
            if unsafe { libc::setsid() } == -1 {
                bail!("setsid failed: {}", std::io::Error::last_os_error());
            }
            Ok(())
        }
        _parent => std::process::exit(0),
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    // Core logs go through the `log` facade; bridge them into tracing.
    tracing_log::LogTracer::init().context("log bridge")?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("tracing subscriber")?;
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None => Config::load_default().context("loading default configuration"),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    if !args.interactive {
        daemonize()?;
    }
    install_signal_handlers();

    let cfg = load_config(&args)?;
    let lock_path = args
        .pid_file
        .clone()
        .unwrap_or_else(|| cfg.lock_file());
    let _lock = LockFile::acquire(&lock_path)
        .with_context(|| format!("lock file {}", lock_path.display()))?;

    let listen = match (&args.tcp, &args.socket) {
        (Some(addr), _) => ListenAddr::Tcp(*addr),
        (None, Some(path)) => ListenAddr::Unix(path.clone()),
        (None, None) => ListenAddr::Unix(cfg.server_socket()),
    };
    let dss_path = args
        .dss
        .clone()
        .or_else(|| cfg.get("dss", "path").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/var/lib/phobosd/dss.db"));

    let families: Vec<String> = cfg.families().iter().map(|f| f.to_string()).collect();
    let ctx = context::init(cfg);
    let dss_factory = Arc::new(SqliteDssFactory::new(&dss_path));

    info!("+----------------------------------------------------+");
    info!(
        "|  phobos-lrsd v{:<37} |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Host:     {:<39} |", ctx.owner().hostname);
    info!("|  Families: {:<39} |", families.join(","));
    info!("|  Socket:   {:<39} |", describe_listen(&listen));
    info!("|  DSS:      {:<39} |", dss_path.display());
    info!("+----------------------------------------------------+");

    let lrs = match Lrs::new(Arc::clone(&ctx), dss_factory, listen) {
        Ok(lrs) => lrs,
        Err(e) => {
            context::finish();
            return Err(anyhow::anyhow!(e)).context("starting the LRS core");
        }
    };

    let stop = lrs.stop_flag();
    while !STOP.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("stop requested, draining");
    lrs.shutdown();
    context::finish();
    info!("bye");
    Ok(())
}

fn describe_listen(listen: &ListenAddr) -> String {
    match listen {
        ListenAddr::Unix(path) => path.display().to_string(),
        ListenAddr::Tcp(addr) => addr.to_string(),
    }
}

// Referenced by the lockfile module for stale-pid probing.
pub(crate) fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
