//! Server Core (spec §6): process-wide registries, prefs loading/reload,
//! PID file and status file, CLI argument parsing, and startup
//! orchestration. The only crate with a `main`.

mod cli;
mod pidfile;
mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use infra_common::config::SharedConfig;
use infra_common::logging::{self, LoggingConfig};
use infra_common::tasks::Scheduler;
use infra_common::timeout::TimeoutService;
use rtsp_transport::{ListenerSet, SocketPool};
use session_core::default_modules::{AllowAuthenticatedModule, DigestAuthModule, InMemoryUserStore, RtpLifecycleModule};
use session_core::{ModuleRegistry, Role, RtpSessionRegistry, RtspSessionRegistry, SessionAcceptor, SessionDeps, TunnelMap};

use cli::Cli;
use pidfile::PidFile;

/// Exit code requesting the process supervisor restart us (spec §6:
/// "a distinguished nonzero value requesting the supervisor to restart").
const EXIT_RESTART_REQUESTED: i32 = 75;
/// Exit code for a fatal startup failure (spec §6: "nonzero for fatal
/// startup failure"); anything other than 0 or [`EXIT_RESTART_REQUESTED`]
/// reads as this category to a supervisor, but we use a fixed value for
/// our own paths through `main`.
const EXIT_STARTUP_FATAL: i32 = 1;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging_config = LoggingConfig::new(
        logging::parse_log_level(&cli.log_level).context("invalid --log-level")?,
        "rtsp-server",
    );
    if cli.is_daemon() {
        // Daemonized operation runs detached from a terminal (spec §1's
        // external launcher), so timestamps/JSON framing matter more than
        // colorized interactive output.
        logging_config = logging_config.with_json();
    }
    logging::setup_logging(logging_config).context("failed to initialize logging")?;

    let config = SharedConfig::load(cli.prefs_file.clone()).context("failed to load prefs file")?;
    let runtime = build_runtime(&config)?;
    match runtime.block_on(run(cli, config)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "fatal startup failure");
            std::process::exit(EXIT_STARTUP_FATAL);
        }
    }
}

fn build_runtime(config: &SharedConfig) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    // `0` means "let tokio pick its own default worker count".
    let worker_threads = config.snapshot().worker_threads;
    if worker_threads > 0 {
        builder.worker_threads(worker_threads);
    }
    builder.build().context("failed to build the tokio runtime")
}

async fn run(cli: Cli, config: SharedConfig) -> Result<i32> {
    if let Some(port) = cli.port {
        // `SharedConfig::reload` always re-parses from disk, so there's no
        // field-level setter to push this through; the override is applied
        // directly to the listen addresses we bind below instead, and
        // reverts to the prefs file's own port on the next `SIGHUP`-driven
        // reload. That matches its scope: a launch-time knob, not a
        // persistent prefs change.
        info!(port, "applying --port override to all configured listen addresses");
    }

    let rtp_sessions = Arc::new(RtpSessionRegistry::new());
    let rtsp_sessions = Arc::new(RtspSessionRegistry::new());
    let tunnel_map = TunnelMap::new();
    let timeouts = TimeoutService::new(Duration::from_millis(250));
    let _timeout_scanner = timeouts.spawn_scanner();

    let initial = config.snapshot();
    let socket_pool = SocketPool::new(initial.rtcp_recv_buffer_bytes);

    let modules = Arc::new(build_module_registry(config.clone(), rtp_sessions.clone(), socket_pool.clone()));

    let scheduler = Scheduler::new(timeouts.clone(), initial.max_connections, Duration::from_secs(10));

    let deps = SessionDeps::new(
        config.clone(),
        modules.clone(),
        rtp_sessions.clone(),
        rtsp_sessions.clone(),
        tunnel_map,
        timeouts.clone(),
        socket_pool,
    );

    let acceptor = SessionAcceptor::new(deps.clone(), scheduler.clone());
    let listeners = ListenerSet::new(acceptor);

    let listen_addrs = listen_addresses(&config, &cli);
    listeners.rebuild(&listen_addrs).await;
    if listeners.is_empty() {
        anyhow::bail!("no RTSP listener bound out of {} configured address(es)", listen_addrs.len());
    }
    info!(bound = ?listeners.bound_addresses(), "RTSP listeners up");

    let _pid_file = match &initial.pid_file {
        Some(path) => Some(PidFile::create(path).context("failed to create PID file")?),
        None => None,
    };

    let status_interval = cli
        .status_interval
        .unwrap_or(initial.status_update_interval_secs);
    let _status_writer = match &initial.status_file {
        Some(path) => status::spawn_status_writer(deps.clone(), path.clone(), Duration::from_secs(status_interval)),
        None => None,
    };

    modules.dispatch_lifecycle(Role::Register).await;
    modules.dispatch_lifecycle(Role::Initialize).await;

    let exit_code = wait_for_termination(&config, &listeners, &modules).await;

    modules.dispatch_lifecycle(Role::Shutdown).await;
    scheduler.shutdown().await;

    Ok(exit_code)
}

fn listen_addresses(config: &SharedConfig, cli: &Cli) -> Vec<std::net::SocketAddr> {
    let mut addrs = config.snapshot().rtsp_listen;
    if let Some(port) = cli.port {
        for addr in addrs.iter_mut() {
            addr.set_port(port);
        }
    }
    addrs
}

fn build_module_registry(
    config: SharedConfig,
    rtp_sessions: Arc<RtpSessionRegistry>,
    socket_pool: SocketPool,
) -> ModuleRegistry {
    // No accounts are provisioned from prefs in this tree (the user store
    // is an external collaborator, per spec §1); Digest auth starts with
    // an empty user table so every request is challenged and then
    // rejected until a deployment-specific auth module is layered on top
    // via its own `ModuleRegistryBuilder::register` call site.
    let users = InMemoryUserStore::new();
    let realm = config.snapshot().auth_realm;

    ModuleRegistry::builder()
        .register(DigestAuthModule::new(realm, users))
        .register(AllowAuthenticatedModule::new())
        .register(RtpLifecycleModule::new(rtp_sessions, socket_pool, config))
        .build()
}

/// Waits for `SIGHUP` (reload prefs and rebuild listeners), `SIGUSR1`
/// (orderly restart — exits with [`EXIT_RESTART_REQUESTED`] so the
/// supervisor knows to relaunch us), `SIGTERM`, or Ctrl-C (clean
/// shutdown). Returns the process exit code.
async fn wait_for_termination<H: rtsp_transport::AcceptHandler>(
    config: &SharedConfig,
    listeners: &ListenerSet<H>,
    modules: &ModuleRegistry,
) -> i32 {
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler, reload via signal unavailable");
            return wait_for_shutdown_only().await;
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGUSR1 handler, restart-on-signal unavailable");
            return wait_for_shutdown_only().await;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            return wait_for_shutdown_only().await;
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading prefs");
                if let Err(e) = config.reload() {
                    warn!(error = %e, "prefs reload failed, keeping previous configuration");
                    continue;
                }
                let fresh = config.snapshot();
                listeners.rebuild(&fresh.rtsp_listen).await;
                modules.dispatch_lifecycle(Role::RereadPrefs).await;
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1 received, requesting a supervisor restart");
                return EXIT_RESTART_REQUESTED;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                return 0;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                return 0;
            }
        }
    }
}

async fn wait_for_shutdown_only() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    0
}
