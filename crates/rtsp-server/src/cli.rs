//! Command-line surface (spec §6): "a foreground/daemon switch, a prefs-file
//! path, a port override, a stats-update interval." Actual process
//! daemonization (double-fork, detaching from the controlling terminal) is
//! one of the external collaborators spec §1 names explicitly — this only
//! parses the switch and leaves the forking itself to the process
//! supervisor (systemd, launchd, a container runtime) that starts us.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "rtsp-server")]
#[command(author, version, about = "RTSP/RTP streaming media server core")]
pub struct Cli {
    /// Run attached to the controlling terminal. The default; the inverse
    /// of `--daemon`.
    #[arg(long, conflicts_with = "daemon")]
    pub foreground: bool,

    /// Request background/daemon operation. The process itself still runs
    /// in the foreground of whatever launched it (spec §1: daemonization is
    /// an external collaborator's job); this only changes default log
    /// formatting to something more log-file-friendly.
    #[arg(long)]
    pub daemon: bool,

    /// Path to the TOML prefs file (spec §3, §6). Re-read in full on
    /// `SIGHUP` (spec §5's `RereadPrefs`).
    #[arg(short = 'c', long = "prefs-file", value_name = "PATH")]
    pub prefs_file: Option<PathBuf>,

    /// Override the RTSP listen port from the prefs file, applied to every
    /// configured listen address.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Seconds between server-status file writes; `0` disables it. Overrides
    /// the prefs file's `status_update_interval_secs` when given.
    #[arg(long, value_name = "SECS")]
    pub status_interval: Option<u64>,

    /// `tracing` log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn is_daemon(&self) -> bool {
        self.daemon && !self.foreground
    }
}
