//! Process PID file: created on startup, removed on shutdown (spec §6).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Holds the path to a written PID file and removes it on drop, so a panic
/// or an early `?`-return during startup still cleans up after itself.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write PID file at {}", path.display()))?;
        Ok(PidFile { path: path.to_path_buf() })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove PID file");
        }
    }
}
