//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Paths to all Provisor working directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `.provisor/`).
    pub root: PathBuf,
    /// Downloaded artifacts (`.provisor/downloads/`).
    pub downloads: PathBuf,
    /// Extraction scratch space (`.provisor/staging/`).
    pub staging: PathBuf,
    /// Action journal (`.provisor/actions.jsonl`).
    pub run_log: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            downloads: root.join("downloads"),
            staging: root.join("staging"),
            run_log: root.join("actions.jsonl"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.downloads)?;
        std::fs::create_dir_all(&self.staging)?;
        Ok(())
    }
}

/// Top-level Provisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisorConfig {
    /// Working directory paths.
    pub data_paths: DataPaths,
    /// Bound on every external call (package install, pull, download).
    pub call_timeout: Duration,
    /// How many times a daemon probe is retried before giving up.
    pub daemon_retries: u32,
    /// Pause between daemon probe retries.
    pub daemon_retry_delay: Duration,
    /// Container runtime CLI binary.
    pub docker_bin: String,
}

impl ProvisorConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let call_timeout_secs = env_parse("PROVISOR_CALL_TIMEOUT_SECS").unwrap_or(120);
        let daemon_retries = env_parse("PROVISOR_DAEMON_RETRIES").unwrap_or(5);
        let retry_ms = env_parse("PROVISOR_DAEMON_RETRY_MS").unwrap_or(1000);
        let docker_bin = std::env::var("PROVISOR_DOCKER").unwrap_or_else(|_| "docker".into());

        let data_paths = DataPaths::new(data_dir)?;

        Ok(Self {
            data_paths,
            call_timeout: Duration::from_secs(call_timeout_secs),
            daemon_retries: daemon_retries as u32,
            daemon_retry_delay: Duration::from_millis(retry_ms),
            docker_bin,
        })
    }

    /// Defaults with short timeouts, rooted at `data_dir`. Used by tests.
    pub fn for_testing(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            data_paths: DataPaths::new(data_dir)?,
            call_timeout: Duration::from_millis(500),
            daemon_retries: 2,
            daemon_retry_delay: Duration::from_millis(10),
            docker_bin: "docker".into(),
        })
    }
}

fn env_parse(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
