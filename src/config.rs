use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;

/// Default poll budget for a freshly launched session to show up.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Timeout for session queries, launches and kills.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Process listings can be slow on busy hosts.
pub const DEFAULT_LISTING_TIMEOUT: Duration = Duration::from_secs(15);

/// Explicit runtime configuration handed to managers at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxConfig {
    /// Directory that receives generated layout artifacts.
    pub artifact_root: PathBuf,
    /// Directory holding one sub-directory per saved manager id.
    pub persistence_root: PathBuf,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub listing_timeout: Duration,
    /// Upload directory on remote hosts, relative to the remote home.
    pub remote_artifact_dir: String,
}

/// Default base directory: `~/.muxherd/`
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".muxherd")
}

impl MuxConfig {
    /// Configuration rooted at `base`, with a persistence root per backend kind.
    pub fn rooted_at(base: &Path, backend: BackendKind) -> Self {
        Self {
            artifact_root: base.join("layouts"),
            persistence_root: base.join("managers").join(backend.id()),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            listing_timeout: DEFAULT_LISTING_TIMEOUT,
            remote_artifact_dir: ".muxherd/layouts".to_string(),
        }
    }

    pub fn for_backend(backend: BackendKind) -> Self {
        Self::rooted_at(&default_base_dir(), backend)
    }

    /// Defaults overlaid with `MUXHERD_HOME`, `MUXHERD_POLL_TIMEOUT_SECS` and
    /// `MUXHERD_COMMAND_TIMEOUT_SECS` when set.
    pub fn from_env(backend: BackendKind) -> Self {
        let base = std::env::var_os("MUXHERD_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(default_base_dir);
        let mut config = Self::rooted_at(&base, backend);
        if let Some(secs) = env_secs("MUXHERD_POLL_TIMEOUT_SECS") {
            config.poll_timeout = secs;
        }
        if let Some(secs) = env_secs("MUXHERD_COMMAND_TIMEOUT_SECS") {
            config.command_timeout = secs;
        }
        config
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring non-numeric timeout override");
            None
        }
    }
}
