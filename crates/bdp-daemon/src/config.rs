//! Daemon configuration.
//!
//! Defaults cover the common single-user install; a TOML file overrides the
//! defaults and command-line flags override the file. Every field has a
//! serde default so a partial file stays valid.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration load errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File we tried to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File we tried to parse.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime settings of the provider daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Unix socket the daemon listens on.
    pub socket_path: PathBuf,
    /// Directory holding the per-domain database files.
    pub data_dir: PathBuf,
    /// Maximum concurrent sessions; beyond this the LRU idle session is
    /// evicted.
    pub max_sessions: usize,
    /// Per-read timeout on client sockets, in milliseconds.
    pub receive_timeout_ms: u64,
    /// How often the idle sweeper runs, in seconds.
    pub idle_sweep_interval_secs: u64,
    /// Idle age beyond which a session without a notification callback is
    /// closed, in seconds.
    pub idle_ceiling_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_runtime_dir().join("provider.sock"),
            data_dir: default_runtime_dir().join("data"),
            max_sessions: 30,
            receive_timeout_ms: 5_000,
            idle_sweep_interval_secs: 20,
            idle_ceiling_secs: 60,
        }
    }
}

impl DaemonConfig {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}

fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map_or_else(|| PathBuf::from("/tmp/bdp"), |dir| PathBuf::from(dir).join("bdp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.max_sessions, 30);
        assert_eq!(config.receive_timeout_ms, 5_000);
        assert!(config.idle_sweep_interval_secs < config.idle_ceiling_secs);
        assert!(config.socket_path.ends_with("provider.sock"));
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bdp.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_sessions = 4\ndata_dir = \"/var/lib/bdp\"").unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/bdp"));
        assert_eq!(config.receive_timeout_ms, 5_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bdp.toml");
        std::fs::write(&path, "max_sesions = 4\n").unwrap();
        assert!(matches!(DaemonConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(DaemonConfig::load(&path), Err(ConfigError::Read { .. })));
    }
}
