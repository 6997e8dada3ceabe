//! Configuration for tsmon.
//!
//! Loaded from a TOML file (default `~/.config/tsmon/config.toml`); every
//! field has a serde default so an empty or missing file yields a working
//! configuration. The empirically tuned constants of the ingest pipeline
//! (merge window, presence fuzz, liveness cache TTL, single-flight TTL)
//! live here rather than as hard-coded magic numbers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Data directory (database, rendered dump scripts).
    pub data_dir: Option<PathBuf>,
    /// Poller tuning.
    pub poller: PollerConfig,
    /// Scripting-client launch settings.
    pub client: ClientConfig,
}

/// Poller supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Output merge window in milliseconds. Adjacent output log fragments
    /// within this window coalesce into one stored record.
    pub merge_window_ms: i64,
    /// Base presence fuzz in seconds, added to the inferred max sleep when
    /// deciding whether a check-in extends an existing presence window.
    pub presence_fuzz_secs: i64,
    /// How long a cached `active` flag is trusted before re-querying.
    pub liveness_cache_secs: u64,
    /// TTL of the per-server single-flight entry. A crashed task's entry
    /// expires after this long, allowing a fresh launch.
    pub single_flight_ttl_secs: u64,
    /// Delay before a failed poll attempt is retried.
    pub retry_delay_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            merge_window_ms: 15,
            presence_fuzz_secs: 60,
            liveness_cache_secs: 5,
            single_flight_ttl_secs: 60,
            retry_delay_secs: 5,
        }
    }
}

/// Scripting-client launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Explicit path to the client jar. When unset, the platform-dependent
    /// search across known install layouts applies.
    pub jar_path: Option<PathBuf>,
    /// JVM max heap in megabytes.
    pub max_heap_mb: u32,
    /// Parallel GC thread count.
    pub gc_threads: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            jar_path: None,
            max_heap_mb: 128,
            gc_threads: 4,
        }
    }
}

impl Config {
    /// Load configuration from the given path, or defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid config {}: {e}", path.display()),
            ))
        })
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tsmon")
            .join("config.toml")
    }

    /// Resolve the data directory, creating nothing.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tsmon")
        })
    }

    /// Database path inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("tsmon.db")
    }

    /// Supervisor lock path inside the data directory.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir().join("tsmon.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/tsmon.toml")).unwrap();
        assert_eq!(cfg.poller.merge_window_ms, 15);
        assert_eq!(cfg.poller.presence_fuzz_secs, 60);
        assert_eq!(cfg.client.max_heap_mb, 128);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[poller]\nmerge_window_ms = 30\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.poller.merge_window_ms, 30);
        assert_eq!(cfg.poller.liveness_cache_secs, 5);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poller = \"not a table\"").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
