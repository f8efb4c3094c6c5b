//! Repository configuration via `cairn.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are stored as plain integers with their unit in the key name.

use cairn_core::{CairnError, CairnResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed next to the repository data.
pub const CONFIG_FILE_NAME: &str = "cairn.toml";

/// Repository configuration loaded from `cairn.toml`.
///
/// # Example
///
/// ```toml
/// slot_count = 4
/// acquire_timeout_ms = 5000
/// session_idle_timeout_secs = 1800
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Number of pooled storage slots
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
    /// How long a transaction waits for a slot
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle time after which `clean_sessions` closes a session
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// Period of the background session sweep; 0 disables it
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long shutdown waits for slots to drain
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// How long shutdown waits to grab a slot still in use before giving up on it
    #[serde(default = "default_reclaim_lock_timeout_ms")]
    pub reclaim_lock_timeout_ms: u64,
    /// Group whose members bypass permission checks
    #[serde(default = "default_manager_group")]
    pub manager_group: String,
}

fn default_slot_count() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_session_idle_timeout_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_reclaim_lock_timeout_ms() -> u64 {
    200
}

fn default_manager_group() -> String {
    "managers".to_string()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            slot_count: default_slot_count(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            drain_timeout_ms: default_drain_timeout_ms(),
            reclaim_lock_timeout_ms: default_reclaim_lock_timeout_ms(),
            manager_group: default_manager_group(),
        }
    }
}

impl RepositoryConfig {
    /// Set the number of slots
    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    /// Set the slot acquisition timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the idle timeout of sessions
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the sweep period; zero disables the sweeper
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    /// Set the shutdown drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the manager group
    pub fn with_manager_group(mut self, group: impl Into<String>) -> Self {
        self.manager_group = group.into();
        self
    }

    /// Slot acquisition timeout
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Session idle timeout
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Sweep period, `None` when disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Shutdown drain timeout
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Per-slot reclaim lock timeout
    pub fn reclaim_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.reclaim_lock_timeout_ms)
    }

    /// Check values that would make the repository unusable
    ///
    /// # Errors
    ///
    /// Returns `Config` for a zero slot count or an empty manager group.
    pub fn validate(&self) -> CairnResult<()> {
        if self.slot_count == 0 {
            return Err(CairnError::Config(
                "slot_count must be at least 1".to_string(),
            ));
        }
        if self.manager_group.trim().is_empty() {
            return Err(CairnError::Config(
                "manager_group must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Cairn repository configuration
#
# Number of pooled storage slots. This is the hard ceiling on concurrent
# storage access; sessions beyond it wait for a slot.
slot_count = 4

# How long a transaction waits for a free slot before failing (milliseconds)
acquire_timeout_ms = 5000

# Sessions idle for longer than this are closed by the sweeper (seconds)
session_idle_timeout_secs = 1800

# Period of the background session sweep (seconds, 0 disables it)
sweep_interval_secs = 60

# Shutdown: how long to wait for transactions to give back their slots,
# then how long to wait for each slot still in use before giving up on it
drain_timeout_ms = 5000
reclaim_lock_timeout_ms = 200

# Members of this group bypass permission checks
manager_group = "managers"
"#
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> CairnResult<Self> {
        let config: RepositoryConfig = toml::from_str(content)
            .map_err(|e| CairnError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> CairnResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CairnError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            CairnError::Config(msg) => CairnError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> CairnResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                CairnError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> CairnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CairnError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            CairnError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_toml_matches_default() {
        let config = RepositoryConfig::from_toml_str(RepositoryConfig::default_toml()).unwrap();
        assert_eq!(config, RepositoryConfig::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = RepositoryConfig::from_toml_str("").unwrap();
        assert_eq!(config.slot_count, 4);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.manager_group, "managers");
    }

    #[test]
    fn zero_slots_rejected() {
        let err = RepositoryConfig::from_toml_str("slot_count = 0").unwrap_err();
        assert!(matches!(err, CairnError::Config(_)));
    }

    #[test]
    fn zero_sweep_interval_disables_sweeper() {
        let config = RepositoryConfig::from_toml_str("sweep_interval_secs = 0").unwrap();
        assert!(config.sweep_interval().is_none());
    }

    #[test]
    fn write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(!path.exists());

        RepositoryConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());
        assert_eq!(RepositoryConfig::from_file(&path).unwrap(), RepositoryConfig::default());
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "slot_count = 9\n").unwrap();

        RepositoryConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(RepositoryConfig::from_file(&path).unwrap().slot_count, 9);
    }

    #[test]
    fn write_to_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = RepositoryConfig::default()
            .with_slot_count(2)
            .with_acquire_timeout(Duration::from_millis(100))
            .with_manager_group("admins");

        config.write_to_file(&path).unwrap();
        assert_eq!(RepositoryConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = RepositoryConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, CairnError::Config(_)));
    }
}
