//! Configuration for the link service
//!
//! Loaded from TOML. Every field has a default, so an absent file or a
//! partial one yields a working configuration.

use crate::backoff::BackoffPolicy;
use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Directory holding credentials, the session registry and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for short-lived artifacts swept by the cleanup scheduler
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub pairing: PairingConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub logs: LogConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            temp_dir: None,
            backoff: BackoffConfig::default(),
            pairing: PairingConfig::default(),
            cleanup: CleanupConfig::default(),
            logs: LogConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file, defaulting when it does not exist
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: LinkConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the lifecycle guarantees
    pub fn validate(&self) -> Result<()> {
        if self.backoff.max_attempts == 0 {
            return Err(LinkError::Config(
                "backoff.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff.growth < 1.0 {
            return Err(LinkError::Config(format!(
                "backoff.growth must be >= 1.0, got {}",
                self.backoff.growth
            )));
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return Err(LinkError::Config(
                "backoff.cap_ms must not be below backoff.base_ms".to_string(),
            ));
        }
        if self.pairing.ttl_secs == 0 {
            return Err(LinkError::Config(
                "pairing.ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Temp artifact directory (defaults to `<data_dir>/temp`)
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("temp"))
    }

    /// Reconnect policy built from the backoff settings
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff.base_ms),
            self.backoff.growth,
            Duration::from_millis(self.backoff.cap_ms),
            self.backoff.max_attempts,
        )
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_growth")]
    pub growth: f64,

    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,

    /// Consecutive failures before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay before returning to "waiting for pairing" after a logout
    #[serde(default = "default_logout_delay_ms")]
    pub logout_delay_ms: u64,
}

fn default_base_ms() -> u64 {
    3_000
}

fn default_growth() -> f64 {
    1.5
}

fn default_cap_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_logout_delay_ms() -> u64 {
    3_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            growth: default_growth(),
            cap_ms: default_cap_ms(),
            max_attempts: default_max_attempts(),
            logout_delay_ms: default_logout_delay_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn logout_delay(&self) -> Duration {
        Duration::from_millis(self.logout_delay_ms)
    }
}

/// Pairing code settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Lifetime of an issued pairing code
    #[serde(default = "default_pairing_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_pairing_ttl_secs() -> u64 {
    60
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_pairing_ttl_secs(),
        }
    }
}

impl PairingConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// Background sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval of the pairing/temp sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Interval of the oversized-file sweep
    #[serde(default = "default_compact_interval_secs")]
    pub compact_interval_secs: u64,

    /// Delay before the first sweep after start
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Temp artifacts older than this are deleted
    #[serde(default = "default_temp_max_age_secs")]
    pub temp_max_age_secs: u64,

    /// Cache files larger than this are truncated
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Cache files (relative to the data dir) checked by the oversized sweep
    #[serde(default = "default_cache_files")]
    pub cache_files: Vec<PathBuf>,
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_compact_interval_secs() -> u64 {
    60 * 60
}

fn default_initial_delay_secs() -> u64 {
    10
}

fn default_temp_max_age_secs() -> u64 {
    30 * 60
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_cache_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from("store.json"),
        PathBuf::from("messages.json"),
    ]
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            compact_interval_secs: default_compact_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
            temp_max_age_secs: default_temp_max_age_secs(),
            max_file_bytes: default_max_file_bytes(),
            cache_files: default_cache_files(),
        }
    }
}

impl CleanupConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn temp_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_max_age_secs)
    }
}

/// Retention caps for the four audit logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_error_cap")]
    pub max_errors: usize,

    #[serde(default = "default_activity_cap")]
    pub max_activity: usize,

    #[serde(default = "default_session_cap")]
    pub max_session: usize,

    #[serde(default = "default_pairing_cap")]
    pub max_pairing: usize,
}

fn default_error_cap() -> usize {
    1000
}

fn default_activity_cap() -> usize {
    2000
}

fn default_session_cap() -> usize {
    500
}

fn default_pairing_cap() -> usize {
    500
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_errors: default_error_cap(),
            max_activity: default_activity_cap(),
            max_session: default_session_cap(),
            max_pairing: default_pairing_cap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.backoff.base_ms, 3_000);
        assert_eq!(config.backoff.max_attempts, 10);
        assert_eq!(config.pairing.ttl_secs, 60);
        assert_eq!(config.cleanup.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.cleanup.compact_interval(), Duration::from_secs(3600));
        assert_eq!(config.logs.max_activity, 2000);
        assert_eq!(config.temp_dir(), PathBuf::from("data").join("temp"));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
            data_dir = "/var/lib/link"

            [backoff]
            max_attempts = 5

            [pairing]
            ttl_secs = 120
        "#;
        let config: LinkConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/link"));
        assert_eq!(config.backoff.max_attempts, 5);
        assert_eq!(config.backoff.cap_ms, 30_000);
        assert_eq!(config.pairing.ttl_secs, 120);
        assert_eq!(config.logs.max_errors, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = LinkConfig::default();
        config.backoff.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.backoff.growth = 0.5;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.backoff.cap_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing_uses_defaults() {
        let config = LinkConfig::from_file("/tmp/nonexistent-a3s-link.toml").unwrap();
        assert_eq!(config.backoff.max_attempts, 10);
    }

    #[test]
    fn test_from_file_parses_toml() {
        let dir = std::env::temp_dir().join(format!("a3s-link-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("link.toml");
        std::fs::write(&path, "[cleanup]\nmax_file_bytes = 1024\n").unwrap();

        let config = LinkConfig::from_file(&path).unwrap();
        assert_eq!(config.cleanup.max_file_bytes, 1024);

        std::fs::write(&path, "[backoff\n").unwrap();
        assert!(matches!(LinkConfig::from_file(&path), Err(LinkError::Toml(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
