//! Engine configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty or
//! missing file yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TICKETMAIL_CONFIG";

/// Environment variable overriding the database path.
pub const DATABASE_ENV: &str = "TICKETMAIL_DATABASE";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inbound sync settings.
    pub sync: SyncConfig,
    /// Outbound dispatch settings.
    pub outbound: OutboundConfig,
    /// Network deadlines.
    pub network: NetworkConfig,
    /// Storage locations.
    pub storage: StorageConfig,
}

/// Inbound sync scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scheduler passes.
    pub poll_interval_secs: u64,
    /// Maximum messages processed per mailbox cycle.
    pub max_batch_size: usize,
    /// Mailboxes synced in parallel by one process.
    pub max_concurrent_mailboxes: usize,
    /// A `syncing` lease whose heartbeat is older than this is reclaimable.
    pub lease_stale_after_secs: u64,
    /// Consecutive failures after which a connector is sent back to
    /// `pending` for re-validation.
    pub revalidate_after_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_batch_size: 100,
            max_concurrent_mailboxes: 8,
            lease_stale_after_secs: 600,
            revalidate_after_failures: 5,
        }
    }
}

impl SyncConfig {
    /// Interval between scheduler passes.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Lease staleness threshold.
    #[must_use]
    pub const fn lease_stale_after(&self) -> Duration {
        Duration::from_secs(self.lease_stale_after_secs)
    }
}

/// Outbound dispatch limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Concurrent sends allowed per connector.
    pub max_concurrent_sends: usize,
    /// Milliseconds to wait for a send slot before deferring.
    pub permit_timeout_ms: u64,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sends: 4,
            permit_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl OutboundConfig {
    /// Send slot wait limit.
    #[must_use]
    pub const fn permit_timeout(&self) -> Duration {
        Duration::from_millis(self.permit_timeout_ms)
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Network deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Deadline for a single IMAP or SMTP operation, in seconds.
    pub operation_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 60,
        }
    }
}

impl NetworkConfig {
    /// Per-operation deadline.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Storage locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `SQLite` database file.
    pub database_path: PathBuf,
    /// Root directory for attachment bytes.
    pub attachment_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            database_path: base.join("ticketmail.db"),
            attachment_dir: base.join("attachments"),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ticketmail")
}

/// Default configuration file location.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ticketmail")
        .join("config.json")
}

impl EngineConfig {
    /// Load configuration from `TICKETMAIL_CONFIG` or the default path,
    /// then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV).map_or_else(default_config_path, PathBuf::from);
        let mut config = Self::from_file(&path).await?;
        if let Some(db) = std::env::var_os(DATABASE_ENV) {
            config.storage.database_path = PathBuf::from(db);
        }
        Ok(config)
    }

    /// Load configuration from a specific file. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.check()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.sync.poll_interval_secs == 0 {
            return Err(Error::Config("sync.poll_interval_secs must be positive".into()));
        }
        if self.sync.max_batch_size == 0 {
            return Err(Error::Config("sync.max_batch_size must be positive".into()));
        }
        if self.sync.max_concurrent_mailboxes == 0 {
            return Err(Error::Config(
                "sync.max_concurrent_mailboxes must be positive".into(),
            ));
        }
        if self.outbound.max_concurrent_sends == 0 {
            return Err(Error::Config(
                "outbound.max_concurrent_sends must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"sync": {"max_batch_size": 10}}"#).unwrap();
        assert_eq!(config.sync.max_batch_size, 10);
        assert_eq!(config.sync.poll_interval_secs, 60);
        assert_eq!(config.outbound.retry.max_retries, 3);
        assert_eq!(config.network.operation_timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let config = EngineConfig::from_file(Path::new("/nonexistent/ticketmail.json"))
            .await
            .unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let path = std::env::temp_dir().join(format!("ticketmail-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"{"sync": {"max_batch_size": 0}}"#)
            .await
            .unwrap();
        let err = EngineConfig::from_file(&path).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
