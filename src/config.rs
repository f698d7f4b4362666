use clap::ValueEnum;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Meeting pool service configuration
    Pool,
}

fn default_api_port() -> u16 {
    3000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_grace_period_secs() -> u64 {
    120
}

fn default_lifecycle_workers() -> usize {
    2
}

fn default_ingest_workers() -> usize {
    2
}

fn default_max_ingest_attempts() -> u32 {
    5
}

/// Top-level service configuration file structure
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Configuration type (must be "pool")
    pub config_type: ConfigType,
    /// Path to the sqlite state database
    pub db_path: PathBuf,
    /// Trigger-layer API port (default: 3000)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Meeting provider settings (maps to [provider] section in TOML)
    pub provider: ProviderConfig,
    /// Durable storage settings (maps to [storage] section in TOML)
    pub storage: StorageConfig,
    /// Pool/worker tuning (maps to [pool] section in TOML)
    #[serde(default)]
    pub pool: PoolTuning,
    /// Meeting accounts to import (maps to [[accounts]] in TOML)
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Meeting provider connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider REST base URL (e.g. https://api.example-meet.com/v2)
    pub base_url: String,
    /// OAuth token endpoint
    pub auth_url: String,
    /// Provider account/tenant id sent with the token request
    pub account_id: String,
    /// Credential profile name to look up the client id/secret from
    /// ~/.config/meeting_pool/credentials.toml
    pub credential_profile: String,
    /// Per-request timeout in seconds (default: 30)
    pub request_timeout_secs: Option<u64>,
}

/// Durable storage (SFTP) settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SFTP server hostname or IP address
    pub host: String,
    /// SFTP server port (default: 22)
    pub port: u16,
    /// SFTP username for authentication
    pub username: String,
    /// Credential profile name to look up the password from the credentials file
    pub credential_profile: String,
    /// Remote directory recordings are uploaded under (e.g. /recordings)
    pub remote_dir: String,
}

/// Worker and sweeper tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PoolTuning {
    /// Seconds between reconciliation sweeps (default: 60)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Grace period after scheduled end before a lesson counts as stuck (default: 120)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Worker threads on the lifecycle lane (default: 2)
    #[serde(default = "default_lifecycle_workers")]
    pub lifecycle_workers: usize,
    /// Worker threads on the ingestion lane (default: 2)
    #[serde(default = "default_ingest_workers")]
    pub ingest_workers: usize,
    /// Attempts before a recording is parked as failed (default: 5)
    #[serde(default = "default_max_ingest_attempts")]
    pub max_ingest_attempts: u32,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            lifecycle_workers: default_lifecycle_workers(),
            ingest_workers: default_ingest_workers(),
            max_ingest_attempts: default_max_ingest_attempts(),
        }
    }
}

/// One provider account/seat
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account id as known to the provider
    pub id: String,
    /// Maximum concurrent meetings this account may host
    pub max_concurrent: i64,
    /// Whether the account participates in allocation (default: true)
    pub active: Option<bool>,
}

impl PoolConfig {
    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.lifecycle_workers == 0 || self.pool.ingest_workers == 0 {
            return Err("worker counts must be at least 1".to_string());
        }
        if self.pool.max_ingest_attempts == 0 {
            return Err("max_ingest_attempts must be at least 1".to_string());
        }
        for account in &self.accounts {
            if account.id.is_empty() {
                return Err("account id must not be empty".to_string());
            }
            if account.max_concurrent < 1 {
                return Err(format!(
                    "account '{}': max_concurrent must be at least 1",
                    account.id
                ));
            }
        }
        if self.storage.remote_dir.is_empty() {
            return Err("storage.remote_dir must not be empty".to_string());
        }
        Ok(())
    }
}

/// Load and validate a config file
pub fn load_config(path: &std::path::Path) -> Result<PoolConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
    let config: PoolConfig = toml::from_str(&content)
        .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
    config.validate()?;
    Ok(config)
}
