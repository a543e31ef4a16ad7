//! Configuration module for payout-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Where validated settlement uploads wait for processing.
    pub upload_dir: PathBuf,
    /// Settlement rows of any other transaction type are ignored.
    pub transaction_type: String,
    pub max_upload_bytes: usize,
    /// Validated uploads not processed within this many seconds are swept.
    pub retention_secs: u64,
}

impl SettlementConfig {
    pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
    pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;

    pub fn default_upload_dir() -> PathBuf {
        env::temp_dir().join("payout-settlements")
    }
}

impl PayoutConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "payout-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            settlement: SettlementConfig {
                upload_dir: env::var("SETTLEMENT_UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| SettlementConfig::default_upload_dir()),
                transaction_type: env::var("SETTLEMENT_TRANSACTION_TYPE")
                    .unwrap_or_else(|_| "Bulk Payment".to_string()),
                max_upload_bytes: env::var("SETTLEMENT_MAX_UPLOAD_BYTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(SettlementConfig::DEFAULT_MAX_UPLOAD_BYTES),
                retention_secs: env::var("SETTLEMENT_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(SettlementConfig::DEFAULT_RETENTION_SECS),
            },
        })
    }
}
