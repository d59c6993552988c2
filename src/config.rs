//! Configuration management with validation and defaults
//!
//! Game rules are copied into each round when it opens, so changing the
//! configuration never affects a round that is already running.

use crate::types::{AccountId, NoWinnerPolicy, RoundRules, TieBreak, Wei};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 0.02 ether per token
pub const DEFAULT_PRICE_PER_TOKEN: u64 = 20_000_000_000_000_000;

/// Top-level engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub game: GameConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
}

/// Rules applied to every newly opened round
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Price of one token in wei (TOML integers are 64-bit)
    pub price_per_token: u64,
    pub min_guess: u8,
    pub max_guess: u8,
    /// The single identity allowed to close rounds and open new ones
    pub owner: String,
    pub tie_break: TieBreak,
    pub no_winner_policy: NoWinnerPolicy,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            price_per_token: DEFAULT_PRICE_PER_TOKEN,
            min_guess: 1,
            max_guess: 10,
            owner: "0x4c5bC2044c44CcA67a5B6100496C4c570d532D4D".to_string(),
            tie_break: TieBreak::FirstMatch,
            no_winner_policy: NoWinnerPolicy::CarryOver,
        }
    }
}

impl GameConfig {
    pub fn rules(&self) -> RoundRules {
        RoundRules {
            price_per_token: Wei::from(self.price_per_token),
            min_guess: self.min_guess,
            max_guess: self.max_guess,
            owner: AccountId::new(self.owner.clone()),
            tie_break: self.tie_break,
            no_winner_policy: self.no_winner_policy,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
    Zstd,
}

/// Storage configuration with optimization settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    pub compression_type: CompressionType,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Rocksdb,
            data_directory: "./DB/lottery_data".to_string(),
            write_buffer_size_mb: 16,
            compression_type: CompressionType::Lz4,
            clear_on_start: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Monitoring and metrics configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub log_level: LogLevel,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    /// In-memory store, verbose logging
    pub fn development() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                clear_on_start: true,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_level: LogLevel::Debug,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Persistent RocksDB store
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Rocksdb,
                data_directory: "./DB/lottery_data".to_string(),
                write_buffer_size_mb: 64,
                compression_type: CompressionType::Lz4,
                clear_on_start: false,
            },
            ..Default::default()
        }
    }

    /// Load and validate a TOML configuration file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigValidationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigValidationError::LoadFailed(format!("{}: {}", path.display(), e))
        })?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|e| ConfigValidationError::LoadFailed(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.game.price_per_token == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "price_per_token must be > 0".to_string(),
            ));
        }

        if self.game.min_guess > self.game.max_guess {
            return Err(ConfigValidationError::LogicalInconsistency(format!(
                "min_guess {} is greater than max_guess {}",
                self.game.min_guess, self.game.max_guess
            )));
        }

        if self.game.owner.trim().is_empty() {
            return Err(ConfigValidationError::MissingRequired("game.owner".to_string()));
        }

        if self.storage.backend == StorageBackend::Rocksdb && self.storage.data_directory.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "storage.data_directory".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration logical inconsistency: {0}")]
    LogicalInconsistency(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}
