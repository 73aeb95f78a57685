//! Repository configuration value object.
//!
//! # Responsibility
//! - Resolve store addresses, credentials and outbox tuning from key/value
//!   sources once at process start.
//!
//! # Invariants
//! - Components receive a `WhisperConfig`; they never read the environment.
//! - Every key is optional and falls back to a documented default.
//! - The graph password never appears in `Debug` output.

use crate::logging::normalize_level;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const MONGO_URI_KEY: &str = "MONGO_URI";
pub const MONGO_DBNAME_KEY: &str = "MONGO_DBNAME";
pub const NEO4J_URI_KEY: &str = "NEO4J_URI";
pub const NEO4J_USER_KEY: &str = "NEO4J_USER";
pub const NEO4J_PASS_KEY: &str = "NEO4J_PASS";
pub const OUTBOX_PATH_KEY: &str = "WHISPER_OUTBOX_PATH";
pub const EMBEDDING_DIM_KEY: &str = "WHISPER_EMBEDDING_DIM";
pub const MAX_ATTEMPTS_KEY: &str = "WHISPER_OUTBOX_MAX_ATTEMPTS";
pub const DRAIN_INTERVAL_KEY: &str = "WHISPER_DRAIN_INTERVAL_SECS";
pub const DRAIN_BATCH_KEY: &str = "WHISPER_DRAIN_BATCH";
pub const LOG_LEVEL_KEY: &str = "WHISPER_LOG_LEVEL";

const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017";
const DEFAULT_MONGO_DBNAME: &str = "aeon";
const DEFAULT_NEO4J_URI: &str = "bolt://localhost:7687";
const DEFAULT_NEO4J_USER: &str = "neo4j";
const DEFAULT_NEO4J_PASS: &str = "password";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 30;
const DEFAULT_DRAIN_BATCH: u32 = 100;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidNumber { key: &'static str, value: String },
    MustBePositive { key: &'static str },
    InvalidLogLevel(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNumber { key, value } => {
                write!(f, "{key} must be a non-negative integer, got `{value}`")
            }
            Self::MustBePositive { key } => write!(f, "{key} must be greater than zero"),
            Self::InvalidLogLevel(message) => write!(f, "{message}"),
        }
    }
}

impl Error for ConfigError {}

/// Explicit configuration for one `WhisperService` instance.
#[derive(Clone, PartialEq, Eq)]
pub struct WhisperConfig {
    pub mongo_uri: String,
    pub mongo_database: String,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    /// `None` keeps the outbox in memory.
    pub outbox_path: Option<PathBuf>,
    /// Declared embedding length; `None` disables the length check.
    pub embedding_dim: Option<usize>,
    pub outbox_max_attempts: u32,
    pub drain_interval: Duration,
    pub drain_batch_size: u32,
    pub log_level: Option<&'static str>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            mongo_uri: DEFAULT_MONGO_URI.to_string(),
            mongo_database: DEFAULT_MONGO_DBNAME.to_string(),
            neo4j_uri: DEFAULT_NEO4J_URI.to_string(),
            neo4j_user: DEFAULT_NEO4J_USER.to_string(),
            neo4j_password: DEFAULT_NEO4J_PASS.to_string(),
            outbox_path: None,
            embedding_dim: None,
            outbox_max_attempts: DEFAULT_MAX_ATTEMPTS,
            drain_interval: Duration::from_secs(DEFAULT_DRAIN_INTERVAL_SECS),
            drain_batch_size: DEFAULT_DRAIN_BATCH,
            log_level: None,
        }
    }
}

impl Debug for WhisperConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperConfig")
            .field("mongo_uri", &self.mongo_uri)
            .field("mongo_database", &self.mongo_database)
            .field("neo4j_uri", &self.neo4j_uri)
            .field("neo4j_user", &self.neo4j_user)
            .field("neo4j_password", &"<redacted>")
            .field("outbox_path", &self.outbox_path)
            .field("embedding_dim", &self.embedding_dim)
            .field("outbox_max_attempts", &self.outbox_max_attempts)
            .field("drain_interval", &self.drain_interval)
            .field("drain_batch_size", &self.drain_batch_size)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl WhisperConfig {
    /// Reads configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration from any key/value source.
    ///
    /// Blank values are treated as unset.
    ///
    /// # Errors
    /// - `InvalidNumber` when a numeric key does not parse.
    /// - `MustBePositive` when attempts, batch size or interval is zero.
    /// - `InvalidLogLevel` when the log level is unsupported.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let outbox_max_attempts = positive(
            MAX_ATTEMPTS_KEY,
            parse_number(MAX_ATTEMPTS_KEY, get(MAX_ATTEMPTS_KEY))?
                .unwrap_or(defaults.outbox_max_attempts),
        )?;
        let drain_batch_size = positive(
            DRAIN_BATCH_KEY,
            parse_number(DRAIN_BATCH_KEY, get(DRAIN_BATCH_KEY))?
                .unwrap_or(defaults.drain_batch_size),
        )?;
        let drain_interval_secs = positive(
            DRAIN_INTERVAL_KEY,
            parse_number(DRAIN_INTERVAL_KEY, get(DRAIN_INTERVAL_KEY))?
                .unwrap_or(DEFAULT_DRAIN_INTERVAL_SECS),
        )?;
        let log_level = get(LOG_LEVEL_KEY)
            .map(|value| normalize_level(&value).map_err(ConfigError::InvalidLogLevel))
            .transpose()?;

        Ok(Self {
            mongo_uri: get(MONGO_URI_KEY).unwrap_or(defaults.mongo_uri),
            mongo_database: get(MONGO_DBNAME_KEY).unwrap_or(defaults.mongo_database),
            neo4j_uri: get(NEO4J_URI_KEY).unwrap_or(defaults.neo4j_uri),
            neo4j_user: get(NEO4J_USER_KEY).unwrap_or(defaults.neo4j_user),
            neo4j_password: get(NEO4J_PASS_KEY).unwrap_or(defaults.neo4j_password),
            outbox_path: get(OUTBOX_PATH_KEY).map(PathBuf::from),
            embedding_dim: parse_number(EMBEDDING_DIM_KEY, get(EMBEDDING_DIM_KEY))?,
            outbox_max_attempts,
            drain_interval: Duration::from_secs(drain_interval_secs),
            drain_batch_size,
            log_level,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { key, value: raw })
        })
        .transpose()
}

fn positive<T: Default + PartialEq>(key: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::MustBePositive { key });
    }
    Ok(value)
}
