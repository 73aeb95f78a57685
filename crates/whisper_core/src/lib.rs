//! Dual-store whisper repository.
//! MongoDB holds the authoritative records; Neo4j holds a derived tag graph.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;

pub use config::{ConfigError, WhisperConfig};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::whisper::{NewWhisper, ValidationError, Whisper, WhisperId, WhisperPatch};
pub use repo::outbox_repo::{IndexJob, JobId, OutboxCounts, OutboxRepository, OutboxStatus};
pub use service::projection::ProjectionWorker;
pub use service::whisper_service::{
    open_outbox, DrainReport, IndexOutcome, WhisperError, WhisperService, WriteReport,
};
pub use store::{
    GraphIndex, InMemoryGraphIndex, InMemoryPrimaryStore, MongoPrimaryStore, Neo4jGraphIndex,
    PrimaryStore, StoreError,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
