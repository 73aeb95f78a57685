//! Store adapter contracts for the primary store and the graph index.
//!
//! # Responsibility
//! - Define entity-level contracts the service layer talks to.
//! - Translate native driver errors into one `StoreError` vocabulary.
//!
//! # Invariants
//! - Adapters never retry, cache, or enforce business rules.
//! - Identifier format is checked before dispatch and reported as
//!   `StoreError::InvalidId`, never as a transport fault.
//! - `close` is idempotent; calls after `close` fail with `StoreError::Closed`.

use crate::model::whisper::{NewWhisper, Whisper, WhisperId, WhisperPatch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod memory;
pub mod mongo;
pub mod neo4j;

pub use memory::{InMemoryGraphIndex, InMemoryPrimaryStore};
pub use mongo::MongoPrimaryStore;
pub use neo4j::Neo4jGraphIndex;

pub type StoreResult<T> = Result<T, StoreError>;

/// Adapter-level failure, independent of the backing driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Identifier rejected by the store's id format.
    InvalidId(String),
    /// Network/connection failure reaching the store.
    Unavailable {
        store: &'static str,
        message: String,
    },
    /// Store reachable but refused the operation.
    Rejected {
        store: &'static str,
        message: String,
    },
    /// Persisted record could not be mapped back to the domain model.
    InvalidData(String),
    /// Handle already released by `close`.
    Closed(&'static str),
}

impl StoreError {
    /// Returns whether the failure is a connectivity fault.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId(id) => write!(f, "malformed identifier: `{id}`"),
            Self::Unavailable { store, message } => write!(f, "{store} unavailable: {message}"),
            Self::Rejected { store, message } => {
                write!(f, "{store} rejected operation: {message}")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted whisper data: {message}"),
            Self::Closed(store) => write!(f, "{store} handle already closed"),
        }
    }
}

impl Error for StoreError {}

/// Denormalized scalar copy of a whisper held on its graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhisperNode {
    pub id: WhisperId,
    pub raw_text: String,
    pub source_url: Option<String>,
    pub created_at: i64,
}

impl From<&Whisper> for WhisperNode {
    fn from(whisper: &Whisper) -> Self {
        Self {
            id: whisper.id.clone(),
            raw_text: whisper.raw_text.clone(),
            source_url: whisper.source_url.clone(),
            created_at: whisper.created_at,
        }
    }
}

/// Authoritative record store for whispers.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Validates `id` against the store's identifier format and returns its
    /// canonical spelling. Performs no I/O.
    fn canonical_id(&self, id: &str) -> StoreResult<WhisperId>;
    /// Creates secondary indexes on `created_at` and `tags`.
    async fn ensure_indexes(&self) -> StoreResult<()>;
    /// Inserts a validated whisper and returns the generated id.
    async fn insert_one(&self, input: &NewWhisper, created_at: i64) -> StoreResult<WhisperId>;
    /// Loads one whisper by id.
    async fn find_one(&self, id: &str) -> StoreResult<Option<Whisper>>;
    /// Overwrites the fields named by `patch`; returns the matched count.
    async fn update_one(&self, id: &str, patch: &WhisperPatch) -> StoreResult<u64>;
    /// Deletes one whisper; returns the deleted count.
    async fn delete_one(&self, id: &str) -> StoreResult<u64>;
    /// Releases the connection handle.
    async fn close(&self) -> StoreResult<()>;
}

/// Derived tag graph: `(:Whisper)-[:TAGGED]->(:Tag)`.
#[async_trait]
pub trait GraphIndex: Send + Sync {
    /// Upserts the whisper node and makes its edge set exactly `tags`.
    async fn upsert_whisper(&self, node: &WhisperNode, tags: &[String]) -> StoreResult<()>;
    /// Replaces the edge set of an existing whisper node; no-op when absent.
    async fn replace_tags(&self, id: &str, tags: &[String]) -> StoreResult<()>;
    /// Removes the whisper node and all its edges; tag nodes are kept.
    async fn remove_whisper(&self, id: &str) -> StoreResult<()>;
    /// Returns the sorted tag values linked to the whisper node.
    async fn tags_of(&self, id: &str) -> StoreResult<Vec<String>>;
    /// Releases the session handle.
    async fn close(&self) -> StoreResult<()>;
}
