//! In-process implementations of both store contracts.
//!
//! Used by tests and by dry-run ingestion. Both stores can be switched
//! unavailable to exercise partial-failure paths.

use super::{GraphIndex, PrimaryStore, StoreError, StoreResult, WhisperNode};
use crate::model::whisper::{NewWhisper, Whisper, WhisperId, WhisperPatch};
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

const PRIMARY: &str = "memory-primary";
const GRAPH: &str = "memory-graph";

/// Availability switch and close flag shared by both in-memory stores.
#[derive(Debug)]
struct Gate {
    store: &'static str,
    available: AtomicBool,
    closed: AtomicBool,
}

impl Gate {
    fn new(store: &'static str) -> Self {
        Self {
            store,
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed(self.store));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                store: self.store,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Primary store holding whispers in a map keyed by ObjectId hex.
///
/// Ids use the same format as MongoDB so malformed-id handling matches.
#[derive(Debug)]
pub struct InMemoryPrimaryStore {
    records: RwLock<HashMap<WhisperId, Whisper>>,
    gate: Gate,
    reads_available: AtomicBool,
    index_bootstraps: AtomicU64,
}

impl InMemoryPrimaryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            gate: Gate::new(PRIMARY),
            reads_available: AtomicBool::new(true),
            index_bootstraps: AtomicU64::new(0),
        }
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.gate.available.store(available, Ordering::SeqCst);
    }

    /// Fails `find_one` only, leaving writes reachable.
    pub fn set_reads_available(&self, available: bool) {
        self.reads_available.store(available, Ordering::SeqCst);
    }

    /// Returns a stored record without going through the gate.
    pub async fn record(&self, id: &str) -> Option<Whisper> {
        self.records.read().await.get(id).cloned()
    }

    /// Number of records currently stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of times `ensure_indexes` ran.
    pub fn index_bootstraps(&self) -> u64 {
        self.index_bootstraps.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryPrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_id(id: &str) -> StoreResult<String> {
    ObjectId::parse_str(id.trim())
        .map(|oid| oid.to_hex())
        .map_err(|_| StoreError::InvalidId(id.to_string()))
}

#[async_trait]
impl PrimaryStore for InMemoryPrimaryStore {
    fn canonical_id(&self, id: &str) -> StoreResult<WhisperId> {
        parse_id(id)
    }

    async fn ensure_indexes(&self) -> StoreResult<()> {
        self.gate.check()?;
        self.index_bootstraps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_one(&self, input: &NewWhisper, created_at: i64) -> StoreResult<WhisperId> {
        self.gate.check()?;
        let id = ObjectId::new().to_hex();
        let whisper = Whisper::from_new(id.clone(), input.clone(), created_at);
        self.records.write().await.insert(id.clone(), whisper);
        Ok(id)
    }

    async fn find_one(&self, id: &str) -> StoreResult<Option<Whisper>> {
        let key = parse_id(id)?;
        self.gate.check()?;
        if !self.reads_available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                store: PRIMARY,
                message: "read timed out".to_string(),
            });
        }
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn update_one(&self, id: &str, patch: &WhisperPatch) -> StoreResult<u64> {
        let key = parse_id(id)?;
        self.gate.check()?;
        let mut records = self.records.write().await;
        match records.get_mut(&key) {
            Some(whisper) => {
                patch.apply_to(whisper);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_one(&self, id: &str) -> StoreResult<u64> {
        let key = parse_id(id)?;
        self.gate.check()?;
        Ok(u64::from(self.records.write().await.remove(&key).is_some()))
    }

    async fn close(&self) -> StoreResult<()> {
        self.gate.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GraphState {
    whispers: HashMap<WhisperId, WhisperNode>,
    tags: BTreeSet<String>,
    edges: HashMap<WhisperId, BTreeSet<String>>,
}

impl GraphState {
    fn link_exactly(&mut self, id: &str, tags: &[String]) {
        let linked = self.edges.entry(id.to_string()).or_default();
        linked.clear();
        for tag in tags {
            self.tags.insert(tag.clone());
            linked.insert(tag.clone());
        }
    }
}

/// Graph index holding nodes and `TAGGED` edges in memory.
#[derive(Debug)]
pub struct InMemoryGraphIndex {
    state: RwLock<GraphState>,
    gate: Gate,
    writes: AtomicU64,
}

impl InMemoryGraphIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            gate: Gate::new(GRAPH),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulates losing (or regaining) the connection to the graph.
    pub fn set_available(&self, available: bool) {
        self.gate.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful write calls since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns the whisper node, if projected.
    pub async fn node(&self, id: &str) -> Option<WhisperNode> {
        self.state.read().await.whispers.get(id).cloned()
    }

    /// Returns every tag node, including ones no longer referenced.
    pub async fn tag_nodes(&self) -> Vec<String> {
        self.state.read().await.tags.iter().cloned().collect()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryGraphIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphIndex for InMemoryGraphIndex {
    async fn upsert_whisper(&self, node: &WhisperNode, tags: &[String]) -> StoreResult<()> {
        self.gate.check()?;
        let mut state = self.state.write().await;
        state.whispers.insert(node.id.clone(), node.clone());
        state.link_exactly(&node.id, tags);
        self.record_write();
        Ok(())
    }

    async fn replace_tags(&self, id: &str, tags: &[String]) -> StoreResult<()> {
        self.gate.check()?;
        let mut state = self.state.write().await;
        if state.whispers.contains_key(id) {
            state.link_exactly(id, tags);
        }
        self.record_write();
        Ok(())
    }

    async fn remove_whisper(&self, id: &str) -> StoreResult<()> {
        self.gate.check()?;
        let mut state = self.state.write().await;
        state.whispers.remove(id);
        state.edges.remove(id);
        self.record_write();
        Ok(())
    }

    async fn tags_of(&self, id: &str) -> StoreResult<Vec<String>> {
        self.gate.check()?;
        let state = self.state.read().await;
        Ok(state
            .edges
            .get(id)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> StoreResult<()> {
        self.gate.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
