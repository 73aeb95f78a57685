//! Whisper repository facade.
//!
//! # Responsibility
//! - Sequence every write as primary store first, graph projection second.
//! - Define partial success: a failed projection never undoes a primary write.
//! - Queue failed projections in the outbox and replay them on `drain`.
//!
//! # Invariants
//! - Primary store faults abort the operation and are returned to the caller.
//! - Graph faults during writes are reported in `WriteReport::index`, never as
//!   errors.
//! - Malformed ids behave exactly like unknown ids.
//! - A whisper with pending outbox jobs gets new projections queued behind
//!   them, never applied inline ahead of them.
//! - Reads never touch the graph index.

use crate::config::WhisperConfig;
use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::whisper::{
    now_epoch_ms, NewWhisper, ValidationError, Whisper, WhisperPatch,
};
use crate::repo::outbox_repo::{
    IndexJob, JobId, OutboxCounts, OutboxEntry, OutboxRepository, OutboxStatus,
    SqliteOutboxRepository,
};
use crate::store::{
    GraphIndex, MongoPrimaryStore, Neo4jGraphIndex, PrimaryStore, StoreError, WhisperNode,
};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;

/// Service error for whisper operations.
#[derive(Debug)]
pub enum WhisperError {
    /// Input rejected before any write.
    Validation(ValidationError),
    /// Primary store failure; the operation did not complete.
    Primary(StoreError),
    /// Graph index failure on a non-write path (connect, read-back).
    Index(StoreError),
    /// Local outbox failure.
    Outbox(DbError),
    /// `shutdown` already released the store handles.
    Closed,
}

impl WhisperError {
    /// Returns whether the failure is a connectivity fault on either store.
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            Self::Primary(err) | Self::Index(err) => err.is_unavailable(),
            _ => false,
        }
    }
}

impl Display for WhisperError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Primary(err) => write!(f, "primary store: {err}"),
            Self::Index(err) => write!(f, "graph index: {err}"),
            Self::Outbox(err) => write!(f, "index outbox: {err}"),
            Self::Closed => write!(f, "whisper service is shut down"),
        }
    }
}

impl Error for WhisperError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Primary(err) | Self::Index(err) => Some(err),
            Self::Outbox(err) => Some(err),
            Self::Closed => None,
        }
    }
}

impl From<ValidationError> for WhisperError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for WhisperError {
    fn from(value: DbError) -> Self {
        Self::Outbox(value)
    }
}

/// What happened to the graph projection of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Projection applied inline.
    Synced,
    /// No projection was needed.
    Untouched,
    /// Projection not applied yet; queued in the outbox for replay.
    Deferred { job_id: JobId, error: String },
    /// Projection failed and could not be queued either.
    Failed { error: String },
}

impl IndexOutcome {
    /// Returns whether the graph may lag the primary record.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Deferred { .. } | Self::Failed { .. })
    }
}

/// Successful write result plus the projection outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport<T> {
    pub value: T,
    pub index: IndexOutcome,
}

impl<T> WriteReport<T> {
    fn new(value: T, index: IndexOutcome) -> Self {
        Self { value, index }
    }

    /// Returns whether the primary write succeeded but the graph lags.
    pub fn is_partial(&self) -> bool {
        self.index.is_partial()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Result of one outbox replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs applied and removed from the outbox.
    pub applied: usize,
    /// Jobs that failed and stay pending.
    pub failed: usize,
    /// Jobs that failed for the last time and are now dead.
    pub dead: usize,
    /// Jobs not attempted because an earlier job for the same whisper failed.
    pub skipped: usize,
}

/// Facade over the primary store, the graph index and the outbox.
pub struct WhisperService<P: PrimaryStore, G: GraphIndex> {
    primary: P,
    index: G,
    outbox: SqliteOutboxRepository,
    embedding_dim: Option<usize>,
    max_attempts: u32,
    indexes_ready: OnceCell<()>,
    closed: AtomicBool,
}

impl WhisperService<MongoPrimaryStore, Neo4jGraphIndex> {
    /// Connects to MongoDB and Neo4j and opens the outbox named by `config`.
    pub async fn connect(config: &WhisperConfig) -> Result<Self, WhisperError> {
        let primary = MongoPrimaryStore::connect(&config.mongo_uri, &config.mongo_database)
            .await
            .map_err(WhisperError::Primary)?;
        let index = Neo4jGraphIndex::connect(
            &config.neo4j_uri,
            &config.neo4j_user,
            &config.neo4j_password,
        )
        .await
        .map_err(WhisperError::Index)?;
        let outbox = open_outbox(config)?;
        Ok(Self::new(primary, index, outbox, config))
    }
}

/// Opens the outbox file named by `config`, or an in-memory one when unset.
pub fn open_outbox(config: &WhisperConfig) -> Result<SqliteOutboxRepository, WhisperError> {
    let conn = match config.outbox_path.as_ref() {
        Some(path) => open_db(path)?,
        None => open_db_in_memory()?,
    };
    Ok(SqliteOutboxRepository::new(conn))
}

impl<P: PrimaryStore, G: GraphIndex> WhisperService<P, G> {
    /// Creates a service from already-connected stores.
    pub fn new(primary: P, index: G, outbox: SqliteOutboxRepository, config: &WhisperConfig) -> Self {
        Self {
            primary,
            index,
            outbox,
            embedding_dim: config.embedding_dim,
            max_attempts: config.outbox_max_attempts,
            indexes_ready: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn index(&self) -> &G {
        &self.index
    }

    pub fn outbox(&self) -> &SqliteOutboxRepository {
        &self.outbox
    }

    /// Creates one whisper and projects it into the graph.
    ///
    /// # Contract
    /// - Primary insert failure: error, nothing written anywhere.
    /// - Projection failure: success with `IndexOutcome::Deferred`.
    /// - The returned record carries the generated id and `created_at`.
    pub async fn create(&self, input: NewWhisper) -> Result<WriteReport<Whisper>, WhisperError> {
        self.ensure_open()?;
        let input = input.validated(self.embedding_dim)?;
        self.ensure_indexes().await?;

        let created_at = now_epoch_ms();
        let id = self
            .primary
            .insert_one(&input, created_at)
            .await
            .map_err(|err| primary_failure("create", err))?;
        let whisper = Whisper::from_new(id, input, created_at);
        info!(
            "event=whisper_create module=service status=ok whisper_id={} tag_count={}",
            whisper.id,
            whisper.tags.len()
        );

        let job = IndexJob::Upsert {
            node: WhisperNode::from(&whisper),
            tags: whisper.tags.clone(),
        };
        let index = self.project(job).await;
        Ok(WriteReport::new(whisper, index))
    }

    /// Gets one whisper from the primary store.
    ///
    /// Malformed ids return `Ok(None)`.
    pub async fn get(&self, id: &str) -> Result<Option<Whisper>, WhisperError> {
        self.ensure_open()?;
        let Some(id) = self.canonical_id(id) else {
            return Ok(None);
        };
        self.ensure_indexes().await?;
        self.find(&id).await
    }

    /// Overwrites the fields named by `patch`.
    ///
    /// # Contract
    /// - Empty patch: same as `get`, no writes, `IndexOutcome::Untouched`.
    /// - Unknown or malformed id: `Ok(None)`, graph untouched.
    /// - Tags named: the whisper node is upserted from the updated record and
    ///   its edge set replaced by the new set.
    /// - Tags not named: the graph is untouched even if scalar fields changed.
    /// - Read-back failure after a committed tag change: the edge replacement
    ///   is still projected (or queued), then the error is returned.
    pub async fn update(
        &self,
        id: &str,
        patch: WhisperPatch,
    ) -> Result<Option<WriteReport<Whisper>>, WhisperError> {
        self.ensure_open()?;
        if patch.is_empty() {
            let found = self.get(id).await?;
            return Ok(found.map(|whisper| WriteReport::new(whisper, IndexOutcome::Untouched)));
        }

        let patch = patch.validated(self.embedding_dim)?;
        let Some(id) = self.canonical_id(id) else {
            return Ok(None);
        };
        self.ensure_indexes().await?;

        let matched = self
            .primary
            .update_one(&id, &patch)
            .await
            .map_err(|err| primary_failure("update", err))?;
        if matched == 0 {
            debug!("event=whisper_update module=service status=not_found whisper_id={id}");
            return Ok(None);
        }

        let updated = match self.find(&id).await {
            Ok(found) => found,
            Err(err) => {
                // The tag change is already committed; queue its projection
                // before surfacing the read failure.
                if let Some(tags) = patch.tags {
                    self.project(IndexJob::ReplaceTags { id, tags }).await;
                }
                return Err(err);
            }
        };
        // Deleted between the write and the read-back: report as not found.
        let Some(updated) = updated else {
            return Ok(None);
        };
        info!(
            "event=whisper_update module=service status=ok whisper_id={} tags_changed={}",
            id,
            patch.touches_tags()
        );

        // Upsert rather than edge replacement so a node lost to a dead
        // projection is recreated from the current record.
        let index = if patch.touches_tags() {
            let job = IndexJob::Upsert {
                node: WhisperNode::from(&updated),
                tags: updated.tags.clone(),
            };
            self.project(job).await
        } else {
            IndexOutcome::Untouched
        };
        Ok(Some(WriteReport::new(updated, index)))
    }

    /// Deletes one whisper and removes its graph node.
    ///
    /// Returns `false` for unknown or malformed ids. A failed graph removal is
    /// deferred and never changes the returned value.
    pub async fn delete(&self, id: &str) -> Result<WriteReport<bool>, WhisperError> {
        self.ensure_open()?;
        let Some(id) = self.canonical_id(id) else {
            return Ok(WriteReport::new(false, IndexOutcome::Untouched));
        };
        self.ensure_indexes().await?;

        let deleted = self
            .primary
            .delete_one(&id)
            .await
            .map_err(|err| primary_failure("delete", err))?
            > 0;
        info!("event=whisper_delete module=service status=ok whisper_id={id} existed={deleted}");

        let index = self.project(IndexJob::Remove { id }).await;
        Ok(WriteReport::new(deleted, index))
    }

    /// Returns the tag values linked to the whisper in the graph index.
    pub async fn index_tags(&self, id: &str) -> Result<Vec<String>, WhisperError> {
        self.ensure_open()?;
        let Some(id) = self.canonical_id(id) else {
            return Ok(Vec::new());
        };
        self.index.tags_of(&id).await.map_err(WhisperError::Index)
    }

    /// Replays up to `limit` pending outbox jobs in enqueue order.
    ///
    /// After a failure, later jobs for the same whisper are skipped until the
    /// next pass so projections are never applied out of order.
    pub async fn drain(&self, limit: u32) -> Result<DrainReport, WhisperError> {
        self.ensure_open()?;
        let entries = self.outbox.pending(limit)?;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            if blocked.contains(&entry.whisper_id) {
                report.skipped += 1;
                continue;
            }

            match apply_job(&self.index, &entry.job).await {
                Ok(()) => {
                    self.outbox.complete(entry.job_id)?;
                    report.applied += 1;
                }
                Err(err) => {
                    blocked.insert(entry.whisper_id.clone());
                    let status =
                        self.outbox
                            .record_failure(entry.job_id, &err.to_string(), self.max_attempts)?;
                    log_replay_failure(&entry, status, &err);
                    match status {
                        OutboxStatus::Pending => report.failed += 1,
                        OutboxStatus::Dead => report.dead += 1,
                    }
                }
            }
        }

        if report != DrainReport::default() {
            info!(
                "event=outbox_drain module=service status=ok applied={} failed={} dead={} skipped={}",
                report.applied, report.failed, report.dead, report.skipped
            );
        }
        Ok(report)
    }

    /// Returns outbox row counts by status.
    pub fn outbox_counts(&self) -> Result<OutboxCounts, WhisperError> {
        Ok(self.outbox.counts()?)
    }

    /// Returns jobs that exhausted their attempts.
    pub fn dead_letters(&self) -> Result<Vec<OutboxEntry>, WhisperError> {
        Ok(self.outbox.dead_letters()?)
    }

    /// Returns whether `shutdown` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases both store handles.
    ///
    /// Idempotent: calls after the first are no-ops. A graph close failure is
    /// logged; a primary close failure is returned.
    pub async fn shutdown(&self) -> Result<(), WhisperError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("event=service_shutdown module=service status=skipped");
            return Ok(());
        }

        let primary = self.primary.close().await;
        if let Err(err) = self.index.close().await {
            warn!("event=service_shutdown module=service status=warn store=index error={err}");
        }
        match primary {
            Ok(()) => {
                info!("event=service_shutdown module=service status=ok");
                Ok(())
            }
            Err(err) => {
                error!("event=service_shutdown module=service status=error store=primary error={err}");
                Err(WhisperError::Primary(err))
            }
        }
    }

    fn ensure_open(&self) -> Result<(), WhisperError> {
        if self.is_closed() {
            return Err(WhisperError::Closed);
        }
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<(), WhisperError> {
        self.indexes_ready
            .get_or_try_init(|| async {
                self.primary
                    .ensure_indexes()
                    .await
                    .map_err(|err| primary_failure("ensure_indexes", err))
            })
            .await?;
        Ok(())
    }

    fn canonical_id(&self, id: &str) -> Option<String> {
        match self.primary.canonical_id(id) {
            Ok(id) => Some(id),
            Err(err) => {
                debug!("event=whisper_lookup module=service status=not_found reason=invalid_id error={err}");
                None
            }
        }
    }

    async fn find(&self, id: &str) -> Result<Option<Whisper>, WhisperError> {
        match self.primary.find_one(id).await {
            Ok(found) => Ok(found),
            Err(StoreError::InvalidId(_)) => Ok(None),
            Err(err) => Err(primary_failure("get", err)),
        }
    }

    /// Applies `job` inline, or queues it when it cannot go first.
    async fn project(&self, job: IndexJob) -> IndexOutcome {
        let queued_behind = match self.outbox.has_pending_for(job.whisper_id()) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(
                    "event=index_project module=service status=warn op={} whisper_id={} error_code=outbox_read_failed error={}",
                    job.op(),
                    job.whisper_id(),
                    err
                );
                false
            }
        };

        let error = if queued_behind {
            "queued behind pending projections".to_string()
        } else {
            match apply_job(&self.index, &job).await {
                Ok(()) => return IndexOutcome::Synced,
                Err(err) => err.to_string(),
            }
        };

        match self.outbox.enqueue(&job) {
            Ok(job_id) => {
                warn!(
                    "event=index_project module=service status=deferred op={} whisper_id={} job_id={} error={}",
                    job.op(),
                    job.whisper_id(),
                    job_id,
                    error
                );
                IndexOutcome::Deferred { job_id, error }
            }
            Err(outbox_err) => {
                error!(
                    "event=index_project module=service status=error op={} whisper_id={} error_code=outbox_write_failed error={} outbox_error={}",
                    job.op(),
                    job.whisper_id(),
                    error,
                    outbox_err
                );
                IndexOutcome::Failed {
                    error: format!("{error}; not queued: {outbox_err}"),
                }
            }
        }
    }
}

async fn apply_job<G: GraphIndex>(index: &G, job: &IndexJob) -> Result<(), StoreError> {
    match job {
        IndexJob::Upsert { node, tags } => index.upsert_whisper(node, tags).await,
        IndexJob::ReplaceTags { id, tags } => index.replace_tags(id, tags).await,
        IndexJob::Remove { id } => index.remove_whisper(id).await,
    }
}

fn primary_failure(op: &'static str, err: StoreError) -> WhisperError {
    error!("event=whisper_{op} module=service status=error store=primary error={err}");
    WhisperError::Primary(err)
}

fn log_replay_failure(entry: &OutboxEntry, status: OutboxStatus, err: &StoreError) {
    match status {
        OutboxStatus::Pending => warn!(
            "event=outbox_replay module=service status=retry op={} whisper_id={} job_id={} attempts={} error={}",
            entry.job.op(),
            entry.whisper_id,
            entry.job_id,
            entry.attempts + 1,
            err
        ),
        OutboxStatus::Dead => error!(
            "event=outbox_replay module=service status=dead op={} whisper_id={} job_id={} attempts={} error={}",
            entry.job.op(),
            entry.whisper_id,
            entry.job_id,
            entry.attempts + 1,
            err
        ),
    }
}
