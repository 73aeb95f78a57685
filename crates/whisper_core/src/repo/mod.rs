//! Local persistence for projections awaiting the graph index.
//!
//! # Responsibility
//! - Define the outbox contract used by the service and projection worker.
//! - Keep SQLite details behind that contract.
//!
//! # Invariants
//! - Repository APIs never touch either remote store.

pub mod outbox_repo;
