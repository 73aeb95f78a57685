//! Repository use-case services.
//!
//! # Responsibility
//! - Orchestrate primary store, graph index and outbox calls into the
//!   whisper repository API.
//! - Keep CLI and callers decoupled from driver details.

pub mod projection;
pub mod whisper_service;
