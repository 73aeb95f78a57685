//! Whisper domain model.
//!
//! # Responsibility
//! - Define the canonical record stored in the primary store.
//! - Define write inputs (`NewWhisper`, `WhisperPatch`) and their validation.
//!
//! # Invariants
//! - A `Whisper` always carries a store-assigned id; inputs never do.
//! - Tags are trimmed, deduplicated and sorted before any write.

pub mod whisper;
