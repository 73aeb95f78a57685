//! Whisper entity, write inputs and input validation.
//!
//! # Responsibility
//! - Define the canonical `Whisper` record returned to callers.
//! - Define create (`NewWhisper`) and partial-update (`WhisperPatch`) inputs.
//! - Normalize tags and validate required fields before any store write.
//!
//! # Invariants
//! - `id` and `created_at` are assigned once at creation and never change.
//! - `raw_text` is never blank.
//! - `tags` is a sorted set: trimmed, inner whitespace collapsed, deduplicated.
//! - When an embedding dimension is declared, every stored vector matches it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Opaque identifier assigned by the primary store.
///
/// Kept as a type alias: the format is owned by the store, not by core.
pub type WhisperId = String;

/// Canonical whisper record as held by the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Whisper {
    /// Store-assigned id.
    pub id: WhisperId,
    /// Captured text content.
    pub raw_text: String,
    /// Free-form provenance reference (file path, URL, ...).
    pub source_url: Option<String>,
    /// Producer-supplied embedding vector.
    pub embeddings: Option<Vec<f32>>,
    /// Sorted distinct tag values.
    pub tags: Vec<String>,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
}

impl Whisper {
    /// Builds the stored record from validated input and store-assigned fields.
    pub fn from_new(id: WhisperId, input: NewWhisper, created_at: i64) -> Self {
        Self {
            id,
            raw_text: input.raw_text,
            source_url: input.source_url,
            embeddings: input.embeddings,
            tags: input.tags,
            created_at,
        }
    }
}

/// Create input: a whisper that has no id yet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewWhisper {
    pub raw_text: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub embeddings: Option<Vec<f32>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewWhisper {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            ..Self::default()
        }
    }

    pub fn with_source_url(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = Some(source_url.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_embeddings(mut self, embeddings: Vec<f32>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    /// Validates required fields and returns the normalized input.
    ///
    /// # Errors
    /// - `BlankText` when `raw_text` is empty after trimming.
    /// - `BlankTag` when any tag is empty after trimming.
    /// - `EmbeddingDimension` when `embedding_dim` is declared and differs.
    pub fn validated(self, embedding_dim: Option<usize>) -> Result<Self, ValidationError> {
        validate_text(&self.raw_text)?;
        if let Some(vector) = self.embeddings.as_ref() {
            validate_embeddings(vector, embedding_dim)?;
        }
        let tags = normalize_tags(&self.tags)?;
        Ok(Self { tags, ..self })
    }
}

/// Sparse field overwrite for `update`.
///
/// `None` on any field means "leave untouched". For nullable fields,
/// `Some(None)` clears the stored value. A serialized `tags: null` is read
/// as absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WhisperPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(
        default,
        deserialize_with = "explicit_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_url: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "explicit_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub embeddings: Option<Option<Vec<f32>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl WhisperPatch {
    pub fn raw_text(mut self, raw_text: impl Into<String>) -> Self {
        self.raw_text = Some(raw_text.into());
        self
    }

    pub fn source_url(mut self, source_url: Option<String>) -> Self {
        self.source_url = Some(source_url);
        self
    }

    pub fn embeddings(mut self, embeddings: Option<Vec<f32>>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Returns whether no field is named by this patch.
    pub fn is_empty(&self) -> bool {
        self.raw_text.is_none()
            && self.source_url.is_none()
            && self.embeddings.is_none()
            && self.tags.is_none()
    }

    /// Returns whether this patch changes the tag set.
    pub fn touches_tags(&self) -> bool {
        self.tags.is_some()
    }

    /// Validates named fields and returns the normalized patch.
    ///
    /// # Errors
    /// Same rules as [`NewWhisper::validated`], applied to named fields only.
    pub fn validated(self, embedding_dim: Option<usize>) -> Result<Self, ValidationError> {
        if let Some(text) = self.raw_text.as_deref() {
            validate_text(text)?;
        }
        if let Some(Some(vector)) = self.embeddings.as_ref() {
            validate_embeddings(vector, embedding_dim)?;
        }
        let tags = match self.tags {
            Some(tags) => Some(normalize_tags(&tags)?),
            None => None,
        };
        Ok(Self { tags, ..self })
    }

    /// Applies this patch onto an in-memory record.
    pub fn apply_to(&self, whisper: &mut Whisper) {
        if let Some(text) = self.raw_text.as_ref() {
            whisper.raw_text = text.clone();
        }
        if let Some(source_url) = self.source_url.as_ref() {
            whisper.source_url = source_url.clone();
        }
        if let Some(embeddings) = self.embeddings.as_ref() {
            whisper.embeddings = embeddings.clone();
        }
        if let Some(tags) = self.tags.as_ref() {
            whisper.tags = tags.clone();
        }
    }
}

/// Input rejected before reaching any store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    BlankText,
    BlankTag(String),
    EmbeddingDimension { expected: usize, actual: usize },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankText => write!(f, "raw_text must not be blank"),
            Self::BlankTag(value) => write!(f, "invalid tag: `{value}`"),
            Self::EmbeddingDimension { expected, actual } => write!(
                f,
                "embedding dimension mismatch: expected {expected}, got {actual}"
            ),
        }
    }
}

impl Error for ValidationError {}

/// Normalizes one tag value: trims and collapses inner whitespace.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let collapsed = WHITESPACE_RE.replace_all(tag.trim(), " ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.into_owned())
    }
}

/// Normalizes, deduplicates and sorts tag values.
///
/// # Errors
/// Returns `BlankTag` for the first value that is empty after trimming.
pub fn normalize_tags(tags: &[String]) -> Result<Vec<String>, ValidationError> {
    let mut unique = BTreeSet::new();
    for tag in tags {
        let value = normalize_tag(tag).ok_or_else(|| ValidationError::BlankTag(tag.clone()))?;
        unique.insert(value);
    }
    Ok(unique.into_iter().collect())
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn validate_text(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::BlankText);
    }
    Ok(())
}

fn validate_embeddings(vector: &[f32], embedding_dim: Option<usize>) -> Result<(), ValidationError> {
    match embedding_dim {
        Some(expected) if vector.len() != expected => Err(ValidationError::EmbeddingDimension {
            expected,
            actual: vector.len(),
        }),
        _ => Ok(()),
    }
}

// Distinguishes `"field": null` (Some(None)) from a missing field (None).
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
