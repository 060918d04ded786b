//! The Store's error taxonomy.
//!
//! Errors are values, not exceptions: every public operation returns a
//! `Result<T>` and callers inspect [`StoreError::kind`] to decide what to
//! do. Only [`ErrorKind::VersionMismatch`] and [`ErrorKind::Transient`]
//! are retried internally; every other kind surfaces to the caller with
//! its original context preserved.

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The coarse classification used by the retry loop and by callers that
/// want to branch on failure type without matching the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No document matches the given id or filter.
    NotFound,
    /// Insert conflicted with an existing primary key.
    AlreadyExists,
    /// The CAS predicate did not match; the writer should retry from a
    /// fresh read. The Store retries this internally up to `maxRetries`.
    VersionMismatch,
    /// Retries, or the retry time budget, were exhausted.
    ConcurrencyExhausted,
    /// A configuration or schema pre-condition was not met (e.g. the
    /// configured version field is absent or not integer-typed).
    ValidationError,
    /// An internal cache fault. Never surfaced to callers directly; the
    /// Store always falls through to the DB and records this in stats.
    CacheError,
    /// Classified as transient by the DB collaborator; retried
    /// internally like `VersionMismatch`.
    Transient,
    /// Any other backend error. Surfaced verbatim.
    Fatal,
    /// The caller's cancellation handle fired before the operation
    /// reached a consistent stopping point.
    Cancelled,
    /// A change stream's resume token is older than the backend's
    /// history window. The watch router treats this as a trigger to
    /// broadcast a `Resync` to every subscriber rather than as a fatal
    /// error (spec §4.5).
    ResumePointInvalid,
}

/// The Store's error type.
///
/// `StoreError::Other` wraps all `Fatal`-classified failures bubbled up
/// from the database collaborator; its `source` is preserved so callers
/// retain root-cause context.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("no document matches id `{id}`")]
    NotFound { id: String },

    #[error("a document with id `{id}` already exists")]
    AlreadyExists { id: String },

    #[error("version mismatch on `{id}`: expected {expected}, found {found:?}")]
    VersionMismatch {
        id: String,
        expected: i64,
        found: Option<i64>,
    },

    #[error("update on `{id}` exhausted its retry budget after {attempts} attempt(s) in {elapsed_ms}ms")]
    ConcurrencyExhausted {
        id: String,
        attempts: u32,
        elapsed_ms: u64,
    },

    #[error("configuration invalid: {0}")]
    ValidationError(String),

    #[error("version field `{field}` missing or not integer-typed on this document type")]
    VersionFieldMissing { field: String },

    #[error("cache operation failed: {0}")]
    CacheError(String),

    #[error("transient backend error: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("backend error: {0}")]
    Fatal(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("the caller's mutate closure rejected the update: {0}")]
    MutateRejected(Box<dyn std::error::Error + Send + Sync>),

    #[error("change stream resume token is beyond the backend's history window")]
    ResumePointInvalid,
}

impl StoreError {
    /// The coarse [`ErrorKind`] of this error, used by the retry loop.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            StoreError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            StoreError::ConcurrencyExhausted { .. } => ErrorKind::ConcurrencyExhausted,
            StoreError::ValidationError(_) | StoreError::VersionFieldMissing { .. } => {
                ErrorKind::ValidationError
            }
            StoreError::CacheError(_) => ErrorKind::CacheError,
            StoreError::Transient(_) => ErrorKind::Transient,
            StoreError::Fatal(_) => ErrorKind::Fatal,
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::MutateRejected(_) => ErrorKind::Fatal,
            StoreError::ResumePointInvalid => ErrorKind::ResumePointInvalid,
        }
    }

    /// Whether the Store's CAS retry loop should retry this error.
    ///
    /// Only `VersionMismatch` and `Transient` are retried (spec: §4.7);
    /// everything else -- including cancellation -- surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::VersionMismatch | ErrorKind::Transient)
    }

    pub(crate) fn not_found(id: impl fmt::Display) -> Self {
        StoreError::NotFound { id: id.to_string() }
    }

    pub(crate) fn already_exists(id: impl fmt::Display) -> Self {
        StoreError::AlreadyExists { id: id.to_string() }
    }

    pub(crate) fn version_mismatch(id: impl fmt::Display, expected: i64, found: Option<i64>) -> Self {
        StoreError::VersionMismatch {
            id: id.to_string(),
            expected,
            found,
        }
    }
}
