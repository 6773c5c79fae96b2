//! Typed errors for the fetch/merge/embed pipeline.
//!
//! Each boundary reports its own error type with the cause attached:
//! [`SourceError`] from the work-item source, [`EmbeddingError`] from the
//! embedding service, [`IndexError`] from index persistence. Only the
//! synchronizer folds them into a [`PipelineError`] and decides what is
//! retryable.

use thiserror::Error;

/// Failures reported by a [`WorkItemSource`](crate::source::WorkItemSource).
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network, TLS, or authentication failure, or an unexpected status.
    #[error("source request failed: {0}")]
    Unavailable(String),

    /// The item exists in a link but cannot be read (deleted, no permission).
    #[error("work item {project}/{id} is not retrievable")]
    NotRetrievable { project: String, id: String },

    /// The response did not have the expected structure.
    #[error("malformed work item {id}: {reason}")]
    Malformed { id: String, reason: String },

    /// A group id with no configured member projects.
    #[error("unknown location '{0}'")]
    UnknownLocation(String),
}

impl SourceError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        SourceError::Unavailable(msg.into())
    }

    pub fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Malformed {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::Unavailable(err.to_string())
    }
}

/// Failures reported by an [`Embedder`](crate::embedding::Embedder).
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,

    /// Network failure, 429, or 5xx after all retries.
    #[error("embedding service unreachable: {0}")]
    Unavailable(String),

    /// A 4xx other than 429.
    #[error("embedding request rejected: {0}")]
    Rejected(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// Failures reading or writing a persisted index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("index file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),

    #[error("unsupported index schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("corrupt index: {0}")]
    Corrupt(String),
}

/// Pipeline-level failures surfaced to the operator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("work-item source unavailable")]
    SourceUnavailable(#[source] SourceError),

    #[error("release '{release}' matched {matches} configuration items (expected exactly 1)")]
    ReleaseResolution { release: String, matches: usize },

    #[error("merge integrity violation on {item_id}: {reason}")]
    MergeIntegrity { item_id: String, reason: String },

    /// Retryable: the staged records remain in the cache.
    #[error("embedding service unavailable; staged records kept in cache {db_id}")]
    EmbeddingUnavailable {
        db_id: String,
        #[source]
        source: EmbeddingError,
    },

    #[error("no qualifying work items found for {0}")]
    EmptyResult(String),

    #[error("index {0} is not in the catalog")]
    UnknownIndex(String),

    #[error("cached records for {0} failed the integrity check")]
    CacheCorrupt(String),

    #[error("catalog storage error")]
    Storage(#[from] sqlx::Error),

    #[error("index persistence error")]
    Index(#[from] IndexError),
}

impl PipelineError {
    /// Whether re-running the same command can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::EmbeddingUnavailable { .. } | PipelineError::SourceUnavailable(_)
        )
    }

    pub fn merge_integrity(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::MergeIntegrity {
            item_id: item_id.into(),
            reason: reason.into(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
