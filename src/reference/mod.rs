//! Reference data: versioned cache, canonical identifiers, cache-first fetch.

pub mod cache;
pub mod canonical;
pub mod coordinator;
pub mod source;

pub use cache::{CacheHit, CacheLookup, PutOutcome, SqliteVersionedCache, VersionedCache};
pub use canonical::{canonicalize_components, canonicalize_id, canonicalize_untyped};
pub use coordinator::{FetchOptions, FetchOrigin, FetchOutcome, ReferenceFetchCoordinator};
pub use source::{HttpReferenceSource, RawComponent, RawReferencePayload, ReferenceSource, SourceError};

use thiserror::Error;

use crate::db::DatabaseError;
use crate::locks::LockError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Stored version {version} of '{key}' is unreadable: {reason}")]
    CorruptVersion { key: String, version: u32, reason: String },

    #[error("Content hash mismatch for '{key}': declared {declared}, computed {computed}")]
    HashMismatch {
        key: String,
        declared: String,
        computed: String,
    },

    #[error("No cache record for '{0}'")]
    MissingKey(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Database(DatabaseError::Sqlite(e))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Database(DatabaseError::Serialization(e))
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Reference '{key}' unavailable: {source}")]
    ReferenceUnavailable { key: String, source: SourceError },

    #[error("Reference '{0}' has no components after normalization")]
    EmptyReference(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl FetchError {
    /// Missing reference keys are structural; everything else may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ReferenceUnavailable { source, .. } => {
                matches!(source, SourceError::SourceUnavailable(_))
            }
            Self::Lock(LockError::Busy { .. }) => true,
            _ => false,
        }
    }
}
