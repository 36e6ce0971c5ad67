//! Append-only, hash-chained audit trail and the read-only export built on it.

pub mod export;
pub mod log;

pub use export::{ExportItem, ExportReport, ExportSummary, QualityMetrics};
pub use log::{verify_events, AuditLog, ChainVerification};

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Audit chain for session {session_id} is broken at event {sequence}")]
    ChainBroken { session_id: String, sequence: u64 },

    #[error("Export rendering failed: {0}")]
    Render(String),
}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        AuditError::Database(DatabaseError::Sqlite(e))
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Database(DatabaseError::Serialization(e))
    }
}
