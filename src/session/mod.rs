//! Session pipeline state: append-only checkpoints and lossless replay.

pub mod replay;
pub mod state;
pub mod store;

pub use replay::{bound_hashes, load_snapshot, replay, BoundReference, SessionSnapshot, SessionStatus};
pub use state::{can_transition, next_states};
pub use store::{SessionCheckpointStore, SessionRecord, SqliteCheckpointStore};

use thiserror::Error;

use crate::db::DatabaseError;
use crate::locks::LockError;
use crate::models::SessionState;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session busy: {0}")]
    SessionBusy(#[from] LockError),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {session_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("Session {session_id} is {state} and can no longer change")]
    Immutable { session_id: String, state: SessionState },

    #[error("Session {0} has no readable checkpoint")]
    NoValidCheckpoint(String),
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        SessionError::Database(DatabaseError::Sqlite(e))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Database(DatabaseError::Serialization(e))
    }
}
