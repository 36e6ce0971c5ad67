//! Multi-party review: role-attributed decisions and threaded comments,
//! with reads of other reviewers' input gated on each reviewer's first pass.

pub mod consensus;
pub mod gate;
pub mod store;

pub use consensus::{consensus_level, thread_consensus};
pub use gate::{effective_decisions, ReviewContext, ReviewGate, SubmissionReceipt};
pub use store::{NewComment, NewDecision, ReviewStore, SqliteReviewStore};

use thiserror::Error;

use crate::db::DatabaseError;
use crate::models::ReviewerRole;

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Reviewer {reviewer_id} must complete a first pass before reading other reviewers' input")]
    ReviewOrderViolation { session_id: String, reviewer_id: String },

    #[error("Reviewer {reviewer_id} is not registered on session {session_id}")]
    UnknownReviewer { session_id: String, reviewer_id: String },

    #[error("Reviewer {reviewer_id} is already registered as {existing}")]
    RoleConflict { reviewer_id: String, existing: ReviewerRole },

    #[error("Unknown mapping: {0}")]
    UnknownMapping(String),

    #[error("Unknown item: {0}")]
    UnknownItem(String),

    #[error("Component {component_id} is not in reference {key} v{version}")]
    UnknownComponent {
        component_id: String,
        key: String,
        version: u32,
    },

    #[error("Comment {comment_id} cannot be superseded: {reason}")]
    InvalidSupersede { comment_id: String, reason: String },

    #[error("Comment body is empty")]
    EmptyComment,
}

impl From<rusqlite::Error> for ReviewError {
    fn from(e: rusqlite::Error) -> Self {
        ReviewError::Database(DatabaseError::Sqlite(e))
    }
}

impl From<serde_json::Error> for ReviewError {
    fn from(e: serde_json::Error) -> Self {
        ReviewError::Database(DatabaseError::Serialization(e))
    }
}
