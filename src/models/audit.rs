use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::AuditAction;

/// One link of a session's hash-chained audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub session_id: String,
    /// 1-based position in the session's chain.
    pub sequence: u64,
    pub actor: String,
    pub action: AuditAction,
    /// What the action touched (dataset hash, item id, payload ref, ...).
    pub subject: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// `after_hash` of the previous event, or the session genesis hash.
    pub before_hash: String,
    pub after_hash: String,
}
