use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{Agreement, CommentTargetKind, ConsensusLevel, DecisionKind, ReviewerRole};
use super::mapping::{ComponentMapping, MappingEdit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerRecord {
    pub reviewer_id: String,
    pub role: ReviewerRole,
    pub registered_at: DateTime<Utc>,
    /// Set once the reviewer submits their first completed pass; opens the gate.
    pub initial_pass_at: Option<DateTime<Utc>>,
}

impl ReviewerRecord {
    pub fn has_completed_initial_pass(&self) -> bool {
        self.initial_pass_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommentTarget {
    pub kind: CommentTargetKind,
    pub id: String,
}

impl CommentTarget {
    pub fn mapping(id: impl Into<String>) -> Self {
        Self {
            kind: CommentTargetKind::Mapping,
            id: id.into(),
        }
    }

    pub fn item(id: impl Into<String>) -> Self {
        Self {
            kind: CommentTargetKind::Item,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub comment_id: String,
    pub session_id: String,
    pub reviewer_id: String,
    pub role: ReviewerRole,
    pub target: CommentTarget,
    pub body: String,
    pub agreement: Agreement,
    /// Earlier comment this one corrects; the earlier one stays in the thread.
    pub supersedes: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Storage order; threads sort by it.
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub decision_id: String,
    pub session_id: String,
    pub reviewer_id: String,
    pub mapping_id: String,
    pub kind: DecisionKind,
    pub edit: Option<MappingEdit>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
}

/// One reviewer action within a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewAction {
    Accept {
        mapping_id: String,
    },
    Edit {
        mapping_id: String,
        edit: MappingEdit,
    },
    Reject {
        mapping_id: String,
        reason: Option<String>,
    },
    Comment {
        target: CommentTarget,
        body: String,
        agreement: Agreement,
        supersedes: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub reviewer_id: String,
    pub actions: Vec<ReviewAction>,
    /// Marks this submission as the reviewer's completed first pass.
    pub completes_pass: bool,
}

/// Effective state of one mapping after folding its decision history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDecisionView {
    pub mapping_id: String,
    pub decision: Option<DecisionKind>,
    pub decided_by: Option<String>,
    pub effective: ComponentMapping,
    pub history_len: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadConsensus {
    pub target: CommentTarget,
    pub level: ConsensusLevel,
    pub agree_ratio: f32,
    pub participants: u32,
    /// Count of current (non-superseded) comments per agreement value.
    pub distribution: std::collections::BTreeMap<String, u32>,
}
