use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::SessionState;
use super::item::{CandidateItem, ChunkFailure};
use super::mapping::MappingOutcome;
use super::review::{MappingDecisionView, ReviewerRecord};

/// A durable marker of pipeline progress. The payload lives in a separate
/// content-addressed record referenced by `payload_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub ordinal: u32,
    pub label: SessionState,
    pub payload_ref: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
}

/// Why an ITEMS_EXTRACTED checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRevision {
    Extraction,
    ReviewerEdit,
    ReviewerDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointPayload {
    Created {
        reference_key: String,
    },
    ReferenceFetched {
        reference_key: String,
        dataset_hash: String,
        dataset_version: u32,
    },
    ItemsExtracted {
        revision: ItemRevision,
        items: Vec<CandidateItem>,
        #[serde(default)]
        chunk_failures: Vec<ChunkFailure>,
    },
    ItemsReviewed {
        items: Vec<CandidateItem>,
    },
    Mapped {
        run: u32,
        mapping_only: bool,
        dataset_hash: String,
        dataset_version: u32,
        outcome: MappingOutcome,
    },
    Reviewed {
        reviewers: Vec<ReviewerRecord>,
        decisions: Vec<MappingDecisionView>,
    },
    /// Review progress recorded without moving the session: the full
    /// reviewer list and effective decisions after a registration or a
    /// submission. Labelled with the state the session is already in.
    ReviewRecorded {
        state: SessionState,
        reviewers: Vec<ReviewerRecord>,
        decisions: Vec<MappingDecisionView>,
    },
    Exported {
        report_hash: String,
    },
    Abandoned {
        reason: String,
    },
}

impl CheckpointPayload {
    /// State a checkpoint carrying this payload is labelled with.
    pub fn state(&self) -> SessionState {
        match self {
            Self::Created { .. } => SessionState::Created,
            Self::ReferenceFetched { .. } => SessionState::ReferenceFetched,
            Self::ItemsExtracted { .. } => SessionState::ItemsExtracted,
            Self::ItemsReviewed { .. } => SessionState::ItemsReviewed,
            Self::Mapped { .. } => SessionState::Mapped,
            Self::Reviewed { .. } => SessionState::Reviewed,
            Self::ReviewRecorded { state, .. } => *state,
            Self::Exported { .. } => SessionState::Exported,
            Self::Abandoned { .. } => SessionState::Abandoned,
        }
    }

    pub fn is_mapping_only(&self) -> bool {
        matches!(self, Self::Mapped { mapping_only: true, .. })
    }

    /// True for payloads that record progress within the current state.
    pub fn is_in_place(&self) -> bool {
        matches!(self, Self::ReviewRecorded { .. })
    }
}
