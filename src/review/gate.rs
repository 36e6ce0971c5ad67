//! Review submission and gated reads.
//!
//! All review input is stored as soon as it is submitted. What a reviewer
//! may *read* is gated: another reviewer's comments and decisions become
//! visible only after the reader has completed their own first pass.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::consensus::thread_consensus;
use super::store::{NewComment, NewDecision, ReviewStore, SqliteReviewStore};
use super::ReviewError;
use crate::models::{
    Agreement, CandidateItem, CommentTarget, CommentTargetKind, ComponentMapping, DecisionKind, MappingDecisionView,
    MappingEdit, MappingOutcome, ReferenceDataset, ReviewAction, ReviewComment, ReviewDecision, ReviewSubmission,
    ReviewerRecord, ReviewerRole, ThreadConsensus,
};
use crate::reference::canonicalize_id;

/// What a submission is validated against: the current mapping run, the
/// frozen items and the dataset version the mapping was bound to.
#[derive(Debug, Clone, Copy)]
pub struct ReviewContext<'a> {
    pub mapping: &'a MappingOutcome,
    pub items: &'a [CandidateItem],
    pub dataset: &'a ReferenceDataset,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub decisions: Vec<ReviewDecision>,
    pub comments: Vec<ReviewComment>,
    /// True when this submission completed the reviewer's first pass.
    pub initial_pass_completed: bool,
}

pub struct ReviewGate {
    store: Box<dyn ReviewStore>,
}

impl Default for ReviewGate {
    fn default() -> Self {
        Self::new(Box::new(SqliteReviewStore))
    }
}

/// An action after validation, ready to store.
enum Validated<'a> {
    Decision {
        mapping_id: &'a str,
        kind: DecisionKind,
        edit: Option<MappingEdit>,
        reason: Option<&'a str>,
    },
    Comment {
        target: &'a CommentTarget,
        body: &'a str,
        agreement: Agreement,
        supersedes: Option<&'a str>,
    },
}

impl ReviewGate {
    pub fn new(store: Box<dyn ReviewStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn ReviewStore {
        self.store.as_ref()
    }

    pub fn register(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
        role: ReviewerRole,
    ) -> Result<ReviewerRecord, ReviewError> {
        let record = self.store.register_reviewer(conn, session_id, reviewer_id, role)?;
        tracing::info!(session_id = %session_id, reviewer_id = %reviewer_id, role = %role, "Reviewer registered");
        Ok(record)
    }

    /// Validate every action, then store them in order. Nothing is stored
    /// when any action is invalid.
    pub fn submit_review(
        &self,
        conn: &Connection,
        session_id: &str,
        submission: &ReviewSubmission,
        ctx: ReviewContext<'_>,
    ) -> Result<SubmissionReceipt, ReviewError> {
        let reviewer = self.require_reviewer(conn, session_id, &submission.reviewer_id)?;
        let mappings: HashMap<&str, &ComponentMapping> =
            ctx.mapping.mappings.iter().map(|m| (m.mapping_id.as_str(), m)).collect();

        let mut validated = Vec::with_capacity(submission.actions.len());
        for action in &submission.actions {
            validated.push(self.validate(conn, session_id, &reviewer, action, &mappings, ctx)?);
        }

        let mut receipt = SubmissionReceipt::default();
        for action in validated {
            match action {
                Validated::Decision {
                    mapping_id,
                    kind,
                    edit,
                    reason,
                } => {
                    receipt.decisions.push(self.store.insert_decision(
                        conn,
                        NewDecision {
                            session_id,
                            reviewer_id: &reviewer.reviewer_id,
                            mapping_id,
                            kind,
                            edit: edit.as_ref(),
                            reason,
                        },
                    )?);
                }
                Validated::Comment {
                    target,
                    body,
                    agreement,
                    supersedes,
                } => {
                    receipt.comments.push(self.store.insert_comment(
                        conn,
                        NewComment {
                            session_id,
                            reviewer_id: &reviewer.reviewer_id,
                            role: reviewer.role,
                            target,
                            body,
                            agreement,
                            supersedes,
                        },
                    )?);
                }
            }
        }

        if submission.completes_pass {
            receipt.initial_pass_completed =
                self.store
                    .mark_initial_pass(conn, session_id, &reviewer.reviewer_id, crate::db::now_timestamp())?;
        }

        tracing::info!(
            session_id = %session_id,
            reviewer_id = %reviewer.reviewer_id,
            decisions = receipt.decisions.len(),
            comments = receipt.comments.len(),
            initial_pass_completed = receipt.initial_pass_completed,
            "Review submitted"
        );
        Ok(receipt)
    }

    fn validate<'a>(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer: &ReviewerRecord,
        action: &'a ReviewAction,
        mappings: &HashMap<&str, &ComponentMapping>,
        ctx: ReviewContext<'_>,
    ) -> Result<Validated<'a>, ReviewError> {
        match action {
            ReviewAction::Accept { mapping_id } => {
                known_mapping(mappings, mapping_id)?;
                Ok(Validated::Decision {
                    mapping_id: mapping_id.as_str(),
                    kind: DecisionKind::Accept,
                    edit: None,
                    reason: None,
                })
            }
            ReviewAction::Reject { mapping_id, reason } => {
                known_mapping(mappings, mapping_id)?;
                Ok(Validated::Decision {
                    mapping_id: mapping_id.as_str(),
                    kind: DecisionKind::Reject,
                    edit: None,
                    reason: reason.as_deref(),
                })
            }
            ReviewAction::Edit { mapping_id, edit } => {
                let mapping = known_mapping(mappings, mapping_id)?;
                let mut edit = edit.clone();
                if let Some(raw) = &edit.component_id {
                    // Edits may only point at the dataset version the mapping was made against.
                    let canonical = canonicalize_id(mapping.component_type, raw);
                    if !ctx.dataset.components.contains(mapping.component_type, &canonical) {
                        return Err(ReviewError::UnknownComponent {
                            component_id: canonical,
                            key: ctx.dataset.key.clone(),
                            version: ctx.dataset.version,
                        });
                    }
                    edit.component_id = Some(canonical);
                }
                if let Some(confidence) = edit.confidence {
                    edit.confidence = Some(if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 });
                }
                Ok(Validated::Decision {
                    mapping_id: mapping_id.as_str(),
                    kind: DecisionKind::Edit,
                    edit: Some(edit),
                    reason: None,
                })
            }
            ReviewAction::Comment {
                target,
                body,
                agreement,
                supersedes,
            } => {
                if body.trim().is_empty() {
                    return Err(ReviewError::EmptyComment);
                }
                match target.kind {
                    CommentTargetKind::Mapping => {
                        known_mapping(mappings, &target.id)?;
                    }
                    CommentTargetKind::Item => {
                        if !ctx.items.iter().any(|i| i.item_id == target.id) {
                            return Err(ReviewError::UnknownItem(target.id.clone()));
                        }
                    }
                }
                if let Some(previous_id) = supersedes {
                    let previous = self.store.comment(conn, session_id, previous_id)?.ok_or_else(|| {
                        ReviewError::InvalidSupersede {
                            comment_id: previous_id.clone(),
                            reason: "no such comment".into(),
                        }
                    })?;
                    if previous.reviewer_id != reviewer.reviewer_id {
                        return Err(ReviewError::InvalidSupersede {
                            comment_id: previous_id.clone(),
                            reason: "only the author can correct a comment".into(),
                        });
                    }
                    if &previous.target != target {
                        return Err(ReviewError::InvalidSupersede {
                            comment_id: previous_id.clone(),
                            reason: "correction must stay in the same thread".into(),
                        });
                    }
                }
                Ok(Validated::Comment {
                    target,
                    body: body.trim(),
                    agreement: *agreement,
                    supersedes: supersedes.as_deref(),
                })
            }
        }
    }

    /// All comments on the session, gated on the reader's first pass.
    pub fn comments_for(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
    ) -> Result<Vec<ReviewComment>, ReviewError> {
        self.require_visibility(conn, session_id, reviewer_id)?;
        self.store.comments(conn, session_id)
    }

    /// All decisions on the session, gated on the reader's first pass.
    pub fn decisions_for(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
    ) -> Result<Vec<ReviewDecision>, ReviewError> {
        self.require_visibility(conn, session_id, reviewer_id)?;
        self.store.decisions(conn, session_id)
    }

    /// The reader's own comments. Never gated.
    pub fn own_comments(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
    ) -> Result<Vec<ReviewComment>, ReviewError> {
        self.require_reviewer(conn, session_id, reviewer_id)?;
        Ok(self
            .store
            .comments(conn, session_id)?
            .into_iter()
            .filter(|c| c.reviewer_id == reviewer_id)
            .collect())
    }

    /// One thread in submission order, with its consensus. Gated.
    pub fn thread(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
        target: &CommentTarget,
    ) -> Result<(Vec<ReviewComment>, ThreadConsensus), ReviewError> {
        let comments = self.comments_for(conn, session_id, reviewer_id)?;
        let consensus = thread_consensus(target, &comments);
        let thread = comments.into_iter().filter(|c| &c.target == target).collect();
        Ok((thread, consensus))
    }

    fn require_reviewer(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
    ) -> Result<ReviewerRecord, ReviewError> {
        self.store
            .reviewer(conn, session_id, reviewer_id)?
            .ok_or_else(|| ReviewError::UnknownReviewer {
                session_id: session_id.to_string(),
                reviewer_id: reviewer_id.to_string(),
            })
    }

    fn require_visibility(&self, conn: &Connection, session_id: &str, reviewer_id: &str) -> Result<(), ReviewError> {
        let reviewer = self.require_reviewer(conn, session_id, reviewer_id)?;
        if !reviewer.has_completed_initial_pass() {
            tracing::warn!(session_id = %session_id, reviewer_id = %reviewer_id, "Gated review read rejected");
            return Err(ReviewError::ReviewOrderViolation {
                session_id: session_id.to_string(),
                reviewer_id: reviewer_id.to_string(),
            });
        }
        Ok(())
    }
}

fn known_mapping<'m>(
    mappings: &HashMap<&str, &'m ComponentMapping>,
    id: &str,
) -> Result<&'m ComponentMapping, ReviewError> {
    mappings
        .get(id)
        .copied()
        .ok_or_else(|| ReviewError::UnknownMapping(id.to_string()))
}

/// Effective state of every mapping: the last decision in submission order
/// wins, applied to the model's mapping. Earlier decisions stay in history.
pub fn effective_decisions(mapping: &MappingOutcome, decisions: &[ReviewDecision]) -> Vec<MappingDecisionView> {
    let mut by_mapping: HashMap<&str, Vec<&ReviewDecision>> = HashMap::new();
    for decision in decisions {
        by_mapping.entry(decision.mapping_id.as_str()).or_default().push(decision);
    }

    mapping
        .mappings
        .iter()
        .map(|m| {
            let mut history = by_mapping.remove(m.mapping_id.as_str()).unwrap_or_default();
            history.sort_by_key(|d| d.seq);
            let last = history.last();
            let effective = match last {
                Some(ReviewDecision {
                    kind: DecisionKind::Edit,
                    edit: Some(edit),
                    ..
                }) => edit.apply(m),
                _ => m.clone(),
            };
            MappingDecisionView {
                mapping_id: m.mapping_id.clone(),
                decision: last.map(|d| d.kind),
                decided_by: last.map(|d| d.reviewer_id.clone()),
                effective,
                history_len: history.len() as u32,
            }
        })
        .collect()
}
