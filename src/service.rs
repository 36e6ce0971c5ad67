//! Session-level façade over the pipeline.
//!
//! Every call names its session explicitly. Mutations take the per-session
//! lock, run their stage outside any transaction, then commit the resulting
//! checkpoint together with its audit events in one SQLite transaction.
//! Reads replay checkpoints and never take the lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{verify_events, AuditError, AuditLog, ChainVerification, ExportReport};
use crate::db::{self, DatabaseError};
use crate::locks::{KeyGuard, KeyedLocks, LockError};
use crate::models::{
    AuditAction, CandidateItem, Checkpoint, CheckpointPayload, CommentTarget, ItemEdit, ItemRevision,
    MappingDecisionView, MappingOutcome, ReferenceDataset, ReviewComment, ReviewDecision, ReviewSubmission,
    ReviewerRecord, ReviewerRole, SessionState, ThreadConsensus,
};
use crate::pipeline::document::{DocumentError, DocumentReader, PlainTextReader};
use crate::pipeline::extraction::{ExtractionError, ExtractionOutput, ExtractionStage};
use crate::pipeline::mapping::{MappingError, MappingStage};
use crate::pipeline::model::ModelClient;
use crate::pipeline::CancellationToken;
use crate::pipeline_config::PipelineConfig;
use crate::reference::coordinator::normalize_key;
use crate::reference::{
    CacheError, FetchError, FetchOptions, FetchOutcome, ReferenceFetchCoordinator, ReferenceSource,
    SqliteVersionedCache,
};
use crate::review::{effective_decisions, ReviewContext, ReviewError, ReviewGate, SubmissionReceipt};
use crate::session::{
    bound_hashes, can_transition, load_snapshot, BoundReference, SessionCheckpointStore, SessionError, SessionRecord,
    SessionSnapshot, SessionStatus, SqliteCheckpointStore,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Session {0} has no items to approve")]
    NoItems(String),

    #[error("Item {item_id} not found in session {session_id}")]
    UnknownItem { session_id: String, item_id: String },

    #[error("Session {session_id} has no {what} yet")]
    NotReady { session_id: String, what: &'static str },

    #[error("Reference {key} version {hash} is no longer in the cache")]
    ReferenceMissing { key: String, hash: String },
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Database(DatabaseError::Sqlite(e))
    }
}

impl From<LockError> for ServiceError {
    fn from(e: LockError) -> Self {
        ServiceError::Session(SessionError::SessionBusy(e))
    }
}

pub struct ValidationService {
    db_path: PathBuf,
    config: PipelineConfig,
    checkpoints: Box<dyn SessionCheckpointStore>,
    coordinator: ReferenceFetchCoordinator,
    reader: Box<dyn DocumentReader>,
    model: Arc<dyn ModelClient>,
    review: ReviewGate,
    audit: AuditLog,
    sessions: KeyedLocks,
}

impl ValidationService {
    pub fn new(
        db_path: &Path,
        config: PipelineConfig,
        source: Arc<dyn ReferenceSource>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        let cache = Arc::new(SqliteVersionedCache::new(config.cache.ttl));
        Self {
            db_path: db_path.to_path_buf(),
            coordinator: ReferenceFetchCoordinator::new(source, cache, config.locks.clone()),
            sessions: KeyedLocks::new("session", config.locks.clone()),
            config,
            checkpoints: Box::new(SqliteCheckpointStore),
            reader: Box::new(PlainTextReader),
            model,
            review: ReviewGate::default(),
            audit: AuditLog,
        }
    }

    pub fn with_document_reader(mut self, reader: Box<dyn DocumentReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// One connection per call; SQLite WAL lets reads run beside a writer.
    fn open_db(&self) -> Result<Connection, ServiceError> {
        Ok(db::open_database(&self.db_path)?)
    }

    fn lock(&self, session_id: &str, operation: &str) -> Result<KeyGuard<'_>, ServiceError> {
        Ok(self.sessions.acquire(session_id, operation)?)
    }

    fn snapshot(&self, conn: &Connection, session_id: &str) -> Result<SessionSnapshot, ServiceError> {
        Ok(load_snapshot(self.checkpoints.as_ref(), conn, session_id)?)
    }

    /// Reject a stage before it runs when its checkpoint could not be appended.
    fn require_transition(
        snapshot: &SessionSnapshot,
        to: SessionState,
        mapping_only: bool,
    ) -> Result<(), ServiceError> {
        if snapshot.state.is_terminal() {
            return Err(SessionError::Immutable {
                session_id: snapshot.session_id.clone(),
                state: snapshot.state,
            }
            .into());
        }
        if !can_transition(snapshot.state, to, mapping_only) {
            return Err(SessionError::InvalidTransition {
                session_id: snapshot.session_id.clone(),
                from: snapshot.state,
                to,
            }
            .into());
        }
        Ok(())
    }

    fn require_active(snapshot: &SessionSnapshot) -> Result<(), ServiceError> {
        if snapshot.state.is_terminal() {
            return Err(SessionError::Immutable {
                session_id: snapshot.session_id.clone(),
                state: snapshot.state,
            }
            .into());
        }
        Ok(())
    }

    /// Append a checkpoint and its audit event. Runs inside the caller's transaction.
    fn record_checkpoint(
        &self,
        conn: &Connection,
        session_id: &str,
        payload: &CheckpointPayload,
        actor: &str,
    ) -> Result<Checkpoint, ServiceError> {
        let checkpoint = self.checkpoints.append(conn, session_id, payload, actor)?;
        self.audit.append(
            conn,
            session_id,
            actor,
            AuditAction::Checkpoint,
            &checkpoint.ordinal.to_string(),
            json!({ "state": checkpoint.label, "payload_ref": checkpoint.payload_ref }),
        )?;
        Ok(checkpoint)
    }

    /// Record the reviewer list and effective decisions as an in-place
    /// checkpoint, so replay alone restores review progress.
    fn record_review_progress(
        &self,
        conn: &Connection,
        snapshot: &SessionSnapshot,
        actor: &str,
    ) -> Result<Checkpoint, ServiceError> {
        let session_id = snapshot.session_id.as_str();
        let reviewers = self.review.store().reviewers(conn, session_id)?;
        let decisions = match &snapshot.mapping {
            Some(mapping) => effective_decisions(mapping, &self.review.store().decisions(conn, session_id)?),
            None => Vec::new(),
        };
        self.record_checkpoint(
            conn,
            session_id,
            &CheckpointPayload::ReviewRecorded {
                state: snapshot.state,
                reviewers,
                decisions,
            },
            actor,
        )
    }

    fn bound_dataset(&self, conn: &Connection, bound: &BoundReference) -> Result<ReferenceDataset, ServiceError> {
        self.coordinator
            .cache()
            .get_by_hash(conn, &bound.key, &bound.content_hash)?
            .ok_or_else(|| ServiceError::ReferenceMissing {
                key: bound.key.clone(),
                hash: bound.content_hash.clone(),
            })
    }

    fn audit_fetch(
        &self,
        conn: &Connection,
        session_id: &str,
        actor: &str,
        outcome: &FetchOutcome,
    ) -> Result<(), ServiceError> {
        self.audit.append(
            conn,
            session_id,
            actor,
            AuditAction::Fetch,
            &outcome.dataset.key,
            json!({
                "version": outcome.dataset.version,
                "content_hash": outcome.dataset.content_hash,
                "origin": outcome.origin,
                "created_version": outcome.created_version,
            }),
        )?;
        if outcome.ids_rewritten > 0 {
            self.audit.append(
                conn,
                session_id,
                actor,
                AuditAction::Canonicalize,
                &outcome.dataset.key,
                json!({ "ids_rewritten": outcome.ids_rewritten, "version": outcome.dataset.version }),
            )?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Session lifecycle
    // ═══════════════════════════════════════════════════════════

    pub fn create_session(&self, reference_key: &str, actor: &str) -> Result<SessionRecord, ServiceError> {
        let session_id = Uuid::new_v4().to_string();
        let reference_key = normalize_key(reference_key);
        let _guard = self.lock(&session_id, "create")?;
        let conn = self.open_db()?;

        let tx = conn.unchecked_transaction()?;
        let (record, checkpoint) = self.checkpoints.create_session(&tx, &session_id, &reference_key, actor)?;
        self.audit.append(
            &tx,
            &session_id,
            actor,
            AuditAction::Checkpoint,
            &checkpoint.ordinal.to_string(),
            json!({ "state": checkpoint.label, "payload_ref": checkpoint.payload_ref }),
        )?;
        tx.commit()?;

        tracing::info!(session_id = %session_id, key = %reference_key, "Session created");
        Ok(record)
    }

    /// Bind the session to the current version of its reference unit.
    pub fn fetch_reference(
        &self,
        session_id: &str,
        options: FetchOptions,
        actor: &str,
    ) -> Result<FetchOutcome, ServiceError> {
        let _guard = self.lock(session_id, "fetch")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::ReferenceFetched, false)?;

        let outcome = self.coordinator.fetch_with(&conn, &snapshot.reference_key, options)?;

        let tx = conn.unchecked_transaction()?;
        self.audit_fetch(&tx, session_id, actor, &outcome)?;
        self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::ReferenceFetched {
                reference_key: outcome.dataset.key.clone(),
                dataset_hash: outcome.dataset.content_hash.clone(),
                dataset_version: outcome.dataset.version,
            },
            actor,
        )?;
        tx.commit()?;
        Ok(outcome)
    }

    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus, ServiceError> {
        let conn = self.open_db()?;
        Ok(self.snapshot(&conn, session_id)?.status())
    }

    /// Rebuild a session from its checkpoints, e.g. after a restart.
    pub fn resume(&self, session_id: &str) -> Result<SessionSnapshot, ServiceError> {
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        tracing::info!(
            session_id = %session_id,
            state = %snapshot.state,
            ordinal = snapshot.last_ordinal,
            skipped = snapshot.skipped_checkpoints.len(),
            "Session resumed"
        );
        Ok(snapshot)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, ServiceError> {
        let conn = self.open_db()?;
        Ok(self.checkpoints.list_sessions(&conn)?)
    }

    pub fn abandon(&self, session_id: &str, reason: &str, actor: &str) -> Result<Checkpoint, ServiceError> {
        let _guard = self.lock(session_id, "abandon")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::Abandoned, false)?;

        let tx = conn.unchecked_transaction()?;
        let checkpoint = self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::Abandoned {
                reason: reason.to_string(),
            },
            actor,
        )?;
        tx.commit()?;
        tracing::info!(session_id = %session_id, "Session abandoned");
        Ok(checkpoint)
    }

    // ═══════════════════════════════════════════════════════════
    // Extraction and item review
    // ═══════════════════════════════════════════════════════════

    pub fn extract_items(
        &self,
        session_id: &str,
        raw_text: &str,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutput, ServiceError> {
        let _guard = self.lock(session_id, "extract")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::ItemsExtracted, false)?;

        let mut stage = ExtractionStage::new(self.config.extraction.clone());
        if self.config.extraction.model_assisted {
            stage = stage.with_model(Arc::clone(&self.model), self.config.mapping.call_timeout);
        }
        let output = stage.extract(raw_text, cancel)?;

        let tx = conn.unchecked_transaction()?;
        self.audit.append(
            &tx,
            session_id,
            actor,
            AuditAction::Extract,
            "document",
            json!({
                "items": output.items.len(),
                "chunks": output.chunk_count,
                "chunk_failures": output.chunk_failures.len(),
                "sanitized_lines_removed": output.sanitized_lines_removed,
            }),
        )?;
        self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::ItemsExtracted {
                revision: ItemRevision::Extraction,
                items: output.items.clone(),
                chunk_failures: output.chunk_failures.clone(),
            },
            actor,
        )?;
        tx.commit()?;
        Ok(output)
    }

    pub fn extract_document(
        &self,
        session_id: &str,
        path: &Path,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutput, ServiceError> {
        let text = self.reader.read_text(path)?;
        self.extract_items(session_id, &text, actor, cancel)
    }

    pub fn edit_item(&self, session_id: &str, edit: &ItemEdit, actor: &str) -> Result<CandidateItem, ServiceError> {
        let _guard = self.lock(session_id, "edit_item")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::ItemsExtracted, false)?;

        let mut items = snapshot.items.clone();
        let unknown = |item_id: &str| ServiceError::UnknownItem {
            session_id: session_id.to_string(),
            item_id: item_id.to_string(),
        };
        if let Some(Some(parent)) = &edit.parent_item_id {
            if parent == &edit.item_id || !items.iter().any(|i| &i.item_id == parent) {
                return Err(unknown(parent));
            }
        }
        let item = items
            .iter_mut()
            .find(|i| i.item_id == edit.item_id)
            .ok_or_else(|| unknown(&edit.item_id))?;

        let mut changed = Vec::new();
        if let Some(text) = edit.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            item.text = text.to_string();
            changed.push("text");
        }
        if let Some(kind) = edit.kind {
            item.kind = kind;
            changed.push("kind");
        }
        if let Some(parent) = &edit.parent_item_id {
            item.parent_item_id = parent.clone();
            changed.push("parent_item_id");
        }
        let edited = item.clone();

        let tx = conn.unchecked_transaction()?;
        self.audit.append(
            &tx,
            session_id,
            actor,
            AuditAction::ItemEdit,
            &edit.item_id,
            json!({ "fields": changed }),
        )?;
        self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::ItemsExtracted {
                revision: ItemRevision::ReviewerEdit,
                items,
                chunk_failures: snapshot.chunk_failures.clone(),
            },
            actor,
        )?;
        tx.commit()?;
        Ok(edited)
    }

    /// Remove an item. Its sub-items become top-level items.
    pub fn delete_item(&self, session_id: &str, item_id: &str, actor: &str) -> Result<Vec<CandidateItem>, ServiceError> {
        let _guard = self.lock(session_id, "delete_item")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::ItemsExtracted, false)?;

        if !snapshot.items.iter().any(|i| i.item_id == item_id) {
            return Err(ServiceError::UnknownItem {
                session_id: session_id.to_string(),
                item_id: item_id.to_string(),
            });
        }
        let items: Vec<CandidateItem> = snapshot
            .items
            .iter()
            .filter(|i| i.item_id != item_id)
            .cloned()
            .map(|mut i| {
                if i.parent_item_id.as_deref() == Some(item_id) {
                    i.parent_item_id = None;
                }
                i
            })
            .collect();

        let tx = conn.unchecked_transaction()?;
        self.audit.append(
            &tx,
            session_id,
            actor,
            AuditAction::ItemDelete,
            item_id,
            json!({ "remaining": items.len() }),
        )?;
        self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::ItemsExtracted {
                revision: ItemRevision::ReviewerDelete,
                items: items.clone(),
                chunk_failures: snapshot.chunk_failures.clone(),
            },
            actor,
        )?;
        tx.commit()?;
        Ok(items)
    }

    /// Freeze the reviewed item list; mapping reads only this list.
    pub fn approve_items(&self, session_id: &str, actor: &str) -> Result<Vec<CandidateItem>, ServiceError> {
        let _guard = self.lock(session_id, "approve_items")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::ItemsReviewed, false)?;
        if snapshot.items.is_empty() {
            return Err(ServiceError::NoItems(session_id.to_string()));
        }

        let tx = conn.unchecked_transaction()?;
        self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::ItemsReviewed {
                items: snapshot.items.clone(),
            },
            actor,
        )?;
        tx.commit()?;
        Ok(snapshot.items)
    }

    // ═══════════════════════════════════════════════════════════
    // Mapping
    // ═══════════════════════════════════════════════════════════

    pub fn map_items(
        &self,
        session_id: &str,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<MappingOutcome, ServiceError> {
        let _guard = self.lock(session_id, "map")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::Mapped, false)?;

        let bound = snapshot.reference.clone().ok_or(ServiceError::NotReady {
            session_id: session_id.to_string(),
            what: "reference",
        })?;
        let dataset = self.bound_dataset(&conn, &bound)?;
        self.run_mapping(&conn, &snapshot, &dataset, false, None, actor, cancel)
    }

    /// Re-enter mapping for an already mapped session without touching the
    /// reviewed items, optionally against a freshly fetched reference version.
    pub fn remap_items(
        &self,
        session_id: &str,
        refresh_reference: bool,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<MappingOutcome, ServiceError> {
        let _guard = self.lock(session_id, "remap")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::Mapped, true)?;

        let (dataset, fetched) = if refresh_reference {
            let outcome = self.coordinator.fetch_with(
                &conn,
                &snapshot.reference_key,
                FetchOptions {
                    force_fresh: true,
                    stale_on_failure: false,
                },
            )?;
            (outcome.dataset.clone(), Some(outcome))
        } else {
            let bound = snapshot
                .mapping_reference
                .clone()
                .or_else(|| snapshot.reference.clone())
                .ok_or(ServiceError::NotReady {
                    session_id: session_id.to_string(),
                    what: "reference",
                })?;
            (self.bound_dataset(&conn, &bound)?, None)
        };
        self.run_mapping(&conn, &snapshot, &dataset, true, fetched.as_ref(), actor, cancel)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_mapping(
        &self,
        conn: &Connection,
        snapshot: &SessionSnapshot,
        dataset: &ReferenceDataset,
        mapping_only: bool,
        fetched: Option<&FetchOutcome>,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<MappingOutcome, ServiceError> {
        let session_id = snapshot.session_id.as_str();
        let run = snapshot.mapping_run + 1;
        let _span = tracing::info_span!("map_session", session_id = %session_id, run, mapping_only).entered();

        let stage = MappingStage::new(
            Arc::clone(&self.model),
            self.config.retry.clone(),
            self.config.mapping.clone(),
        );
        let outcome = stage.map(&snapshot.items, dataset, run, cancel)?;

        let tx = conn.unchecked_transaction()?;
        if let Some(fetched) = fetched {
            self.audit_fetch(&tx, session_id, actor, fetched)?;
        }
        self.audit.append(
            &tx,
            session_id,
            actor,
            AuditAction::Map,
            &dataset.content_hash,
            json!({
                "run": run,
                "dataset_version": dataset.version,
                "mappings": outcome.mappings.len(),
                "failed_items": outcome.failures.len(),
                "unparsed": outcome.statistics.unparsed,
                "coverage_gaps": outcome.coverage.gaps.len(),
            }),
        )?;
        self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::Mapped {
                run,
                mapping_only,
                dataset_hash: dataset.content_hash.clone(),
                dataset_version: dataset.version,
                outcome: outcome.clone(),
            },
            actor,
        )?;
        tx.commit()?;
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════
    // Review
    // ═══════════════════════════════════════════════════════════

    pub fn register_reviewer(
        &self,
        session_id: &str,
        reviewer_id: &str,
        role: ReviewerRole,
    ) -> Result<ReviewerRecord, ServiceError> {
        let _guard = self.lock(session_id, "register_reviewer")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_active(&snapshot)?;

        if let Some(existing) = self.review.store().reviewer(&conn, session_id, reviewer_id)? {
            if existing.role == role {
                return Ok(existing);
            }
        }

        let tx = conn.unchecked_transaction()?;
        let record = self.review.register(&tx, session_id, reviewer_id, role)?;
        self.audit.append(
            &tx,
            session_id,
            reviewer_id,
            AuditAction::ReviewerRegistered,
            reviewer_id,
            json!({ "role": role }),
        )?;
        self.record_review_progress(&tx, &snapshot, reviewer_id)?;
        tx.commit()?;
        Ok(record)
    }

    pub fn submit_review(
        &self,
        session_id: &str,
        submission: &ReviewSubmission,
    ) -> Result<SubmissionReceipt, ServiceError> {
        let _guard = self.lock(session_id, "submit_review")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_active(&snapshot)?;
        if snapshot.state != SessionState::Mapped {
            return Err(SessionError::InvalidTransition {
                session_id: session_id.to_string(),
                from: snapshot.state,
                to: SessionState::Reviewed,
            }
            .into());
        }
        let (mapping, bound) = match (&snapshot.mapping, &snapshot.mapping_reference) {
            (Some(mapping), Some(bound)) => (mapping, bound),
            _ => {
                return Err(ServiceError::NotReady {
                    session_id: session_id.to_string(),
                    what: "mapping",
                })
            }
        };
        let dataset = self.bound_dataset(&conn, bound)?;
        let ctx = ReviewContext {
            mapping,
            items: &snapshot.items,
            dataset: &dataset,
        };

        let reviewer_id = submission.reviewer_id.as_str();
        let tx = conn.unchecked_transaction()?;
        let receipt = self.review.submit_review(&tx, session_id, submission, ctx)?;
        for decision in &receipt.decisions {
            self.audit.append(
                &tx,
                session_id,
                reviewer_id,
                AuditAction::ReviewAction,
                &decision.mapping_id,
                json!({ "decision": decision.kind, "decision_id": decision.decision_id }),
            )?;
        }
        for comment in &receipt.comments {
            self.audit.append(
                &tx,
                session_id,
                reviewer_id,
                AuditAction::ReviewAction,
                &comment.target.id,
                json!({
                    "comment_id": comment.comment_id,
                    "target": comment.target.kind,
                    "agreement": comment.agreement,
                    "supersedes": comment.supersedes,
                }),
            )?;
        }
        if receipt.initial_pass_completed {
            self.audit.append(
                &tx,
                session_id,
                reviewer_id,
                AuditAction::ReviewAction,
                reviewer_id,
                json!({ "initial_pass_completed": true }),
            )?;
        }
        self.record_review_progress(&tx, &snapshot, reviewer_id)?;
        tx.commit()?;
        Ok(receipt)
    }

    pub fn comments_for(&self, session_id: &str, reviewer_id: &str) -> Result<Vec<ReviewComment>, ServiceError> {
        let conn = self.open_db()?;
        Ok(self.review.comments_for(&conn, session_id, reviewer_id)?)
    }

    pub fn decisions_for(&self, session_id: &str, reviewer_id: &str) -> Result<Vec<ReviewDecision>, ServiceError> {
        let conn = self.open_db()?;
        Ok(self.review.decisions_for(&conn, session_id, reviewer_id)?)
    }

    pub fn own_comments(&self, session_id: &str, reviewer_id: &str) -> Result<Vec<ReviewComment>, ServiceError> {
        let conn = self.open_db()?;
        Ok(self.review.own_comments(&conn, session_id, reviewer_id)?)
    }

    pub fn thread(
        &self,
        session_id: &str,
        reviewer_id: &str,
        target: &CommentTarget,
    ) -> Result<(Vec<ReviewComment>, ThreadConsensus), ServiceError> {
        let conn = self.open_db()?;
        Ok(self.review.thread(&conn, session_id, reviewer_id, target)?)
    }

    /// Close mapping review, recording the effective decision of every mapping.
    pub fn finalize_review(&self, session_id: &str, actor: &str) -> Result<Vec<MappingDecisionView>, ServiceError> {
        let _guard = self.lock(session_id, "finalize_review")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::Reviewed, false)?;
        let mapping = snapshot.mapping.as_ref().ok_or(ServiceError::NotReady {
            session_id: session_id.to_string(),
            what: "mapping",
        })?;

        let decisions = effective_decisions(mapping, &self.review.store().decisions(&conn, session_id)?);
        let reviewers = self.review.store().reviewers(&conn, session_id)?;

        let tx = conn.unchecked_transaction()?;
        self.record_checkpoint(
            &tx,
            session_id,
            &CheckpointPayload::Reviewed {
                reviewers,
                decisions: decisions.clone(),
            },
            actor,
        )?;
        tx.commit()?;
        Ok(decisions)
    }

    // ═══════════════════════════════════════════════════════════
    // Export and audit
    // ═══════════════════════════════════════════════════════════

    fn build_report(&self, conn: &Connection, snapshot: &SessionSnapshot) -> Result<ExportReport, ServiceError> {
        let session_id = snapshot.session_id.as_str();
        let decisions = if !snapshot.decisions.is_empty() {
            snapshot.decisions.clone()
        } else if let Some(mapping) = &snapshot.mapping {
            effective_decisions(mapping, &self.review.store().decisions(conn, session_id)?)
        } else {
            Vec::new()
        };
        let reviewers = self.review.store().reviewers(conn, session_id)?;
        let title = match snapshot.mapping_reference.as_ref().or(snapshot.reference.as_ref()) {
            Some(bound) => self
                .coordinator
                .cache()
                .get_by_hash(conn, &bound.key, &bound.content_hash)?
                .and_then(|d| d.title),
            None => None,
        };
        let trail = self.audit.events(conn, session_id)?;
        let chain = verify_events(session_id, &trail);
        Ok(ExportReport::build(snapshot, &decisions, &reviewers, title, trail, chain))
    }

    /// Read-only report of the session as it stands.
    pub fn render_export(&self, session_id: &str) -> Result<ExportReport, ServiceError> {
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        self.build_report(&conn, &snapshot)
    }

    /// Render the report and close the session. No further mutation is accepted.
    pub fn finalize_export(&self, session_id: &str, actor: &str) -> Result<ExportReport, ServiceError> {
        let _guard = self.lock(session_id, "export")?;
        let conn = self.open_db()?;
        let snapshot = self.snapshot(&conn, session_id)?;
        Self::require_transition(&snapshot, SessionState::Exported, false)?;

        let report = self.build_report(&conn, &snapshot)?;
        let report_hash = report.report_hash()?;

        let tx = conn.unchecked_transaction()?;
        self.record_checkpoint(&tx, session_id, &CheckpointPayload::Exported { report_hash }, actor)?;
        tx.commit()?;
        tracing::info!(session_id = %session_id, mappings = report.summary.total_mappings, "Session exported");
        Ok(report)
    }

    pub fn verify_audit(&self, session_id: &str) -> Result<ChainVerification, ServiceError> {
        let conn = self.open_db()?;
        Ok(self.audit.verify_chain(&conn, session_id)?)
    }

    /// Mark the cached reference as changed upstream; the next fetch goes upstream.
    pub fn signal_reference_change(&self, reference_key: &str) -> Result<(), ServiceError> {
        let conn = self.open_db()?;
        self.coordinator
            .cache()
            .signal_upstream_change(&conn, &normalize_key(reference_key))?;
        Ok(())
    }

    /// Archive superseded reference versions past the retention bound.
    /// Versions any session is bound to are never touched.
    pub fn sweep_cache(&self) -> Result<usize, ServiceError> {
        let conn = self.open_db()?;
        let mut referenced = HashSet::new();
        for record in self.checkpoints.list_sessions(&conn)? {
            referenced.extend(bound_hashes(self.checkpoints.as_ref(), &conn, &record.session_id)?);
        }

        let retention = chrono::Duration::from_std(self.config.cache.archive_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = chrono::Utc::now() - retention;
        let archived = self.coordinator.cache().archive_sweep(&conn, cutoff, &referenced)?;
        tracing::info!(archived, protected = referenced.len(), "Reference cache sweep finished");
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Agreement, DecisionKind, ItemKind, MappingFlag, ReviewAction};
    use crate::pipeline::model::{CompletionOptions, ModelError};
    use crate::pipeline_config::{derive_config, LockPolicy, OperatingMode, RetryPolicy};
    use crate::reference::{RawComponent, RawReferencePayload, SourceError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const DOCUMENT: &str = "Assessment: Workplace Safety\n\
        Answer all questions.\n\
        \n\
        1. Which of the following is PPE?\n\
        a) Gloves\n\
        b) Laptop\n\
        \n\
        2. Answer the following about hazards:\n\
        2.1 List two common hazards on a building site\n\
        2.2 Explain how a hazard differs from a risk\n\
        \n\
        3. Demonstrate how to fit a respirator.";

    const VALID: &str = r#"{"mapping_analysis": {
        "mapped_elements": [{"element_id": "E1", "mapping_strength": "EXPLICIT", "confidence_score": 0.9}],
        "mapped_performance_criteria": [{"criterion_id": "1.1", "mapping_strength": "IMPLICIT", "confidence_score": 0.75}],
        "mapped_performance_evidence": [],
        "mapped_knowledge_evidence": [{"knowledge_id": "KE1", "mapping_strength": "PARTIAL", "confidence_score": 0.6}]
    }}"#;

    struct X1Source {
        calls: AtomicUsize,
    }

    impl ReferenceSource for X1Source {
        fn fetch(&self, key: &str) -> Result<RawReferencePayload, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if key != "X1" {
                return Err(SourceError::ReferenceNotFound(key.to_string()));
            }
            let raw = |id: &str, description: &str| RawComponent {
                id: Some(id.into()),
                description: description.into(),
            };
            Ok(RawReferencePayload {
                title: Some("Workplace safety".into()),
                source_locator: Some("test://X1".into()),
                elements: vec![raw("E1", "Identify hazards")],
                performance_criteria: vec![raw("1.1", "Hazards are identified and reported")],
                performance_evidence: vec![raw("PE1", "Complete a hazard report")],
                knowledge_evidence: vec![raw("KEKE1", "WHS legislation")],
            })
        }
    }

    /// Valid mappings for every item except 2.1, which gets truncated JSON.
    struct X1Model;

    impl ModelClient for X1Model {
        fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String, ModelError> {
            if prompt.contains("Item Q2.1") {
                Ok("{\"mapping_analysis\": oops, not json".into())
            } else {
                Ok(VALID.into())
            }
        }
    }

    /// Model that is down for item 3 and valid for everything else.
    struct Q3DownModel;

    impl ModelClient for Q3DownModel {
        fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String, ModelError> {
            if prompt.contains("Item Q3") {
                Err(ModelError::ModelUnavailable("connection refused".into()))
            } else {
                Ok(VALID.into())
            }
        }
    }

    fn service(dir: &tempfile::TempDir) -> ValidationService {
        service_with(dir, Arc::new(X1Model))
    }

    fn service_with(dir: &tempfile::TempDir, model: Arc<dyn ModelClient>) -> ValidationService {
        let mut config = derive_config(OperatingMode::Testing);
        config.retry = RetryPolicy::immediate(2);
        config.locks = LockPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        ValidationService::new(
            &dir.path().join("assessmap.db"),
            config,
            Arc::new(X1Source {
                calls: AtomicUsize::new(0),
            }),
            model,
        )
    }

    /// Session through to MAPPED.
    fn mapped_session(svc: &ValidationService) -> String {
        let cancel = CancellationToken::new();
        let session = svc.create_session("x1", "alice").unwrap();
        let id = session.session_id;
        svc.fetch_reference(&id, FetchOptions::default(), "alice").unwrap();
        svc.extract_items(&id, DOCUMENT, "alice", &cancel).unwrap();
        svc.approve_items(&id, "alice").unwrap();
        svc.map_items(&id, "alice", &cancel).unwrap();
        id
    }

    fn accept(mapping_id: &str) -> ReviewAction {
        ReviewAction::Accept {
            mapping_id: mapping_id.into(),
        }
    }

    fn comment(mapping_id: &str, body: &str, agreement: Agreement) -> ReviewAction {
        ReviewAction::Comment {
            target: CommentTarget::mapping(mapping_id),
            body: body.into(),
            agreement,
            supersedes: None,
        }
    }

    #[test]
    fn x1_pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = mapped_session(&svc);

        let status = svc.session_status(&id).unwrap();
        assert_eq!(status.state, SessionState::Mapped);
        assert_eq!(status.reference_key, "X1");
        assert_eq!(status.reference_version, Some(1));
        assert_eq!(status.item_count, 5);
        // Q2 is a heading; the four answerable items are mapped.
        assert_eq!(status.mapping_count, 10);
        assert!(status.coverage_gaps.contains(&"PE1".to_string()));

        let snapshot = svc.resume(&id).unwrap();
        let mapping = snapshot.mapping.as_ref().unwrap();
        let placeholder: Vec<_> = mapping.mappings_for("Q2.1").collect();
        assert_eq!(placeholder.len(), 1);
        assert!(placeholder[0].has_flag(MappingFlag::Unparsed));
        assert!(mapping.mappings.iter().any(|m| m.component_id == "PC1.1"));

        svc.register_reviewer(&id, "sme", ReviewerRole::SubjectMatterExpert).unwrap();
        svc.register_reviewer(&id, "edu", ReviewerRole::EducationalExpert).unwrap();

        svc.submit_review(
            &id,
            &ReviewSubmission {
                reviewer_id: "sme".into(),
                actions: vec![accept("m1-Q1-E1"), comment("m1-Q1-E1", "Direct match", Agreement::Agree)],
                completes_pass: true,
            },
        )
        .unwrap();

        let gated = svc.comments_for(&id, "edu").unwrap_err();
        assert!(matches!(
            gated,
            ServiceError::Review(ReviewError::ReviewOrderViolation { .. })
        ));

        svc.submit_review(
            &id,
            &ReviewSubmission {
                reviewer_id: "edu".into(),
                actions: vec![ReviewAction::Reject {
                    mapping_id: "m1-Q3-KE1".into(),
                    reason: Some("practical task, not knowledge".into()),
                }],
                completes_pass: true,
            },
        )
        .unwrap();
        assert_eq!(svc.comments_for(&id, "edu").unwrap().len(), 1);
        let (thread, consensus) = svc.thread(&id, "edu", &CommentTarget::mapping("m1-Q1-E1")).unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(consensus.participants, 1);

        let decisions = svc.finalize_review(&id, "alice").unwrap();
        let q1_e1 = decisions.iter().find(|d| d.mapping_id == "m1-Q1-E1").unwrap();
        assert_eq!(q1_e1.decision, Some(DecisionKind::Accept));

        let report = svc.finalize_export(&id, "alice").unwrap();
        assert_eq!(report.summary.approved, 1);
        assert_eq!(report.summary.rejected, 1);
        assert_eq!(report.summary.pending, 8);
        assert_eq!(report.reference_title.as_deref(), Some("Workplace safety"));
        assert!(report.chain.chain_valid);
        assert!(report.to_markdown().contains("### Q2.1"));

        assert_eq!(svc.session_status(&id).unwrap().state, SessionState::Exported);
        assert!(svc.verify_audit(&id).unwrap().chain_valid);

        let err = svc.abandon(&id, "too late", "alice").unwrap_err();
        assert!(matches!(err, ServiceError::Session(SessionError::Immutable { .. })));
    }

    #[test]
    fn every_mutation_is_audited_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = mapped_session(&svc);

        let conn = svc.open_db().unwrap();
        let actions: Vec<AuditAction> = AuditLog.events(&conn, &id).unwrap().into_iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Checkpoint,
                AuditAction::Fetch,
                AuditAction::Canonicalize,
                AuditAction::Checkpoint,
                AuditAction::Extract,
                AuditAction::Checkpoint,
                AuditAction::Checkpoint,
                AuditAction::Map,
                AuditAction::Checkpoint,
            ]
        );
    }

    #[test]
    fn item_edits_are_checkpointed_until_approval() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let cancel = CancellationToken::new();
        let id = svc.create_session("X1", "alice").unwrap().session_id;
        svc.fetch_reference(&id, FetchOptions::default(), "alice").unwrap();
        svc.extract_items(&id, DOCUMENT, "alice", &cancel).unwrap();

        let edited = svc
            .edit_item(
                &id,
                &ItemEdit {
                    item_id: "Q3".into(),
                    kind: Some(ItemKind::Practical),
                    text: Some("Fit a half-face respirator.".into()),
                    ..ItemEdit::default()
                },
                "alice",
            )
            .unwrap();
        assert_eq!(edited.kind, ItemKind::Practical);

        let remaining = svc.delete_item(&id, "Q2", "alice").unwrap();
        assert_eq!(remaining.len(), 4);
        assert!(remaining.iter().all(|i| i.parent_item_id.is_none()));

        let missing = svc.delete_item(&id, "Q9", "alice").unwrap_err();
        assert!(matches!(missing, ServiceError::UnknownItem { .. }));

        let approved = svc.approve_items(&id, "alice").unwrap();
        assert_eq!(approved.len(), 4);
        assert_eq!(approved[3].text, "Fit a half-face respirator.");

        let frozen = svc
            .edit_item(
                &id,
                &ItemEdit {
                    item_id: "Q1".into(),
                    text: Some("changed".into()),
                    ..ItemEdit::default()
                },
                "alice",
            )
            .unwrap_err();
        assert!(matches!(
            frozen,
            ServiceError::Session(SessionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn out_of_order_stage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = svc.create_session("X1", "alice").unwrap().session_id;
        let err = svc
            .extract_items(&id, DOCUMENT, "alice", &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Session(SessionError::InvalidTransition { .. })));
        assert_eq!(svc.session_status(&id).unwrap().state, SessionState::Created);
    }

    #[test]
    fn cancelled_mapping_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let cancel = CancellationToken::new();
        let id = svc.create_session("X1", "alice").unwrap().session_id;
        svc.fetch_reference(&id, FetchOptions::default(), "alice").unwrap();
        svc.extract_items(&id, DOCUMENT, "alice", &cancel).unwrap();
        svc.approve_items(&id, "alice").unwrap();
        let before = svc.session_status(&id).unwrap().last_ordinal;

        cancel.cancel();
        let err = svc.map_items(&id, "alice", &cancel).unwrap_err();
        assert!(matches!(err, ServiceError::Mapping(MappingError::Cancelled { .. })));
        let status = svc.session_status(&id).unwrap();
        assert_eq!(status.state, SessionState::ItemsReviewed);
        assert_eq!(status.last_ordinal, before);
    }

    #[test]
    fn concurrent_mutation_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = svc.create_session("X1", "alice").unwrap().session_id;

        let _held = svc.sessions.acquire(&id, "map").unwrap();
        let err = svc.fetch_reference(&id, FetchOptions::default(), "bob").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Session(SessionError::SessionBusy(LockError::Busy { .. }))
        ));
        // Reads do not take the lock.
        assert_eq!(svc.session_status(&id).unwrap().state, SessionState::Created);
    }

    #[test]
    fn remap_keeps_items_and_clears_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = mapped_session(&svc);
        svc.register_reviewer(&id, "sme", ReviewerRole::SubjectMatterExpert).unwrap();
        svc.submit_review(
            &id,
            &ReviewSubmission {
                reviewer_id: "sme".into(),
                actions: vec![accept("m1-Q1-E1")],
                completes_pass: true,
            },
        )
        .unwrap();
        svc.finalize_review(&id, "alice").unwrap();

        let outcome = svc.remap_items(&id, false, "alice", &CancellationToken::new()).unwrap();
        assert!(outcome.mappings.iter().any(|m| m.mapping_id == "m2-Q1-E1"));

        let snapshot = svc.resume(&id).unwrap();
        assert_eq!(snapshot.state, SessionState::Mapped);
        assert_eq!(snapshot.mapping_run, 2);
        assert_eq!(snapshot.items.len(), 5);
        assert!(snapshot.decisions.is_empty());

        // The earlier accept targets a run-1 id and no longer applies.
        let report = svc.render_export(&id).unwrap();
        assert_eq!(report.summary.approved, 0);
    }

    #[test]
    fn failed_item_is_recorded_and_survives_resume() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_with(&dir, Arc::new(Q3DownModel));
        let id = mapped_session(&svc);

        let status = svc.session_status(&id).unwrap();
        assert_eq!(status.state, SessionState::Mapped);
        assert_eq!(status.failed_items, vec!["Q3".to_string()]);
        // Q1, Q2.1 and Q2.2 each map to E1, PC1.1 and KE1.
        assert_eq!(status.mapping_count, 9);
        assert_eq!(status.last_ordinal, 5);

        let snapshot = svc.resume(&id).unwrap();
        let mapping = snapshot.mapping.as_ref().unwrap();
        assert_eq!(mapping.failures.len(), 1);
        assert_eq!(mapping.failures[0].item_id, "Q3");
        assert_eq!(mapping.failures[0].attempts, 2);
        assert!(mapping.failures[0].reason.contains("connection refused"));
        assert_eq!(mapping.mappings_for("Q3").count(), 0);
    }

    #[test]
    fn review_progress_survives_resume() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = mapped_session(&svc);

        svc.register_reviewer(&id, "sme", ReviewerRole::SubjectMatterExpert).unwrap();
        svc.submit_review(
            &id,
            &ReviewSubmission {
                reviewer_id: "sme".into(),
                actions: vec![accept("m1-Q1-E1")],
                completes_pass: true,
            },
        )
        .unwrap();

        let snapshot = svc.resume(&id).unwrap();
        assert_eq!(snapshot.state, SessionState::Mapped);
        assert_eq!(snapshot.last_ordinal, 7);
        assert_eq!(snapshot.reviewers.len(), 1);
        assert_eq!(snapshot.reviewers[0].reviewer_id, "sme");
        assert!(snapshot.reviewers[0].has_completed_initial_pass());
        let decision = snapshot.decisions.iter().find(|d| d.mapping_id == "m1-Q1-E1").unwrap();
        assert_eq!(decision.decision, Some(DecisionKind::Accept));

        let decisions = svc.finalize_review(&id, "alice").unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.mapping_id == "m1-Q1-E1" && d.decision == Some(DecisionKind::Accept)));
        assert_eq!(svc.session_status(&id).unwrap().state, SessionState::Reviewed);
    }

    #[test]
    fn render_export_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = mapped_session(&svc);
        let before = svc.verify_audit(&id).unwrap();
        let first = svc.render_export(&id).unwrap();
        let second = svc.render_export(&id).unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        assert_eq!(svc.verify_audit(&id).unwrap(), before);
        assert_eq!(svc.session_status(&id).unwrap().state, SessionState::Mapped);
    }

    #[test]
    fn reregistering_same_role_is_not_a_new_event() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = svc.create_session("X1", "alice").unwrap().session_id;
        svc.register_reviewer(&id, "v1", ReviewerRole::Validator).unwrap();
        let events = svc.verify_audit(&id).unwrap().total_events;
        svc.register_reviewer(&id, "v1", ReviewerRole::Validator).unwrap();
        assert_eq!(svc.verify_audit(&id).unwrap().total_events, events);
        let conflict = svc.register_reviewer(&id, "v1", ReviewerRole::Assessor).unwrap_err();
        assert!(matches!(conflict, ServiceError::Review(ReviewError::RoleConflict { .. })));
    }

    #[test]
    fn sweep_protects_bound_versions() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        mapped_session(&svc);
        assert_eq!(svc.sweep_cache().unwrap(), 0);
    }

    #[test]
    fn unsupported_document_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let id = svc.create_session("X1", "alice").unwrap().session_id;
        svc.fetch_reference(&id, FetchOptions::default(), "alice").unwrap();
        let path = dir.path().join("assessment.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        let err = svc
            .extract_document(&id, &path, "alice", &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Document(DocumentError::UnsupportedFormat(_))));
    }
}
