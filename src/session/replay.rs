//! Rebuild in-memory session state from the checkpoint log alone.
//!
//! Replay folds every complete checkpoint in ordinal order. A checkpoint
//! whose payload is missing, fails its digest, does not parse, or disagrees
//! with its label is skipped; the state is that of the highest complete one.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::store::SessionCheckpointStore;
use super::SessionError;
use crate::hashing::digest_bytes;
use crate::models::{
    CandidateItem, Checkpoint, CheckpointPayload, ChunkFailure, MappingDecisionView, MappingOutcome, ReviewerRecord,
    SessionState,
};

/// The reference dataset version a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundReference {
    pub key: String,
    pub content_hash: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub reference_key: String,
    pub state: SessionState,
    pub reference: Option<BoundReference>,
    pub items: Vec<CandidateItem>,
    pub chunk_failures: Vec<ChunkFailure>,
    /// True once items were approved; mapping reads only frozen items.
    pub items_frozen: bool,
    pub mapping: Option<MappingOutcome>,
    pub mapping_run: u32,
    /// Dataset the current mapping was computed against.
    pub mapping_reference: Option<BoundReference>,
    pub reviewers: Vec<ReviewerRecord>,
    pub decisions: Vec<MappingDecisionView>,
    pub export_hash: Option<String>,
    pub abandoned_reason: Option<String>,
    pub last_ordinal: u32,
    pub updated_at: Option<DateTime<Utc>>,
    pub skipped_checkpoints: Vec<u32>,
}

impl SessionSnapshot {
    fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            reference_key: String::new(),
            state: SessionState::Created,
            reference: None,
            items: Vec::new(),
            chunk_failures: Vec::new(),
            items_frozen: false,
            mapping: None,
            mapping_run: 0,
            mapping_reference: None,
            reviewers: Vec::new(),
            decisions: Vec::new(),
            export_hash: None,
            abandoned_reason: None,
            last_ordinal: 0,
            updated_at: None,
            skipped_checkpoints: Vec::new(),
        }
    }

    fn apply(&mut self, checkpoint: &Checkpoint, payload: CheckpointPayload) {
        match payload {
            CheckpointPayload::Created { reference_key } => self.reference_key = reference_key,
            CheckpointPayload::ReferenceFetched {
                reference_key,
                dataset_hash,
                dataset_version,
            } => {
                self.reference = Some(BoundReference {
                    key: reference_key,
                    content_hash: dataset_hash,
                    version: dataset_version,
                });
            }
            CheckpointPayload::ItemsExtracted {
                items, chunk_failures, ..
            } => {
                self.items = items;
                self.chunk_failures = chunk_failures;
                self.items_frozen = false;
            }
            CheckpointPayload::ItemsReviewed { items } => {
                self.items = items;
                self.items_frozen = true;
            }
            CheckpointPayload::Mapped {
                run,
                dataset_hash,
                dataset_version,
                outcome,
                ..
            } => {
                let bound = BoundReference {
                    key: self.reference_key.clone(),
                    content_hash: dataset_hash,
                    version: dataset_version,
                };
                self.reference = Some(bound.clone());
                self.mapping_reference = Some(bound);
                self.mapping = Some(outcome);
                self.mapping_run = run;
                // Decisions refer to mapping ids of the previous run.
                self.decisions.clear();
            }
            CheckpointPayload::Reviewed { reviewers, decisions }
            | CheckpointPayload::ReviewRecorded {
                reviewers, decisions, ..
            } => {
                self.reviewers = reviewers;
                self.decisions = decisions;
            }
            CheckpointPayload::Exported { report_hash } => self.export_hash = Some(report_hash),
            CheckpointPayload::Abandoned { reason } => self.abandoned_reason = Some(reason),
        }
        self.state = checkpoint.label;
        self.last_ordinal = checkpoint.ordinal;
        self.updated_at = Some(checkpoint.timestamp);
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            state: self.state,
            reference_key: self.reference_key.clone(),
            reference_version: self.reference.as_ref().map(|r| r.version),
            item_count: self.items.len(),
            mapping_count: self.mapping.as_ref().map_or(0, |m| m.mappings.len()),
            failed_items: self
                .mapping
                .as_ref()
                .map(|m| m.failures.iter().map(|f| f.item_id.clone()).collect())
                .unwrap_or_default(),
            coverage_gaps: self
                .mapping
                .as_ref()
                .map(|m| m.coverage.gaps.iter().map(|g| g.component_id.clone()).collect())
                .unwrap_or_default(),
            last_ordinal: self.last_ordinal,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only summary for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub reference_key: String,
    pub reference_version: Option<u32>,
    pub item_count: usize,
    pub mapping_count: usize,
    pub failed_items: Vec<String>,
    pub coverage_gaps: Vec<String>,
    pub last_ordinal: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fold checkpoints (with their stored bodies) into a snapshot.
pub fn replay(session_id: &str, log: &[(Checkpoint, Option<String>)]) -> Result<SessionSnapshot, SessionError> {
    let mut snapshot = SessionSnapshot::empty(session_id);
    let mut applied = 0usize;

    let mut ordered: Vec<&(Checkpoint, Option<String>)> = log.iter().collect();
    ordered.sort_by_key(|(checkpoint, _)| checkpoint.ordinal);

    for (checkpoint, body) in ordered {
        match complete_payload(checkpoint, body.as_deref()) {
            Ok(payload) => {
                snapshot.apply(checkpoint, payload);
                applied += 1;
            }
            Err(reason) => {
                tracing::warn!(
                    session_id = %session_id,
                    ordinal = checkpoint.ordinal,
                    reason = %reason,
                    "Skipping incomplete checkpoint during replay"
                );
                snapshot.skipped_checkpoints.push(checkpoint.ordinal);
            }
        }
    }

    if applied == 0 {
        return Err(SessionError::NoValidCheckpoint(session_id.to_string()));
    }
    Ok(snapshot)
}

fn complete_payload(checkpoint: &Checkpoint, body: Option<&str>) -> Result<CheckpointPayload, String> {
    let body = body.ok_or("payload missing")?;
    let digest = digest_bytes(body.as_bytes());
    if digest != checkpoint.payload_ref {
        return Err(format!("payload digest mismatch ({digest})"));
    }
    let payload: CheckpointPayload = serde_json::from_str(body).map_err(|e| format!("unreadable payload: {e}"))?;
    if payload.state() != checkpoint.label {
        return Err(format!("payload is {} but checkpoint says {}", payload.state(), checkpoint.label));
    }
    Ok(payload)
}

/// Load every checkpoint of a session and replay it.
pub fn load_snapshot(
    store: &dyn SessionCheckpointStore,
    conn: &Connection,
    session_id: &str,
) -> Result<SessionSnapshot, SessionError> {
    if store.session(conn, session_id)?.is_none() {
        return Err(SessionError::NotFound(session_id.to_string()));
    }
    let checkpoints = store.checkpoints(conn, session_id)?;
    let mut log = Vec::with_capacity(checkpoints.len());
    for checkpoint in checkpoints {
        let body = store.payload_body(conn, &checkpoint.payload_ref)?;
        log.push((checkpoint, body));
    }
    replay(session_id, &log)
}

/// Every dataset hash the session was ever bound to, read straight from the
/// stored payloads. Does not depend on a clean replay.
pub fn bound_hashes(
    store: &dyn SessionCheckpointStore,
    conn: &Connection,
    session_id: &str,
) -> Result<HashSet<String>, SessionError> {
    let mut hashes = HashSet::new();
    for checkpoint in store.checkpoints(conn, session_id)? {
        let Some(body) = store.payload_body(conn, &checkpoint.payload_ref)? else {
            continue;
        };
        match serde_json::from_str::<CheckpointPayload>(&body) {
            Ok(
                CheckpointPayload::ReferenceFetched { dataset_hash, .. }
                | CheckpointPayload::Mapped { dataset_hash, .. },
            ) => {
                hashes.insert(dataset_hash);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    ordinal = checkpoint.ordinal,
                    error = %e,
                    "Unreadable checkpoint payload while collecting bound references"
                );
            }
        }
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::models::{ItemKind, ItemRevision, MappingOutcome};
    use crate::session::store::SqliteCheckpointStore;

    fn item(id: &str) -> CandidateItem {
        CandidateItem {
            item_id: id.into(),
            label: id.trim_start_matches('Q').into(),
            text: format!("Question {id}"),
            ordinal: 1,
            parent_item_id: None,
            kind: ItemKind::ShortAnswer,
            extraction_confidence: 0.9,
            choices: vec![],
        }
    }

    fn seeded(conn: &Connection) {
        let store = SqliteCheckpointStore;
        store.create_session(conn, "s1", "X1", "alice").unwrap();
        for payload in [
            CheckpointPayload::ReferenceFetched {
                reference_key: "X1".into(),
                dataset_hash: "h1".into(),
                dataset_version: 1,
            },
            CheckpointPayload::ItemsExtracted {
                revision: ItemRevision::Extraction,
                items: vec![item("Q1"), item("Q2")],
                chunk_failures: vec![],
            },
            CheckpointPayload::ItemsExtracted {
                revision: ItemRevision::ReviewerDelete,
                items: vec![item("Q1")],
                chunk_failures: vec![],
            },
            CheckpointPayload::ItemsReviewed { items: vec![item("Q1")] },
        ] {
            store.append(conn, "s1", &payload, "alice").unwrap();
        }
    }

    #[test]
    fn replay_reconstructs_state() {
        let conn = open_memory_database().unwrap();
        seeded(&conn);
        let snapshot = load_snapshot(&SqliteCheckpointStore, &conn, "s1").unwrap();
        assert_eq!(snapshot.state, SessionState::ItemsReviewed);
        assert_eq!(snapshot.reference_key, "X1");
        assert_eq!(snapshot.reference.as_ref().unwrap().version, 1);
        assert_eq!(snapshot.items.len(), 1);
        assert!(snapshot.items_frozen);
        assert_eq!(snapshot.last_ordinal, 5);
        assert!(snapshot.skipped_checkpoints.is_empty());
    }

    #[test]
    fn replay_is_deterministic() {
        let conn = open_memory_database().unwrap();
        seeded(&conn);
        let a = load_snapshot(&SqliteCheckpointStore, &conn, "s1").unwrap();
        let b = load_snapshot(&SqliteCheckpointStore, &conn, "s1").unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[test]
    fn incomplete_tail_checkpoint_is_skipped() {
        let conn = open_memory_database().unwrap();
        seeded(&conn);
        let store = SqliteCheckpointStore;
        let mut log: Vec<(Checkpoint, Option<String>)> = store
            .checkpoints(&conn, "s1")
            .unwrap()
            .into_iter()
            .map(|c| {
                let body = store.payload_body(&conn, &c.payload_ref).unwrap();
                (c, body)
            })
            .collect();
        // Simulate a crash that wrote the checkpoint row but not its payload.
        log.last_mut().unwrap().1 = None;

        let snapshot = replay("s1", &log).unwrap();
        assert_eq!(snapshot.state, SessionState::ItemsExtracted);
        assert!(!snapshot.items_frozen);
        assert_eq!(snapshot.skipped_checkpoints, vec![5]);
    }

    #[test]
    fn tampered_payload_is_skipped() {
        let conn = open_memory_database().unwrap();
        seeded(&conn);
        let store = SqliteCheckpointStore;
        let mut log: Vec<(Checkpoint, Option<String>)> = store
            .checkpoints(&conn, "s1")
            .unwrap()
            .into_iter()
            .map(|c| {
                let body = store.payload_body(&conn, &c.payload_ref).unwrap();
                (c, body)
            })
            .collect();
        let tampered = log[2].1.as_ref().unwrap().replace("Question Q2", "Question Q9");
        log[2].1 = Some(tampered);

        let snapshot = replay("s1", &log).unwrap();
        assert_eq!(snapshot.skipped_checkpoints, vec![3]);
        assert_eq!(snapshot.state, SessionState::ItemsReviewed);
    }

    #[test]
    fn bound_hashes_cover_superseded_bindings() {
        let conn = open_memory_database().unwrap();
        seeded(&conn);
        let store = SqliteCheckpointStore;
        store
            .append(
                &conn,
                "s1",
                &CheckpointPayload::Mapped {
                    run: 1,
                    mapping_only: false,
                    dataset_hash: "h2".into(),
                    dataset_version: 2,
                    outcome: MappingOutcome::default(),
                },
                "alice",
            )
            .unwrap();

        let snapshot = load_snapshot(&store, &conn, "s1").unwrap();
        assert_eq!(snapshot.reference.as_ref().unwrap().content_hash, "h2");

        let hashes = bound_hashes(&store, &conn, "s1").unwrap();
        let expected: HashSet<String> = ["h1", "h2"].into_iter().map(String::from).collect();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn unknown_session() {
        let conn = open_memory_database().unwrap();
        assert!(matches!(
            load_snapshot(&SqliteCheckpointStore, &conn, "ghost"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn no_readable_checkpoint() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCheckpointStore;
        let (_, checkpoint) = store.create_session(&conn, "s1", "X1", "alice").unwrap();
        assert!(matches!(
            replay("s1", &[(checkpoint, None)]),
            Err(SessionError::NoValidCheckpoint(_))
        ));
    }
}
