//! Per-session hash chain of audit events.
//!
//! Event `n` hashes its own fields together with the `after_hash` of event
//! `n - 1` (or a genesis hash derived from the session id), so editing,
//! dropping or reordering any stored event breaks verification from that
//! point on. The table also rejects UPDATE and DELETE outright.

use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditError;
use crate::db::{format_timestamp, now_timestamp, parse_timestamp};
use crate::hashing::digest_parts;
use crate::models::{AuditAction, AuditEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub session_id: String,
    pub total_events: usize,
    pub chain_valid: bool,
    /// `after_hash` of the last event, if any.
    pub head_hash: Option<String>,
    pub issues: Vec<String>,
}

/// Hash every chained event starts from.
pub fn genesis_hash(session_id: &str) -> String {
    digest_parts(&["genesis", session_id])
}

#[allow(clippy::too_many_arguments)]
fn event_hash(
    before_hash: &str,
    session_id: &str,
    sequence: u64,
    actor: &str,
    action: AuditAction,
    subject: &str,
    detail: &str,
    timestamp: &str,
) -> String {
    digest_parts(&[
        before_hash,
        session_id,
        &sequence.to_string(),
        actor,
        action.as_str(),
        subject,
        detail,
        timestamp,
    ])
}

/// Stateless; callers hold the session lock and own the transaction, so the
/// event commits together with the mutation it records.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditLog;

impl AuditLog {
    pub fn append(
        &self,
        conn: &Connection,
        session_id: &str,
        actor: &str,
        action: AuditAction,
        subject: &str,
        detail: serde_json::Value,
    ) -> Result<AuditEvent, AuditError> {
        let head: Option<(i64, String)> = conn
            .query_row(
                "SELECT sequence, after_hash FROM audit_events WHERE session_id = ?1
                 ORDER BY sequence DESC LIMIT 1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (sequence, before_hash) = match head {
            Some((last, hash)) => (last as u64 + 1, hash),
            None => (1, genesis_hash(session_id)),
        };

        let timestamp = now_timestamp();
        let stamp = format_timestamp(&timestamp);
        let detail_text = serde_json::to_string(&detail)?;
        let after_hash = event_hash(
            &before_hash,
            session_id,
            sequence,
            actor,
            action,
            subject,
            &detail_text,
            &stamp,
        );
        let event_id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO audit_events (session_id, sequence, event_id, actor, action, subject, detail,
                                       timestamp, before_hash, after_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session_id,
                sequence as i64,
                event_id,
                actor,
                action.as_str(),
                subject,
                detail_text,
                stamp,
                before_hash,
                after_hash
            ],
        )?;

        tracing::debug!(session_id = %session_id, sequence, action = %action, "Audit event appended");
        Ok(AuditEvent {
            event_id,
            session_id: session_id.to_string(),
            sequence,
            actor: actor.to_string(),
            action,
            subject: subject.to_string(),
            detail,
            timestamp,
            before_hash,
            after_hash,
        })
    }

    /// All events of a session, ascending by sequence.
    pub fn events(&self, conn: &Connection, session_id: &str) -> Result<Vec<AuditEvent>, AuditError> {
        let mut stmt = conn.prepare(
            "SELECT event_id, session_id, sequence, actor, action, subject, detail, timestamp,
                    before_hash, after_hash
             FROM audit_events WHERE session_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt
            .query_map(params![session_id], map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub fn verify_chain(&self, conn: &Connection, session_id: &str) -> Result<ChainVerification, AuditError> {
        let events = self.events(conn, session_id)?;
        let verification = verify_events(session_id, &events);
        if !verification.chain_valid {
            tracing::warn!(
                session_id = %session_id,
                issues = verification.issues.len(),
                "Audit chain verification failed"
            );
        }
        Ok(verification)
    }
}

/// Recompute every link of an already-loaded chain.
pub fn verify_events(session_id: &str, events: &[AuditEvent]) -> ChainVerification {
    let mut issues = Vec::new();
    let mut expected_before = genesis_hash(session_id);

    for (index, event) in events.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if event.sequence != expected_sequence {
            issues.push(format!("event {} out of sequence (expected {expected_sequence})", event.sequence));
        }
        if event.session_id != session_id {
            issues.push(format!("event {} belongs to session {}", event.sequence, event.session_id));
        }
        if event.before_hash != expected_before {
            issues.push(format!("event {} predecessor hash mismatch", event.sequence));
        }
        let detail = serde_json::to_string(&event.detail).unwrap_or_default();
        let recomputed = event_hash(
            &event.before_hash,
            &event.session_id,
            event.sequence,
            &event.actor,
            event.action,
            &event.subject,
            &detail,
            &format_timestamp(&event.timestamp),
        );
        if recomputed != event.after_hash {
            issues.push(format!("event {} hash mismatch", event.sequence));
        }
        expected_before = event.after_hash.clone();
    }

    ChainVerification {
        session_id: session_id.to_string(),
        total_events: events.len(),
        chain_valid: issues.is_empty(),
        head_hash: events.last().map(|e| e.after_hash.clone()),
        issues,
    }
}

struct EventRow {
    event_id: String,
    session_id: String,
    sequence: i64,
    actor: String,
    action: String,
    subject: String,
    detail: String,
    timestamp: String,
    before_hash: String,
    after_hash: String,
}

impl EventRow {
    fn into_event(self) -> Result<AuditEvent, AuditError> {
        Ok(AuditEvent {
            action: AuditAction::from_str(&self.action)?,
            detail: serde_json::from_str(&self.detail)?,
            timestamp: parse_timestamp(&self.timestamp)?,
            event_id: self.event_id,
            session_id: self.session_id,
            sequence: self.sequence as u64,
            actor: self.actor,
            subject: self.subject,
            before_hash: self.before_hash,
            after_hash: self.after_hash,
        })
    }
}

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_id: row.get(0)?,
        session_id: row.get(1)?,
        sequence: row.get(2)?,
        actor: row.get(3)?,
        action: row.get(4)?,
        subject: row.get(5)?,
        detail: row.get(6)?,
        timestamp: row.get(7)?,
        before_hash: row.get(8)?,
        after_hash: row.get(9)?,
    })
}
