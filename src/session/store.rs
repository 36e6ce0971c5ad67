//! Checkpoint persistence. Payload bodies are content-addressed: the
//! checkpoint row stores the digest, the body lives in `checkpoint_payloads`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::state::can_transition;
use super::SessionError;
use crate::db::{format_timestamp, now_timestamp, parse_timestamp};
use crate::hashing::digest_bytes;
use crate::models::{Checkpoint, CheckpointPayload, SessionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub reference_key: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Append-only checkpoint log per session. Callers hold the session lock
/// and own the surrounding transaction.
pub trait SessionCheckpointStore: Send + Sync {
    /// Register a session and write its CREATED checkpoint.
    fn create_session(
        &self,
        conn: &Connection,
        session_id: &str,
        reference_key: &str,
        actor: &str,
    ) -> Result<(SessionRecord, Checkpoint), SessionError>;

    fn session(&self, conn: &Connection, session_id: &str) -> Result<Option<SessionRecord>, SessionError>;

    fn list_sessions(&self, conn: &Connection) -> Result<Vec<SessionRecord>, SessionError>;

    /// Append the next checkpoint. Rejects transitions the state machine forbids.
    fn append(
        &self,
        conn: &Connection,
        session_id: &str,
        payload: &CheckpointPayload,
        actor: &str,
    ) -> Result<Checkpoint, SessionError>;

    /// All checkpoints, ascending by ordinal.
    fn checkpoints(&self, conn: &Connection, session_id: &str) -> Result<Vec<Checkpoint>, SessionError>;

    fn latest(&self, conn: &Connection, session_id: &str) -> Result<Option<Checkpoint>, SessionError>;

    /// Raw payload body, if stored.
    fn payload_body(&self, conn: &Connection, payload_ref: &str) -> Result<Option<String>, SessionError>;
}

pub struct SqliteCheckpointStore;

impl SqliteCheckpointStore {
    fn write_checkpoint(
        &self,
        conn: &Connection,
        session_id: &str,
        ordinal: u32,
        payload: &CheckpointPayload,
        actor: &str,
    ) -> Result<Checkpoint, SessionError> {
        let body = serde_json::to_string(payload)?;
        let payload_ref = digest_bytes(body.as_bytes());
        let timestamp = now_timestamp();

        conn.execute(
            "INSERT OR IGNORE INTO checkpoint_payloads (payload_ref, body) VALUES (?1, ?2)",
            params![payload_ref, body],
        )?;
        conn.execute(
            "INSERT INTO checkpoints (session_id, ordinal, label, payload_ref, created_at, actor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                ordinal,
                payload.state().as_str(),
                payload_ref,
                format_timestamp(&timestamp),
                actor
            ],
        )?;

        tracing::info!(
            session_id = %session_id,
            ordinal,
            state = %payload.state(),
            actor = %actor,
            "Checkpoint appended"
        );
        Ok(Checkpoint {
            session_id: session_id.to_string(),
            ordinal,
            label: payload.state(),
            payload_ref,
            timestamp,
            actor: actor.to_string(),
        })
    }
}

struct CheckpointRow {
    session_id: String,
    ordinal: u32,
    label: String,
    payload_ref: String,
    created_at: String,
    actor: String,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint, SessionError> {
        Ok(Checkpoint {
            label: SessionState::from_str(&self.label)?,
            timestamp: parse_timestamp(&self.created_at)?,
            session_id: self.session_id,
            ordinal: self.ordinal,
            payload_ref: self.payload_ref,
            actor: self.actor,
        })
    }
}

fn map_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        session_id: row.get(0)?,
        ordinal: row.get(1)?,
        label: row.get(2)?,
        payload_ref: row.get(3)?,
        created_at: row.get(4)?,
        actor: row.get(5)?,
    })
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_session_record(
    (session_id, reference_key, created_at, created_by): (String, String, String, String),
) -> Result<SessionRecord, SessionError> {
    Ok(SessionRecord {
        session_id,
        reference_key,
        created_at: parse_timestamp(&created_at)?,
        created_by,
    })
}

impl SessionCheckpointStore for SqliteCheckpointStore {
    fn create_session(
        &self,
        conn: &Connection,
        session_id: &str,
        reference_key: &str,
        actor: &str,
    ) -> Result<(SessionRecord, Checkpoint), SessionError> {
        let created_at = now_timestamp();
        conn.execute(
            "INSERT INTO sessions (session_id, reference_key, created_at, created_by) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, reference_key, format_timestamp(&created_at), actor],
        )?;
        let payload = CheckpointPayload::Created {
            reference_key: reference_key.to_string(),
        };
        let checkpoint = self.write_checkpoint(conn, session_id, 1, &payload, actor)?;
        Ok((
            SessionRecord {
                session_id: session_id.to_string(),
                reference_key: reference_key.to_string(),
                created_at,
                created_by: actor.to_string(),
            },
            checkpoint,
        ))
    }

    fn session(&self, conn: &Connection, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        let row = conn
            .query_row(
                "SELECT session_id, reference_key, created_at, created_by FROM sessions WHERE session_id = ?1",
                params![session_id],
                map_session_row,
            )
            .optional()?;
        row.map(into_session_record).transpose()
    }

    fn list_sessions(&self, conn: &Connection) -> Result<Vec<SessionRecord>, SessionError> {
        let mut stmt = conn.prepare(
            "SELECT session_id, reference_key, created_at, created_by FROM sessions ORDER BY created_at, session_id",
        )?;
        let rows = stmt.query_map([], map_session_row)?.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_session_record).collect()
    }

    fn append(
        &self,
        conn: &Connection,
        session_id: &str,
        payload: &CheckpointPayload,
        actor: &str,
    ) -> Result<Checkpoint, SessionError> {
        let latest = self
            .latest(conn, session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let to = payload.state();
        if latest.label.is_terminal() {
            return Err(SessionError::Immutable {
                session_id: session_id.to_string(),
                state: latest.label,
            });
        }
        let allowed = if payload.is_in_place() {
            to == latest.label
        } else {
            can_transition(latest.label, to, payload.is_mapping_only())
        };
        if !allowed {
            return Err(SessionError::InvalidTransition {
                session_id: session_id.to_string(),
                from: latest.label,
                to,
            });
        }
        self.write_checkpoint(conn, session_id, latest.ordinal + 1, payload, actor)
    }

    fn checkpoints(&self, conn: &Connection, session_id: &str) -> Result<Vec<Checkpoint>, SessionError> {
        let mut stmt = conn.prepare(
            "SELECT session_id, ordinal, label, payload_ref, created_at, actor
             FROM checkpoints WHERE session_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], map_checkpoint_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    fn latest(&self, conn: &Connection, session_id: &str) -> Result<Option<Checkpoint>, SessionError> {
        let row = conn
            .query_row(
                "SELECT session_id, ordinal, label, payload_ref, created_at, actor
                 FROM checkpoints WHERE session_id = ?1 ORDER BY ordinal DESC LIMIT 1",
                params![session_id],
                map_checkpoint_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    fn payload_body(&self, conn: &Connection, payload_ref: &str) -> Result<Option<String>, SessionError> {
        let body = conn
            .query_row(
                "SELECT body FROM checkpoint_payloads WHERE payload_ref = ?1",
                params![payload_ref],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(body)
    }
}
