use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::ReviewError;
use crate::db::{format_timestamp, now_timestamp, parse_timestamp};
use crate::models::{
    Agreement, CommentTarget, CommentTargetKind, DecisionKind, MappingEdit, ReviewComment, ReviewDecision,
    ReviewerRecord, ReviewerRole,
};

#[derive(Debug, Clone)]
pub struct NewComment<'a> {
    pub session_id: &'a str,
    pub reviewer_id: &'a str,
    pub role: ReviewerRole,
    pub target: &'a CommentTarget,
    pub body: &'a str,
    pub agreement: Agreement,
    pub supersedes: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct NewDecision<'a> {
    pub session_id: &'a str,
    pub reviewer_id: &'a str,
    pub mapping_id: &'a str,
    pub kind: DecisionKind,
    pub edit: Option<&'a MappingEdit>,
    pub reason: Option<&'a str>,
}

/// Review records. Comments and decisions are append-only; the only
/// update is setting a reviewer's initial-pass timestamp once.
pub trait ReviewStore: Send + Sync {
    fn register_reviewer(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
        role: ReviewerRole,
    ) -> Result<ReviewerRecord, ReviewError>;

    fn reviewer(&self, conn: &Connection, session_id: &str, reviewer_id: &str)
        -> Result<Option<ReviewerRecord>, ReviewError>;

    fn reviewers(&self, conn: &Connection, session_id: &str) -> Result<Vec<ReviewerRecord>, ReviewError>;

    /// Returns false when the pass was already recorded.
    fn mark_initial_pass(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, ReviewError>;

    fn insert_comment(&self, conn: &Connection, comment: NewComment<'_>) -> Result<ReviewComment, ReviewError>;

    fn insert_decision(&self, conn: &Connection, decision: NewDecision<'_>) -> Result<ReviewDecision, ReviewError>;

    fn comment(&self, conn: &Connection, session_id: &str, comment_id: &str) -> Result<Option<ReviewComment>, ReviewError>;

    /// Every comment on the session in submission order. Ungated.
    fn comments(&self, conn: &Connection, session_id: &str) -> Result<Vec<ReviewComment>, ReviewError>;

    /// Every decision on the session in submission order. Ungated.
    fn decisions(&self, conn: &Connection, session_id: &str) -> Result<Vec<ReviewDecision>, ReviewError>;
}

pub struct SqliteReviewStore;

const COMMENT_COLUMNS: &str =
    "seq, comment_id, session_id, reviewer_id, role, target_kind, target_id, body, agreement, supersedes, created_at";

const DECISION_COLUMNS: &str = "seq, decision_id, session_id, reviewer_id, mapping_id, decision, edit, reason, created_at";

struct CommentRow {
    seq: i64,
    comment_id: String,
    session_id: String,
    reviewer_id: String,
    role: String,
    target_kind: String,
    target_id: String,
    body: String,
    agreement: String,
    supersedes: Option<String>,
    created_at: String,
}

impl CommentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            comment_id: row.get(1)?,
            session_id: row.get(2)?,
            reviewer_id: row.get(3)?,
            role: row.get(4)?,
            target_kind: row.get(5)?,
            target_id: row.get(6)?,
            body: row.get(7)?,
            agreement: row.get(8)?,
            supersedes: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_comment(self) -> Result<ReviewComment, ReviewError> {
        Ok(ReviewComment {
            comment_id: self.comment_id,
            session_id: self.session_id,
            reviewer_id: self.reviewer_id,
            role: ReviewerRole::from_str(&self.role)?,
            target: CommentTarget {
                kind: CommentTargetKind::from_str(&self.target_kind)?,
                id: self.target_id,
            },
            body: self.body,
            agreement: Agreement::from_str(&self.agreement)?,
            supersedes: self.supersedes,
            created_at: parse_timestamp(&self.created_at)?,
            seq: self.seq,
        })
    }
}

struct DecisionRow {
    seq: i64,
    decision_id: String,
    session_id: String,
    reviewer_id: String,
    mapping_id: String,
    decision: String,
    edit: Option<String>,
    reason: Option<String>,
    created_at: String,
}

impl DecisionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            decision_id: row.get(1)?,
            session_id: row.get(2)?,
            reviewer_id: row.get(3)?,
            mapping_id: row.get(4)?,
            decision: row.get(5)?,
            edit: row.get(6)?,
            reason: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_decision(self) -> Result<ReviewDecision, ReviewError> {
        let edit = self.edit.as_deref().map(serde_json::from_str::<MappingEdit>).transpose()?;
        Ok(ReviewDecision {
            decision_id: self.decision_id,
            session_id: self.session_id,
            reviewer_id: self.reviewer_id,
            mapping_id: self.mapping_id,
            kind: DecisionKind::from_str(&self.decision)?,
            edit,
            reason: self.reason,
            created_at: parse_timestamp(&self.created_at)?,
            seq: self.seq,
        })
    }
}

fn reviewer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_reviewer(
    (reviewer_id, role, registered_at, initial_pass_at): (String, String, String, Option<String>),
) -> Result<ReviewerRecord, ReviewError> {
    Ok(ReviewerRecord {
        reviewer_id,
        role: ReviewerRole::from_str(&role)?,
        registered_at: parse_timestamp(&registered_at)?,
        initial_pass_at: initial_pass_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

impl ReviewStore for SqliteReviewStore {
    fn register_reviewer(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
        role: ReviewerRole,
    ) -> Result<ReviewerRecord, ReviewError> {
        if let Some(existing) = self.reviewer(conn, session_id, reviewer_id)? {
            if existing.role != role {
                return Err(ReviewError::RoleConflict {
                    reviewer_id: reviewer_id.to_string(),
                    existing: existing.role,
                });
            }
            return Ok(existing);
        }
        let registered_at = now_timestamp();
        conn.execute(
            "INSERT INTO reviewers (session_id, reviewer_id, role, registered_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, reviewer_id, role.as_str(), format_timestamp(&registered_at)],
        )?;
        Ok(ReviewerRecord {
            reviewer_id: reviewer_id.to_string(),
            role,
            registered_at,
            initial_pass_at: None,
        })
    }

    fn reviewer(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
    ) -> Result<Option<ReviewerRecord>, ReviewError> {
        let row = conn
            .query_row(
                "SELECT reviewer_id, role, registered_at, initial_pass_at
                 FROM reviewers WHERE session_id = ?1 AND reviewer_id = ?2",
                params![session_id, reviewer_id],
                reviewer_from_row,
            )
            .optional()?;
        row.map(into_reviewer).transpose()
    }

    fn reviewers(&self, conn: &Connection, session_id: &str) -> Result<Vec<ReviewerRecord>, ReviewError> {
        let mut stmt = conn.prepare(
            "SELECT reviewer_id, role, registered_at, initial_pass_at
             FROM reviewers WHERE session_id = ?1 ORDER BY registered_at, reviewer_id",
        )?;
        let rows = stmt
            .query_map(params![session_id], reviewer_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_reviewer).collect()
    }

    fn mark_initial_pass(
        &self,
        conn: &Connection,
        session_id: &str,
        reviewer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, ReviewError> {
        let changed = conn.execute(
            "UPDATE reviewers SET initial_pass_at = ?3
             WHERE session_id = ?1 AND reviewer_id = ?2 AND initial_pass_at IS NULL",
            params![session_id, reviewer_id, format_timestamp(&at)],
        )?;
        Ok(changed == 1)
    }

    fn insert_comment(&self, conn: &Connection, comment: NewComment<'_>) -> Result<ReviewComment, ReviewError> {
        let comment_id = Uuid::new_v4().to_string();
        let created_at = now_timestamp();
        conn.execute(
            "INSERT INTO review_comments
             (comment_id, session_id, reviewer_id, role, target_kind, target_id, body, agreement, supersedes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                comment_id,
                comment.session_id,
                comment.reviewer_id,
                comment.role.as_str(),
                comment.target.kind.as_str(),
                comment.target.id,
                comment.body,
                comment.agreement.as_str(),
                comment.supersedes,
                format_timestamp(&created_at),
            ],
        )?;
        Ok(ReviewComment {
            comment_id,
            session_id: comment.session_id.to_string(),
            reviewer_id: comment.reviewer_id.to_string(),
            role: comment.role,
            target: comment.target.clone(),
            body: comment.body.to_string(),
            agreement: comment.agreement,
            supersedes: comment.supersedes.map(String::from),
            created_at,
            seq: conn.last_insert_rowid(),
        })
    }

    fn insert_decision(&self, conn: &Connection, decision: NewDecision<'_>) -> Result<ReviewDecision, ReviewError> {
        let decision_id = Uuid::new_v4().to_string();
        let created_at = now_timestamp();
        let edit_json = decision.edit.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO review_decisions
             (decision_id, session_id, reviewer_id, mapping_id, decision, edit, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                decision_id,
                decision.session_id,
                decision.reviewer_id,
                decision.mapping_id,
                decision.kind.as_str(),
                edit_json,
                decision.reason,
                format_timestamp(&created_at),
            ],
        )?;
        Ok(ReviewDecision {
            decision_id,
            session_id: decision.session_id.to_string(),
            reviewer_id: decision.reviewer_id.to_string(),
            mapping_id: decision.mapping_id.to_string(),
            kind: decision.kind,
            edit: decision.edit.cloned(),
            reason: decision.reason.map(String::from),
            created_at,
            seq: conn.last_insert_rowid(),
        })
    }

    fn comment(&self, conn: &Connection, session_id: &str, comment_id: &str) -> Result<Option<ReviewComment>, ReviewError> {
        let row = conn
            .query_row(
                &format!("SELECT {COMMENT_COLUMNS} FROM review_comments WHERE session_id = ?1 AND comment_id = ?2"),
                params![session_id, comment_id],
                CommentRow::from_row,
            )
            .optional()?;
        row.map(CommentRow::into_comment).transpose()
    }

    fn comments(&self, conn: &Connection, session_id: &str) -> Result<Vec<ReviewComment>, ReviewError> {
        let mut stmt =
            conn.prepare(&format!("SELECT {COMMENT_COLUMNS} FROM review_comments WHERE session_id = ?1 ORDER BY seq"))?;
        let rows = stmt
            .query_map(params![session_id], CommentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CommentRow::into_comment).collect()
    }

    fn decisions(&self, conn: &Connection, session_id: &str) -> Result<Vec<ReviewDecision>, ReviewError> {
        let mut stmt = conn
            .prepare(&format!("SELECT {DECISION_COLUMNS} FROM review_decisions WHERE session_id = ?1 ORDER BY seq"))?;
        let rows = stmt
            .query_map(params![session_id], DecisionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(DecisionRow::into_decision).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::session::{SessionCheckpointStore, SqliteCheckpointStore};

    fn setup() -> Connection {
        let conn = open_memory_database().unwrap();
        SqliteCheckpointStore.create_session(&conn, "s1", "X1", "alice").unwrap();
        conn
    }

    #[test]
    fn register_is_idempotent_per_role() {
        let conn = setup();
        let store = SqliteReviewStore;
        let first = store
            .register_reviewer(&conn, "s1", "sme", ReviewerRole::SubjectMatterExpert)
            .unwrap();
        let again = store
            .register_reviewer(&conn, "s1", "sme", ReviewerRole::SubjectMatterExpert)
            .unwrap();
        assert_eq!(first, again);
        assert!(matches!(
            store.register_reviewer(&conn, "s1", "sme", ReviewerRole::Validator),
            Err(ReviewError::RoleConflict { .. })
        ));
    }

    #[test]
    fn initial_pass_is_set_once() {
        let conn = setup();
        let store = SqliteReviewStore;
        store.register_reviewer(&conn, "s1", "sme", ReviewerRole::SubjectMatterExpert).unwrap();
        assert!(store.mark_initial_pass(&conn, "s1", "sme", now_timestamp()).unwrap());
        assert!(!store.mark_initial_pass(&conn, "s1", "sme", now_timestamp()).unwrap());
        assert!(store.reviewer(&conn, "s1", "sme").unwrap().unwrap().has_completed_initial_pass());
    }

    #[test]
    fn comments_round_trip_in_order() {
        let conn = setup();
        let store = SqliteReviewStore;
        let target = CommentTarget::mapping("m1-Q1-E1");
        let first = store
            .insert_comment(
                &conn,
                NewComment {
                    session_id: "s1",
                    reviewer_id: "sme",
                    role: ReviewerRole::SubjectMatterExpert,
                    target: &target,
                    body: "Strong link",
                    agreement: Agreement::Agree,
                    supersedes: None,
                },
            )
            .unwrap();
        let second = store
            .insert_comment(
                &conn,
                NewComment {
                    session_id: "s1",
                    reviewer_id: "sme",
                    role: ReviewerRole::SubjectMatterExpert,
                    target: &target,
                    body: "Actually only partial",
                    agreement: Agreement::Partial,
                    supersedes: Some(&first.comment_id),
                },
            )
            .unwrap();
        assert!(second.seq > first.seq);

        let all = store.comments(&conn, "s1").unwrap();
        assert_eq!(all, vec![first.clone(), second.clone()]);
        assert_eq!(store.comment(&conn, "s1", &first.comment_id).unwrap(), Some(first));
    }

    #[test]
    fn decisions_round_trip_with_edit() {
        let conn = setup();
        let store = SqliteReviewStore;
        let edit = MappingEdit {
            confidence: Some(0.4),
            ..MappingEdit::default()
        };
        let stored = store
            .insert_decision(
                &conn,
                NewDecision {
                    session_id: "s1",
                    reviewer_id: "validator",
                    mapping_id: "m1-Q1-E1",
                    kind: DecisionKind::Edit,
                    edit: Some(&edit),
                    reason: None,
                },
            )
            .unwrap();
        assert_eq!(store.decisions(&conn, "s1").unwrap(), vec![stored]);
    }

    #[test]
    fn review_records_are_append_only() {
        let conn = setup();
        let store = SqliteReviewStore;
        let target = CommentTarget::item("Q1");
        store
            .insert_comment(
                &conn,
                NewComment {
                    session_id: "s1",
                    reviewer_id: "sme",
                    role: ReviewerRole::SubjectMatterExpert,
                    target: &target,
                    body: "ok",
                    agreement: Agreement::Neutral,
                    supersedes: None,
                },
            )
            .unwrap();
        assert!(conn.execute("UPDATE review_comments SET body = 'changed'", []).is_err());
        assert!(conn.execute("DELETE FROM review_comments", []).is_err());
    }
}
