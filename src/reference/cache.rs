//! Append-only, content-addressed store of reference dataset versions.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::CacheError;
use crate::db::{format_timestamp, parse_timestamp};
use crate::models::{CacheRecord, ReferenceComponents, ReferenceDataset};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheLookup {
    /// Return the latest version even when it is no longer fresh.
    pub allow_stale: bool,
    /// Skip the cache entirely; the caller will fetch and `put`.
    pub force_refresh: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheHit {
    Fresh(CacheRecord),
    Stale(CacheRecord),
    Miss,
}

impl CacheHit {
    pub fn record(&self) -> Option<&CacheRecord> {
        match self {
            Self::Fresh(r) | Self::Stale(r) => Some(r),
            Self::Miss => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    pub record: CacheRecord,
    /// False when the content hash matched the latest version.
    pub created_version: bool,
}

impl PutOutcome {
    pub fn current(&self) -> Option<&ReferenceDataset> {
        self.record.latest()
    }
}

/// Versioned reference cache. Versions are never overwritten or deleted.
pub trait VersionedCache: Send + Sync {
    fn get(&self, conn: &Connection, key: &str, lookup: CacheLookup) -> Result<CacheHit, CacheError>;

    /// Store a dataset. Idempotent when its hash equals the latest version's:
    /// no new version, and the existing `fetched_at` is untouched.
    fn put(&self, conn: &Connection, dataset: ReferenceDataset) -> Result<PutOutcome, CacheError>;

    fn record(&self, conn: &Connection, key: &str) -> Result<Option<CacheRecord>, CacheError>;

    fn get_by_hash(&self, conn: &Connection, key: &str, hash: &str) -> Result<Option<ReferenceDataset>, CacheError>;

    fn get_as_of(&self, conn: &Connection, key: &str, at: DateTime<Utc>) -> Result<Option<ReferenceDataset>, CacheError>;

    /// Mark the current version non-fresh until the next `put` for `key`.
    fn signal_upstream_change(&self, conn: &Connection, key: &str) -> Result<(), CacheError>;

    /// Flag superseded versions older than `cutoff` as archived, skipping any
    /// whose hash is in `referenced`. Returns how many were flagged.
    fn archive_sweep(
        &self,
        conn: &Connection,
        cutoff: DateTime<Utc>,
        referenced: &HashSet<String>,
    ) -> Result<usize, CacheError>;
}

/// SQLite-backed versioned cache.
pub struct SqliteVersionedCache {
    ttl: chrono::Duration,
}

impl SqliteVersionedCache {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl.as_secs() as i64),
        }
    }

    /// Versions flagged by the archive sweep, ascending.
    pub fn archived_versions(&self, conn: &Connection, key: &str) -> Result<Vec<u32>, CacheError> {
        let mut stmt = conn.prepare(
            "SELECT version FROM reference_datasets WHERE key = ?1 AND archived = 1 ORDER BY version",
        )?;
        let versions = stmt
            .query_map(params![key], |row| row.get::<_, u32>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    fn load_datasets(&self, conn: &Connection, key: &str) -> Result<Vec<ReferenceDataset>, CacheError> {
        let mut stmt = conn.prepare(
            "SELECT version, content_hash, fetched_at, source_locator, title, components
             FROM reference_datasets WHERE key = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(DatasetRow {
                    version: row.get(0)?,
                    content_hash: row.get(1)?,
                    fetched_at: row.get(2)?,
                    source_locator: row.get(3)?,
                    title: row.get(4)?,
                    components: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(|row| row.into_dataset(key)).collect()
    }
}

impl Default for SqliteVersionedCache {
    fn default() -> Self {
        Self::new(crate::pipeline_config::CacheConfig::default().ttl)
    }
}

struct DatasetRow {
    version: u32,
    content_hash: String,
    fetched_at: String,
    source_locator: String,
    title: Option<String>,
    components: String,
}

impl DatasetRow {
    fn into_dataset(self, key: &str) -> Result<ReferenceDataset, CacheError> {
        let components: ReferenceComponents = serde_json::from_str(&self.components)
            .map_err(|e| CacheError::CorruptVersion {
                key: key.to_string(),
                version: self.version,
                reason: e.to_string(),
            })?;
        Ok(ReferenceDataset {
            key: key.to_string(),
            version: self.version,
            fetched_at: parse_timestamp(&self.fetched_at)?,
            source_locator: self.source_locator,
            title: self.title,
            content_hash: self.content_hash,
            components,
        })
    }
}

impl VersionedCache for SqliteVersionedCache {
    fn get(&self, conn: &Connection, key: &str, lookup: CacheLookup) -> Result<CacheHit, CacheError> {
        if lookup.force_refresh {
            return Ok(CacheHit::Miss);
        }
        let Some(record) = self.record(conn, key)? else {
            return Ok(CacheHit::Miss);
        };
        if record.datasets.is_empty() {
            return Ok(CacheHit::Miss);
        }
        if record.is_fresh(Utc::now()) {
            Ok(CacheHit::Fresh(record))
        } else if lookup.allow_stale {
            Ok(CacheHit::Stale(record))
        } else {
            Ok(CacheHit::Miss)
        }
    }

    fn put(&self, conn: &Connection, dataset: ReferenceDataset) -> Result<PutOutcome, CacheError> {
        let expected = dataset.components.content_hash();
        if expected != dataset.content_hash {
            return Err(CacheError::HashMismatch {
                key: dataset.key.clone(),
                declared: dataset.content_hash.clone(),
                computed: expected,
            });
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO reference_keys (key, ttl_secs) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET ttl_secs = excluded.ttl_secs",
            params![dataset.key, self.ttl.num_seconds()],
        )?;

        let latest: Option<(u32, String)> = tx
            .query_row(
                "SELECT version, content_hash FROM reference_datasets
                 WHERE key = ?1 ORDER BY version DESC LIMIT 1",
                params![dataset.key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let created_version = match &latest {
            Some((_, hash)) if *hash == dataset.content_hash => false,
            _ => {
                let version = latest.as_ref().map(|(v, _)| v + 1).unwrap_or(1);
                let components = serde_json::to_string(&dataset.components)?;
                tx.execute(
                    "INSERT INTO reference_datasets
                     (key, version, content_hash, fetched_at, source_locator, title, components)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        dataset.key,
                        version,
                        dataset.content_hash,
                        format_timestamp(&dataset.fetched_at),
                        dataset.source_locator,
                        dataset.title,
                        components,
                    ],
                )?;
                true
            }
        };

        // Upstream delivered this content just now, so any change signal is answered.
        tx.execute(
            "UPDATE reference_keys SET upstream_changed_at = NULL WHERE key = ?1",
            params![dataset.key],
        )?;
        tx.commit()?;

        if created_version {
            tracing::info!(key = %dataset.key, hash = %dataset.content_hash, "Stored new reference version");
        } else {
            tracing::debug!(key = %dataset.key, "Reference content unchanged, no new version");
        }

        let record = self
            .record(conn, &dataset.key)?
            .ok_or_else(|| CacheError::MissingKey(dataset.key.clone()))?;
        Ok(PutOutcome {
            record,
            created_version,
        })
    }

    fn record(&self, conn: &Connection, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        let header: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT ttl_secs, upstream_changed_at FROM reference_keys WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((ttl_secs, changed)) = header else {
            return Ok(None);
        };
        let upstream_changed_at = changed.as_deref().map(parse_timestamp).transpose()?;
        Ok(Some(CacheRecord {
            key: key.to_string(),
            datasets: self.load_datasets(conn, key)?,
            ttl_secs,
            upstream_changed_at,
        }))
    }

    fn get_by_hash(&self, conn: &Connection, key: &str, hash: &str) -> Result<Option<ReferenceDataset>, CacheError> {
        Ok(self
            .record(conn, key)?
            .and_then(|r| r.by_hash(hash).cloned()))
    }

    fn get_as_of(&self, conn: &Connection, key: &str, at: DateTime<Utc>) -> Result<Option<ReferenceDataset>, CacheError> {
        Ok(self.record(conn, key)?.and_then(|r| r.as_of(at).cloned()))
    }

    fn signal_upstream_change(&self, conn: &Connection, key: &str) -> Result<(), CacheError> {
        let updated = conn.execute(
            "UPDATE reference_keys SET upstream_changed_at = ?2 WHERE key = ?1",
            params![key, format_timestamp(&Utc::now())],
        )?;
        if updated == 0 {
            return Err(CacheError::MissingKey(key.to_string()));
        }
        tracing::info!(key = %key, "Upstream change signaled");
        Ok(())
    }

    fn archive_sweep(
        &self,
        conn: &Connection,
        cutoff: DateTime<Utc>,
        referenced: &HashSet<String>,
    ) -> Result<usize, CacheError> {
        let mut stmt = conn.prepare(
            "SELECT d.key, d.version, d.content_hash FROM reference_datasets d
             WHERE d.archived = 0
               AND d.fetched_at < ?1
               AND d.version < (SELECT MAX(version) FROM reference_datasets m WHERE m.key = d.key)",
        )?;
        let candidates = stmt
            .query_map(params![format_timestamp(&cutoff)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut archived = 0;
        for (key, version, hash) in candidates {
            if referenced.contains(&hash) {
                continue;
            }
            archived += conn.execute(
                "UPDATE reference_datasets SET archived = 1 WHERE key = ?1 AND version = ?2",
                params![key, version],
            )?;
        }
        if archived > 0 {
            tracing::info!(archived, "Archived superseded reference versions");
        }
        Ok(archived)
    }
}
