//! Cache-first reference retrieval.
//!
//! Reads go straight to the cache. A miss (or a forced refresh) takes the
//! cache-key lock, re-checks the cache, then asks the upstream source and
//! stores the canonicalized result. Writes for one key are serialized; reads
//! and other keys never wait.

use std::sync::Arc;

use rusqlite::Connection;

use super::cache::{CacheHit, CacheLookup, VersionedCache};
use super::canonical::{canonicalize_components, dedupe_components};
use super::source::ReferenceSource;
use super::FetchError;
use crate::db::now_timestamp;
use crate::locks::KeyedLocks;
use crate::models::ReferenceDataset;
use crate::pipeline_config::LockPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip the freshness check and ask upstream.
    pub force_fresh: bool,
    /// When upstream fails, serve the latest cached version even if stale.
    pub stale_on_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOrigin {
    Cache,
    Upstream,
    StaleFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub dataset: ReferenceDataset,
    pub origin: FetchOrigin,
    pub created_version: bool,
    /// Identifiers rewritten by canonicalization.
    pub ids_rewritten: usize,
}

pub struct ReferenceFetchCoordinator {
    source: Arc<dyn ReferenceSource>,
    cache: Arc<dyn VersionedCache>,
    locks: KeyedLocks,
}

/// Reference codes compare case-insensitively and ignore surrounding space.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

impl ReferenceFetchCoordinator {
    pub fn new(
        source: Arc<dyn ReferenceSource>,
        cache: Arc<dyn VersionedCache>,
        lock_policy: LockPolicy,
    ) -> Self {
        Self {
            source,
            cache,
            locks: KeyedLocks::new("reference key", lock_policy),
        }
    }

    pub fn cache(&self) -> &Arc<dyn VersionedCache> {
        &self.cache
    }

    pub fn fetch(&self, conn: &Connection, key: &str, force_fresh: bool) -> Result<ReferenceDataset, FetchError> {
        self.fetch_with(
            conn,
            key,
            FetchOptions {
                force_fresh,
                stale_on_failure: false,
            },
        )
        .map(|outcome| outcome.dataset)
    }

    pub fn fetch_with(&self, conn: &Connection, key: &str, options: FetchOptions) -> Result<FetchOutcome, FetchError> {
        let key = normalize_key(key);
        let _span = tracing::info_span!("reference_fetch", key = %key, force = options.force_fresh).entered();

        if !options.force_fresh {
            if let CacheHit::Fresh(record) = self.cache.get(conn, &key, CacheLookup::default())? {
                if let Some(dataset) = record.latest() {
                    return self.normalize_cached(conn, dataset.clone());
                }
            }
        }

        let _guard = self.locks.acquire(&key, "fetch")?;

        // Another caller may have refreshed the key while we waited.
        if !options.force_fresh {
            if let CacheHit::Fresh(record) = self.cache.get(conn, &key, CacheLookup::default())? {
                if let Some(dataset) = record.latest() {
                    return self.normalize_cached(conn, dataset.clone());
                }
            }
        }

        let payload = match self.source.fetch(&key) {
            Ok(payload) => payload,
            Err(source) => {
                tracing::warn!(key = %key, error = %source, "Upstream reference fetch failed");
                if options.stale_on_failure {
                    let lookup = CacheLookup {
                        allow_stale: true,
                        force_refresh: false,
                    };
                    if let Some(dataset) = self.cache.get(conn, &key, lookup)?.record().and_then(|r| r.latest()) {
                        tracing::warn!(key = %key, version = dataset.version, "Serving stale reference version");
                        return Ok(FetchOutcome {
                            dataset: dataset.clone(),
                            origin: FetchOrigin::StaleFallback,
                            created_version: false,
                            ids_rewritten: 0,
                        });
                    }
                }
                return Err(FetchError::ReferenceUnavailable { key, source });
            }
        };

        let locator = payload
            .source_locator
            .clone()
            .unwrap_or_else(|| format!("reference://{key}"));
        let title = payload.title.clone();
        let mut components = payload.into_components();
        let ids_rewritten = canonicalize_components(&mut components);
        let duplicates = dedupe_components(&mut components);
        if duplicates > 0 {
            tracing::warn!(key = %key, duplicates, "Dropped duplicate component ids");
        }
        if components.is_empty() {
            return Err(FetchError::EmptyReference(key));
        }

        let dataset = ReferenceDataset::new(&key, &locator, title, components, now_timestamp());
        let outcome = self.cache.put(conn, dataset)?;
        let current = outcome
            .current()
            .cloned()
            .ok_or_else(|| super::CacheError::MissingKey(key.clone()))?;

        tracing::info!(
            key = %key,
            version = current.version,
            created = outcome.created_version,
            ids_rewritten,
            "Reference fetched from upstream"
        );

        Ok(FetchOutcome {
            dataset: current,
            origin: FetchOrigin::Upstream,
            created_version: outcome.created_version,
            ids_rewritten,
        })
    }

    /// Cached versions were canonicalized on write; re-running is a no-op
    /// unless the row predates a canonicalization change, in which case the
    /// normalized content is stored as a new version.
    fn normalize_cached(&self, conn: &Connection, dataset: ReferenceDataset) -> Result<FetchOutcome, FetchError> {
        let mut components = dataset.components.clone();
        let ids_rewritten = canonicalize_components(&mut components);
        if ids_rewritten == 0 {
            return Ok(FetchOutcome {
                dataset,
                origin: FetchOrigin::Cache,
                created_version: false,
                ids_rewritten: 0,
            });
        }

        tracing::warn!(key = %dataset.key, ids_rewritten, "Cached reference needed canonicalization");
        let _guard = self.locks.acquire(&dataset.key, "normalize")?;
        let normalized = ReferenceDataset::new(
            &dataset.key,
            &dataset.source_locator,
            dataset.title.clone(),
            components,
            dataset.fetched_at,
        );
        let outcome = self.cache.put(conn, normalized)?;
        let current = outcome
            .current()
            .cloned()
            .ok_or_else(|| super::CacheError::MissingKey(dataset.key.clone()))?;
        Ok(FetchOutcome {
            dataset: current,
            origin: FetchOrigin::Cache,
            created_version: outcome.created_version,
            ids_rewritten,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::db::open_memory_database;
    use crate::reference::cache::SqliteVersionedCache;
    use crate::reference::source::{RawComponent, RawReferencePayload, SourceError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Source returning a scripted sequence of payloads, counting calls.
    pub(crate) struct ScriptedSource {
        responses: Mutex<Vec<Result<RawReferencePayload, SourceError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<RawReferencePayload, SourceError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ReferenceSource for ScriptedSource {
        fn fetch(&self, key: &str) -> Result<RawReferencePayload, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(SourceError::ReferenceNotFound(key.to_string()));
            }
            responses.remove(0)
        }
    }

    fn raw(id: &str, description: &str) -> RawComponent {
        RawComponent {
            id: Some(id.into()),
            description: description.into(),
        }
    }

    fn x1_payload() -> RawReferencePayload {
        RawReferencePayload {
            title: Some("Unit X1".into()),
            source_locator: Some("test://X1".into()),
            elements: vec![raw("E1", "Prepare for work")],
            performance_criteria: vec![raw("1.1", "Identify hazards")],
            performance_evidence: vec![raw("PEPE1", "Conduct two inspections")],
            knowledge_evidence: vec![raw("KEKE1", "Hazard types")],
        }
    }

    fn coordinator(source: Arc<ScriptedSource>) -> ReferenceFetchCoordinator {
        ReferenceFetchCoordinator::new(
            source,
            Arc::new(SqliteVersionedCache::new(Duration::from_secs(3600))),
            LockPolicy::default(),
        )
    }

    #[test]
    fn miss_fetches_upstream_and_canonicalizes() {
        let conn = open_memory_database().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(x1_payload())]));
        let coordinator = coordinator(Arc::clone(&source));

        let outcome = coordinator.fetch_with(&conn, "x1", FetchOptions::default()).unwrap();
        assert_eq!(outcome.origin, FetchOrigin::Upstream);
        assert!(outcome.created_version);
        assert_eq!(outcome.ids_rewritten, 3);
        let ids: Vec<_> = outcome.dataset.components.iter().map(|(_, c)| c.id.clone()).collect();
        assert_eq!(ids, vec!["E1", "PC1.1", "PE1", "KE1"]);
        assert_eq!(outcome.dataset.key, "X1");
    }

    #[test]
    fn fresh_hit_does_not_call_upstream() {
        let conn = open_memory_database().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(x1_payload())]));
        let coordinator = coordinator(Arc::clone(&source));

        coordinator.fetch(&conn, "X1", false).unwrap();
        let outcome = coordinator.fetch_with(&conn, "X1", FetchOptions::default()).unwrap();
        assert_eq!(outcome.origin, FetchOrigin::Cache);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_fresh_with_identical_content_keeps_version() {
        let conn = open_memory_database().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(x1_payload()), Ok(x1_payload())]));
        let coordinator = coordinator(Arc::clone(&source));

        let v1 = coordinator.fetch(&conn, "X1", false).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let outcome = coordinator
            .fetch_with(&conn, "X1", FetchOptions { force_fresh: true, stale_on_failure: false })
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(!outcome.created_version);
        assert_eq!(outcome.dataset.version, 1);
        assert_eq!(outcome.dataset.fetched_at, v1.fetched_at);
        let record = coordinator.cache().record(&conn, "X1").unwrap().unwrap();
        assert_eq!(record.datasets.len(), 1);
    }

    #[test]
    fn force_fresh_with_changed_content_appends_version() {
        let conn = open_memory_database().unwrap();
        let mut changed = x1_payload();
        changed.knowledge_evidence.push(raw("2", "Control hierarchy"));
        let source = Arc::new(ScriptedSource::new(vec![Ok(x1_payload()), Ok(changed)]));
        let coordinator = coordinator(source);

        let v1 = coordinator.fetch(&conn, "X1", false).unwrap();
        let v2 = coordinator.fetch(&conn, "X1", true).unwrap();
        assert_eq!(v2.version, 2);
        assert!(v2.components.contains(crate::models::ComponentType::KnowledgeEvidence, "KE2"));
        let old = coordinator.cache().get_by_hash(&conn, "X1", &v1.content_hash).unwrap();
        assert_eq!(old.unwrap().version, 1);
    }

    #[test]
    fn upstream_failure_surfaces_reference_unavailable() {
        let conn = open_memory_database().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Err(SourceError::SourceUnavailable(
            "connection reset".into(),
        ))]));
        let coordinator = coordinator(source);

        let err = coordinator.fetch(&conn, "X1", false).unwrap_err();
        assert!(matches!(err, FetchError::ReferenceUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let conn = open_memory_database().unwrap();
        let coordinator = coordinator(Arc::new(ScriptedSource::new(vec![])));
        let err = coordinator.fetch(&conn, "NOPE", false).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn stale_fallback_only_when_requested() {
        let conn = open_memory_database().unwrap();
        let cache = Arc::new(SqliteVersionedCache::new(Duration::from_secs(3600)));
        let mut components = x1_payload().into_components();
        canonicalize_components(&mut components);
        let old = ReferenceDataset::new("X1", "test://X1", None, components, Utc::now() - chrono::Duration::hours(5));
        cache.put(&conn, old).unwrap();

        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::SourceUnavailable("down".into())),
            Err(SourceError::SourceUnavailable("down".into())),
        ]));
        let coordinator = ReferenceFetchCoordinator::new(source, cache, LockPolicy::default());

        assert!(coordinator.fetch(&conn, "X1", false).is_err());
        let outcome = coordinator
            .fetch_with(&conn, "X1", FetchOptions { force_fresh: false, stale_on_failure: true })
            .unwrap();
        assert_eq!(outcome.origin, FetchOrigin::StaleFallback);
        assert_eq!(outcome.dataset.version, 1);
    }

    #[test]
    fn empty_payload_is_rejected() {
        let conn = open_memory_database().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(RawReferencePayload::default())]));
        let err = coordinator(source).fetch(&conn, "X1", false).unwrap_err();
        assert!(matches!(err, FetchError::EmptyReference(_)));
    }
}
