use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::ComponentType;
use crate::hashing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub description: String,
}

impl Component {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// The four component categories of one reference unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceComponents {
    pub elements: Vec<Component>,
    pub criteria: Vec<Component>,
    pub performance_evidence: Vec<Component>,
    pub knowledge_evidence: Vec<Component>,
}

impl ReferenceComponents {
    pub fn of_type(&self, component_type: ComponentType) -> &[Component] {
        match component_type {
            ComponentType::Element => &self.elements,
            ComponentType::Criterion => &self.criteria,
            ComponentType::PerformanceEvidence => &self.performance_evidence,
            ComponentType::KnowledgeEvidence => &self.knowledge_evidence,
        }
    }

    pub fn of_type_mut(&mut self, component_type: ComponentType) -> &mut Vec<Component> {
        match component_type {
            ComponentType::Element => &mut self.elements,
            ComponentType::Criterion => &mut self.criteria,
            ComponentType::PerformanceEvidence => &mut self.performance_evidence,
            ComponentType::KnowledgeEvidence => &mut self.knowledge_evidence,
        }
    }

    /// All components, in category order then declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (ComponentType, &Component)> + '_ {
        ComponentType::ALL
            .into_iter()
            .flat_map(move |t| self.of_type(t).iter().map(move |c| (t, c)))
    }

    pub fn contains(&self, component_type: ComponentType, id: &str) -> bool {
        self.of_type(component_type).iter().any(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        ComponentType::ALL.iter().map(|t| self.of_type(*t).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic digest of the components; identical content hashes equal.
    pub fn content_hash(&self) -> String {
        // Serializing plain strings and vectors cannot fail.
        hashing::digest_json(self).unwrap_or_else(|_| hashing::digest_bytes(b""))
    }
}

/// One immutable version of an external reference unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDataset {
    pub key: String,
    /// 1-based position in the key's version sequence; 0 until stored.
    #[serde(default)]
    pub version: u32,
    pub fetched_at: DateTime<Utc>,
    pub source_locator: String,
    pub title: Option<String>,
    pub content_hash: String,
    pub components: ReferenceComponents,
}

impl ReferenceDataset {
    pub fn new(
        key: &str,
        source_locator: &str,
        title: Option<String>,
        components: ReferenceComponents,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let content_hash = components.content_hash();
        Self {
            key: key.to_string(),
            version: 0,
            fetched_at,
            source_locator: source_locator.to_string(),
            title,
            content_hash,
            components,
        }
    }

    pub fn is_fresh(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now < self.fetched_at + ttl
    }
}

/// All stored versions for one key, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub datasets: Vec<ReferenceDataset>,
    pub ttl_secs: i64,
    pub upstream_changed_at: Option<DateTime<Utc>>,
}

impl CacheRecord {
    /// Most recent version, regardless of freshness.
    pub fn latest(&self) -> Option<&ReferenceDataset> {
        self.datasets.last()
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs)
    }

    /// Fresh = latest version within ttl and no upstream change signaled since it was stored.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.upstream_changed_at.is_none()
            && self.latest().is_some_and(|d| d.is_fresh(self.ttl(), now))
    }

    pub fn by_hash(&self, hash: &str) -> Option<&ReferenceDataset> {
        self.datasets.iter().rev().find(|d| d.content_hash == hash)
    }

    /// Version that was current at `at`: the latest fetched at or before it.
    pub fn as_of(&self, at: DateTime<Utc>) -> Option<&ReferenceDataset> {
        self.datasets.iter().rev().find(|d| d.fetched_at <= at)
    }
}
