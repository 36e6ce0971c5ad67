use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Component, ComponentType, ReferenceComponents};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Reference '{0}' not found upstream")]
    ReferenceNotFound(String),

    #[error("Reference source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed reference payload: {0}")]
    MalformedPayload(String),
}

/// External provider of reference units, addressed by code.
pub trait ReferenceSource: Send + Sync {
    fn fetch(&self, key: &str) -> Result<RawReferencePayload, SourceError>;
}

/// One entry as delivered upstream. Elements use `id`, the rest `code`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawComponent {
    #[serde(default, alias = "code")]
    pub id: Option<String>,
    #[serde(default, alias = "title", alias = "text")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReferencePayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "url")]
    pub source_locator: Option<String>,
    #[serde(default)]
    pub elements: Vec<RawComponent>,
    #[serde(default, alias = "criteria")]
    pub performance_criteria: Vec<RawComponent>,
    #[serde(default)]
    pub performance_evidence: Vec<RawComponent>,
    #[serde(default)]
    pub knowledge_evidence: Vec<RawComponent>,
}

impl RawReferencePayload {
    /// Convert to components, dropping entries without a description.
    /// Identifiers are left as delivered; canonicalization runs afterwards.
    pub fn into_components(self) -> ReferenceComponents {
        let mut components = ReferenceComponents::default();
        let lists = [
            (ComponentType::Element, self.elements),
            (ComponentType::Criterion, self.performance_criteria),
            (ComponentType::PerformanceEvidence, self.performance_evidence),
            (ComponentType::KnowledgeEvidence, self.knowledge_evidence),
        ];
        for (component_type, raw) in lists {
            let target = components.of_type_mut(component_type);
            target.extend(
                raw.into_iter()
                    .filter(|r| !r.description.trim().is_empty())
                    .map(|r| Component::new(r.id.unwrap_or_default(), r.description.trim())),
            );
        }
        components
    }
}

// ═══════════════════════════════════════════════════════════
// HTTP source
// ═══════════════════════════════════════════════════════════

/// Fetches `{base_url}/{key}` and expects a `RawReferencePayload` JSON body.
pub struct HttpReferenceSource {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpReferenceSource {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::SourceUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim())
    }
}

impl ReferenceSource for HttpReferenceSource {
    fn fetch(&self, key: &str) -> Result<RawReferencePayload, SourceError> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SourceError::SourceUnavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::ReferenceNotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(SourceError::SourceUnavailable(format!(
                "HTTP {} from {url}",
                status.as_u16()
            )));
        }

        let mut payload: RawReferencePayload = response
            .json()
            .map_err(|e| SourceError::MalformedPayload(e.to_string()))?;
        if payload.source_locator.is_none() {
            payload.source_locator = Some(url);
        }
        Ok(payload)
    }
}
