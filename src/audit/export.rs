//! Flattened, human-readable export of a session.
//!
//! Built from the replayed snapshot, the effective review decisions and the
//! audit trail. Building or rendering a report never writes anything.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::log::ChainVerification;
use super::AuditError;
use crate::hashing::digest_json;
use crate::models::{
    AuditEvent, ComponentCoverage, DecisionKind, ItemKind, MappingDecisionView, MappingFailure, MappingStatistics,
    ReviewerRecord, SessionState,
};
use crate::session::{BoundReference, SessionSnapshot};

const HIGH_CONFIDENCE: f32 = 0.8;
const LOW_CONFIDENCE: f32 = 0.7;
/// Share of low-confidence mappings above which manual review is recommended.
const LOW_CONFIDENCE_SHARE: f32 = 0.3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub total_items: usize,
    pub total_mappings: usize,
    /// Accepted or accepted with edits.
    pub approved: usize,
    pub rejected: usize,
    pub pending: usize,
    /// Percent of mappings approved.
    pub approval_rate: f32,
    pub average_confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub high_confidence: usize,
    pub medium_confidence: usize,
    pub low_confidence: usize,
    pub unparsed: u32,
    pub unresolved: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportItem {
    pub item_id: String,
    pub label: String,
    pub kind: ItemKind,
    pub text: String,
    pub mappings: Vec<MappingDecisionView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub session_id: String,
    pub state: SessionState,
    pub reference: Option<BoundReference>,
    pub reference_title: Option<String>,
    /// Highest checkpoint the report reflects.
    pub as_of_ordinal: u32,
    pub updated_at: Option<DateTime<Utc>>,
    pub summary: ExportSummary,
    pub quality: QualityMetrics,
    pub items: Vec<ExportItem>,
    pub failed_items: Vec<MappingFailure>,
    pub coverage_gaps: Vec<ComponentCoverage>,
    pub coverage_percent: BTreeMap<String, f32>,
    pub statistics: MappingStatistics,
    pub reviewers: Vec<ReviewerRecord>,
    pub recommendations: Vec<String>,
    pub chain: ChainVerification,
    pub trail: Vec<AuditEvent>,
}

impl ExportReport {
    pub fn build(
        snapshot: &SessionSnapshot,
        decisions: &[MappingDecisionView],
        reviewers: &[ReviewerRecord],
        reference_title: Option<String>,
        trail: Vec<AuditEvent>,
        chain: ChainVerification,
    ) -> Self {
        let items: Vec<ExportItem> = snapshot
            .items
            .iter()
            .map(|item| ExportItem {
                item_id: item.item_id.clone(),
                label: item.label.clone(),
                kind: item.kind,
                text: item.text.clone(),
                mappings: decisions
                    .iter()
                    .filter(|d| d.effective.item_id == item.item_id)
                    .cloned()
                    .collect(),
            })
            .collect();

        let summary = summarize(snapshot.items.len(), decisions);
        let mapping = snapshot.mapping.as_ref();
        let statistics = mapping.map(|m| m.statistics.clone()).unwrap_or_default();
        let quality = quality_metrics(decisions, &statistics);
        let coverage_gaps = mapping.map(|m| m.coverage.gaps.clone()).unwrap_or_default();
        let failed_items = mapping.map(|m| m.failures.clone()).unwrap_or_default();

        let mut recommendations = Vec::new();
        if summary.total_mappings > 0
            && quality.low_confidence as f32 > summary.total_mappings as f32 * LOW_CONFIDENCE_SHARE
        {
            recommendations.push(format!(
                "{} mappings have low confidence scores; consider manual review",
                quality.low_confidence
            ));
        }
        if !coverage_gaps.is_empty() {
            recommendations.push(format!(
                "{} components are not assessed by any item",
                coverage_gaps.len()
            ));
        }
        if !failed_items.is_empty() {
            recommendations.push(format!("{} items could not be mapped", failed_items.len()));
        }
        if !chain.chain_valid {
            recommendations.push("Audit chain failed verification; do not rely on this report".into());
        }

        Self {
            session_id: snapshot.session_id.clone(),
            state: snapshot.state,
            reference: snapshot.mapping_reference.clone().or_else(|| snapshot.reference.clone()),
            reference_title,
            as_of_ordinal: snapshot.last_ordinal,
            updated_at: snapshot.updated_at,
            summary,
            quality,
            items,
            failed_items,
            coverage_gaps,
            coverage_percent: mapping.map(|m| m.coverage.percent_by_type.clone()).unwrap_or_default(),
            statistics,
            reviewers: reviewers.to_vec(),
            recommendations,
            chain,
            trail,
        }
    }

    pub fn to_json(&self) -> Result<String, AuditError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Digest recorded in the EXPORTED checkpoint.
    pub fn report_hash(&self) -> Result<String, AuditError> {
        Ok(digest_json(self)?)
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str(&format!("# Validation report: session {}\n\n", self.session_id));
        md.push_str(&format!("- State: {}\n", self.state));
        match &self.reference {
            Some(r) => md.push_str(&format!(
                "- Reference: {} v{} ({})\n",
                r.key,
                r.version,
                self.reference_title.as_deref().unwrap_or("untitled")
            )),
            None => md.push_str("- Reference: not fetched\n"),
        }
        md.push_str(&format!("- Checkpoint: {}\n", self.as_of_ordinal));
        md.push_str(&format!(
            "- Audit chain: {} ({} events)\n\n",
            if self.chain.chain_valid { "verified" } else { "BROKEN" },
            self.chain.total_events
        ));

        md.push_str("## Summary\n\n");
        let s = &self.summary;
        md.push_str("| Items | Mappings | Approved | Rejected | Pending | Approval rate |\n");
        md.push_str("|---|---|---|---|---|---|\n");
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {:.1}% |\n\n",
            s.total_items, s.total_mappings, s.approved, s.rejected, s.pending, s.approval_rate
        ));
        md.push_str(&format!(
            "Confidence: {} high, {} medium, {} low (average {:.2}).\n\n",
            self.quality.high_confidence, self.quality.medium_confidence, self.quality.low_confidence,
            s.average_confidence
        ));

        md.push_str("## Items\n");
        for item in &self.items {
            md.push_str(&format!("\n### {} ({})\n\n{}\n\n", item.item_id, item.kind, item.text));
            if item.mappings.is_empty() {
                md.push_str("_No mappings._\n");
                continue;
            }
            for view in &item.mappings {
                let m = &view.effective;
                let target = if m.component_id.is_empty() { "unparsed" } else { m.component_id.as_str() };
                let decision = match (view.decision, view.decided_by.as_deref()) {
                    (Some(kind), Some(by)) => format!("{kind} by {by}"),
                    _ => "pending".to_string(),
                };
                md.push_str(&format!(
                    "- {} [{}] {}, confidence {:.2}, {}\n",
                    target, m.component_type, m.strength, m.confidence, decision
                ));
            }
        }

        if !self.failed_items.is_empty() {
            md.push_str("\n## Failed items\n\n");
            for failure in &self.failed_items {
                md.push_str(&format!(
                    "- {} after {} attempts: {}\n",
                    failure.item_id, failure.attempts, failure.reason
                ));
            }
        }

        md.push_str("\n## Coverage gaps\n\n");
        if self.coverage_gaps.is_empty() {
            md.push_str("None.\n");
        }
        for gap in &self.coverage_gaps {
            md.push_str(&format!("- {} ({})\n", gap.component_id, gap.component_type));
        }

        if !self.reviewers.is_empty() {
            md.push_str("\n## Reviewers\n\n");
            for reviewer in &self.reviewers {
                md.push_str(&format!("- {} ({})\n", reviewer.reviewer_id, reviewer.role));
            }
        }

        if !self.recommendations.is_empty() {
            md.push_str("\n## Recommendations\n\n");
            for r in &self.recommendations {
                md.push_str(&format!("- {r}\n"));
            }
        }

        md.push_str("\n## Audit trail\n\n");
        for event in &self.trail {
            md.push_str(&format!(
                "{}. {} {} {} `{}` ({})\n",
                event.sequence,
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.actor,
                event.action,
                event.subject,
                event.after_hash
            ));
        }
        md
    }
}

fn summarize(total_items: usize, decisions: &[MappingDecisionView]) -> ExportSummary {
    let total = decisions.len();
    let approved = decisions
        .iter()
        .filter(|d| matches!(d.decision, Some(DecisionKind::Accept | DecisionKind::Edit)))
        .count();
    let rejected = decisions
        .iter()
        .filter(|d| d.decision == Some(DecisionKind::Reject))
        .count();
    let confidence_sum: f32 = decisions.iter().map(|d| d.effective.confidence).sum();
    ExportSummary {
        total_items,
        total_mappings: total,
        approved,
        rejected,
        pending: total - approved - rejected,
        approval_rate: if total > 0 { approved as f32 / total as f32 * 100.0 } else { 0.0 },
        average_confidence: if total > 0 { confidence_sum / total as f32 } else { 0.0 },
    }
}

fn quality_metrics(decisions: &[MappingDecisionView], statistics: &MappingStatistics) -> QualityMetrics {
    let mut metrics = QualityMetrics {
        unparsed: statistics.unparsed,
        unresolved: statistics.unresolved,
        ..QualityMetrics::default()
    };
    for view in decisions {
        let c = view.effective.confidence;
        if c > HIGH_CONFIDENCE {
            metrics.high_confidence += 1;
        } else if c < LOW_CONFIDENCE {
            metrics.low_confidence += 1;
        } else {
            metrics.medium_confidence += 1;
        }
    }
    metrics
}
