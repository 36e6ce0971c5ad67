//! Post-mapping analysis: per-component coverage, gaps, statistics and the
//! compliance summary.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{
    CandidateItem, ComplianceSummary, ComponentCoverage, ComponentMapping, ComponentType, CoverageReport,
    MappingFailure, MappingFlag, MappingStatistics, ReferenceDataset,
};

/// Mappings below this confidence count as low confidence.
pub const LOW_CONFIDENCE_THRESHOLD: f32 = 0.6;

/// Count distinct items per component. Only resolved mappings count.
pub fn compute_coverage(mappings: &[ComponentMapping], dataset: &ReferenceDataset) -> CoverageReport {
    let mut items_per_component: HashMap<(ComponentType, &str), HashSet<&str>> = HashMap::new();
    for mapping in mappings.iter().filter(|m| m.is_resolved()) {
        items_per_component
            .entry((mapping.component_type, mapping.component_id.as_str()))
            .or_default()
            .insert(mapping.item_id.as_str());
    }

    let mut components = Vec::with_capacity(dataset.components.len());
    let mut covered_by_type: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    for (component_type, component) in dataset.components.iter() {
        let item_count = items_per_component
            .get(&(component_type, component.id.as_str()))
            .map_or(0, |items| items.len() as u32);
        let tally = covered_by_type.entry(component_type.as_str().to_string()).or_default();
        tally.1 += 1;
        if item_count > 0 {
            tally.0 += 1;
        }
        components.push(ComponentCoverage {
            component_type,
            component_id: component.id.clone(),
            item_count,
        });
    }

    let gaps = components.iter().filter(|c| c.item_count == 0).cloned().collect();
    let percent_by_type = covered_by_type
        .into_iter()
        .map(|(name, (covered, total))| (name, covered as f32 * 100.0 / total as f32))
        .collect();

    CoverageReport {
        components,
        gaps,
        percent_by_type,
    }
}

pub fn compute_statistics(mappings: &[ComponentMapping]) -> MappingStatistics {
    let mut stats = MappingStatistics {
        total_mappings: mappings.len() as u32,
        ..MappingStatistics::default()
    };
    let mut confidence_sum = 0.0f32;
    let mut scored = 0u32;

    for mapping in mappings {
        if mapping.has_flag(MappingFlag::Unparsed) {
            stats.unparsed += 1;
            continue;
        }
        if mapping.has_flag(MappingFlag::UnresolvedComponent) {
            stats.unresolved += 1;
        }
        confidence_sum += mapping.confidence;
        scored += 1;
        if mapping.confidence < LOW_CONFIDENCE_THRESHOLD {
            stats.low_confidence += 1;
        }
        *stats.by_strength.entry(mapping.strength.as_str().to_string()).or_default() += 1;
        *stats
            .by_compliance
            .entry(mapping.compliance_alignment.as_str().to_string())
            .or_default() += 1;
    }

    if scored > 0 {
        stats.average_confidence = confidence_sum / scored as f32;
    }
    stats
}

pub fn compliance_summary(
    items: &[CandidateItem],
    mappings: &[ComponentMapping],
    failures: &[MappingFailure],
) -> ComplianceSummary {
    let failed: HashSet<&str> = failures.iter().map(|f| f.item_id.as_str()).collect();
    let mut summary = ComplianceSummary {
        failed_items: failures.iter().map(|f| f.item_id.clone()).collect(),
        ..ComplianceSummary::default()
    };

    for item in items.iter().filter(|i| !failed.contains(i.item_id.as_str())) {
        let own: Vec<&ComponentMapping> = mappings.iter().filter(|m| m.item_id == item.item_id).collect();
        if own.is_empty() {
            continue;
        }
        let has_evidence = own
            .iter()
            .any(|m| m.is_resolved() && m.component_type.is_evidence());
        if !has_evidence {
            summary.items_without_evidence.push(item.item_id.clone());
        }
        let average = own.iter().map(|m| m.confidence).sum::<f32>() / own.len() as f32;
        if average < LOW_CONFIDENCE_THRESHOLD {
            summary.low_confidence_items.push(item.item_id.clone());
        }
    }
    summary
}
