use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::enums::{ComplianceAlignment, ComponentType, MappingFlag, MappingProvenance, MappingStrength};

/// One item-to-component edge produced by the mapping stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMapping {
    pub mapping_id: String,
    pub item_id: String,
    pub component_type: ComponentType,
    /// Canonical id; empty for unparsed placeholders.
    pub component_id: String,
    pub strength: MappingStrength,
    pub confidence: f32,
    pub rationale: String,
    pub compliance_alignment: ComplianceAlignment,
    pub provenance: MappingProvenance,
    #[serde(default)]
    pub flags: Vec<MappingFlag>,
}

impl ComponentMapping {
    pub fn has_flag(&self, flag: MappingFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Counts toward coverage: parsed or repaired, and resolved against the dataset.
    pub fn is_resolved(&self) -> bool {
        !self.has_flag(MappingFlag::Unparsed) && !self.has_flag(MappingFlag::UnresolvedComponent)
    }
}

/// An item whose model calls were exhausted without a usable response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFailure {
    pub item_id: String,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentCoverage {
    pub component_type: ComponentType,
    pub component_id: String,
    /// Distinct items mapped to this component.
    pub item_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub components: Vec<ComponentCoverage>,
    /// Components no item maps to.
    pub gaps: Vec<ComponentCoverage>,
    /// Percentage of covered components per type, keyed by type name.
    pub percent_by_type: BTreeMap<String, f32>,
}

impl CoverageReport {
    pub fn is_gap(&self, component_id: &str) -> bool {
        self.gaps.iter().any(|g| g.component_id == component_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingStatistics {
    pub total_mappings: u32,
    pub average_confidence: f32,
    pub low_confidence: u32,
    pub by_strength: BTreeMap<String, u32>,
    pub by_compliance: BTreeMap<String, u32>,
    pub unparsed: u32,
    pub unresolved: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSummary {
    /// Items with no mapping to either evidence category.
    pub items_without_evidence: Vec<String>,
    /// Items whose average mapping confidence is below the threshold.
    pub low_confidence_items: Vec<String>,
    pub failed_items: Vec<String>,
}

/// Everything one mapping run produced; stored as the MAPPED checkpoint payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingOutcome {
    pub mappings: Vec<ComponentMapping>,
    pub failures: Vec<MappingFailure>,
    pub coverage: CoverageReport,
    pub statistics: MappingStatistics,
    pub compliance: ComplianceSummary,
}

impl MappingOutcome {
    pub fn mappings_for<'a>(&'a self, item_id: &'a str) -> impl Iterator<Item = &'a ComponentMapping> + 'a {
        self.mappings.iter().filter(move |m| m.item_id == item_id)
    }
}

/// A reviewer's correction to one mapping. `None` fields keep the model's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingEdit {
    pub component_id: Option<String>,
    pub strength: Option<MappingStrength>,
    pub confidence: Option<f32>,
    pub compliance_alignment: Option<ComplianceAlignment>,
    pub rationale: Option<String>,
}

impl MappingEdit {
    pub fn apply(&self, mapping: &ComponentMapping) -> ComponentMapping {
        let mut edited = mapping.clone();
        if let Some(id) = &self.component_id {
            edited.component_id = id.clone();
        }
        if let Some(strength) = self.strength {
            edited.strength = strength;
        }
        if let Some(confidence) = self.confidence {
            edited.confidence = confidence.clamp(0.0, 1.0);
        }
        if let Some(alignment) = self.compliance_alignment {
            edited.compliance_alignment = alignment;
        }
        if let Some(rationale) = &self.rationale {
            edited.rationale = rationale.clone();
        }
        edited
    }
}
