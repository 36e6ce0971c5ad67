//! Turn one free-text model response into component mappings.
//!
//! Never fails: a response that survives no repair stage becomes a single
//! `unparsed` placeholder with confidence 0.

use std::collections::HashMap;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::models::{
    ComplianceAlignment, ComponentMapping, ComponentType, MappingFlag, MappingProvenance, MappingStrength,
    ReferenceDataset,
};
use crate::pipeline::repair::{recover_json, RepairOutcome, Shape};
use crate::reference::{canonicalize_id, canonicalize_untyped};

const CATEGORY_KEYS: [(&str, ComponentType); 4] = [
    ("mapped_elements", ComponentType::Element),
    ("mapped_performance_criteria", ComponentType::Criterion),
    ("mapped_performance_evidence", ComponentType::PerformanceEvidence),
    ("mapped_knowledge_evidence", ComponentType::KnowledgeEvidence),
];

const ID_FIELDS: [&str; 8] = [
    "element_id",
    "criterion_id",
    "evidence_id",
    "knowledge_id",
    "id",
    "code",
    "element_code",
    "criterion_code",
];

/// Result of interpreting one response, with what had to be fixed along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpretedResponse {
    pub mappings: Vec<ComponentMapping>,
    pub provenance: MappingProvenance,
    pub defects: Vec<String>,
}

impl InterpretedResponse {
    pub fn is_unparsed(&self) -> bool {
        self.provenance == MappingProvenance::Unparsed
    }
}

pub fn mapping_id(run: u32, item_id: &str, component_id: &str) -> String {
    format!("m{run}-{item_id}-{component_id}")
}

/// The deterministic stand-in for an item whose response could not be read.
pub fn unparsed_placeholder(run: u32, item_id: &str, reason: &str) -> ComponentMapping {
    ComponentMapping {
        mapping_id: mapping_id(run, item_id, "unparsed"),
        item_id: item_id.to_string(),
        component_type: ComponentType::Element,
        component_id: String::new(),
        strength: MappingStrength::Weak,
        confidence: 0.0,
        rationale: format!("Model response could not be parsed: {reason}"),
        compliance_alignment: ComplianceAlignment::Minimal,
        provenance: MappingProvenance::Unparsed,
        flags: vec![MappingFlag::Unparsed],
    }
}

pub fn interpret_response(response: &str, item_id: &str, dataset: &ReferenceDataset, run: u32) -> InterpretedResponse {
    let (value, recovered_as, mut defects) = match recover_json(response, Shape::Object) {
        RepairOutcome::Direct(value) => (value, MappingProvenance::Parsed, Vec::new()),
        RepairOutcome::Repaired { value, steps } => {
            let applied: Vec<String> = steps
                .iter()
                .map(|s| serde_json::to_value(s).ok().and_then(|v| v.as_str().map(String::from)).unwrap_or_default())
                .collect();
            (value, MappingProvenance::Repaired, vec![format!("repaired: {}", applied.join(", "))])
        }
        RepairOutcome::Failed { defects } => {
            let reason = defects
                .iter()
                .map(|d| format!("{}: {}", d.stage, d.message))
                .collect::<Vec<_>>()
                .join("; ");
            return unparsed(run, item_id, reason);
        }
    };

    let Some(analysis) = find_analysis(&value) else {
        return unparsed(run, item_id, "no mapping_analysis in response".into());
    };

    let mut provenance = recovered_as;
    let mut by_component: HashMap<(ComponentType, String), ComponentMapping> = HashMap::new();
    let mut order: Vec<(ComponentType, String)> = Vec::new();

    for (key, category_type) in CATEGORY_KEYS {
        let Some(entries) = analysis.get(key).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            let Some(mapping) = entry_to_mapping(entry, category_type, item_id, dataset, run, &mut defects) else {
                continue;
            };
            if mapping.has_flag(MappingFlag::ConfidenceClamped) {
                provenance = MappingProvenance::Repaired;
            }
            let slot = (mapping.component_type, mapping.component_id.clone());
            match by_component.get(&slot) {
                Some(existing) if existing.confidence >= mapping.confidence => {}
                Some(_) => {
                    by_component.insert(slot, mapping);
                }
                None => {
                    order.push(slot.clone());
                    by_component.insert(slot, mapping);
                }
            }
        }
    }

    let mappings = order
        .into_iter()
        .filter_map(|slot| by_component.remove(&slot))
        .map(|mut m| {
            m.provenance = if m.has_flag(MappingFlag::ConfidenceClamped) {
                MappingProvenance::Repaired
            } else {
                recovered_as
            };
            m
        })
        .collect();

    if !defects.is_empty() {
        tracing::warn!(item_id = %item_id, defects = defects.len(), "Mapping response needed repair");
    }
    InterpretedResponse {
        mappings,
        provenance,
        defects,
    }
}

fn unparsed(run: u32, item_id: &str, reason: String) -> InterpretedResponse {
    tracing::warn!(item_id = %item_id, reason = %reason, "Mapping response unparseable, using placeholder");
    InterpretedResponse {
        mappings: vec![unparsed_placeholder(run, item_id, &reason)],
        provenance: MappingProvenance::Unparsed,
        defects: vec![reason],
    }
}

/// `mapping_analysis` may be nested or the categories may sit at the top level.
fn find_analysis(value: &Value) -> Option<&Map<String, Value>> {
    let object = value.as_object()?;
    if let Some(inner) = object.get("mapping_analysis").and_then(Value::as_object) {
        return Some(inner);
    }
    CATEGORY_KEYS
        .iter()
        .any(|(key, _)| object.contains_key(*key))
        .then_some(object)
}

fn entry_to_mapping(
    entry: &Value,
    category_type: ComponentType,
    item_id: &str,
    dataset: &ReferenceDataset,
    run: u32,
    defects: &mut Vec<String>,
) -> Option<ComponentMapping> {
    let raw_id = match entry {
        Value::String(s) => Some(s.clone()),
        Value::Object(fields) => ID_FIELDS.iter().find_map(|f| match fields.get(*f) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }),
        _ => None,
    };
    let Some(raw_id) = raw_id else {
        defects.push(format!("{category_type} entry without an id"));
        return None;
    };

    // An explicit prefix wins over the list the model put the entry in.
    let (component_type, component_id) =
        canonicalize_untyped(&raw_id).unwrap_or_else(|| (category_type, canonicalize_id(category_type, &raw_id)));

    let mut flags = Vec::new();
    if !dataset.components.contains(component_type, &component_id) {
        defects.push(format!("{component_id} not in {} v{}", dataset.key, dataset.version));
        flags.push(MappingFlag::UnresolvedComponent);
    }

    let strength = enum_field::<MappingStrength>(entry, &["mapping_strength", "strength"]).unwrap_or_else(|| {
        defects.push(format!("{component_id}: missing or unknown mapping_strength"));
        MappingStrength::Weak
    });

    let compliance_value = entry
        .get("asqa_validation")
        .and_then(|v| v.get("standard_1_8_compliance"))
        .or_else(|| entry.get("compliance_alignment"))
        .or_else(|| entry.get("compliance"));
    let compliance_alignment = compliance_value
        .and_then(Value::as_str)
        .and_then(|s| ComplianceAlignment::from_str(&s.trim().to_lowercase()).ok())
        .unwrap_or(ComplianceAlignment::Partial);

    let confidence = match read_confidence(entry) {
        Some(c) if (0.0..=1.0).contains(&c) => c,
        Some(c) => {
            defects.push(format!("{component_id}: confidence {c} out of range"));
            flags.push(MappingFlag::ConfidenceClamped);
            if c.is_finite() {
                c.clamp(0.0, 1.0)
            } else {
                0.0
            }
        }
        None => {
            defects.push(format!("{component_id}: missing confidence_score"));
            0.0
        }
    };

    let rationale = ["rationale", "justification", "reasoning"]
        .iter()
        .find_map(|f| entry.get(*f).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string();

    Some(ComponentMapping {
        mapping_id: mapping_id(run, item_id, &component_id),
        item_id: item_id.to_string(),
        component_type,
        component_id,
        strength,
        confidence,
        rationale,
        compliance_alignment,
        provenance: MappingProvenance::Parsed,
        flags,
    })
}

fn read_confidence(entry: &Value) -> Option<f32> {
    let value = entry.get("confidence_score").or_else(|| entry.get("confidence"))?;
    match value {
        Value::Number(n) => n.as_f64().map(|c| c as f32),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f32>().ok(),
        _ => None,
    }
}

fn enum_field<T: FromStr>(entry: &Value, fields: &[&str]) -> Option<T> {
    fields
        .iter()
        .find_map(|f| entry.get(*f).and_then(Value::as_str))
        .and_then(|s| T::from_str(&s.trim().to_lowercase()).ok())
}
