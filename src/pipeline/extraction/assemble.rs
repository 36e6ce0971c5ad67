//! Merge per-chunk raw items into the final ordered, de-duplicated,
//! hierarchical item list.

use std::collections::{HashMap, HashSet};

use super::classify::classify_item;
use super::patterns::RawItem;
use crate::models::{normalize_text, CandidateItem, ItemKind};

/// Confidence given to a parent heading that the document never stated.
const PLACEHOLDER_CONFIDENCE: f32 = 0.3;

pub fn assemble_items(raw: Vec<RawItem>) -> Vec<CandidateItem> {
    let merged = dedupe_by_text_and_ordinal(raw);
    let with_parents = synthesize_missing_parents(merged);

    let parent_labels: HashSet<String> = with_parents
        .iter()
        .filter_map(|item| item.parent_label.clone())
        .collect();

    let mut used_ids: HashMap<String, usize> = HashMap::new();
    let mut unlabeled = 0usize;
    // Most recent main item id per label, so a reused label binds to the nearest parent.
    let mut main_ids: HashMap<String, String> = HashMap::new();
    let mut items = Vec::with_capacity(with_parents.len());

    for raw in with_parents {
        let base = if raw.label.is_empty() {
            unlabeled += 1;
            format!("Q{unlabeled}")
        } else {
            format!("Q{}", raw.label)
        };
        let item_id = unique_id(&base, &mut used_ids);

        let parent_item_id = raw
            .parent_label
            .as_ref()
            .and_then(|label| main_ids.get(label).cloned());
        if raw.parent_label.is_none() && !raw.label.is_empty() {
            main_ids.insert(raw.label.clone(), item_id.clone());
        }

        let kind = raw.kind.unwrap_or_else(|| {
            if raw.parent_label.is_none() && parent_labels.contains(&raw.label) && raw.choices.is_empty() {
                ItemKind::Heading
            } else {
                classify_item(&raw.text, &raw.choices)
            }
        });

        items.push(CandidateItem {
            item_id,
            label: raw.label,
            text: raw.text,
            ordinal: raw.ordinal,
            parent_item_id,
            kind,
            extraction_confidence: raw.confidence.clamp(0.0, 1.0),
            choices: raw.choices,
        });
    }

    group_under_parents(items)
}

/// Items seen in two overlapping chunks collapse to one; the more confident copy wins.
fn dedupe_by_text_and_ordinal(mut raw: Vec<RawItem>) -> Vec<RawItem> {
    raw.sort_by_key(|item| item.ordinal);
    let mut index: HashMap<(String, u32), usize> = HashMap::new();
    let mut out: Vec<RawItem> = Vec::with_capacity(raw.len());

    for item in raw {
        let key = (normalize_text(&item.text), item.ordinal);
        match index.get(&key) {
            Some(&pos) => {
                if item.confidence > out[pos].confidence {
                    out[pos] = item;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(item);
            }
        }
    }
    out
}

/// A sub-item whose parent never appeared gets a heading placeholder
/// positioned at the sub-item itself.
fn synthesize_missing_parents(items: Vec<RawItem>) -> Vec<RawItem> {
    let mut seen_mains: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(items.len());

    for item in items {
        match &item.parent_label {
            None => {
                if !item.label.is_empty() {
                    seen_mains.insert(item.label.clone());
                }
            }
            Some(parent) if !seen_mains.contains(parent) => {
                tracing::debug!(parent_label = %parent, ordinal = item.ordinal, "Synthesizing missing parent item");
                seen_mains.insert(parent.clone());
                out.push(RawItem {
                    label: parent.clone(),
                    parent_label: None,
                    text: format!("Item {parent}"),
                    ordinal: item.ordinal,
                    choices: Vec::new(),
                    confidence: PLACEHOLDER_CONFIDENCE,
                    kind: Some(ItemKind::Heading),
                });
            }
            Some(_) => {}
        }
        out.push(item);
    }
    out
}

fn unique_id(base: &str, used: &mut HashMap<String, usize>) -> String {
    match used.get_mut(base) {
        None => {
            used.insert(base.to_string(), 0);
            base.to_string()
        }
        Some(count) => {
            *count += 1;
            format!("{base}_{count}")
        }
    }
}

/// Each main item followed by its sub-items, mains in document order.
fn group_under_parents(items: Vec<CandidateItem>) -> Vec<CandidateItem> {
    let mut children: HashMap<String, Vec<CandidateItem>> = HashMap::new();
    let mut roots = Vec::new();
    for item in items {
        match item.parent_item_id.clone() {
            Some(parent) => children.entry(parent).or_default().push(item),
            None => roots.push(item),
        }
    }

    let mut out = Vec::new();
    for root in roots {
        let subs = children.remove(&root.item_id).unwrap_or_default();
        out.push(root);
        out.extend(subs);
    }
    out
}
