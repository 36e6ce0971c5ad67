use serde::{Deserialize, Serialize};

use super::enums::ItemKind;

/// An extracted, human-reviewable unit (usually a question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub item_id: String,
    /// Numbering as it appears in the document ("3", "3.1"); empty when unnumbered.
    pub label: String,
    pub text: String,
    /// Position in the source text (line number); orders items across chunks.
    pub ordinal: u32,
    pub parent_item_id: Option<String>,
    pub kind: ItemKind,
    pub extraction_confidence: f32,
    #[serde(default)]
    pub choices: Vec<String>,
}

impl CandidateItem {
    pub fn is_sub_item(&self) -> bool {
        self.parent_item_id.is_some()
    }

    /// Whitespace-collapsed, lowercase text used for de-duplication.
    pub fn normalized_text(&self) -> String {
        normalize_text(&self.text)
    }
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A reviewer's change to one extracted item. `None` fields are left as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemEdit {
    pub item_id: String,
    pub text: Option<String>,
    pub kind: Option<ItemKind>,
    pub parent_item_id: Option<Option<String>>,
}

/// A chunk whose model-assisted extraction failed and fell back to rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub first_line: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(normalize_text("  What   is\tPPE? "), "what is ppe?");
    }

    #[test]
    fn sub_item_detection() {
        let item = CandidateItem {
            item_id: "Q3.1".into(),
            label: "3.1".into(),
            text: "Name one hazard".into(),
            ordinal: 7,
            parent_item_id: Some("Q3".into()),
            kind: ItemKind::ShortAnswer,
            extraction_confidence: 0.9,
            choices: vec![],
        };
        assert!(item.is_sub_item());
    }
}
