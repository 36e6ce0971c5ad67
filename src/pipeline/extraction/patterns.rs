//! Rule-based recognition of numbered items in document lines.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::ItemKind;

static SUB_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?i:q(?:uestion)?\s*)?(\d{1,3})\.(\d{1,3})[.)]?\s+(\S.*)$").unwrap()
});
static QUESTION_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?i:question)\s+(\d{1,3})\s*[:.)\-]\s*(\S.*)$").unwrap()
});
static Q_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?i:q)(\d{1,3})\s*[:.)\-]\s*(\S.*)$").unwrap());
static MAIN_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,3})\s*[.)]\s*(\S.*)$").unwrap());
static CHOICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[A-Ha-h][.)]|\([A-Ha-h]\)|[-•*]\s*\(?[A-Ha-h]\))\s*(\S.*)$").unwrap()
});

/// Main items shorter than this are treated as noise ("3. 4.").
const MIN_MAIN_TEXT: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum LineMatch {
    Main { label: String, text: String, confidence: f32 },
    Sub { parent_label: String, label: String, text: String },
    Choice(String),
    Continuation(String),
    Blank,
}

pub fn classify_line(line: &str) -> LineMatch {
    if line.trim().is_empty() {
        return LineMatch::Blank;
    }
    if let Some(caps) = SUB_ITEM.captures(line) {
        return LineMatch::Sub {
            parent_label: caps[1].to_string(),
            label: format!("{}.{}", &caps[1], &caps[2]),
            text: caps[3].trim().to_string(),
        };
    }
    for (pattern, confidence) in [(&QUESTION_WORD, 0.95), (&Q_PREFIX, 0.9), (&MAIN_ITEM, 0.9)] {
        if let Some(caps) = pattern.captures(line) {
            let text = caps[2].trim().to_string();
            if text.chars().count() >= MIN_MAIN_TEXT {
                return LineMatch::Main {
                    label: caps[1].to_string(),
                    text,
                    confidence,
                };
            }
        }
    }
    if let Some(caps) = CHOICE.captures(line) {
        return LineMatch::Choice(caps[1].trim().to_string());
    }
    LineMatch::Continuation(line.trim().to_string())
}

/// Item recognized before ids, hierarchy and de-duplication are settled.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub label: String,
    pub parent_label: Option<String>,
    pub text: String,
    pub ordinal: u32,
    pub choices: Vec<String>,
    pub confidence: f32,
    /// Kind asserted by the extractor; classified later when absent.
    pub kind: Option<ItemKind>,
}

/// Line numbers are 1-based positions in the sanitized document.
pub fn extract_from_lines(lines: &[(u32, &str)]) -> Vec<RawItem> {
    let mut items = Vec::new();
    let mut current: Option<RawItem> = None;

    for (number, line) in lines {
        match classify_line(line) {
            LineMatch::Main { label, text, confidence } => {
                items.extend(current.take());
                current = Some(RawItem {
                    label,
                    parent_label: None,
                    text,
                    ordinal: *number,
                    choices: Vec::new(),
                    confidence,
                    kind: None,
                });
            }
            LineMatch::Sub { parent_label, label, text } => {
                items.extend(current.take());
                current = Some(RawItem {
                    label,
                    parent_label: Some(parent_label),
                    text,
                    ordinal: *number,
                    choices: Vec::new(),
                    confidence: 0.9,
                    kind: None,
                });
            }
            LineMatch::Choice(choice) => {
                if let Some(item) = current.as_mut() {
                    item.choices.push(choice);
                }
            }
            LineMatch::Continuation(text) => {
                // Prose after the choices belongs to the document, not the item.
                if let Some(item) = current.as_mut().filter(|i| i.choices.is_empty()) {
                    item.text.push(' ');
                    item.text.push_str(&text);
                }
            }
            LineMatch::Blank => {}
        }
    }
    items.extend(current);

    if items.is_empty() {
        items = question_line_fallback(lines);
    }
    items
}

/// No numbering anywhere: every line ending in '?' is a candidate.
fn question_line_fallback(lines: &[(u32, &str)]) -> Vec<RawItem> {
    lines
        .iter()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            trimmed.ends_with('?') && trimmed.split_whitespace().count() >= 3
        })
        .map(|(number, line)| RawItem {
            label: String::new(),
            parent_label: None,
            text: line.trim().to_string(),
            ordinal: *number,
            choices: Vec::new(),
            confidence: 0.5,
            kind: None,
        })
        .collect()
}

/// Pair each line with its 1-based line number.
pub fn numbered_lines(text: &str) -> Vec<(u32, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i as u32 + 1, line))
        .collect()
}
