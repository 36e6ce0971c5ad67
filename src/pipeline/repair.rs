//! Lenient JSON recovery for model output.
//!
//! Attempts, in order: direct parse, the most plausible structured substring
//! (first opening bracket to its matching close), then syntactic repair of
//! common malformations. Each stage that fails leaves a `ParseDefect`; the
//! defects never escape as errors, callers decide on a fallback.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",(\s*[}\]])").unwrap());
static ADJACENT_OBJECTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\}(\s*)\{").unwrap());
static ADJACENT_ARRAYS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\](\s*)\[").unwrap());
static ADJACENT_MEMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"("|\d|true|false|null|\}|\])(\s*\n\s*)""#).unwrap());
static PYTHON_LITERALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\s*)(True|False|None)\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    CodeFence,
    Substring,
    TrailingComma,
    MissingComma,
    ControlCharacters,
    UnescapedQuotes,
    PythonLiterals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    Array,
}

impl Shape {
    fn delimiters(&self) -> (char, char) {
        match self {
            Shape::Object => ('{', '}'),
            Shape::Array => ('[', ']'),
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Shape::Object => value.is_object(),
            Shape::Array => value.is_array(),
        }
    }
}

/// Why one recovery stage did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseDefect {
    pub stage: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    Direct(Value),
    Repaired { value: Value, steps: Vec<RepairStep> },
    Failed { defects: Vec<ParseDefect> },
}

impl RepairOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Direct(v) | Self::Repaired { value: v, .. } => Some(v),
            Self::Failed { .. } => None,
        }
    }
}

/// Recover a JSON value of the expected shape from free text.
pub fn recover_json(text: &str, shape: Shape) -> RepairOutcome {
    let mut defects = Vec::new();

    match try_parse(text.trim(), shape) {
        Ok(value) => return RepairOutcome::Direct(value),
        Err(message) => defects.push(ParseDefect { stage: "direct", message }),
    }

    let mut steps = Vec::new();
    let mut candidate = text.trim().to_string();
    if let Some(unfenced) = strip_code_fence(&candidate) {
        candidate = unfenced;
        steps.push(RepairStep::CodeFence);
    }

    match extract_structured_substring(&candidate, shape) {
        Some(sub) => {
            if sub != candidate {
                steps.push(RepairStep::Substring);
            }
            candidate = sub;
        }
        None => {
            defects.push(ParseDefect {
                stage: "substring",
                message: format!("no {:?} delimiters found", shape),
            });
            return RepairOutcome::Failed { defects };
        }
    }

    match try_parse(&candidate, shape) {
        Ok(value) => return RepairOutcome::Repaired { value, steps },
        Err(message) => defects.push(ParseDefect { stage: "substring", message }),
    }

    let (repaired, syntax_steps) = repair_syntax(&candidate);
    steps.extend(syntax_steps);
    match try_parse(&repaired, shape) {
        Ok(value) => RepairOutcome::Repaired { value, steps },
        Err(message) => {
            defects.push(ParseDefect { stage: "syntax", message });
            RepairOutcome::Failed { defects }
        }
    }
}

fn try_parse(text: &str, shape: Shape) -> Result<Value, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    if shape.matches(&value) {
        Ok(value)
    } else {
        Err(format!("expected {:?}, found other JSON value", shape))
    }
}

fn strip_code_fence(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip a language tag on the fence line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].trim().to_string())
}

/// From the first opening delimiter to its matching close, skipping
/// delimiters inside strings. Truncated output falls back to the last close.
pub fn extract_structured_substring(text: &str, shape: Shape) -> Option<String> {
    let (open, close) = shape.delimiters();
    let start = text.find(open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    let end = text.rfind(close)?;
    (end > start).then(|| text[start..=end].to_string())
}

/// Apply every syntactic repair; report the ones that changed something.
pub fn repair_syntax(text: &str) -> (String, Vec<RepairStep>) {
    let mut steps = Vec::new();
    let mut current = text.to_string();

    let (escaped, quote_fixes, control_fixes) = escape_string_contents(&current);
    if quote_fixes > 0 {
        steps.push(RepairStep::UnescapedQuotes);
    }
    if control_fixes > 0 {
        steps.push(RepairStep::ControlCharacters);
    }
    current = escaped;

    let next = TRAILING_COMMA.replace_all(&current, "$1").into_owned();
    if next != current {
        steps.push(RepairStep::TrailingComma);
        current = next;
    }

    let mut next = ADJACENT_OBJECTS.replace_all(&current, "},$1{").into_owned();
    next = ADJACENT_ARRAYS.replace_all(&next, "],$1[").into_owned();
    next = ADJACENT_MEMBERS.replace_all(&next, "$1,$2\"").into_owned();
    if next != current {
        steps.push(RepairStep::MissingComma);
        current = next;
    }

    let next = PYTHON_LITERALS
        .replace_all(&current, |caps: &regex::Captures| {
            let literal = match &caps[2] {
                "True" => "true",
                "False" => "false",
                _ => "null",
            };
            format!(":{}{}", &caps[1], literal)
        })
        .into_owned();
    if next != current {
        steps.push(RepairStep::PythonLiterals);
        current = next;
    }

    (current, steps)
}

/// Walk the text tracking string state. Inside strings: escape raw control
/// characters, and escape a quote that is not followed by a structural
/// character (it cannot be the closing quote).
fn escape_string_contents(text: &str) -> (String, usize, usize) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut quote_fixes = 0;
    let mut control_fixes = 0;

    for (i, &c) in chars.iter().enumerate() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                let rest = &chars[i + 1..];
                let gap = rest.iter().take_while(|n| n.is_whitespace()).count();
                let next = rest.get(gap);
                // A quote followed by a line break and another quote closes a
                // member whose separating comma is missing.
                let newline_then_quote = next == Some(&'"') && rest[..gap].contains(&'\n');
                if newline_then_quote || matches!(next, None | Some(',') | Some('}') | Some(']') | Some(':')) {
                    in_string = false;
                    out.push(c);
                } else {
                    quote_fixes += 1;
                    out.push_str("\\\"");
                }
            }
            '\n' => {
                control_fixes += 1;
                out.push_str("\\n");
            }
            '\t' => {
                control_fixes += 1;
                out.push_str("\\t");
            }
            c if c.is_control() => control_fixes += 1,
            c => out.push(c),
        }
    }
    (out, quote_fixes, control_fixes)
}
