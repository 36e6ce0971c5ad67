use crate::models::ItemKind;

const TRUE_FALSE_CUES: &[&str] = &["true or false", "true/false", "(t/f)"];
const SCENARIO_CUES: &[&str] = &["scenario", "case study", "read the following situation", "imagine you are"];
const PRACTICAL_CUES: &[&str] = &["demonstrate", "perform", "practical", "observe", "show how", "carry out"];
const ESSAY_CUES: &[&str] = &["explain", "discuss", "analyse", "analyze", "evaluate", "compare", "justify", "describe"];
const SHORT_ANSWER_CUES: &[&str] = &["list", "name", "identify", "define", "state", "what is", "outline", "give an example"];

/// Classify an item from its text and choices. Order matters: the more
/// specific cues are checked first.
pub fn classify_item(text: &str, choices: &[String]) -> ItemKind {
    let lower = text.to_lowercase();
    let has_any = |cues: &[&str]| cues.iter().any(|cue| lower.contains(cue));

    if has_any(TRUE_FALSE_CUES) {
        return ItemKind::TrueFalse;
    }
    if choices.len() >= 2 {
        return ItemKind::MultipleChoice;
    }
    if has_any(SCENARIO_CUES) {
        return ItemKind::Scenario;
    }
    if has_any(PRACTICAL_CUES) {
        return ItemKind::Practical;
    }
    if has_any(ESSAY_CUES) {
        return ItemKind::Essay;
    }
    if has_any(SHORT_ANSWER_CUES) {
        return ItemKind::ShortAnswer;
    }
    if lower.trim_end().ends_with('?') {
        return ItemKind::Question;
    }
    ItemKind::Unknown
}

/// Map a free-form kind label (model output) onto the enum.
pub fn parse_kind_label(label: &str) -> Option<ItemKind> {
    let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
    let kind = match normalized.as_str() {
        "mcq" | "multiple_choice" | "multichoice" => ItemKind::MultipleChoice,
        "true_false" | "truefalse" | "tf" => ItemKind::TrueFalse,
        "essay" | "long_answer" | "extended_response" => ItemKind::Essay,
        "short_answer" | "short" => ItemKind::ShortAnswer,
        "scenario" | "case_study" => ItemKind::Scenario,
        "practical" | "observation" => ItemKind::Practical,
        "question" => ItemKind::Question,
        "heading" | "section" => ItemKind::Heading,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choices_make_multiple_choice() {
        let choices = vec!["Gloves".to_string(), "Laptop".to_string()];
        assert_eq!(classify_item("Which item is PPE?", &choices), ItemKind::MultipleChoice);
    }

    #[test]
    fn true_false_beats_choices() {
        let choices = vec!["True".to_string(), "False".to_string()];
        assert_eq!(
            classify_item("True or false: gloves are PPE.", &choices),
            ItemKind::TrueFalse
        );
    }

    #[test]
    fn cue_words() {
        assert_eq!(classify_item("Read the scenario and respond.", &[]), ItemKind::Scenario);
        assert_eq!(classify_item("Demonstrate a safe lift.", &[]), ItemKind::Practical);
        assert_eq!(classify_item("Explain the hierarchy of control.", &[]), ItemKind::Essay);
        assert_eq!(classify_item("List two hazards.", &[]), ItemKind::ShortAnswer);
        assert_eq!(classify_item("Who signs off the permit?", &[]), ItemKind::Question);
        assert_eq!(classify_item("Site induction", &[]), ItemKind::Unknown);
    }

    #[test]
    fn kind_labels_from_model() {
        assert_eq!(parse_kind_label("MCQ"), Some(ItemKind::MultipleChoice));
        assert_eq!(parse_kind_label("short answer"), Some(ItemKind::ShortAnswer));
        assert_eq!(parse_kind_label("true-false"), Some(ItemKind::TrueFalse));
        assert_eq!(parse_kind_label("riddle"), None);
    }
}
