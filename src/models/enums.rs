use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(ComponentType {
    Element => "element",
    Criterion => "criterion",
    PerformanceEvidence => "performance_evidence",
    KnowledgeEvidence => "knowledge_evidence",
});

impl ComponentType {
    pub const ALL: [ComponentType; 4] = [
        ComponentType::Element,
        ComponentType::Criterion,
        ComponentType::PerformanceEvidence,
        ComponentType::KnowledgeEvidence,
    ];

    /// Canonical identifier prefix for this component type.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Element => "E",
            Self::Criterion => "PC",
            Self::PerformanceEvidence => "PE",
            Self::KnowledgeEvidence => "KE",
        }
    }

    /// Infer the type from an identifier's prefix. Two-letter prefixes win over `E`.
    pub fn from_prefixed_id(id: &str) -> Option<Self> {
        let upper = id.trim().to_ascii_uppercase();
        [Self::Criterion, Self::PerformanceEvidence, Self::KnowledgeEvidence, Self::Element]
            .into_iter()
            .find(|t| upper.starts_with(t.prefix()))
    }

    pub fn is_evidence(&self) -> bool {
        matches!(self, Self::PerformanceEvidence | Self::KnowledgeEvidence)
    }
}

str_enum!(MappingStrength {
    Explicit => "explicit",
    Implicit => "implicit",
    Partial => "partial",
    Weak => "weak",
});

str_enum!(ComplianceAlignment {
    Full => "full",
    Partial => "partial",
    Minimal => "minimal",
});

str_enum!(ItemKind {
    MultipleChoice => "multiple_choice",
    TrueFalse => "true_false",
    Essay => "essay",
    ShortAnswer => "short_answer",
    Scenario => "scenario",
    Practical => "practical",
    Question => "question",
    Heading => "heading",
    Unknown => "unknown",
});

str_enum!(SessionState {
    Created => "created",
    ReferenceFetched => "reference_fetched",
    ItemsExtracted => "items_extracted",
    ItemsReviewed => "items_reviewed",
    Mapped => "mapped",
    Reviewed => "reviewed",
    Exported => "exported",
    Abandoned => "abandoned",
});

impl SessionState {
    pub const ALL: [SessionState; 8] = [
        SessionState::Created,
        SessionState::ReferenceFetched,
        SessionState::ItemsExtracted,
        SessionState::ItemsReviewed,
        SessionState::Mapped,
        SessionState::Reviewed,
        SessionState::Exported,
        SessionState::Abandoned,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exported | Self::Abandoned)
    }
}

str_enum!(ReviewerRole {
    Assessor => "assessor",
    Validator => "validator",
    ComplianceOfficer => "compliance_officer",
    PeerReviewer => "peer_reviewer",
    SubjectMatterExpert => "subject_matter_expert",
    EducationalExpert => "educational_expert",
});

str_enum!(Agreement {
    Agree => "agree",
    Disagree => "disagree",
    Partial => "partial",
    Neutral => "neutral",
});

str_enum!(DecisionKind {
    Accept => "accept",
    Edit => "edit",
    Reject => "reject",
});

str_enum!(CommentTargetKind {
    Mapping => "mapping",
    Item => "item",
});

str_enum!(MappingProvenance {
    Parsed => "parsed",
    Repaired => "repaired",
    Unparsed => "unparsed",
});

str_enum!(MappingFlag {
    Unparsed => "unparsed",
    UnresolvedComponent => "unresolved_component",
    ConfidenceClamped => "confidence_clamped",
});

str_enum!(ConsensusLevel {
    Strong => "strong",
    Moderate => "moderate",
    Weak => "weak",
    NoConsensus => "no_consensus",
    NoFeedback => "no_feedback",
});

str_enum!(AuditAction {
    Fetch => "fetch",
    Canonicalize => "canonicalize",
    Extract => "extract",
    ItemEdit => "item_edit",
    ItemDelete => "item_delete",
    Map => "map",
    Checkpoint => "checkpoint",
    ReviewerRegistered => "reviewer_registered",
    ReviewAction => "review_action",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn component_type_round_trip() {
        for (variant, s) in [
            (ComponentType::Element, "element"),
            (ComponentType::Criterion, "criterion"),
            (ComponentType::PerformanceEvidence, "performance_evidence"),
            (ComponentType::KnowledgeEvidence, "knowledge_evidence"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(ComponentType::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn prefix_inference_prefers_two_letter_codes() {
        assert_eq!(ComponentType::from_prefixed_id("PC1.2"), Some(ComponentType::Criterion));
        assert_eq!(ComponentType::from_prefixed_id("pe3"), Some(ComponentType::PerformanceEvidence));
        assert_eq!(ComponentType::from_prefixed_id("KE10"), Some(ComponentType::KnowledgeEvidence));
        assert_eq!(ComponentType::from_prefixed_id("E2"), Some(ComponentType::Element));
        assert_eq!(ComponentType::from_prefixed_id("7"), None);
    }

    #[test]
    fn session_state_round_trip() {
        for (variant, s) in [
            (SessionState::Created, "created"),
            (SessionState::ReferenceFetched, "reference_fetched"),
            (SessionState::ItemsExtracted, "items_extracted"),
            (SessionState::ItemsReviewed, "items_reviewed"),
            (SessionState::Mapped, "mapped"),
            (SessionState::Reviewed, "reviewed"),
            (SessionState::Exported, "exported"),
            (SessionState::Abandoned, "abandoned"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(SessionState::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn serde_matches_as_str() {
        let json = serde_json::to_string(&ReviewerRole::SubjectMatterExpert).unwrap();
        assert_eq!(json, "\"subject_matter_expert\"");
        let json = serde_json::to_string(&MappingFlag::UnresolvedComponent).unwrap();
        assert_eq!(json, "\"unresolved_component\"");
    }

    #[test]
    fn invalid_enum_value_errors() {
        let err = MappingStrength::from_str("strong").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { .. }));
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Exported.is_terminal());
        assert!(SessionState::Abandoned.is_terminal());
        assert!(!SessionState::Reviewed.is_terminal());
    }
}
