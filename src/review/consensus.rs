use std::collections::{BTreeMap, HashSet};

use crate::models::{Agreement, CommentTarget, ConsensusLevel, ReviewComment, ThreadConsensus};

/// Share of `agree` among current comments needed for each level.
const STRONG: f32 = 0.8;
const MODERATE: f32 = 0.6;
const WEAK: f32 = 0.4;

pub fn consensus_level(agree_ratio: f32, current_comments: usize) -> ConsensusLevel {
    if current_comments == 0 {
        ConsensusLevel::NoFeedback
    } else if agree_ratio >= STRONG {
        ConsensusLevel::Strong
    } else if agree_ratio >= MODERATE {
        ConsensusLevel::Moderate
    } else if agree_ratio >= WEAK {
        ConsensusLevel::Weak
    } else {
        ConsensusLevel::NoConsensus
    }
}

/// Consensus over one thread. Superseded comments no longer vote.
pub fn thread_consensus(target: &CommentTarget, comments: &[ReviewComment]) -> ThreadConsensus {
    let thread: Vec<&ReviewComment> = comments.iter().filter(|c| &c.target == target).collect();
    let superseded: HashSet<&str> = thread.iter().filter_map(|c| c.supersedes.as_deref()).collect();
    let current: Vec<&&ReviewComment> = thread
        .iter()
        .filter(|c| !superseded.contains(c.comment_id.as_str()))
        .collect();

    let mut distribution: BTreeMap<String, u32> = BTreeMap::new();
    for comment in &current {
        *distribution.entry(comment.agreement.as_str().to_string()).or_default() += 1;
    }
    let agrees = current.iter().filter(|c| c.agreement == Agreement::Agree).count();
    let agree_ratio = if current.is_empty() {
        0.0
    } else {
        agrees as f32 / current.len() as f32
    };
    let participants = thread.iter().map(|c| c.reviewer_id.as_str()).collect::<HashSet<_>>().len() as u32;

    ThreadConsensus {
        target: target.clone(),
        level: consensus_level(agree_ratio, current.len()),
        agree_ratio,
        participants,
        distribution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReviewerRole;
    use chrono::Utc;

    fn comment(id: &str, reviewer: &str, agreement: Agreement, supersedes: Option<&str>) -> ReviewComment {
        ReviewComment {
            comment_id: id.into(),
            session_id: "s1".into(),
            reviewer_id: reviewer.into(),
            role: ReviewerRole::Validator,
            target: CommentTarget::mapping("m1-Q1-E1"),
            body: "note".into(),
            agreement,
            supersedes: supersedes.map(String::from),
            created_at: Utc::now(),
            seq: 0,
        }
    }

    #[test]
    fn thresholds() {
        assert_eq!(consensus_level(0.0, 0), ConsensusLevel::NoFeedback);
        assert_eq!(consensus_level(0.8, 5), ConsensusLevel::Strong);
        assert_eq!(consensus_level(0.6, 5), ConsensusLevel::Moderate);
        assert_eq!(consensus_level(0.4, 5), ConsensusLevel::Weak);
        assert_eq!(consensus_level(0.2, 5), ConsensusLevel::NoConsensus);
    }

    #[test]
    fn superseded_comments_do_not_vote() {
        let comments = vec![
            comment("c1", "sme", Agreement::Disagree, None),
            comment("c2", "edu", Agreement::Agree, None),
            comment("c3", "sme", Agreement::Agree, Some("c1")),
        ];
        let consensus = thread_consensus(&CommentTarget::mapping("m1-Q1-E1"), &comments);
        assert_eq!(consensus.level, ConsensusLevel::Strong);
        assert_eq!(consensus.participants, 2);
        assert_eq!(consensus.distribution.get("agree"), Some(&2));
        assert!(consensus.distribution.get("disagree").is_none());
    }

    #[test]
    fn other_threads_are_ignored() {
        let comments = vec![comment("c1", "sme", Agreement::Agree, None)];
        let consensus = thread_consensus(&CommentTarget::item("Q1"), &comments);
        assert_eq!(consensus.level, ConsensusLevel::NoFeedback);
        assert_eq!(consensus.participants, 0);
    }
}
