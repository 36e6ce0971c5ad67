use crate::models::SessionState;

/// Whether a checkpoint labelled `to` may follow one labelled `from`.
///
/// States only move forward. Re-entries that stay in place are allowed where
/// work is repeated (reference refetch, item edits), and `Mapped` may be
/// re-entered from `Mapped`/`Reviewed` as an explicit mapping-only run.
/// Any non-terminal state may be abandoned.
pub fn can_transition(from: SessionState, to: SessionState, mapping_only: bool) -> bool {
    use SessionState::*;

    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (_, Abandoned) => true,
        (Created, ReferenceFetched) => true,
        (ReferenceFetched, ReferenceFetched | ItemsExtracted) => true,
        (ItemsExtracted, ItemsExtracted | ItemsReviewed) => true,
        (ItemsReviewed, Mapped) => true,
        (Mapped | Reviewed, Mapped) => mapping_only,
        (Mapped, Reviewed) => true,
        (Reviewed, Exported) => true,
        _ => false,
    }
}

/// States reachable from `from` with one checkpoint.
pub fn next_states(from: SessionState) -> Vec<SessionState> {
    SessionState::ALL
        .into_iter()
        .filter(|to| can_transition(from, *to, true))
        .collect()
}
