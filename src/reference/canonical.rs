//! Canonical component identifiers.
//!
//! Every identifier is rewritten to `<PREFIX><number>` where the prefix is the
//! component type's code: repeated prefixes collapse (`KEKE3` → `KE3`), bare
//! numbers gain the prefix (`1.1` → `PC1.1`). The rewrite is idempotent.

use crate::models::{Component, ComponentType, ReferenceComponents};

/// Canonicalize one identifier for a known component type.
pub fn canonicalize_id(component_type: ComponentType, raw: &str) -> String {
    let prefix = component_type.prefix();
    let mut id: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();

    // Separators between prefix and number ("PC-1.1", "KE_3") and doubled
    // prefixes interleave ("KE-KE_3"), so strip both until nothing changes.
    let doubled = format!("{prefix}{prefix}");
    loop {
        let before = id.len();
        for sep in ['-', '_', ':'] {
            let glued = format!("{prefix}{sep}");
            if id.starts_with(&glued) {
                id.replace_range(prefix.len()..glued.len(), "");
            }
        }
        if id.starts_with(&doubled) {
            id.replace_range(..prefix.len(), "");
        }
        if id.len() == before {
            break;
        }
    }

    let id = id.trim_end_matches(['.', ',', ';']).to_string();

    if id.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("{prefix}{id}");
    }
    id
}

/// Canonicalize an identifier whose type is only known from its prefix.
/// Returns `None` for bare numbers, which are ambiguous without a type.
pub fn canonicalize_untyped(raw: &str) -> Option<(ComponentType, String)> {
    let component_type = ComponentType::from_prefixed_id(raw)?;
    Some((component_type, canonicalize_id(component_type, raw)))
}

/// Rewrite every identifier in place. Missing identifiers are assigned from
/// position (`E1`, `E2`, ...). Returns how many identifiers changed.
pub fn canonicalize_components(components: &mut ReferenceComponents) -> usize {
    let mut rewritten = 0;
    for component_type in ComponentType::ALL {
        for (index, component) in components.of_type_mut(component_type).iter_mut().enumerate() {
            let canonical = if component.id.trim().is_empty() {
                format!("{}{}", component_type.prefix(), index + 1)
            } else {
                canonicalize_id(component_type, &component.id)
            };
            if canonical != component.id {
                rewritten += 1;
                component.id = canonical;
            }
        }
    }
    rewritten
}

/// Drop later duplicates of an identifier within each category.
pub fn dedupe_components(components: &mut ReferenceComponents) -> usize {
    let mut removed = 0;
    for component_type in ComponentType::ALL {
        let list = components.of_type_mut(component_type);
        let before = list.len();
        let mut seen = std::collections::HashSet::new();
        list.retain(|c: &Component| seen.insert(c.id.clone()));
        removed += before - list.len();
    }
    removed
}
