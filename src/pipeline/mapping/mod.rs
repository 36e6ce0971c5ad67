//! Mapping stage: reviewed items onto reference components.
//!
//! Model calls go out with bounded concurrency, a per-call timeout and
//! retries. Every response passes through the repair pipeline in `parse`,
//! so an item either gets mappings (possibly an `unparsed` placeholder) or
//! an explicit `MappingFailure` after its attempts are exhausted.

pub mod coverage;
pub mod parse;
pub mod prompt;
pub mod stage;

pub use coverage::{compliance_summary, compute_coverage, compute_statistics, LOW_CONFIDENCE_THRESHOLD};
pub use parse::{interpret_response, mapping_id, unparsed_placeholder, InterpretedResponse};
pub use prompt::build_mapping_prompt;
pub use stage::{MappingError, MappingStage};
