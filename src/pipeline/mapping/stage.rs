use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::coverage::{compliance_summary, compute_coverage, compute_statistics};
use super::parse::{interpret_response, InterpretedResponse};
use super::prompt::{build_mapping_prompt, MAPPING_SYSTEM_PROMPT};
use crate::models::{CandidateItem, ItemKind, MappingFailure, MappingOutcome, ReferenceDataset};
use crate::pipeline::model::{complete_with_timeout, CallPermits, CompletionOptions, ModelClient};
use crate::pipeline::CancellationToken;
use crate::pipeline_config::{MappingConfig, RetryPolicy};

#[derive(Error, Debug, PartialEq)]
pub enum MappingError {
    #[error("No mappable items")]
    NoItems,

    #[error("Reference dataset {key} has no components")]
    EmptyReference { key: String },

    #[error("Circuit breaker open after {consecutive_failures} consecutive item failures: {last_reason}")]
    CircuitOpen {
        consecutive_failures: u32,
        last_reason: String,
    },

    #[error("Mapping cancelled after {completed} items")]
    Cancelled { completed: usize },
}

enum ItemResult {
    Mapped(InterpretedResponse),
    Failed(MappingFailure),
}

/// Maps reviewed items onto one reference dataset version through the model.
pub struct MappingStage {
    client: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    config: MappingConfig,
}

impl MappingStage {
    pub fn new(client: Arc<dyn ModelClient>, retry: RetryPolicy, config: MappingConfig) -> Self {
        Self { client, retry, config }
    }

    /// Map every non-heading item. Per-item failures are collected, not
    /// raised; only the circuit breaker or cancellation abort the run.
    pub fn map(
        &self,
        items: &[CandidateItem],
        dataset: &ReferenceDataset,
        run: u32,
        cancel: &CancellationToken,
    ) -> Result<MappingOutcome, MappingError> {
        if dataset.components.is_empty() {
            return Err(MappingError::EmptyReference {
                key: dataset.key.clone(),
            });
        }
        let targets: Vec<&CandidateItem> = items.iter().filter(|i| i.kind != ItemKind::Heading).collect();
        if targets.is_empty() {
            return Err(MappingError::NoItems);
        }

        let start = Instant::now();
        let workers = self.config.max_concurrent_calls.clamp(1, targets.len());
        // Upstream calls abandoned on timeout keep their slot until they return.
        let permits = CallPermits::new(workers);
        let _span = tracing::info_span!(
            "map_items",
            reference = %dataset.key,
            version = dataset.version,
            items = targets.len(),
            run,
            workers
        )
        .entered();

        let next = AtomicUsize::new(0);
        let consecutive_failures = AtomicU32::new(0);
        let tripped = AtomicBool::new(false);
        let last_failure: Mutex<Option<String>> = Mutex::new(None);
        let results: Mutex<Vec<Option<ItemResult>>> = Mutex::new((0..targets.len()).map(|_| None).collect());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if cancel.is_cancelled() || tripped.load(Ordering::SeqCst) {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = targets.get(index) else {
                        break;
                    };

                    let result = self.map_item(item, dataset, run, &permits, cancel);
                    match &result {
                        ItemResult::Mapped(_) => consecutive_failures.store(0, Ordering::SeqCst),
                        ItemResult::Failed(failure) => {
                            let streak = consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                            if let Ok(mut last) = last_failure.lock() {
                                *last = Some(failure.reason.clone());
                            }
                            if self.retry.circuit_breaker_threshold.is_some_and(|limit| streak >= limit) {
                                tripped.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                    if let Ok(mut slots) = results.lock() {
                        slots[index] = Some(result);
                    }
                });
            }
        });

        if tripped.load(Ordering::SeqCst) {
            let last_reason = last_failure
                .into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown".into());
            let consecutive_failures = consecutive_failures.load(Ordering::SeqCst);
            tracing::error!(consecutive_failures, reason = %last_reason, "Mapping circuit breaker opened");
            return Err(MappingError::CircuitOpen {
                consecutive_failures,
                last_reason,
            });
        }

        let slots = results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        let completed = slots.iter().filter(|slot| slot.is_some()).count();
        if completed < targets.len() {
            tracing::info!(completed, total = targets.len(), "Mapping cancelled between items");
            return Err(MappingError::Cancelled { completed });
        }

        let mut mappings = Vec::new();
        let mut failures = Vec::new();
        for result in slots.into_iter().flatten() {
            match result {
                ItemResult::Mapped(response) => mappings.extend(response.mappings),
                ItemResult::Failed(failure) => failures.push(failure),
            }
        }

        let mapped_items: Vec<CandidateItem> = targets.iter().map(|i| (*i).clone()).collect();
        let outcome = MappingOutcome {
            coverage: compute_coverage(&mappings, dataset),
            statistics: compute_statistics(&mappings),
            compliance: compliance_summary(&mapped_items, &mappings, &failures),
            mappings,
            failures,
        };

        tracing::info!(
            mappings = outcome.mappings.len(),
            failed_items = outcome.failures.len(),
            gaps = outcome.coverage.gaps.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Mapping complete"
        );
        Ok(outcome)
    }

    fn map_item(
        &self,
        item: &CandidateItem,
        dataset: &ReferenceDataset,
        run: u32,
        permits: &CallPermits,
        cancel: &CancellationToken,
    ) -> ItemResult {
        let prompt = build_mapping_prompt(item, dataset);
        let options = CompletionOptions {
            system: Some(MAPPING_SYSTEM_PROMPT.to_string()),
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        };
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match complete_with_timeout(&self.client, &prompt, &options, self.config.call_timeout, permits) {
                Ok(response) => {
                    tracing::debug!(item_id = %item.item_id, attempt, response_len = response.len(), "Mapping response received");
                    return ItemResult::Mapped(interpret_response(&response, &item.item_id, dataset, run));
                }
                Err(e) if attempt < max_attempts && !cancel.is_cancelled() => {
                    let delay = e.retry_after().unwrap_or_else(|| self.retry.backoff_delay(attempt));
                    tracing::warn!(
                        item_id = %item.item_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Model call failed, retrying"
                    );
                    sleep_unless_cancelled(delay, cancel);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(item_id = %item.item_id, attempts = attempt, error = %e, "Item mapping failed");
                    return ItemResult::Failed(MappingFailure {
                        item_id: item.item_id.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Sleep in short slices so a cancel is noticed during long backoffs.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) {
    let slice = Duration::from_millis(50);
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}
