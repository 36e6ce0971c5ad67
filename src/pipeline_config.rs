//! Pipeline configuration derived from the operating mode.
//!
//! Production tolerates partial mapping failures and reports them. Testing
//! mode arms the circuit breaker so systemic model failures surface after a
//! handful of items instead of after the whole batch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Production,
    Testing,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Testing => "testing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "production" => Some(Self::Production),
            "testing" => Some(Self::Testing),
            _ => None,
        }
    }
}

/// Retry, backoff and circuit-breaker settings for model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Abort the stage after this many consecutive item failures.
    /// `None` disables the breaker.
    pub circuit_breaker_threshold: Option<u32>,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Policy with no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            circuit_breaker_threshold: None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            circuit_breaker_threshold: None,
        }
    }
}

/// Acquisition policy for per-key exclusive locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl LockPolicy {
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Inputs at or below this size are processed as a single chunk.
    pub max_chunk_chars: usize,
    /// Preferred chunk size once chunking kicks in.
    pub target_chunk_chars: usize,
    /// Trailing item blocks repeated at the start of the next chunk.
    pub overlap_blocks: usize,
    /// Ask the model to extract items per chunk, falling back to rules.
    pub model_assisted: bool,
    /// Inputs shorter than this are rejected as empty documents.
    pub min_text_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 5000,
            target_chunk_chars: 3500,
            overlap_blocks: 0,
            model_assisted: false,
            min_text_chars: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Concurrent model calls per session.
    pub max_concurrent_calls: usize,
    pub call_timeout: Duration,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 2,
            call_timeout: Duration::from_secs(60),
            temperature: 0.1,
            max_output_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Versions older than this become eligible for the archive sweep.
    pub archive_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            archive_after: Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub mode: OperatingMode,
    pub retry: RetryPolicy,
    pub locks: LockPolicy,
    pub extraction: ExtractionConfig,
    pub mapping: MappingConfig,
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        derive_config(OperatingMode::Production)
    }
}

// ═══════════════════════════════════════════════════════════
// Derivation
// ═══════════════════════════════════════════════════════════

/// Derive pipeline config from the operating mode.
pub fn derive_config(mode: OperatingMode) -> PipelineConfig {
    match mode {
        OperatingMode::Production => PipelineConfig {
            mode,
            retry: RetryPolicy::default(),
            locks: LockPolicy::default(),
            extraction: ExtractionConfig::default(),
            mapping: MappingConfig::default(),
            cache: CacheConfig::default(),
        },
        OperatingMode::Testing => PipelineConfig {
            mode,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
                circuit_breaker_threshold: Some(3),
            },
            locks: LockPolicy::default(),
            extraction: ExtractionConfig::default(),
            mapping: MappingConfig {
                max_concurrent_calls: 1,
                ..MappingConfig::default()
            },
            cache: CacheConfig::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_disables_breaker() {
        let config = derive_config(OperatingMode::Production);
        assert_eq!(config.retry.circuit_breaker_threshold, None);
        assert_eq!(config.mode, OperatingMode::Production);
    }

    #[test]
    fn testing_arms_breaker() {
        let config = derive_config(OperatingMode::Testing);
        assert_eq!(config.retry.circuit_breaker_threshold, Some(3));
        assert_eq!(config.mapping.max_concurrent_calls, 1);
    }

    #[test]
    fn default_is_production() {
        assert_eq!(PipelineConfig::default(), derive_config(OperatingMode::Production));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.extraction.max_chunk_chars, 5000);
        assert_eq!(config.extraction.target_chunk_chars, 3500);
        assert_eq!(config.cache.ttl, Duration::from_secs(86_400));
        assert_eq!(config.locks.max_retries, 5);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            circuit_breaker_threshold: None,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_delay(30), Duration::from_millis(350));
    }

    #[test]
    fn lock_backoff_caps_at_max() {
        let policy = LockPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn mode_round_trip() {
        for mode in [OperatingMode::Production, OperatingMode::Testing] {
            assert_eq!(OperatingMode::from_str(mode.as_str()), Some(mode));
        }
        assert_eq!(OperatingMode::from_str("staging"), None);
    }
}
