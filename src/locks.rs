//! Per-key exclusive locks for session transitions and cache writes.
//!
//! One registry per lock domain: sessions lock on session id, the reference
//! cache locks on reference key, so a dataset shared by many sessions never
//! contends with their transitions. Acquisition never blocks indefinitely:
//! it retries with exponential backoff and gives up with `LockError::Busy`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::pipeline_config::LockPolicy;

#[derive(Error, Debug, PartialEq)]
pub enum LockError {
    #[error("{domain} '{key}' is busy (held by {holder}) after {attempts} attempts")]
    Busy {
        domain: &'static str,
        key: String,
        holder: String,
        attempts: u32,
    },

    #[error("Lock registry poisoned")]
    Poisoned,
}

/// Who holds a key and since when.
#[derive(Debug, Clone, Serialize)]
pub struct Holder {
    pub operation: String,
    #[serde(skip)]
    pub since: Instant,
}

pub struct KeyedLocks {
    domain: &'static str,
    policy: LockPolicy,
    held: Mutex<HashMap<String, Holder>>,
}

impl KeyedLocks {
    pub fn new(domain: &'static str, policy: LockPolicy) -> Self {
        Self {
            domain,
            policy,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire `key`, retrying with backoff while another operation holds it.
    pub fn acquire(&self, key: &str, operation: &str) -> Result<KeyGuard<'_>, LockError> {
        let mut attempt = 0u32;
        loop {
            if let Some(guard) = self.try_acquire(key, operation)? {
                if attempt > 0 {
                    tracing::debug!(domain = self.domain, key = %key, attempt, "Lock acquired after retry");
                }
                return Ok(guard);
            }
            if attempt >= self.policy.max_retries {
                let holder = self
                    .holder(key)?
                    .map(|h| h.operation)
                    .unwrap_or_else(|| "unknown".into());
                tracing::warn!(domain = self.domain, key = %key, holder = %holder, "Lock contention, giving up");
                return Err(LockError::Busy {
                    domain: self.domain,
                    key: key.to_string(),
                    holder,
                    attempts: attempt + 1,
                });
            }
            std::thread::sleep(self.policy.backoff_delay(attempt));
            attempt += 1;
        }
    }

    /// Try once. `Ok(None)` when the key is held.
    pub fn try_acquire(&self, key: &str, operation: &str) -> Result<Option<KeyGuard<'_>>, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        if held.contains_key(key) {
            return Ok(None);
        }
        held.insert(
            key.to_string(),
            Holder {
                operation: operation.to_string(),
                since: Instant::now(),
            },
        );
        Ok(Some(KeyGuard {
            locks: self,
            key: key.to_string(),
        }))
    }

    pub fn holder(&self, key: &str) -> Result<Option<Holder>, LockError> {
        let held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        Ok(held.get(key).cloned())
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains_key(key))
            .unwrap_or(true)
    }

    fn release(&self, key: &str) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(key);
        }
    }
}

/// RAII guard; dropping it releases the key.
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> LockPolicy {
        LockPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let locks = KeyedLocks::new("session", fast_policy(0));
        let _guard = locks.try_acquire("s1", "map").unwrap().unwrap();
        assert!(locks.try_acquire("s1", "review").unwrap().is_none());
        assert!(locks.try_acquire("s2", "review").unwrap().is_some());
    }

    #[test]
    fn drop_releases_key() {
        let locks = KeyedLocks::new("session", fast_policy(0));
        {
            let _guard = locks.acquire("s1", "map").unwrap();
            assert!(locks.is_held("s1"));
        }
        assert!(!locks.is_held("s1"));
        assert!(locks.acquire("s1", "map").is_ok());
    }

    #[test]
    fn acquire_gives_up_with_busy() {
        let locks = KeyedLocks::new("session", fast_policy(2));
        let _guard = locks.acquire("s1", "extract").unwrap();
        let err = locks.acquire("s1", "map").err().unwrap();
        match err {
            LockError::Busy { key, holder, attempts, domain } => {
                assert_eq!(domain, "session");
                assert_eq!(key, "s1");
                assert_eq!(holder, "extract");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn acquire_waits_for_release() {
        let locks = Arc::new(KeyedLocks::new(
            "session",
            LockPolicy {
                max_retries: 20,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        ));
        let guard = locks.acquire("s1", "extract").unwrap();
        let worker = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || locks.acquire("s1", "map").map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn holder_reports_operation() {
        let locks = KeyedLocks::new("reference key", fast_policy(0));
        let _guard = locks.acquire("X1", "fetch").unwrap();
        assert_eq!(locks.holder("X1").unwrap().unwrap().operation, "fetch");
        assert!(locks.holder("X2").unwrap().is_none());
    }
}
