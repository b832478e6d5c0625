//! Per-key mutual exclusion with bounded waits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{CoreError, CoreResult};
use crate::logging::log_lock_timeout;

/// Held for the duration of one mutation; dropping it releases the key.
pub type KeyGuard = OwnedMutexGuard<()>;

/// One async mutex per key. Different keys never contend.
pub struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl KeyedLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
            timeout,
        }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    pub async fn acquire(&self, key: &str) -> CoreResult<KeyGuard> {
        self.acquire_within(key, self.timeout).await
    }

    pub async fn acquire_within(&self, key: &str, wait: Duration) -> CoreResult<KeyGuard> {
        let slot = self.slot(key);
        let started = Instant::now();
        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                log_lock_timeout(key, waited_ms);
                Err(CoreError::LockTimeout {
                    key: key.to_string(),
                    waited_ms,
                })
            }
        }
    }

    /// Keys whose lock is currently held.
    pub fn held(&self) -> Vec<String> {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let mut held: Vec<String> = locks
            .iter()
            .filter(|(_, m)| m.try_lock().is_err())
            .map(|(k, _)| k.clone())
            .collect();
        held.sort();
        held
    }

    /// Wait for every in-flight holder to release. Returns the keys that
    /// were still held when `wait` ran out.
    pub async fn drain(&self, wait: Duration) -> Vec<String> {
        let slots: Vec<(String, Arc<Mutex<()>>)> = {
            let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.iter().map(|(k, m)| (k.clone(), Arc::clone(m))).collect()
        };
        let deadline = tokio::time::Instant::now() + wait;
        let mut stuck = Vec::new();
        for (key, slot) in slots {
            if tokio::time::timeout_at(deadline, slot.lock_owned()).await.is_err() {
                stuck.push(key);
            }
        }
        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_times_out_while_held() {
        let locks = KeyedLocks::new(Duration::from_millis(30));
        let guard = locks.acquire("a").await.unwrap();
        assert_eq!(locks.held(), vec!["a".to_string()]);

        let err = locks.acquire("a").await.unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { ref key, .. } if key == "a"));

        drop(guard);
        assert!(locks.acquire("a").await.is_ok());
        assert!(locks.held().is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLocks::new(Duration::from_millis(30));
        let _a = locks.acquire("a").await.unwrap();
        assert!(locks.acquire("b").await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_waits_for_holders() {
        let locks = Arc::new(KeyedLocks::new(Duration::from_secs(1)));
        let guard = locks.acquire("a").await.unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(locks.drain(Duration::from_secs(1)).await.is_empty());
        releaser.await.unwrap();

        let _held = locks.acquire("b").await.unwrap();
        assert_eq!(locks.drain(Duration::from_millis(20)).await, vec!["b".to_string()]);
    }
}
