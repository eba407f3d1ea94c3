//! In-memory idempotency store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{IdempotencyError, IdempotencyStore, Result};

/// Process-local marker set with expiry. Markers do not survive restarts
/// and are not shared between replicas.
pub struct MemoryIdempotencyStore {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl MemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn check(&self, event_id: &str) -> Result<bool> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| IdempotencyError::Internal("marker set poisoned".to_string()))?;
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);

        if seen.contains_key(event_id) {
            return Ok(true);
        }
        seen.insert(event_id.to_string(), now);
        Ok(false)
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        self.seen
            .lock()
            .map_err(|_| IdempotencyError::Internal("marker set poisoned".to_string()))?
            .remove(event_id);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_check_claims_later_checks_see_duplicate() {
        let store = MemoryIdempotencyStore::default();

        assert!(!store.check("e1").await.unwrap());
        assert!(store.check("e1").await.unwrap());
        assert!(!store.check("e2").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_release_allows_reprocessing() {
        let store = MemoryIdempotencyStore::default();
        store.check("e1").await.unwrap();

        store.release("e1").await.unwrap();

        assert!(!store.check("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_markers_expire_after_ttl() {
        let store = MemoryIdempotencyStore::new(Duration::from_millis(20));
        store.check("e1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.check("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_exactly_one() {
        let store = Arc::new(MemoryIdempotencyStore::default());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.check("same").await.unwrap() })
            })
            .collect();

        let mut first_claims = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                first_claims += 1;
            }
        }
        assert_eq!(first_claims, 1);
    }
}
