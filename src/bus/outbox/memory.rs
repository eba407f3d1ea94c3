//! In-memory outbox store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::{OutboxClaim, OutboxError, OutboxEvent, OutboxStore, Result};
use crate::envelope::EventEnvelope;

#[derive(Default)]
struct MemoryState {
    rows: Vec<OutboxEvent>,
    in_flight: HashSet<Uuid>,
}

/// Outbox store kept in process memory.
///
/// Claimed ids sit in an in-flight set until the claim settles, which
/// gives concurrent claims the same exclusivity as `SKIP LOCKED`.
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        lock_state(&self.state)
    }

    /// Append an enveloped event. The row id doubles as the event id.
    pub fn enqueue<T: Serialize>(&self, event_type: &str, body: &T) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_value(EventEnvelope::with_id(id.to_string(), body))?;
        self.insert(id, event_type, payload)?;
        Ok(id)
    }

    /// Append a row with a raw payload.
    pub fn insert(&self, id: Uuid, event_type: &str, payload: serde_json::Value) -> Result<()> {
        self.lock()?.rows.push(OutboxEvent {
            id,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
            published_at: None,
        });
        Ok(())
    }

    /// Snapshot of every row.
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.lock().map(|s| s.rows.clone()).unwrap_or_default()
    }

    pub fn unpublished_count(&self) -> usize {
        self.lock()
            .map(|s| s.rows.iter().filter(|r| r.published_at.is_none()).count())
            .unwrap_or(0)
    }

    /// Backdate a row's publish time.
    pub fn set_published_at(&self, id: Uuid, at: chrono::DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| OutboxError::Store(format!("no outbox row {}", id)))?;
        row.published_at = Some(at);
        Ok(())
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|_| OutboxError::Store("outbox state poisoned".to_string()))
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim(&self, batch_size: usize) -> Result<Box<dyn OutboxClaim>> {
        let mut state = self.lock()?;
        let mut candidates: Vec<OutboxEvent> = state
            .rows
            .iter()
            .filter(|r| r.published_at.is_none() && !state.in_flight.contains(&r.id))
            .cloned()
            .collect();
        candidates.sort_by_key(|r| r.created_at);
        candidates.truncate(batch_size);

        for event in &candidates {
            state.in_flight.insert(event.id);
        }

        Ok(Box::new(MemoryClaim {
            state: Arc::clone(&self.state),
            events: candidates,
            settled: false,
        }))
    }

    async fn prune_published(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| OutboxError::Store(e.to_string()))?;
        let mut state = self.lock()?;
        let before = state.rows.len();
        state
            .rows
            .retain(|r| !matches!(r.published_at, Some(at) if at < cutoff));
        Ok((before - state.rows.len()) as u64)
    }
}

struct MemoryClaim {
    state: Arc<Mutex<MemoryState>>,
    events: Vec<OutboxEvent>,
    settled: bool,
}

impl MemoryClaim {
    fn settle(&mut self, publish: bool) -> Result<()> {
        let mut state = lock_state(&self.state)?;
        let now = Utc::now();
        for event in &self.events {
            state.in_flight.remove(&event.id);
            if publish {
                if let Some(row) = state.rows.iter_mut().find(|r| r.id == event.id) {
                    row.published_at.get_or_insert(now);
                }
            }
        }
        self.settled = true;
        Ok(())
    }
}

#[async_trait]
impl OutboxClaim for MemoryClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_published(mut self: Box<Self>) -> Result<()> {
        self.settle(true)
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        self.settle(false)
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.settle(false);
        }
    }
}
