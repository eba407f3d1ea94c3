//! Mock event log and pull source for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BusError, Delivery, EventLog, MessageSource, Result, StreamSpec};

// ============================================================================
// MockEventLog
// ============================================================================

/// Mock event log for testing.
#[derive(Default)]
pub struct MockEventLog {
    published: RwLock<Vec<(String, Bytes)>>,
    streams: RwLock<Vec<StreamSpec>>,
    fail_on_publish: RwLock<bool>,
    fail_after: RwLock<Option<usize>>,
    fail_on_ensure: RwLock<bool>,
}

impl MockEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Accept `count` publishes, then fail every one after that.
    pub async fn set_fail_after(&self, count: Option<usize>) {
        *self.fail_after.write().await = count;
    }

    pub async fn set_fail_on_ensure(&self, fail: bool) {
        *self.fail_on_ensure.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<(String, Bytes)> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Payloads published to `subject`, parsed as JSON.
    pub async fn published_json(&self, subject: &str) -> Vec<serde_json::Value> {
        self.published
            .read()
            .await
            .iter()
            .filter(|(s, _)| s == subject)
            .filter_map(|(_, p)| serde_json::from_slice(p).ok())
            .collect()
    }

    pub async fn ensured_streams(&self) -> Vec<StreamSpec> {
        self.streams.read().await.clone()
    }
}

#[async_trait]
impl EventLog for MockEventLog {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        let mut published = self.published.write().await;
        if let Some(limit) = *self.fail_after.read().await {
            if published.len() >= limit {
                return Err(BusError::Publish(format!(
                    "Mock publish failure after {} messages",
                    limit
                )));
            }
        }
        published.push((subject.to_string(), payload));
        Ok(())
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<()> {
        if *self.fail_on_ensure.read().await {
            return Err(BusError::Stream {
                stream: spec.name.clone(),
                message: "Mock stream failure".to_string(),
            });
        }
        let mut streams = self.streams.write().await;
        match streams.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => {
                for subject in spec.missing_subjects(&existing.subjects) {
                    existing.subjects.push(subject);
                }
            }
            None => streams.push(spec.clone()),
        }
        Ok(())
    }
}

// ============================================================================
// MockDelivery
// ============================================================================

/// How a mock delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked(Duration),
}

/// Mock delivery. Clones share settlement state, so a test can keep one
/// clone and hand the other to the consumer.
#[derive(Clone)]
pub struct MockDelivery {
    subject: String,
    payload: Bytes,
    num_delivered: u64,
    settlements: Arc<Mutex<Vec<Settlement>>>,
    fail_ack: bool,
}

impl MockDelivery {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>, num_delivered: u64) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            num_delivered,
            settlements: Arc::new(Mutex::new(Vec::new())),
            fail_ack: false,
        }
    }

    pub fn json(subject: impl Into<String>, value: &serde_json::Value, num_delivered: u64) -> Self {
        Self::new(subject, value.to_string().into_bytes(), num_delivered)
    }

    /// Make `ack` and `nak_with_delay` return an error.
    pub fn failing_ack(mut self) -> Self {
        self.fail_ack = true;
        self
    }

    /// Same message, one attempt later.
    pub fn redelivered(&self) -> Self {
        Self::new(
            self.subject.clone(),
            self.payload.clone(),
            self.num_delivered + 1,
        )
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_acked(&self) -> bool {
        self.settlements().contains(&Settlement::Acked)
    }

    pub fn nak_delay(&self) -> Option<Duration> {
        self.settlements().into_iter().find_map(|s| match s {
            Settlement::Nacked(d) => Some(d),
            Settlement::Acked => None,
        })
    }

    fn settle(&self, settlement: Settlement) -> Result<()> {
        if self.fail_ack {
            return Err(BusError::Ack("Mock ack failure".to_string()));
        }
        self.settlements
            .lock()
            .map_err(|e| BusError::Ack(e.to_string()))?
            .push(settlement);
        Ok(())
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn num_delivered(&self) -> u64 {
        self.num_delivered
    }

    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Acked)
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        self.settle(Settlement::Nacked(delay))
    }
}

// ============================================================================
// MockSource
// ============================================================================

/// Mock pull source handing out queued deliveries.
#[derive(Default)]
pub struct MockSource {
    pending: RwLock<VecDeque<Box<dyn Delivery>>>,
    failing_fetches: RwLock<usize>,
    fetch_calls: RwLock<usize>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, delivery: impl Delivery + 'static) {
        self.pending.write().await.push_back(Box::new(delivery));
    }

    /// Make the next `count` fetches fail.
    pub async fn fail_next_fetches(&self, count: usize) {
        *self.failing_fetches.write().await = count;
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn fetch_calls(&self) -> usize {
        *self.fetch_calls.read().await
    }
}

#[async_trait]
impl MessageSource for MockSource {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Box<dyn Delivery>>> {
        *self.fetch_calls.write().await += 1;
        {
            let mut failing = self.failing_fetches.write().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(BusError::Fetch("Mock fetch failure".to_string()));
            }
        }

        let batch: Vec<Box<dyn Delivery>> = {
            let mut pending = self.pending.write().await;
            let n = max.min(pending.len());
            pending.drain(..n).collect()
        };
        if batch.is_empty() {
            tokio::time::sleep(wait).await;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_event_log_publish() {
        let log = MockEventLog::new();

        log.publish("catalog.anime.upserted", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(log.published_count().await, 1);
        let published = log.take_published().await;
        assert_eq!(published[0].0, "catalog.anime.upserted");
        assert_eq!(log.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_event_log_fail_on_publish() {
        let log = MockEventLog::new();
        log.set_fail_on_publish(true).await;

        let result = log.publish("a.b", Bytes::new()).await;

        assert!(matches!(result, Err(BusError::Publish(_))));
        assert_eq!(log.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_event_log_fail_after() {
        let log = MockEventLog::new();
        log.set_fail_after(Some(2)).await;

        assert!(log.publish("a.b", Bytes::new()).await.is_ok());
        assert!(log.publish("a.b", Bytes::new()).await.is_ok());
        assert!(log.publish("a.b", Bytes::new()).await.is_err());
        assert_eq!(log.published_count().await, 2);
    }

    #[tokio::test]
    async fn test_mock_event_log_ensure_stream_reconciles_subjects() {
        let log = MockEventLog::new();
        log.ensure_stream(&StreamSpec::new("S", &["a.>"])).await.unwrap();
        log.ensure_stream(&StreamSpec::new("S", &["a.>", "b.>"]))
            .await
            .unwrap();

        let streams = log.ensured_streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].subjects, vec!["a.>", "b.>"]);
    }

    #[tokio::test]
    async fn test_mock_delivery_clones_share_settlements() {
        let delivery = MockDelivery::new("a.b", b"{}".to_vec(), 1);
        let handed_out = delivery.clone();

        handed_out
            .nak_with_delay(Duration::from_secs(2))
            .await
            .unwrap();

        assert!(!delivery.is_acked());
        assert_eq!(delivery.nak_delay(), Some(Duration::from_secs(2)));
        assert_eq!(delivery.redelivered().num_delivered(), 2);
    }

    #[tokio::test]
    async fn test_mock_source_fetch_respects_max_and_failures() {
        let source = MockSource::new();
        for _ in 0..3 {
            source.push(MockDelivery::new("a.b", b"{}".to_vec(), 1)).await;
        }
        source.fail_next_fetches(1).await;

        assert!(source.fetch(2, Duration::ZERO).await.is_err());
        assert_eq!(source.fetch(2, Duration::ZERO).await.unwrap().len(), 2);
        assert_eq!(source.fetch(2, Duration::ZERO).await.unwrap().len(), 1);
        assert!(source.fetch(2, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(source.fetch_calls().await, 4);
    }
}
