//! Outbox delivery: fan-out of durable events to in-process subscribers.
//!
//! Events are co-committed with the state changes that produced them; this
//! loop reads undelivered rows in insertion order, invokes every subscriber,
//! and marks a row delivered only once all subscribers accepted it. Delivery
//! is at-least-once and per-item in write order; subscribers must be
//! idempotent. A failing subscriber stalls the stream and retries with
//! exponential backoff so ordering is never violated by skipping ahead.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use labelsquor_workflow::Result;

use crate::models::EventRecord;
use crate::shutdown::Shutdown;
use crate::store::SqliteWorkflowStore;

pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// An in-process consumer of orchestrator events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &EventRecord) -> std::result::Result<(), SubscriberError>;
}

/// One delivery pass over the outbox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    /// A subscriber rejected the head of the stream; the pass stopped there.
    pub stalled: bool,
}

pub struct EventBus {
    store: Arc<SqliteWorkflowStore>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    retry_base: std::time::Duration,
    retry_cap: std::time::Duration,
    batch_size: usize,
}

impl EventBus {
    pub fn new(
        store: Arc<SqliteWorkflowStore>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
        retry_base: std::time::Duration,
        retry_cap: std::time::Duration,
    ) -> Self {
        Self {
            store,
            subscribers,
            retry_base,
            retry_cap,
            batch_size: 64,
        }
    }

    /// Deliver pending events until the batch is exhausted or a subscriber
    /// fails. Failure keeps the event undelivered and stops the pass, which
    /// preserves per-item ordering.
    pub async fn deliver_pending(&self) -> Result<DeliveryStats> {
        let mut stats = DeliveryStats::default();
        let events = self.store.undelivered_events(self.batch_size)?;
        for event in events {
            if !self.deliver_one(&event).await {
                stats.stalled = true;
                break;
            }
            self.store.mark_event_delivered(event.id)?;
            stats.delivered += 1;
        }
        Ok(stats)
    }

    async fn deliver_one(&self, event: &EventRecord) -> bool {
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.handle(event).await {
                warn!(
                    subscriber = subscriber.name(),
                    event_id = event.id,
                    event_type = event.event_type.as_str(),
                    error = %e,
                    "event delivery failed; will retry"
                );
                return false;
            }
        }
        debug!(
            event_id = event.id,
            event_type = event.event_type.as_str(),
            work_item = %event.work_item_id,
            "event delivered"
        );
        true
    }

    /// Delivery loop: drain, back off on stall, idle briefly when caught up.
    pub async fn run(&self, shutdown: Arc<Shutdown>) {
        info!(subscribers = self.subscribers.len(), "event bus started");
        let mut backoff = self.retry_base;
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match self.deliver_pending().await {
                Ok(stats) if stats.stalled => {
                    if shutdown.sleep(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.retry_cap);
                }
                Ok(stats) => {
                    backoff = self.retry_base;
                    // Drain immediately while events keep coming.
                    if stats.delivered == 0 && shutdown.sleep(self.retry_base).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "outbox read failed; backing off");
                    if shutdown.sleep(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.retry_cap);
                }
            }
        }
        info!("event bus stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::models::EventType;

    struct Recording {
        name: String,
        seen: Mutex<Vec<(i64, String)>>,
        fail_first: AtomicUsize,
    }

    impl Recording {
        fn new(name: &str, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl EventSubscriber for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, event: &EventRecord) -> std::result::Result<(), SubscriberError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err("induced failure".into());
            }
            self.seen
                .lock()
                .unwrap()
                .push((event.id, event.work_item_id.clone()));
            Ok(())
        }
    }

    fn store_with_events(n: usize) -> Arc<SqliteWorkflowStore> {
        let path = std::env::temp_dir().join(format!(
            "labelsquor-events-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(SqliteWorkflowStore::open(path.to_str().unwrap()).unwrap());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap();
        for i in 0..n {
            store
                .insert_event("wi-1", EventType::StateChanged, &json!({ "seq": i }), now)
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn delivers_in_insertion_order_and_marks_delivered() {
        let store = store_with_events(3);
        let subscriber = Recording::new("recorder", 0);
        let bus = EventBus::new(
            Arc::clone(&store),
            vec![subscriber.clone()],
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(100),
        );

        let stats = bus.deliver_pending().await.unwrap();
        assert_eq!(stats.delivered, 3);
        assert!(!stats.stalled);

        let ids: Vec<i64> = subscriber.seen.lock().unwrap().iter().map(|(id, _)| *id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(store.undelivered_events(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_subscriber_stalls_without_skipping() {
        let store = store_with_events(3);
        let subscriber = Recording::new("flaky", 1);
        let bus = EventBus::new(
            Arc::clone(&store),
            vec![subscriber.clone()],
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(100),
        );

        let first = bus.deliver_pending().await.unwrap();
        assert_eq!(first.delivered, 0);
        assert!(first.stalled);
        assert_eq!(store.undelivered_events(10).unwrap().len(), 3);

        // Retry succeeds and order is preserved: at-least-once, no skips.
        let second = bus.deliver_pending().await.unwrap();
        assert_eq!(second.delivered, 3);
        let ids: Vec<i64> = subscriber.seen.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn all_subscribers_must_accept_before_marking() {
        let store = store_with_events(1);
        let good = Recording::new("good", 0);
        let bad = Recording::new("bad", 1);
        let bus = EventBus::new(
            Arc::clone(&store),
            vec![good.clone(), bad.clone()],
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(100),
        );

        let stats = bus.deliver_pending().await.unwrap();
        assert!(stats.stalled);
        assert_eq!(store.undelivered_events(10).unwrap().len(), 1);

        // Second pass re-delivers to every subscriber; `good` sees it twice,
        // which is why subscribers must be idempotent.
        let stats = bus.deliver_pending().await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(good.seen.lock().unwrap().len(), 2);
        assert_eq!(bad.seen.lock().unwrap().len(), 1);
    }
}
