//! In-process pub/sub bus.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::bus::{EventBus, Listener, ListenerGuard, PublishReport};
use crate::{EventEnvelope, Topic};

struct Slot<M> {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Listener<M>,
}

struct Topics<M> {
    by_topic: Mutex<HashMap<Topic, Vec<Arc<Slot<M>>>>>,
    next_id: AtomicU64,
}

impl<M> Topics<M> {
    // The table only holds plain data, so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<Topic, Vec<Arc<Slot<M>>>>> {
        self.by_topic.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, topic: &Topic, id: u64) {
        let mut table = self.lock();
        if let Some(slots) = table.get_mut(topic) {
            slots.retain(|s| s.id != id);
            if slots.is_empty() {
                table.remove(topic);
            }
        }
    }
}

/// In-memory topic bus.
///
/// - The topic table lock is held only to snapshot or edit listener lists,
///   never across a listener call
/// - Listeners run on the publisher's task, in registration order
/// - Errors and panics are contained per listener
pub struct InMemoryEventBus<M> {
    topics: Arc<Topics<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            topics: Arc::new(Topics {
                by_topic: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<M> core::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("topics", &self.topics.lock().len())
            .finish()
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Send + Sync + 'static,
{
    async fn publish(&self, topic: &Topic, message: M) -> PublishReport {
        let snapshot: Vec<Arc<Slot<M>>> = {
            let table = self.topics.lock();
            match table.get(topic) {
                Some(slots) => slots.clone(),
                None => return PublishReport::default(),
            }
        };

        let envelope = Arc::new(EventEnvelope::new(topic.clone(), message));
        let mut report = PublishReport::default();

        for slot in snapshot {
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }

            let call = (slot.listener)(envelope.clone());
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(topic = %topic, listener = slot.id, error = %err, "event listener failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(topic = %topic, listener = slot.id, "event listener panicked");
                }
            }
        }

        debug!(
            topic = %topic,
            event_id = %envelope.event_id(),
            delivered = report.delivered,
            failed = report.failed,
            "published"
        );
        report
    }

    fn subscribe(&self, topic: &Topic, listener: Listener<M>) -> ListenerGuard {
        let id = self.topics.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        self.topics
            .lock()
            .entry(topic.clone())
            .or_default()
            .push(Arc::new(Slot {
                id,
                active: active.clone(),
                listener,
            }));

        let weak: Weak<Topics<M>> = Arc::downgrade(&self.topics);
        let detach_topic = topic.clone();
        ListenerGuard::new(
            topic.clone(),
            active,
            Box::new(move || {
                if let Some(topics) = weak.upgrade() {
                    topics.detach(&detach_topic, id);
                }
            }),
        )
    }

    fn listener_count(&self, topic: &Topic) -> usize {
        self.topics.lock().get(topic).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener;
    use std::time::Duration;

    fn recorder(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener<String> {
        listener(move |env: Arc<EventEnvelope<String>>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{tag}:{}", env.payload()));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn delivers_in_registration_order_to_exact_topic_only() {
        let bus = InMemoryEventBus::<String>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = bus.subscribe(&Topic::created("users"), recorder(log.clone(), "a"));
        let _b = bus.subscribe(&Topic::created("users"), recorder(log.clone(), "b"));
        let _c = bus.subscribe(&Topic::created("posts"), recorder(log.clone(), "c"));

        let report = bus.publish(&Topic::created("users"), "u1".to_string()).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:u1", "b:u1"]);
    }

    #[tokio::test]
    async fn failing_and_panicking_listeners_are_isolated() {
        let bus = InMemoryEventBus::<String>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let topic = Topic::updated("users");

        let _err = bus.subscribe(
            &topic,
            listener(|_env: Arc<EventEnvelope<String>>| async { Err(anyhow::anyhow!("boom")) }),
        );
        let _panic = bus.subscribe(
            &topic,
            listener(|env: Arc<EventEnvelope<String>>| async move {
                assert!(env.payload().is_empty(), "listener panic");
                Ok(())
            }),
        );
        let _ok = bus.subscribe(&topic, recorder(log.clone(), "ok"));

        let report = bus.publish(&topic, "u1".to_string()).await;

        assert_eq!(report, PublishReport { delivered: 1, failed: 2 });
        assert_eq!(*log.lock().unwrap(), vec!["ok:u1"]);
    }

    #[tokio::test]
    async fn disposing_a_guard_removes_the_listener() {
        let bus = InMemoryEventBus::<String>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let topic = Topic::deleted("users");

        let guard = bus.subscribe(&topic, recorder(log.clone(), "x"));
        assert_eq!(bus.listener_count(&topic), 1);

        guard.dispose();
        guard.dispose();
        assert_eq!(bus.listener_count(&topic), 0);

        bus.publish(&topic, "u1".to_string()).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_a_guard_disposes_it() {
        let bus = InMemoryEventBus::<String>::new();
        let topic = Topic::created("users");
        {
            let _guard = bus.subscribe(&topic, recorder(Arc::new(Mutex::new(Vec::new())), "x"));
            assert_eq!(bus.listener_count(&topic), 1);
        }
        assert_eq!(bus.listener_count(&topic), 0);
    }

    #[tokio::test]
    async fn listener_disposed_mid_publish_is_skipped() {
        let bus = Arc::new(InMemoryEventBus::<String>::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let topic = Topic::updated("users");

        let victim: Arc<Mutex<Option<ListenerGuard>>> = Arc::new(Mutex::new(None));
        let victim_slot = victim.clone();
        let _first = bus.subscribe(
            &topic,
            listener(move |_env: Arc<EventEnvelope<String>>| {
                let victim_slot = victim_slot.clone();
                async move {
                    if let Some(guard) = victim_slot.lock().unwrap().take() {
                        guard.dispose();
                    }
                    Ok(())
                }
            }),
        );
        *victim.lock().unwrap() = Some(bus.subscribe(&topic, recorder(log.clone(), "victim")));

        let report = bus.publish(&topic, "u1".to_string()).await;

        assert_eq!(report.delivered, 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_listener_does_not_block_other_topics() {
        let bus = Arc::new(InMemoryEventBus::<String>::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let wait_gate = gate.clone();
        let _slow = bus.subscribe(
            &Topic::created("users"),
            listener(move |_env: Arc<EventEnvelope<String>>| {
                let gate = wait_gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            }),
        );
        let _fast = bus.subscribe(&Topic::created("posts"), recorder(log.clone(), "posts"));

        let slow_bus = bus.clone();
        let slow = tokio::spawn(async move {
            slow_bus.publish(&Topic::created("users"), "u1".to_string()).await
        });

        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            bus.publish(&Topic::created("posts"), "p1".to_string()),
        )
        .await
        .expect("publish on an unrelated topic must not wait");
        assert_eq!(fast.delivered, 1);

        gate.notify_one();
        assert_eq!(slow.await.unwrap().delivered, 1);
    }
}
