//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** used to fan mutation
//! notifications out to live subscriptions and workflow listeners.
//!
//! ## Delivery Semantics
//!
//! - **Exact topic match**: a message published on `update:users` reaches only
//!   listeners bound to the string `update:users`. There are no wildcards.
//! - **Synchronous delivery**: `publish()` awaits every listener bound to the
//!   topic, one after the other, in registration order. A slow listener delays
//!   that publish call, never publishes on other topics.
//! - **Isolation**: a listener that fails (returns `Err`) or panics is logged
//!   and skipped; later listeners still receive the message.
//! - **Best effort**: no persistence, no retries, no exactly-once guarantee.
//!
//! ## Listener Lifetime
//!
//! `subscribe()` returns a [`ListenerGuard`]. Disposing the guard (explicitly or
//! by dropping it) removes the listener before returning, and a message already
//! being delivered will not reach it afterwards unless its call had started.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{EventEnvelope, Topic};

/// Listener callback: receives the shared envelope, returns a future.
pub type Listener<M> =
    Arc<dyn Fn(Arc<EventEnvelope<M>>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Build a [`Listener`] from an async closure.
pub fn listener<M, F, Fut>(f: F) -> Listener<M>
where
    M: Send + Sync + 'static,
    F: Fn(Arc<EventEnvelope<M>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

/// Outcome of a single `publish()` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Listeners that completed successfully.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
}

impl PublishReport {
    pub fn total(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Disposer for a bound listener.
///
/// Disposal is idempotent. Dropping the guard disposes it.
pub struct ListenerGuard {
    topic: Topic,
    active: Arc<AtomicBool>,
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ListenerGuard {
    /// Used by bus implementations.
    ///
    /// `active` is checked right before each delivery; `detach` removes the
    /// listener from the bus's topic table.
    pub fn new(topic: Topic, active: Arc<AtomicBool>, detach: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            topic,
            active,
            detach: Mutex::new(Some(detach)),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        self.active.store(false, Ordering::Release);
        let detach = match self.detach.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(detach) = detach {
            detach();
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl core::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Topic-keyed, in-process event bus.
///
/// Implementations are passed explicitly to every dependent component (no
/// process-wide emitter), usually as `Arc<dyn EventBus<M>>`.
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    /// Deliver `message` to every listener bound to exactly `topic`.
    async fn publish(&self, topic: &Topic, message: M) -> PublishReport;

    /// Bind `listener` to `topic`.
    fn subscribe(&self, topic: &Topic, listener: Listener<M>) -> ListenerGuard;

    /// Number of listeners currently bound to `topic`.
    fn listener_count(&self, topic: &Topic) -> usize;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + Sync + 'static,
    B: EventBus<M> + ?Sized,
{
    async fn publish(&self, topic: &Topic, message: M) -> PublishReport {
        (**self).publish(topic, message).await
    }

    fn subscribe(&self, topic: &Topic, listener: Listener<M>) -> ListenerGuard {
        (**self).subscribe(topic, listener)
    }

    fn listener_count(&self, topic: &Topic) -> usize {
        (**self).listener_count(topic)
    }
}
