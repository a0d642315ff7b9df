//! Call Router: correlates commands with responses and fans events out.
//!
//! The read loop is the only producer of responses and events; any number of
//! caller tasks register pending calls and consume events concurrently, so the
//! pending table and subscription set are concurrent maps.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::codec::{Event, Response};
use crate::error::{CdpError, Result};

type Outcome = Result<Value>;

/// What the read loop does when the event queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Suspend the read loop until a consumer makes room.
    Block,
}

/// Bounded queue of dispatched events visible to the tab's consumers.
pub(crate) struct EventQueue {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            policy,
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Queue an event according to the overflow policy.
    pub(crate) async fn push(&self, event: Event) {
        if self.policy == OverflowPolicy::DropOldest {
            self.force_push(event);
            return;
        }

        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            {
                let mut buffer = self.buffer.lock();
                if buffer.len() < self.capacity {
                    buffer.push_back(event);
                    drop(buffer);
                    self.readable.notify_one();
                    return;
                }
            }
            writable.await;
        }
    }

    /// Queue an event without ever waiting; the oldest event makes room.
    pub(crate) fn force_push(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.capacity {
                if let Some(dropped) = buffer.pop_front() {
                    debug!(method = %dropped.method, "event queue full, dropping oldest event");
                }
            }
            buffer.push_back(event);
        }
        self.readable.notify_one();
    }

    /// Next event, or `None` once the queue is closed and drained.
    pub(crate) async fn recv(&self) -> Option<Event> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            readable.await;
        }
    }

    pub(crate) fn try_recv(&self) -> Option<Event> {
        let mut buffer = self.buffer.lock();
        let event = buffer.pop_front()?;
        let more = !buffer.is_empty();
        drop(buffer);

        self.writable.notify_one();
        if more {
            // Pass the wakeup on; several pushes may have coalesced into one permit.
            self.readable.notify_one();
        }
        Some(event)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.lock().len()
    }
}

/// Per-tab routing state shared by the read loop and callers.
pub(crate) struct Router {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Outcome>>,
    subscriptions: DashSet<String>,
    events: EventQueue,
    closed: AtomicBool,
}

impl Router {
    pub(crate) fn new(event_capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            subscriptions: DashSet::new(),
            events: EventQueue::new(event_capacity, policy),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate the next command id. Ids start at 1 and never repeat.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a waiter for `id`.
    ///
    /// Fails with [`CdpError::Closed`] if the tab is closed, including when the
    /// close races with this registration.
    pub(crate) fn register(&self, id: u64) -> Result<oneshot::Receiver<Outcome>> {
        if self.is_closed() {
            return Err(CdpError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(CdpError::Closed);
        }
        Ok(rx)
    }

    /// Drop the waiter for `id`, if it is still pending.
    pub(crate) fn cancel(&self, id: u64) {
        if self.pending.remove(&id).is_some() {
            debug!(id, "pending call cancelled");
        }
    }

    /// Deliver a response to its waiter exactly once; unknown ids are dropped.
    pub(crate) fn resolve(&self, response: Response) {
        let id = response.id;
        self.fail_or_deliver(id, response.into_result());
    }

    /// Deliver a failure to the waiter for `id`.
    pub(crate) fn fail(&self, id: u64, error: CdpError) {
        self.fail_or_deliver(id, Err(error));
    }

    fn fail_or_deliver(&self, id: u64, outcome: Outcome) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => debug!(id, "dropping response without a waiter"),
        }
    }

    pub(crate) fn subscribe(&self, method: &str) {
        self.subscriptions.insert(method.to_string());
    }

    pub(crate) fn is_subscribed(&self, method: &str) -> bool {
        self.subscriptions.contains(method)
    }

    /// Queue a browser event if someone subscribed to its method.
    pub(crate) async fn dispatch(&self, event: Event) {
        if !self.is_subscribed(&event.method) {
            return;
        }
        self.events.push(event).await;
    }

    /// Queue a locally made event, bypassing the subscription filter.
    pub(crate) fn inject(&self, event: Event) {
        self.events.force_push(event);
    }

    pub(crate) fn events(&self) -> &EventQueue {
        &self.events
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the tab closed and resolve every waiter with [`CdpError::Closed`].
    ///
    /// Returns `false` if the router was already shut down.
    pub(crate) fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(CdpError::Closed));
            }
        }
        self.events.close();
        true
    }
}

/// Removes a pending registration when the awaiting call is dropped early.
pub(crate) struct PendingGuard {
    router: Arc<Router>,
    id: u64,
    armed: bool,
}

impl PendingGuard {
    pub(crate) fn new(router: Arc<Router>, id: u64) -> Self {
        Self {
            router,
            id,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.router.cancel(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn response(id: u64) -> Response {
        Response {
            id,
            outcome: Ok(json!({"ok": id})),
        }
    }

    #[test]
    fn ids_strictly_increase() {
        let router = Router::new(4, OverflowPolicy::DropOldest);
        let ids: Vec<u64> = (0..5).map(|_| router.next_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn response_reaches_its_waiter_once() {
        let router = Router::new(4, OverflowPolicy::DropOldest);
        let rx = router.register(1).unwrap();
        router.resolve(response(1));
        router.resolve(response(1));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": 1}));
        assert_eq!(router.pending_len(), 0);
    }

    #[tokio::test]
    async fn unknown_response_is_dropped() {
        let router = Router::new(4, OverflowPolicy::DropOldest);
        let rx = router.register(2).unwrap();
        router.resolve(response(99));
        assert_eq!(router.pending_len(), 1);
        router.resolve(response(2));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_later_calls() {
        let router = Router::new(4, OverflowPolicy::DropOldest);
        let first = router.register(1).unwrap();
        let second = router.register(2).unwrap();

        assert!(router.shutdown());
        assert!(!router.shutdown());

        assert!(first.await.unwrap().unwrap_err().is_closed());
        assert!(second.await.unwrap().unwrap_err().is_closed());
        assert!(router.register(3).unwrap_err().is_closed());
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn dropped_guard_cancels_registration() {
        let router = Arc::new(Router::new(4, OverflowPolicy::DropOldest));
        let _rx = router.register(5).unwrap();
        {
            let _guard = PendingGuard::new(router.clone(), 5);
        }
        assert_eq!(router.pending_len(), 0);

        let _rx = router.register(6).unwrap();
        let mut guard = PendingGuard::new(router.clone(), 6);
        guard.disarm();
        drop(guard);
        assert_eq!(router.pending_len(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_events_are_filtered() {
        let router = Router::new(4, OverflowPolicy::DropOldest);
        router.subscribe("Page.loadEventFired");
        router.dispatch(Event::new("Network.requestWillBeSent", json!({}))).await;
        router.dispatch(Event::new("Page.loadEventFired", json!({}))).await;

        assert_eq!(router.events().len(), 1);
        let event = router.events().recv().await.unwrap();
        assert!(event.is("Page.loadEventFired"));
    }

    #[tokio::test]
    async fn events_keep_browser_order() {
        let router = Router::new(8, OverflowPolicy::DropOldest);
        router.subscribe("E");
        for n in 0..5 {
            router.dispatch(Event::new("E", json!({"n": n}))).await;
        }
        for n in 0..5 {
            let event = router.events().recv().await.unwrap();
            assert_eq!(event.params["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let router = Router::new(2, OverflowPolicy::DropOldest);
        router.subscribe("E");
        for n in 0..3 {
            router.dispatch(Event::new("E", json!({"n": n}))).await;
        }
        assert_eq!(router.events().len(), 2);
        assert_eq!(router.events().recv().await.unwrap().params["n"], json!(1));
        assert_eq!(router.events().recv().await.unwrap().params["n"], json!(2));
    }

    #[tokio::test]
    async fn blocking_queue_waits_for_room() {
        let router = Arc::new(Router::new(1, OverflowPolicy::Block));
        router.subscribe("E");
        router.dispatch(Event::new("E", json!({"n": 0}))).await;

        let producer = {
            let router = router.clone();
            tokio::spawn(async move {
                router.dispatch(Event::new("E", json!({"n": 1}))).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(router.events().recv().await.unwrap().params["n"], json!(0));
        producer.await.unwrap();
        assert_eq!(router.events().recv().await.unwrap().params["n"], json!(1));
    }

    #[tokio::test]
    async fn injection_never_blocks_and_bypasses_filter() {
        let router = Router::new(1, OverflowPolicy::Block);
        router.subscribe("E");
        router.dispatch(Event::new("E", json!({}))).await;
        router.inject(Event::injected("Page.loadEventFired"));

        let event = router.events().recv().await.unwrap();
        assert!(event.is_injected());
    }

    #[tokio::test]
    async fn closed_queue_wakes_consumers() {
        let router = Arc::new(Router::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let router = router.clone();
            tokio::spawn(async move { router.events().recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.shutdown();
        assert!(consumer.await.unwrap().is_none());
    }
}
