//! Process-wide prioritized event queue

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::{Event, Priority};

/// Queue entry, `event == None` is the shutdown sentinel
#[derive(Debug)]
struct QueuedEvent {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    event: Option<Event>,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap via Reverse: lower tier first, then earlier arrival
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

struct DispatcherInner {
    heap: Mutex<BinaryHeap<Reverse<QueuedEvent>>>,
    next_seq: AtomicU64,
    notify: Notify,
}

/// Shared handle to the event queue
///
/// Any number of producers may push concurrently; exactly one consumer
/// (the gateway main loop) is expected to call [`pop`](Self::pop).
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                heap: Mutex::new(BinaryHeap::new()),
                next_seq: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue an event at its own priority
    pub fn push(&self, event: Event) {
        trace!(event = event.name(), "Queueing event");
        self.enqueue(event.priority(), Some(event));
    }

    /// Queue the shutdown sentinel ahead of any backlog
    ///
    /// At most one sentinel is queued at a time.
    pub fn push_shutdown(&self) {
        let mut heap = self.inner.heap.lock();
        if heap.iter().any(|Reverse(queued)| queued.event.is_none()) {
            trace!("Shutdown already queued");
            return;
        }
        heap.push(self.entry(Priority::Highest, None));
        drop(heap);
        self.inner.notify.notify_one();
    }

    fn enqueue(&self, priority: Priority, event: Option<Event>) {
        let entry = self.entry(priority, event);
        self.inner.heap.lock().push(entry);
        self.inner.notify.notify_one();
    }

    fn entry(&self, priority: Priority, event: Option<Event>) -> Reverse<QueuedEvent> {
        Reverse(QueuedEvent {
            priority,
            seq: self.inner.next_seq.fetch_add(1, AtomicOrdering::SeqCst),
            enqueued_at: Instant::now(),
            event,
        })
    }

    /// Wait for the next event; `None` means shutdown was requested
    pub async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(Reverse(queued)) = self.inner.heap.lock().pop() {
                trace!(
                    waited_us = queued.enqueued_at.elapsed().as_micros() as u64,
                    "Dequeued event"
                );
                return queued.event;
            }
            notified.await;
        }
    }

    /// Take the next event without waiting
    ///
    /// The outer `None` means the queue is empty, the inner `None` is the
    /// shutdown sentinel.
    pub fn try_pop(&self) -> Option<Option<Event>> {
        self.inner
            .heap
            .lock()
            .pop()
            .map(|Reverse(queued)| queued.event)
    }

    pub fn len(&self) -> usize {
        self.inner.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Endpoint;
    use std::time::Duration;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_higher_priority_served_first() {
        let dispatcher = EventDispatcher::new();
        dispatcher.push(Event::Reconnect(endpoint(1)));
        dispatcher.push(Event::Disconnect(endpoint(2)));

        assert_eq!(dispatcher.pop().await, Some(Event::Disconnect(endpoint(2))));
        assert_eq!(dispatcher.pop().await, Some(Event::Reconnect(endpoint(1))));
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_within_tier() {
        let dispatcher = EventDispatcher::new();
        for port in 1..=5 {
            dispatcher.push(Event::Reconnect(endpoint(port)));
        }

        for port in 1..=5 {
            assert_eq!(dispatcher.pop().await, Some(Event::Reconnect(endpoint(port))));
        }
    }

    #[tokio::test]
    async fn test_shutdown_preempts_backlog() {
        let dispatcher = EventDispatcher::new();
        dispatcher.push(Event::SendStatus(vec![1]));
        dispatcher.push(Event::UnexpectedMessage("x".to_string()));
        dispatcher.push_shutdown();

        assert_eq!(dispatcher.pop().await, None);
        assert_eq!(dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_from_other_task() {
        let dispatcher = EventDispatcher::new();
        let producer = dispatcher.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(Event::BrokerDisconnect(endpoint(7)));
        });

        let event = tokio::time::timeout(Duration::from_secs(2), dispatcher.pop())
            .await
            .unwrap();
        assert_eq!(event, Some(Event::BrokerDisconnect(endpoint(7))));
    }

    #[test]
    fn test_single_shutdown_sentinel_queued() {
        let dispatcher = EventDispatcher::new();
        dispatcher.push_shutdown();
        dispatcher.push_shutdown();
        assert_eq!(dispatcher.len(), 1);

        assert_eq!(dispatcher.try_pop(), Some(None));
        dispatcher.push_shutdown();
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_try_pop_distinguishes_empty_from_sentinel() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.try_pop(), None);
        dispatcher.push_shutdown();
        assert_eq!(dispatcher.try_pop(), Some(None));
    }
}
