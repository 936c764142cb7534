//! Trigger Queue
//!
//! Bounded FIFO between the watcher threads and the daemon dispatcher.
//! Pushing never blocks: on overflow the oldest request for the same target
//! is collapsed into the new one, otherwise the oldest request is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::warn;
use tokio::sync::Notify;

use super::RunRequest;

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// An older request for the same workflow and jobs was replaced
    Collapsed,
    /// The queue was full; the oldest request was discarded
    DroppedOldest(RunRequest),
    /// The queue no longer accepts requests
    Closed,
}

#[derive(Debug)]
pub struct TriggerQueue {
    items: Mutex<VecDeque<RunRequest>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl TriggerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RunRequest>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a request without blocking.
    pub fn push(&self, request: RunRequest) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut items = self.lock();
            if items.len() < self.capacity {
                items.push_back(request);
                PushOutcome::Queued
            } else if let Some(pos) = items.iter().position(|r| r.same_target(&request)) {
                items.remove(pos);
                items.push_back(request);
                PushOutcome::Collapsed
            } else {
                let dropped = items.pop_front();
                items.push_back(request);
                match dropped {
                    Some(dropped) => {
                        warn!(
                            "Trigger queue full ({}), dropped request for workflow '{}' from {}",
                            self.capacity,
                            dropped.workflow_id,
                            dropped.path.display()
                        );
                        PushOutcome::DroppedOldest(dropped)
                    }
                    None => PushOutcome::Queued,
                }
            }
        };

        self.notify.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<RunRequest> {
        self.lock().pop_front()
    }

    /// Waits for the next request; `None` once closed and drained.
    pub async fn pop(&self) -> Option<RunRequest> {
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.try_pop() {
                return Some(request);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stops accepting requests and wakes every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(workflow: &str, path: &str) -> RunRequest {
        RunRequest::new(workflow, Vec::new(), path, EventKind::Create, "evt_test")
    }

    #[test]
    fn test_fifo_order() {
        let queue = TriggerQueue::new(4);
        queue.push(request("a", "/1"));
        queue.push(request("b", "/2"));

        assert_eq!(queue.try_pop().unwrap().workflow_id, "a");
        assert_eq!(queue.try_pop().unwrap().workflow_id, "b");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_overflow_collapses_same_target() {
        let queue = TriggerQueue::new(2);
        queue.push(request("a", "/1"));
        queue.push(request("b", "/2"));

        assert_eq!(queue.push(request("a", "/3")), PushOutcome::Collapsed);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().workflow_id, "b");
        let last = queue.try_pop().unwrap();
        assert_eq!(last.path, std::path::PathBuf::from("/3"));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = TriggerQueue::new(2);
        queue.push(request("a", "/1"));
        queue.push(request("b", "/2"));

        match queue.push(request("c", "/3")) {
            PushOutcome::DroppedOldest(dropped) => assert_eq!(dropped.workflow_id, "a"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().workflow_id, "b");
    }

    #[test]
    fn test_closed_queue_rejects() {
        let queue = TriggerQueue::new(1);
        queue.close();
        assert_eq!(queue.push(request("a", "/1")), PushOutcome::Closed);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(TriggerQueue::new(8));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(request("late", "/x"));

        let received = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.unwrap().workflow_id, "late");
    }

    #[tokio::test]
    async fn test_pop_returns_none_after_close() {
        let queue = Arc::new(TriggerQueue::new(8));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let received = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_none());
    }
}
