//! Bounded, blocking broadcast queue (spec §4.4).
//!
//! The host keeps one of these per transport. A dedicated consumer thread
//! (see `host.rs`) blocks in `pop`, and for each item snapshots the roster
//! and posts the packet into every live wire's own outbound queue, skipping
//! the originator. `stop()` enqueues a sentinel to unblock the consumer.
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
};

use crate::message::PeerId;

/// One fan-out job: an already-framed packet shared (refcounted) across
/// every wire that will receive it this round, plus the id to skip.
#[derive(Clone)]
pub struct BroadcastItem {
    pub frame: Arc<[u8]>,
    pub skip: Option<PeerId>,
}

struct Inner {
    items: VecDeque<Option<BroadcastItem>>,
    stopped: bool,
}

pub struct BroadcastQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BroadcastQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner { items: VecDeque::new(), stopped: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks while the queue is at capacity (backpressure).
    pub fn push(&self, item: BroadcastItem) {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= self.capacity && !inner.stopped {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.stopped {
            return;
        }
        inner.items.push_back(Some(item));
        self.not_empty.notify_one();
    }

    /// Enqueues the sentinel that unblocks a blocked `pop` and marks the
    /// queue stopped — further `push`es are dropped silently.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        inner.items.push_back(None);
        self.not_empty.notify_one();
        self.not_full.notify_all();
    }

    /// Blocks until an item is available. Returns `None` once the sentinel
    /// has been consumed.
    pub fn pop(&self) -> Option<BroadcastItem> {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.is_empty() {
            inner = self.not_empty.wait(inner).unwrap();
        }
        let item = inner.items.pop_front().unwrap();
        self.not_full.notify_one();
        item
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let q = Arc::new(BroadcastQueue::new(8));
        for i in 0..4u8 {
            q.push(BroadcastItem { frame: Arc::from(vec![i]), skip: None });
        }
        for i in 0..4u8 {
            assert_eq!(q.pop().unwrap().frame.as_ref(), &[i]);
        }
    }

    #[test]
    fn stop_unblocks_consumer() {
        let q = Arc::new(BroadcastQueue::new(4));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.stop();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn push_blocks_until_space_freed() {
        let q = Arc::new(BroadcastQueue::new(1));
        q.push(BroadcastItem { frame: Arc::from(vec![1]), skip: None });
        let q2 = q.clone();
        let producer = thread::spawn(move || {
            q2.push(BroadcastItem { frame: Arc::from(vec![2]), skip: None });
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());
        q.pop();
        producer.join().unwrap();
    }
}
