//! Multi-writer, single-reader coalescing queue.
//!
//! Producers offer keys that need work; the consumer takes them oldest first.
//! A key is queued at most once: offering a key that is already queued moves
//! it to the tail instead of adding a duplicate, so the consumer always
//! processes each key after its most recent change.
//!
//! Nodes live in an arena (`Vec<Node<T>>`) linked through `prev`/`next`
//! indices, with a free list for reuse and a `HashMap` from key to node index.
//! Moving a queued key to the tail is therefore O(1) and allocation free once
//! the arena has grown to the working set.
//!
//! Correctness (no lost updates, no duplicate delivery, coalescing order)
//! holds for any number of producers and exactly one consumer.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Queue errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;

struct Node<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    index: HashMap<T, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    closed: bool,
}

impl<T: Eq + Hash + Clone> Inner<T> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            closed: false,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    /// Queues `value` at the tail. Returns true if it was not queued before.
    fn push_back(&mut self, value: T) -> bool {
        if let Some(&idx) = self.index.get(&value) {
            if self.tail != Some(idx) {
                self.unlink(idx);
                self.link_tail(idx);
            }
            return false;
        }

        let node = Node {
            value: Some(value.clone()),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(value, idx);
        self.link_tail(idx);
        true
    }

    fn pop_front(&mut self) -> Option<T> {
        let idx = self.head?;
        self.unlink(idx);
        let value = self.nodes[idx].value.take()?;
        self.index.remove(&value);
        self.free.push(idx);
        Some(value)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = &self.nodes[idx];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        let node = &mut self.nodes[idx];
        node.prev = None;
        node.next = None;
    }

    fn link_tail(&mut self, idx: usize) {
        self.nodes[idx].prev = self.tail;
        self.nodes[idx].next = None;
        match self.tail {
            Some(t) => self.nodes[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }
}

/// A FIFO queue that coalesces duplicate offers by moving them to the tail.
pub struct CoalescingQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T: Eq + Hash + Clone> CoalescingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            available: Condvar::new(),
        }
    }

    /// Queues `value`, or moves it to the tail if already queued.
    ///
    /// Returns `true` when the value was newly queued. Only a new value wakes
    /// the consumer.
    pub fn offer(&self, value: T) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let added = inner.push_back(value);
        drop(inner);

        if added {
            self.available.notify_one();
        }
        Ok(added)
    }

    /// Offers every value of `values` in order under a single lock
    /// acquisition. Returns how many were newly queued.
    pub fn offer_all(&self, values: impl IntoIterator<Item = T>) -> QueueResult<usize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let mut added = 0;
        for value in values {
            if inner.push_back(value) {
                added += 1;
            }
        }
        drop(inner);

        if added > 0 {
            self.available.notify_one();
        }
        Ok(added)
    }

    /// Removes and returns the head, waiting up to `timeout` for one to
    /// arrive.
    ///
    /// A timeout yields `Ok(None)`. A closed queue keeps handing out what is
    /// still queued and fails with [`QueueError::Closed`] once empty.
    ///
    /// A timeout too large to express as a deadline waits without one.
    pub fn take(&self, timeout: Duration) -> QueueResult<Option<T>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = inner.pop_front() {
                return Ok(Some(value));
            }
            if inner.closed {
                return Err(QueueError::Closed);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut inner, deadline).timed_out() {
                        return Ok(inner.pop_front());
                    }
                }
                None => self.available.wait(&mut inner),
            }
        }
    }

    /// Removes and returns the head without waiting.
    pub fn poll(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Moves up to `max` head values into `sink`, oldest first, in one
    /// atomic step. Returns how many were moved.
    pub fn drain_to<E: Extend<T>>(&self, sink: &mut E, max: usize) -> usize {
        let mut inner = self.inner.lock();
        let count = max.min(inner.len());
        sink.extend(std::iter::from_fn(|| inner.pop_front()).take(count));
        count
    }

    /// Rejects further offers and releases a consumer blocked in `take`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            debug!("Coalescing queue closed with {} pending", inner.len());
        }
        drop(inner);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, value: &T) -> bool {
        self.inner.lock().index.contains_key(value)
    }
}

impl<T: Eq + Hash + Clone> Default for CoalescingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain(queue: &CoalescingQueue<i32>) -> Vec<i32> {
        let mut out = Vec::new();
        queue.drain_to(&mut out, usize::MAX);
        out
    }

    #[test]
    fn test_duplicates_move_to_tail() {
        let queue = CoalescingQueue::new();
        for x in [1, 2, 3, 3, 1, 4] {
            queue.offer(x).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(drain(&queue), vec![2, 3, 1, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offer_reports_new_entries() {
        let queue = CoalescingQueue::new();
        assert!(queue.offer("a").unwrap());
        assert!(queue.offer("b").unwrap());
        assert!(!queue.offer("a").unwrap());
        assert!(queue.contains(&"a"));
        assert_eq!(queue.poll(), Some("b"));
        assert_eq!(queue.poll(), Some("a"));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_drain_respects_max() {
        let queue = CoalescingQueue::new();
        queue.offer_all(1..=5).unwrap();

        let mut first = Vec::new();
        assert_eq!(queue.drain_to(&mut first, 2), 2);
        assert_eq!(first, vec![1, 2]);
        assert_eq!(drain(&queue), vec![3, 4, 5]);
    }

    #[test]
    fn test_slots_are_reused() {
        let queue = CoalescingQueue::new();
        for round in 0..10 {
            queue.offer_all([round, round + 100]).unwrap();
            assert_eq!(drain(&queue), vec![round, round + 100]);
        }
        assert!(queue.inner.lock().nodes.len() <= 2);
    }

    #[test]
    fn test_take_times_out_empty() {
        let queue: CoalescingQueue<i32> = CoalescingQueue::new();
        let start = Instant::now();
        assert_eq!(queue.take(Duration::from_millis(20)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_take_without_deadline() {
        let queue = Arc::new(CoalescingQueue::new());
        queue.offer(1).unwrap();
        assert_eq!(queue.take(Duration::MAX).unwrap(), Some(1));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.take(Duration::MAX))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.offer(2).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(Some(2)));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.take(Duration::MAX))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), Err(QueueError::Closed));
    }

    #[test]
    fn test_closed_queue_drains_then_fails() {
        let queue = CoalescingQueue::new();
        queue.offer(1).unwrap();
        queue.close();

        assert_eq!(queue.offer(2), Err(QueueError::Closed));
        assert_eq!(queue.take(Duration::from_millis(10)).unwrap(), Some(1));
        assert_eq!(
            queue.take(Duration::from_millis(10)),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn test_offer_to_tail_keeps_order() {
        let queue = CoalescingQueue::new();
        queue.offer_all([1, 2, 2, 2]).unwrap();
        assert_eq!(drain(&queue), vec![1, 2]);
    }
}
