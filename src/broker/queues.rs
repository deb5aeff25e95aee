//! Priority orderings for ready and pending evaluations.
//!
//! Both queues are max-heaps over priority. They differ in how ties break:
//! the ready queue is FIFO at equal priority (oldest create time first) so
//! schedulers drain fairly, while a job's pending queue prefers the most
//! recently modified evaluation since that one reflects the latest job
//! state.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::evaluation::Evaluation;

#[derive(Debug)]
struct ReadyEntry(Evaluation);

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.create_time.cmp(&self.0.create_time))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

/// Evaluations eligible to run now for one scheduler type, ordered by
/// priority descending then create time ascending.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(16),
        }
    }

    pub fn push(&mut self, eval: Evaluation) {
        self.heap.push(ReadyEntry(eval));
    }

    pub fn peek(&self) -> Option<&Evaluation> {
        self.heap.peek().map(|entry| &entry.0)
    }

    pub fn pop(&mut self) -> Option<Evaluation> {
        self.heap.pop().map(|entry| entry.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Debug)]
struct PendingEntry(Evaluation);

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| self.0.modify_time.cmp(&other.0.modify_time))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingEntry {}

/// Evaluations queued behind the active one for a single job, ordered by
/// priority descending then modify time descending.
#[derive(Debug, Default)]
pub struct PendingQueue {
    heap: BinaryHeap<PendingEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, eval: Evaluation) {
        self.heap.push(PendingEntry(eval));
    }

    pub fn pop(&mut self) -> Option<Evaluation> {
        self.heap.pop().map(|entry| entry.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Retains only the top-ranked pending evaluation and returns the rest,
    /// which have been superseded and must be externally marked canceled.
    pub fn mark_for_cancel(&mut self) -> Vec<Evaluation> {
        if self.heap.len() <= 1 {
            return Vec::new();
        }
        let keep = match self.heap.pop() {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let canceled = std::mem::take(&mut self.heap)
            .into_iter()
            .map(|entry| entry.0)
            .collect();
        self.heap.push(keep);
        canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn eval(priority: i64, offset_ms: i64) -> Evaluation {
        let mut e = Evaluation::new().with_priority(priority);
        e.create_time += Duration::milliseconds(offset_ms);
        e.modify_time = e.create_time;
        e
    }

    #[test]
    fn ready_orders_by_priority_then_fifo() {
        let mut queue = ReadyQueue::new();
        let low = eval(10, 0);
        let high = eval(30, 10);
        let older = eval(20, 20);
        let newer = eval(20, 30);

        queue.push(newer.clone());
        queue.push(low.clone());
        queue.push(high.clone());
        queue.push(older.clone());

        assert_eq!(queue.peek().unwrap().id, high.id);
        assert_eq!(queue.pop().unwrap().id, high.id);
        assert_eq!(queue.pop().unwrap().id, older.id, "FIFO at equal priority");
        assert_eq!(queue.pop().unwrap().id, newer.id);
        assert_eq!(queue.pop().unwrap().id, low.id);
        assert!(queue.is_empty());
    }

    #[test]
    fn pending_prefers_most_recently_modified() {
        let mut queue = PendingQueue::new();
        let older = eval(20, 0);
        let newer = eval(20, 10);

        queue.push(older.clone());
        queue.push(newer.clone());

        assert_eq!(queue.pop().unwrap().id, newer.id);
        assert_eq!(queue.pop().unwrap().id, older.id);
    }

    #[test]
    fn mark_for_cancel_keeps_only_the_top() {
        let mut queue = PendingQueue::new();
        let keep = eval(50, 0);
        let drop1 = eval(20, 10);
        let drop2 = eval(10, 20);

        queue.push(drop1.clone());
        queue.push(keep.clone());
        queue.push(drop2.clone());

        let canceled = queue.mark_for_cancel();
        assert_eq!(canceled.len(), 2);
        assert!(canceled.iter().all(|e| e.id != keep.id));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().id, keep.id);
    }

    #[test]
    fn mark_for_cancel_on_single_entry_is_noop() {
        let mut queue = PendingQueue::new();
        queue.push(eval(10, 0));
        assert!(queue.mark_for_cancel().is_empty());
        assert_eq!(queue.len(), 1);
    }
}
