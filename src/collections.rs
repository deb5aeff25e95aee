//! Index-mapped min-heap for time-deferred tasks.
//!
//! `std::collections::BinaryHeap` supports push/pop but not removal or
//! reprioritization of an arbitrary entry, which the delay watcher needs
//! when an evaluation is promoted or flushed. The heap keeps an explicit map
//! from task ID to its current slot, maintained through the heap's own swap
//! operation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{BrokerError, Result};

/// A unit of work that becomes eligible at a known instant.
pub trait ScheduledTask {
    fn task_id(&self) -> &str;
    fn wait_until(&self) -> DateTime<Utc>;
}

/// Min-heap keyed by `wait_until`, deduplicated by task ID.
///
/// Ties on `wait_until` break by task ID so the ordering is total.
#[derive(Debug, Default)]
pub struct ScheduledTaskHeap<T: ScheduledTask> {
    tasks: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T: ScheduledTask> ScheduledTaskHeap<T> {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    /// The task with the earliest `wait_until`, if any.
    pub fn peek(&self) -> Option<&T> {
        self.tasks.first()
    }

    pub fn push(&mut self, task: T) -> Result<()> {
        let id = task.task_id().to_string();
        if self.index.contains_key(&id) {
            return Err(BrokerError::DuplicateTask(id));
        }
        self.tasks.push(task);
        let last = self.tasks.len() - 1;
        self.index.insert(id, last);
        self.sift_up(last);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.tasks.is_empty() {
            return None;
        }
        let last = self.tasks.len() - 1;
        self.swap_slots(0, last);
        let task = self.tasks.pop()?;
        self.index.remove(task.task_id());
        if !self.tasks.is_empty() {
            self.sift_down(0);
        }
        Some(task)
    }

    /// Removes the task with the given ID from anywhere in the heap.
    pub fn remove(&mut self, task_id: &str) -> Option<T> {
        let slot = *self.index.get(task_id)?;
        let last = self.tasks.len() - 1;
        self.swap_slots(slot, last);
        let task = self.tasks.pop()?;
        self.index.remove(task.task_id());
        if slot < self.tasks.len() {
            self.sift_down(slot);
            self.sift_up(slot);
        }
        Some(task)
    }

    /// Replaces the task with the same ID, re-sifting for its new
    /// `wait_until`. Returns the displaced task, or `None` if the ID is not
    /// tracked (the replacement is dropped in that case).
    pub fn update(&mut self, task: T) -> Option<T> {
        let slot = *self.index.get(task.task_id())?;
        let old = std::mem::replace(&mut self.tasks[slot], task);
        self.sift_down(slot);
        self.sift_up(slot);
        Some(old)
    }

    fn earlier(&self, i: usize, j: usize) -> bool {
        let (a, b) = (&self.tasks[i], &self.tasks[j]);
        (a.wait_until(), a.task_id()) < (b.wait_until(), b.task_id())
    }

    fn swap_slots(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.tasks.swap(i, j);
        self.index.insert(self.tasks[i].task_id().to_string(), i);
        self.index.insert(self.tasks[j].task_id().to_string(), j);
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.earlier(slot, parent) {
                break;
            }
            self.swap_slots(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.tasks.len();
        loop {
            let mut smallest = slot;
            let left = 2 * slot + 1;
            let right = 2 * slot + 2;
            if left < len && self.earlier(left, smallest) {
                smallest = left;
            }
            if right < len && self.earlier(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                return;
            }
            self.swap_slots(slot, smallest);
            slot = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Task {
        id: String,
        at: DateTime<Utc>,
    }

    impl Task {
        fn new(id: &str, offset_ms: i64) -> Self {
            Self {
                id: id.to_string(),
                at: Utc::now() + Duration::milliseconds(offset_ms),
            }
        }
    }

    impl ScheduledTask for Task {
        fn task_id(&self) -> &str {
            &self.id
        }

        fn wait_until(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn pops_in_time_order() {
        let mut heap = ScheduledTaskHeap::new();
        heap.push(Task::new("c", 300)).unwrap();
        heap.push(Task::new("a", 100)).unwrap();
        heap.push(Task::new("b", 200)).unwrap();

        assert_eq!(heap.len(), 3);
        assert_eq!(heap.peek().unwrap().id, "a");
        assert_eq!(heap.pop().unwrap().id, "a");
        assert_eq!(heap.pop().unwrap().id, "b");
        assert_eq!(heap.pop().unwrap().id, "c");
        assert!(heap.pop().is_none());
        assert!(heap.is_empty());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut heap = ScheduledTaskHeap::new();
        heap.push(Task::new("a", 100)).unwrap();
        let err = heap.push(Task::new("a", 200)).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateTask(id) if id == "a"));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn removes_by_id_from_the_middle() {
        let mut heap = ScheduledTaskHeap::new();
        for (id, offset) in [("a", 100), ("b", 200), ("c", 300), ("d", 400), ("e", 500)] {
            heap.push(Task::new(id, offset)).unwrap();
        }

        assert!(heap.remove("c").is_some());
        assert!(heap.remove("c").is_none());
        assert!(!heap.contains("c"));

        let order: Vec<String> = std::iter::from_fn(|| heap.pop()).map(|t| t.id).collect();
        assert_eq!(order, ["a", "b", "d", "e"]);
    }

    #[test]
    fn update_reorders_the_heap() {
        let mut heap = ScheduledTaskHeap::new();
        heap.push(Task::new("a", 100)).unwrap();
        heap.push(Task::new("b", 200)).unwrap();
        heap.push(Task::new("c", 300)).unwrap();

        // Push "c" to the front.
        let old = heap.update(Task::new("c", 10));
        assert!(old.is_some());
        assert_eq!(heap.peek().unwrap().id, "c");

        // Updating an untracked ID is a no-op.
        assert!(heap.update(Task::new("zzz", 1)).is_none());
        assert_eq!(heap.len(), 3);
    }
}
