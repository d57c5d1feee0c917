//! Band-ordered pending-task storage.
//!
//! All `high` entries sit contiguously at the front, then `normal`, then
//! `low`; within a band entries are FIFO. Insertion is O(n), which is fine
//! because admission bounds the length by `max_queue`.

use std::collections::VecDeque;

use crate::task::{TaskEntry, TaskPriority};

#[derive(Debug, Default)]
pub struct PriorityTaskQueue {
    entries: VecDeque<TaskEntry>,
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert at the tail of the entry's band.
    ///
    /// `high` goes before the first non-`high`, `normal` before the first
    /// `low`, `low` at the tail.
    pub fn enqueue(&mut self, entry: TaskEntry) {
        let pos = match entry.priority {
            TaskPriority::High => self.first_position(|p| p != TaskPriority::High),
            TaskPriority::Normal => self.first_position(|p| p == TaskPriority::Low),
            TaskPriority::Low => None,
        };
        self.insert_at(pos, entry);
    }

    /// Insert at the head of the entry's band, ahead of same-band peers.
    ///
    /// Used for retries so re-queued work is not starved. Band order wins over
    /// "front": a retried `low` entry still waits behind queued `high` work.
    pub fn requeue_front(&mut self, entry: TaskEntry) {
        let band = entry.priority;
        let pos = self.first_position(|p| p >= band);
        self.insert_at(pos, entry);
    }

    pub fn pop_front(&mut self) -> Option<TaskEntry> {
        self.entries.pop_front()
    }

    /// Pop up to `n` entries from the head.
    pub fn take_front(&mut self, n: usize) -> Vec<TaskEntry> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// Remove every entry, in dequeue order.
    pub fn drain(&mut self) -> Vec<TaskEntry> {
        self.entries.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskEntry> {
        self.entries.iter()
    }

    /// Count of entries per band, `[high, normal, low]`.
    pub fn band_counts(&self) -> [usize; 3] {
        let mut counts = [0; 3];
        for entry in &self.entries {
            counts[entry.priority as usize] += 1;
        }
        counts
    }

    fn first_position(&self, pred: impl Fn(TaskPriority) -> bool) -> Option<usize> {
        self.entries.iter().position(|e| pred(e.priority))
    }

    fn insert_at(&mut self, pos: Option<usize>, entry: TaskEntry) {
        match pos {
            Some(i) => self.entries.insert(i, entry),
            None => self.entries.push_back(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, priority: TaskPriority) -> TaskEntry {
        TaskEntry::new(json!({ "id": id }), priority, 3).with_id(id)
    }

    fn ids(q: &PriorityTaskQueue) -> Vec<String> {
        q.iter().map(|e| e.task_id.clone()).collect()
    }

    #[test]
    fn bands_are_ordered_and_fifo_within_band() {
        let mut q = PriorityTaskQueue::new();
        q.enqueue(entry("n1", TaskPriority::Normal));
        q.enqueue(entry("l1", TaskPriority::Low));
        q.enqueue(entry("h1", TaskPriority::High));
        q.enqueue(entry("n2", TaskPriority::Normal));
        q.enqueue(entry("h2", TaskPriority::High));
        q.enqueue(entry("l2", TaskPriority::Low));

        assert_eq!(ids(&q), vec!["h1", "h2", "n1", "n2", "l1", "l2"]);
        assert_eq!(q.band_counts(), [2, 2, 2]);
    }

    #[test]
    fn dequeue_order_holds_for_interleaved_operations() {
        let mut q = PriorityTaskQueue::new();
        q.enqueue(entry("l1", TaskPriority::Low));
        q.enqueue(entry("n1", TaskPriority::Normal));
        assert_eq!(q.pop_front().unwrap().task_id, "n1");

        q.enqueue(entry("h1", TaskPriority::High));
        q.enqueue(entry("n2", TaskPriority::Normal));
        assert_eq!(q.pop_front().unwrap().task_id, "h1");
        assert_eq!(q.pop_front().unwrap().task_id, "n2");
        assert_eq!(q.pop_front().unwrap().task_id, "l1");
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn high_into_queue_without_high_goes_to_front() {
        let mut q = PriorityTaskQueue::new();
        q.enqueue(entry("l1", TaskPriority::Low));
        q.enqueue(entry("h1", TaskPriority::High));
        assert_eq!(ids(&q), vec!["h1", "l1"]);
    }

    #[test]
    fn requeue_front_goes_ahead_of_same_band_only() {
        let mut q = PriorityTaskQueue::new();
        q.enqueue(entry("h1", TaskPriority::High));
        q.enqueue(entry("n1", TaskPriority::Normal));
        q.enqueue(entry("l1", TaskPriority::Low));

        q.requeue_front(entry("n-retry", TaskPriority::Normal));
        q.requeue_front(entry("l-retry", TaskPriority::Low));
        q.requeue_front(entry("h-retry", TaskPriority::High));

        assert_eq!(
            ids(&q),
            vec!["h-retry", "h1", "n-retry", "n1", "l-retry", "l1"]
        );
    }

    #[test]
    fn take_front_stops_at_queue_length() {
        let mut q = PriorityTaskQueue::new();
        for i in 0..3 {
            q.enqueue(entry(&format!("t{i}"), TaskPriority::Normal));
        }
        let first = q.take_front(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].task_id, "t0");
        let rest = q.take_front(5);
        assert_eq!(rest.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_empties_in_dequeue_order() {
        let mut q = PriorityTaskQueue::new();
        q.enqueue(entry("a", TaskPriority::Low));
        q.enqueue(entry("b", TaskPriority::High));
        let drained: Vec<String> = q.drain().into_iter().map(|e| e.task_id).collect();
        assert_eq!(drained, ["b", "a"]);
        assert_eq!(q.len(), 0);
    }
}
