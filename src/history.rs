use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde_json::Value;

pub const DEFAULT_HISTORY_LENGTH: usize = 200;

/// Most-recent-first samples of one topic, each with the wall-clock time it was taken.
#[derive(Debug, Clone)]
pub struct History {
    capacity: usize,
    samples: VecDeque<(Value, DateTime<Local>)>,
    enqueued: bool,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
            enqueued: false,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.push_at(value, Local::now());
    }

    /// Prepend a sample, or overwrite the newest one if an out-of-band refresh was enqueued.
    pub fn push_at(&mut self, value: Value, time: DateTime<Local>) {
        if std::mem::take(&mut self.enqueued) {
            if let Some(newest) = self.samples.front_mut() {
                *newest = (value, time);
                return;
            }
        }
        self.samples.push_front((value, time));
        self.samples.truncate(self.capacity);
    }

    /// Replace everything with a single sample, for data without a meaningful trend.
    pub fn set_single(&mut self, value: Value) {
        self.samples.clear();
        self.samples.push_front((value, Local::now()));
        self.enqueued = false;
    }

    /// Make the next push overwrite the newest sample instead of adding one.
    pub fn enqueue(&mut self) {
        self.enqueued = true;
    }

    pub fn is_enqueued(&self) -> bool {
        self.enqueued
    }

    pub fn current(&self) -> Option<&Value> {
        self.samples.front().map(|(v, _)| v)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.samples.iter().map(|(v, _)| v)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = &DateTime<Local>> {
        self.samples.iter().map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.enqueued = false;
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn newest_first_and_bounded() {
        let mut h = History::new(3);
        for i in 0..5 {
            h.push(json!(i));
            assert!(h.len() <= 3);
            assert_eq!(h.values().count(), h.timestamps().count());
        }
        assert_eq!(h.values().cloned().collect::<Vec<_>>(), [json!(4), json!(3), json!(2)]);
        assert_eq!(h.current(), Some(&json!(4)));
    }

    #[test]
    fn enqueued_push_overwrites_newest() {
        let mut h = History::default();
        h.push(json!(10));
        h.push(json!(20));
        h.enqueue();
        h.push(json!(25));
        assert_eq!(h.len(), 2);
        assert_eq!(h.current(), Some(&json!(25)));
        assert!(!h.is_enqueued());
        h.push(json!(30));
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn enqueued_push_on_empty_prepends() {
        let mut h = History::default();
        h.enqueue();
        h.push(json!(1));
        assert_eq!(h.len(), 1);
        assert!(!h.is_enqueued());
    }

    #[test]
    fn set_single_replaces_all() {
        let mut h = History::default();
        h.push(json!(1));
        h.push(json!(2));
        h.set_single(json!("static"));
        assert_eq!(h.len(), 1);
        assert_eq!(h.current(), Some(&json!("static")));
    }

    #[test]
    fn clear_drops_samples_and_mark() {
        let mut h = History::default();
        h.push(json!(1));
        h.enqueue();
        h.clear();
        assert!(h.is_empty());
        assert!(!h.is_enqueued());
        assert_eq!(h.capacity(), DEFAULT_HISTORY_LENGTH);
    }
}
