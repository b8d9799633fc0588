//! # Ring Buffer
//!
//! Fixed-capacity circular buffer of log lines. Writes are O(1) and overwrite
//! the oldest entry once full. [`SharedRingBuffer`] wraps it in a
//! `parking_lot::RwLock` for the tailer (single writer) and the log panel
//! (reader).

use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBuffer {
    slots: Vec<String>,
    head: usize,
    count: usize,
}

impl RingBuffer {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![String::new(); capacity.max(1)],
            head: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.slots[self.head] = line.into();
        self.head = (self.head + 1) % self.slots.len();
        if self.count < self.slots.len() {
            self.count += 1;
        }
    }

    /// Oldest-first iterator over the live window.
    pub fn iter(&self) -> impl Iterator<Item = &String> + '_ {
        let start = (self.head + self.slots.len() - self.count) % self.slots.len();
        (0..self.count).map(move |i| &self.slots[(start + i) % self.slots.len()])
    }

    /// In-order copy of the live window.
    pub fn get_all(&self) -> Vec<String> {
        self.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(String::clear);
        self.head = 0;
        self.count = 0;
    }
}

/// Cloneable handle to a lock-protected [`RingBuffer`].
#[derive(Debug, Clone)]
pub struct SharedRingBuffer {
    inner: Arc<RwLock<RingBuffer>>,
}

impl SharedRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RingBuffer::new(capacity))),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        self.inner.write().push(line);
    }

    /// Appends a batch under one write lock.
    pub fn extend<I: IntoIterator<Item = String>>(&self, lines: I) {
        let mut buf = self.inner.write();
        for line in lines {
            buf.push(line);
        }
    }

    pub fn get_all(&self) -> Vec<String> {
        self.inner.read().get_all()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_lines_in_order() {
        let mut buf = RingBuffer::new(3);
        assert!(buf.is_empty());
        for i in 1..=5 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.get_all(), vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn partial_window_and_clear() {
        let mut buf = RingBuffer::new(4);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.get_all(), vec!["a", "b"]);
        buf.clear();
        assert!(buf.get_all().is_empty());
        buf.push("c");
        assert_eq!(buf.get_all(), vec!["c"]);
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut buf = RingBuffer::new(0);
        buf.push("x");
        buf.push("y");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.get_all(), vec!["y"]);
    }

    #[test]
    fn shared_handle_sees_writes_from_other_threads() {
        let shared = SharedRingBuffer::new(500);
        let writer = shared.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000 {
                writer.push(i.to_string());
            }
        });
        while !handle.is_finished() {
            assert!(shared.get_all().len() <= 500);
        }
        handle.join().unwrap();
        let lines = shared.get_all();
        assert_eq!(lines.len(), 500);
        assert_eq!(lines.first().map(String::as_str), Some("500"));
        assert_eq!(lines.last().map(String::as_str), Some("999"));
    }
}
