//! Fixed-capacity, overwrite-oldest FIFO with paginated newest-first reads.
//!
//! This is the in-memory shape the timeline cache serializes into Redis:
//! one ring per user, holding denormalized timeline entries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RingBuffer<T> {
    size: usize,
    head: usize,
    count: usize,
    items: Vec<Option<T>>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "ring buffer capacity must be non-zero");
        Self {
            size,
            head: 0,
            count: 0,
            items: vec![None; size],
        }
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Writes at `head`, advances `head`, grows `count` until full. Once
    /// full, the write at `head` is itself the overwrite of the oldest
    /// slot — no separate eviction step needed.
    pub fn add(&mut self, item: T) {
        self.items[self.head] = Some(item);
        self.head = (self.head + 1) % self.size;
        if self.count < self.size {
            self.count += 1;
        }
    }

    /// Newest-first pagination: starts at `head - 1 - offset` and walks
    /// backwards, emitting `min(limit, count - offset)` items.
    pub fn read(&self, limit: usize, offset: usize) -> Vec<T> {
        if self.count == 0 || offset >= self.count {
            return Vec::new();
        }

        let available = self.count - offset;
        let take = limit.min(available);
        let mut out = Vec::with_capacity(take);

        let start_pos = (self.head + self.size - 1 - offset) % self.size;
        for i in 0..take {
            let pos = (start_pos + self.size - i) % self.size;
            if let Some(item) = &self.items[pos] {
                out.push(item.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_read_newest_first() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(4);
        rb.add(1);
        rb.add(2);
        rb.add(3);
        assert_eq!(rb.read(10, 0), vec![3, 2, 1]);
    }

    #[test]
    fn overwrites_oldest_once_full() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(4);
        for v in 1..=6 {
            rb.add(v);
        }
        // capacity 4, wrote 1..=6: only 3,4,5,6 survive, newest first.
        assert_eq!(rb.read(10, 0), vec![6, 5, 4, 3]);
        assert_eq!(rb.len(), 4);
    }

    #[test]
    fn respects_limit_and_offset() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(10);
        for v in 1..=10 {
            rb.add(v);
        }
        assert_eq!(rb.read(3, 2), vec![8, 7, 6]);
    }

    #[test]
    fn offset_beyond_count_is_empty() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(4);
        rb.add(1);
        assert_eq!(rb.read(10, 5), Vec::<i32>::new());
    }

    #[test]
    fn empty_buffer_reads_empty() {
        let rb: RingBuffer<i32> = RingBuffer::new(4);
        assert_eq!(rb.read(10, 0), Vec::<i32>::new());
    }

    #[test]
    fn serialize_deserialize_is_a_fixed_point() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(4);
        for v in 1..=5 {
            rb.add(v);
        }
        let json = serde_json::to_string(&rb).unwrap();
        let roundtripped: RingBuffer<i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(rb, roundtripped);
        assert_eq!(roundtripped.read(10, 0), rb.read(10, 0));
    }

    #[test]
    fn capacity_four_add_read_matches_worked_example() {
        // Scenario D from the testable-properties sweep: C=4, add A..F
        // (1..=6), read(limit=10, offset=0) -> [F,E,D,C], read(limit=2,
        // offset=2) -> [D,C].
        let mut rb: RingBuffer<i32> = RingBuffer::new(4);
        for v in 1..=6 {
            rb.add(v);
        }
        assert_eq!(rb.read(10, 0), vec![6, 5, 4, 3]);
        assert_eq!(rb.read(2, 2), vec![4, 3]);
    }
}
