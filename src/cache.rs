#![forbid(unsafe_code)]

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::metadata::VideoMetadata;

/// Bounded, newest-first ring buffer of recently seen videos.
///
/// Written by the inbound listener, read by HTTP handlers. Dedup is a linear
/// scan by `id`; fine at this size.
pub struct RecentVideoCache {
    capacity: usize,
    entries: Mutex<VecDeque<VideoMetadata>>,
}

impl RecentVideoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Inserts at the front unless a record with the same id is already
    /// present. Returns whether the record was inserted.
    pub fn push(&self, record: VideoMetadata) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mut entries = self.entries.lock();
        if entries.iter().any(|existing| existing.id == record.id) {
            return false;
        }
        if entries.len() == self.capacity {
            entries.pop_back();
        }
        entries.push_front(record);
        true
    }

    /// Up to `limit` most recent entries, newest first.
    pub fn snapshot(&self, limit: usize) -> Vec<VideoMetadata> {
        self.entries.lock().iter().take(limit).cloned().collect()
    }

    pub fn find(&self, id: i64) -> Option<VideoMetadata> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
