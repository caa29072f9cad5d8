use std::collections::VecDeque;

use crate::session::image::{BufferId, SharedImage};

/// Bounded, cursor-addressed undo history.
///
/// Every mutating call returns the entries it dropped so the owner can
/// release them from its reference table.
#[derive(Debug)]
pub struct HistoryTimeline {
    entries: VecDeque<SharedImage>,
    cursor: Option<usize>,
    capacity: usize,
}

impl HistoryTimeline {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            cursor: None,
            capacity,
        }
    }

    /// Truncate the redo branch, append `buffer`, and drop the oldest entry
    /// when over capacity. The cursor ends on the new entry.
    pub fn push(&mut self, buffer: SharedImage) -> Vec<SharedImage> {
        let mut dropped: Vec<SharedImage> = match self.cursor {
            Some(cursor) => self.entries.split_off(cursor + 1).into(),
            None => std::mem::take(&mut self.entries).into(),
        };
        self.entries.push_back(buffer);
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                dropped.push(oldest);
            }
        }
        self.cursor = Some(self.entries.len() - 1);
        dropped
    }

    pub fn undo(&mut self) -> Option<SharedImage> {
        let cursor = self.cursor.filter(|c| *c > 0)? - 1;
        self.cursor = Some(cursor);
        self.entries.get(cursor).cloned()
    }

    pub fn redo(&mut self) -> Option<SharedImage> {
        let cursor = self.cursor.filter(|c| c + 1 < self.entries.len())? + 1;
        self.cursor = Some(cursor);
        self.entries.get(cursor).cloned()
    }

    /// Replace the whole history with a single `original` entry.
    pub fn reset(&mut self, original: SharedImage) -> Vec<SharedImage> {
        let mut dropped = self.clear();
        dropped.extend(self.push(original));
        dropped
    }

    pub fn clear(&mut self) -> Vec<SharedImage> {
        self.cursor = None;
        self.entries.drain(..).collect()
    }

    /// Memory-pressure compaction.
    ///
    /// Only runs when more than half the capacity is in use. Keeps the first
    /// entry, the last entry, the cursor entry and every `step`-th entry,
    /// where `step` grows with how full the timeline is. The cursor keeps
    /// pointing at the same buffer.
    pub fn thin(&mut self) -> Vec<SharedImage> {
        let len = self.entries.len();
        let Some(cursor) = self.cursor else {
            return Vec::new();
        };
        if len * 2 <= self.capacity {
            return Vec::new();
        }

        let step = thinning_step(len, self.capacity);
        let last = len - 1;
        let mut kept = VecDeque::with_capacity(len / step + 3);
        let mut dropped = Vec::new();
        let mut new_cursor = 0;
        for (index, entry) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            if index == 0 || index == cursor || index == last || index % step == 0 {
                if index == cursor {
                    new_cursor = kept.len();
                }
                kept.push_back(entry);
            } else {
                dropped.push(entry);
            }
        }
        self.entries = kept;
        self.cursor = Some(new_cursor);
        tracing::debug!(
            before = len,
            after = self.entries.len(),
            step,
            "thinned history timeline"
        );
        dropped
    }

    pub fn current(&self) -> Option<&SharedImage> {
        self.cursor.and_then(|cursor| self.entries.get(cursor))
    }

    pub fn get(&self, index: usize) -> Option<&SharedImage> {
        self.entries.get(index)
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn can_undo(&self) -> bool {
        self.cursor.is_some_and(|cursor| cursor > 0)
    }

    pub fn can_redo(&self) -> bool {
        self.cursor
            .is_some_and(|cursor| cursor + 1 < self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.entries.iter().any(|entry| entry.id() == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.entries.iter().map(|entry| entry.id())
    }
}

/// Keep every `step`-th entry: 2 just above half capacity, up to 4 when full.
pub fn thinning_step(len: usize, capacity: usize) -> usize {
    (len * 4 / capacity.max(1)).max(2)
}
