use std::collections::{HashMap, HashSet};

use crate::session::image::{BufferId, SharedImage};

struct Tracked {
    count: usize,
    buffer: SharedImage,
}

/// Explicit holder counts for every buffer the session has adopted.
///
/// The tracker keeps its own handle to each adopted buffer, so pixels are only
/// dropped by [`RefTracker::reclaim`], never as a side effect of a holder
/// letting go.
#[derive(Default)]
pub struct RefTracker {
    entries: HashMap<BufferId, Tracked>,
}

/// Outcome of a reclamation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimStats {
    pub buffers: usize,
    pub bytes: usize,
}

impl RefTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more holder of `buffer`.
    pub fn adopt(&mut self, buffer: &SharedImage) {
        self.entries
            .entry(buffer.id())
            .or_insert_with(|| Tracked {
                count: 0,
                buffer: SharedImage::clone(buffer),
            })
            .count += 1;
    }

    /// Record that one holder of `id` let go. Returns `false` (and leaves the
    /// count untouched) for unknown ids or counts already at zero.
    pub fn release(&mut self, id: BufferId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.count > 0 => {
                entry.count -= 1;
                true
            }
            Some(_) => {
                tracing::warn!(%id, "refusing to release buffer with no holders");
                false
            }
            None => {
                tracing::warn!(%id, "release of untracked buffer");
                false
            }
        }
    }

    pub fn count(&self, id: BufferId) -> usize {
        self.entries.get(&id).map_or(0, |entry| entry.count)
    }

    pub fn is_tracked(&self, id: BufferId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn tracked_len(&self) -> usize {
        self.entries.len()
    }

    pub fn tracked_bytes(&self) -> usize {
        self.entries.values().map(|entry| entry.buffer.byte_len()).sum()
    }

    /// Ids that a reclamation pass would free given the set of `live` ids
    /// (original, current, preview snapshot, timeline entries).
    pub fn evictable(&self, live: &HashSet<BufferId>) -> Vec<BufferId> {
        let mut ids: Vec<BufferId> = self
            .entries
            .iter()
            .filter(|(id, entry)| entry.count == 0 && !live.contains(id))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Drop the tracker's handle for every evictable id.
    pub fn reclaim(&mut self, live: &HashSet<BufferId>) -> ReclaimStats {
        let mut stats = ReclaimStats::default();
        for id in self.evictable(live) {
            if let Some(entry) = self.entries.remove(&id) {
                stats.buffers += 1;
                stats.bytes += entry.buffer.byte_len();
            }
        }
        if stats.buffers > 0 {
            tracing::debug!(
                buffers = stats.buffers,
                bytes = stats.bytes,
                "reclaimed unreferenced buffers"
            );
        }
        stats
    }

    /// Release one holder of `id` and, if that was the last one and the id
    /// is not `live`, drop the tracker's handle right away. Returns the bytes
    /// freed.
    pub fn release_and_reclaim(&mut self, id: BufferId, live: &HashSet<BufferId>) -> usize {
        if !self.release(id) || self.count(id) > 0 || live.contains(&id) {
            return 0;
        }
        self.entries
            .remove(&id)
            .map_or(0, |entry| entry.buffer.byte_len())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::RefTracker;
    use crate::session::image::{ImageBuffer, SharedImage};
    use std::collections::HashSet;

    fn buffer(value: u8) -> SharedImage {
        ImageBuffer::filled(2, 2, 1, value).expect("buffer").into_shared()
    }

    #[test]
    fn release_never_goes_below_zero() {
        let mut refs = RefTracker::new();
        let a = buffer(1);
        refs.adopt(&a);
        assert!(refs.release(a.id()));
        assert!(!refs.release(a.id()));
        assert_eq!(refs.count(a.id()), 0);
        assert!(!refs.release(buffer(2).id()));
    }

    #[test]
    fn reclaim_skips_counted_and_live_ids() {
        let mut refs = RefTracker::new();
        let held = buffer(1);
        let live = buffer(2);
        let dead = buffer(3);
        for b in [&held, &live, &dead] {
            refs.adopt(b);
        }
        refs.release(live.id());
        refs.release(dead.id());

        let live_ids: HashSet<_> = [live.id()].into_iter().collect();
        assert_eq!(refs.evictable(&live_ids), vec![dead.id()]);

        let stats = refs.reclaim(&live_ids);
        assert_eq!(stats.buffers, 1);
        assert_eq!(stats.bytes, 4);
        assert!(refs.is_tracked(held.id()));
        assert!(refs.is_tracked(live.id()));
        assert!(!refs.is_tracked(dead.id()));
    }

    #[test]
    fn release_and_reclaim_frees_only_the_last_unlisted_holder() {
        let mut refs = RefTracker::new();
        let shared = buffer(4);
        let listed = buffer(5);
        refs.adopt(&shared);
        refs.adopt(&shared);
        refs.adopt(&listed);

        let live: HashSet<_> = [listed.id()].into_iter().collect();
        assert_eq!(refs.release_and_reclaim(shared.id(), &live), 0);
        assert!(refs.is_tracked(shared.id()));
        assert_eq!(refs.release_and_reclaim(shared.id(), &live), 4);
        assert!(!refs.is_tracked(shared.id()));

        assert_eq!(refs.release_and_reclaim(listed.id(), &live), 0);
        assert!(refs.is_tracked(listed.id()));
    }

    #[test]
    fn tracker_keeps_pixels_alive_until_reclaimed() {
        let mut refs = RefTracker::new();
        let a = buffer(7);
        let weak = std::sync::Arc::downgrade(&a);
        refs.adopt(&a);
        refs.release(a.id());
        drop(a);
        assert!(weak.upgrade().is_some());
        refs.reclaim(&HashSet::new());
        assert!(weak.upgrade().is_none());
    }
}
