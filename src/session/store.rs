use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::codec;
use crate::error::{Result, SessionError};
use crate::memory::{CleanupReport, MemoryTarget, Pressure};
use crate::session::events::{EventBus, SessionEvent};
use crate::session::executor::{ExecMode, OperationExecutor, Transform};
use crate::session::image::{BufferId, ImageBuffer, SharedImage};
use crate::session::preview::{PreviewBase, PreviewOverlay, PreviewPhase};
use crate::session::refs::{ReclaimStats, RefTracker};
use crate::session::timeline::HistoryTimeline;
use crate::settings::SessionConfig;

/// A session shared between the interaction thread and the memory monitor.
pub type SharedSession = Arc<Mutex<SessionStore>>;

/// The editing session: working image, undo history, live preview, and the
/// bookkeeping that decides which buffers may be freed.
///
/// While no preview is active, the timeline entry under the cursor is the
/// same buffer as `current`.
pub struct SessionStore {
    config: Arc<SessionConfig>,
    original: Option<SharedImage>,
    current: Option<SharedImage>,
    preview: PreviewOverlay,
    timeline: HistoryTimeline,
    refs: RefTracker,
    executor: OperationExecutor,
    events: EventBus<SessionEvent>,
    last_reclaim: Instant,
}

impl SessionStore {
    pub fn new(config: Arc<SessionConfig>) -> Self {
        let executor = OperationExecutor::new(config.queue_depth, config.queued_timeout);
        Self {
            timeline: HistoryTimeline::new(config.history_capacity),
            original: None,
            current: None,
            preview: PreviewOverlay::default(),
            refs: RefTracker::new(),
            executor,
            events: EventBus::default(),
            last_reclaim: Instant::now(),
            config,
        }
    }

    pub fn shared(config: Arc<SessionConfig>) -> SharedSession {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Decode `path` and make it the original, current and only history
    /// entry. A rejected file leaves the session untouched.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let decoded = codec::load(path, self.config.max_image_dimensions);
        let buffer = self.report(decoded)?;
        self.load_buffer(buffer)
    }

    /// Adopt an already-decoded buffer as if it had been loaded from disk.
    pub fn load_buffer(&mut self, buffer: ImageBuffer) -> Result<()> {
        let (max_width, max_height) = self.config.max_image_dimensions;
        if buffer.width() > max_width || buffer.height() > max_height {
            return self.report(Err(SessionError::ImageTooLarge {
                width: buffer.width(),
                height: buffer.height(),
                max_width,
                max_height,
            }));
        }

        self.discard_preview();
        let dropped = self.timeline.clear();
        self.release_all(dropped);
        self.set_current(None);
        self.set_original(None);
        self.reclaim();

        let buffer = buffer.into_shared();
        self.set_original(Some(buffer.clone()));
        self.set_current(Some(buffer.clone()));
        self.push_history(buffer);
        tracing::debug!(id = %self.current_id_or_default(), "session loaded image");

        self.events.emit(SessionEvent::ImageChanged);
        self.events.emit(SessionEvent::HistoryChanged);
        Ok(())
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        let result = match &self.current {
            Some(current) => codec::save(current, path),
            None => Err(SessionError::NoImageLoaded),
        };
        self.report(result)
    }

    /// Commit `transform` directly, running it inline.
    pub fn apply(&mut self, transform: &Transform) -> Result<()> {
        self.apply_with(transform, ExecMode::Synchronous)
    }

    /// Commit `transform`, running it on the worker thread.
    pub fn apply_queued(&mut self, transform: &Transform) -> Result<()> {
        self.apply_with(transform, ExecMode::Queued)
    }

    /// Direct commit path. An active preview is dropped and the transform
    /// reads the pre-preview snapshot instead. On failure nothing changes.
    pub fn apply_with(&mut self, transform: &Transform, mode: ExecMode) -> Result<()> {
        let base = match self.preview.snapshot().or(self.current.as_ref()) {
            Some(base) => base.clone(),
            None => return self.report(Err(SessionError::NoImageLoaded)),
        };

        let executed = self.executor.execute(transform, &base, mode);
        let output = self.report(executed)?.into_shared();

        self.discard_preview();
        self.record_edit(&base, output.clone());
        self.set_current(Some(output));
        tracing::debug!(transform = transform.name(), ?mode, "applied transform");

        self.events.emit(SessionEvent::ImageChanged);
        self.events.emit(SessionEvent::HistoryChanged);
        self.maybe_reclaim();
        Ok(())
    }

    /// Show `transform` applied to the pre-preview snapshot without touching
    /// history.
    pub fn preview(&mut self, transform: &Transform) -> Result<()> {
        let Some(current) = self.current.clone() else {
            return self.report(Err(SessionError::NoImageLoaded));
        };
        let base = self.preview.snapshot().unwrap_or(&current).clone();

        let executed = self.executor.execute(transform, &base, ExecMode::Synchronous);
        let output = self.report(executed)?.into_shared();

        if let PreviewBase::Started(snapshot) = self.preview.base(&current) {
            self.refs.adopt(&snapshot);
        }
        self.set_current(Some(output));
        tracing::debug!(transform = transform.name(), "previewing transform");

        self.events.emit(SessionEvent::ImageChanged);
        Ok(())
    }

    /// Turn the live preview into a history entry. The pre-preview snapshot
    /// becomes the undo target. Returns `false` when no preview is active.
    pub fn commit(&mut self) -> bool {
        let Some(live) = self.current.clone() else {
            return false;
        };
        let Some(snapshot) = self.preview.take() else {
            return false;
        };

        self.record_edit(&snapshot, live);
        self.refs.release(snapshot.id());
        tracing::debug!("committed preview");

        self.events.emit(SessionEvent::HistoryChanged);
        self.maybe_reclaim();
        true
    }

    /// Throw the preview away and show the pre-preview snapshot again.
    pub fn cancel_preview(&mut self) -> bool {
        let Some(snapshot) = self.preview.take() else {
            return false;
        };
        self.set_current(Some(snapshot.clone()));
        self.refs.release(snapshot.id());
        tracing::debug!("cancelled preview");

        self.events.emit(SessionEvent::ImageChanged);
        true
    }

    pub fn undo(&mut self) -> bool {
        if !self.timeline.can_undo() {
            return false;
        }
        self.discard_preview();
        let Some(target) = self.timeline.undo() else {
            return false;
        };
        self.navigate_to(target);
        true
    }

    pub fn redo(&mut self) -> bool {
        if !self.timeline.can_redo() {
            return false;
        }
        self.discard_preview();
        let Some(target) = self.timeline.redo() else {
            return false;
        };
        self.navigate_to(target);
        true
    }

    /// Replace history with the original image alone.
    pub fn reset_to_original(&mut self) -> Result<()> {
        let Some(original) = self.original.clone() else {
            return self.report(Err(SessionError::NoImageLoaded));
        };
        self.discard_preview();
        self.refs.adopt(&original);
        let dropped = self.timeline.reset(original.clone());
        self.release_all(dropped);
        self.set_current(Some(original));

        self.events.emit(SessionEvent::ImageChanged);
        self.events.emit(SessionEvent::HistoryChanged);
        Ok(())
    }

    /// Thin history under memory pressure. `current`, `original` and the
    /// cursor entry always survive.
    pub fn compact(&mut self) -> usize {
        let dropped = self.timeline.thin();
        let thinned = dropped.len();
        self.release_all(dropped);
        if thinned > 0 {
            self.events.emit(SessionEvent::HistoryChanged);
        }
        thinned
    }

    /// Free every tracked buffer no holder references any more.
    pub fn reclaim(&mut self) -> ReclaimStats {
        let live = self.live_ids();
        self.last_reclaim = Instant::now();
        self.refs.reclaim(&live)
    }

    pub fn current(&self) -> Option<&SharedImage> {
        self.current.as_ref()
    }

    pub fn original(&self) -> Option<&SharedImage> {
        self.original.as_ref()
    }

    pub fn preview_snapshot(&self) -> Option<&SharedImage> {
        self.preview.snapshot()
    }

    pub fn preview_phase(&self) -> PreviewPhase {
        self.preview.phase()
    }

    pub fn is_previewing(&self) -> bool {
        self.preview.is_active()
    }

    pub fn has_image(&self) -> bool {
        self.current.is_some()
    }

    pub fn can_undo(&self) -> bool {
        self.timeline.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.timeline.can_redo()
    }

    pub fn timeline(&self) -> &HistoryTimeline {
        &self.timeline
    }

    pub fn history_len(&self) -> usize {
        self.timeline.len()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.timeline.cursor()
    }

    pub fn ref_count(&self, id: BufferId) -> usize {
        self.refs.count(id)
    }

    pub fn is_tracked(&self, id: BufferId) -> bool {
        self.refs.is_tracked(id)
    }

    pub fn tracked_bytes(&self) -> usize {
        self.refs.tracked_bytes()
    }

    /// First broken session invariant, if any.
    pub fn invariant_violation(&self) -> Option<String> {
        if self.timeline.len() > self.timeline.capacity() {
            return Some(format!(
                "timeline holds {} entries, capacity {}",
                self.timeline.len(),
                self.timeline.capacity()
            ));
        }
        if self.timeline.is_empty() != self.timeline.cursor().is_none() {
            return Some("cursor presence does not match timeline emptiness".into());
        }
        if !self.preview.is_active() {
            let head = self.timeline.current().map(|b| b.id());
            let current = self.current.as_ref().map(|b| b.id());
            if head != current {
                return Some(format!(
                    "current {current:?} differs from cursor entry {head:?}"
                ));
            }
        }
        for id in self.live_ids() {
            if !self.refs.is_tracked(id) {
                return Some(format!("live buffer {id} is not tracked"));
            }
        }
        None
    }

    /// Make `pre` the undo target (pushing it if the cursor is elsewhere)
    /// and `result` the new head.
    fn record_edit(&mut self, pre: &SharedImage, result: SharedImage) {
        let head = self.timeline.current().map(|entry| entry.id());
        if head != Some(pre.id()) {
            self.push_history(pre.clone());
        }
        self.push_history(result);
    }

    fn navigate_to(&mut self, target: SharedImage) {
        self.set_current(Some(target));
        self.events.emit(SessionEvent::ImageChanged);
        self.events.emit(SessionEvent::HistoryChanged);
    }

    fn push_history(&mut self, buffer: SharedImage) {
        self.refs.adopt(&buffer);
        let dropped = self.timeline.push(buffer);
        self.release_all(dropped);
    }

    /// Replace `current`. A replaced buffer nothing else holds (an
    /// overwritten preview result) is freed immediately.
    fn set_current(&mut self, next: Option<SharedImage>) {
        if let Some(next) = &next {
            self.refs.adopt(next);
        }
        if let Some(previous) = std::mem::replace(&mut self.current, next) {
            let live = self.live_ids();
            let freed = self.refs.release_and_reclaim(previous.id(), &live);
            if freed > 0 {
                tracing::trace!(id = %previous.id(), freed, "dropped replaced buffer");
            }
        }
    }

    fn set_original(&mut self, next: Option<SharedImage>) {
        if let Some(next) = &next {
            self.refs.adopt(next);
        }
        if let Some(previous) = std::mem::replace(&mut self.original, next) {
            self.refs.release(previous.id());
        }
    }

    /// Drop the preview snapshot without restoring it; callers replace
    /// `current` themselves.
    fn discard_preview(&mut self) {
        if let Some(snapshot) = self.preview.take() {
            self.refs.release(snapshot.id());
        }
    }

    fn release_all(&mut self, dropped: Vec<SharedImage>) {
        for buffer in dropped {
            self.refs.release(buffer.id());
        }
    }

    fn live_ids(&self) -> HashSet<BufferId> {
        self.timeline
            .ids()
            .chain(self.original.iter().map(|b| b.id()))
            .chain(self.current.iter().map(|b| b.id()))
            .chain(self.preview.snapshot().map(|b| b.id()))
            .collect()
    }

    fn maybe_reclaim(&mut self) {
        if self.last_reclaim.elapsed() >= self.config.cleanup_interval {
            self.reclaim();
        }
    }

    fn current_id_or_default(&self) -> String {
        self.current
            .as_ref()
            .map_or_else(|| "none".to_string(), |b| b.id().to_string())
    }

    fn report<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            tracing::warn!(%err, "session operation failed");
            self.events.emit(SessionEvent::Error(err.to_string()));
        }
        result
    }
}

impl MemoryTarget for Mutex<SessionStore> {
    fn target_name(&self) -> &'static str {
        "session"
    }

    fn compact(&self, pressure: Pressure) -> CleanupReport {
        match self.lock() {
            Ok(mut session) => {
                let evicted = session.compact();
                tracing::debug!(?pressure, evicted, "session history compacted");
                CleanupReport {
                    evicted_entries: evicted,
                    ..CleanupReport::default()
                }
            }
            Err(err) => {
                tracing::error!(?err, "failed to lock session for compaction");
                CleanupReport::default()
            }
        }
    }

    fn reclaim(&self) -> CleanupReport {
        match self.lock() {
            Ok(mut session) => {
                let stats = session.reclaim();
                CleanupReport {
                    evicted_entries: 0,
                    reclaimed_buffers: stats.buffers,
                    reclaimed_bytes: stats.bytes,
                }
            }
            Err(err) => {
                tracing::error!(?err, "failed to lock session for reclamation");
                CleanupReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionStore;
    use crate::error::SessionError;
    use crate::session::events::SessionEvent;
    use crate::session::executor::Transform;
    use crate::session::image::ImageBuffer;
    use crate::settings::SessionConfig;
    use std::sync::Arc;

    fn store(capacity: usize) -> SessionStore {
        SessionStore::new(Arc::new(SessionConfig::with_history_capacity(capacity)))
    }

    fn add(delta: u8) -> Transform {
        Transform::new(format!("add{delta}"), move |img: &ImageBuffer| {
            let pixels = img.pixels().iter().map(|p| p.saturating_add(delta)).collect();
            Ok(ImageBuffer::new(img.width(), img.height(), img.channels(), pixels)?)
        })
    }

    fn loaded(capacity: usize) -> SessionStore {
        let mut session = store(capacity);
        session
            .load_buffer(ImageBuffer::filled(2, 2, 1, 10).expect("image"))
            .expect("load");
        session
    }

    #[test]
    fn operations_without_image_report_no_image_loaded() {
        let mut session = store(5);
        let events = session.subscribe();
        assert_eq!(session.apply(&add(1)), Err(SessionError::NoImageLoaded));
        assert_eq!(session.preview(&add(1)), Err(SessionError::NoImageLoaded));
        assert_eq!(session.reset_to_original(), Err(SessionError::NoImageLoaded));
        assert!(!session.undo());
        assert!(!session.commit());
        assert_eq!(
            events.try_recv(),
            Ok(SessionEvent::Error("no image loaded".into()))
        );
    }

    #[test]
    fn apply_pushes_result_and_keeps_previous_as_undo_target() {
        let mut session = loaded(5);
        let original = session.current().cloned().expect("current");
        session.apply(&add(5)).expect("apply");

        assert_eq!(session.history_len(), 2);
        assert!(session.can_undo());
        assert_eq!(session.current().expect("current").pixels()[0], 15);

        assert!(session.undo());
        assert_eq!(session.current().map(|b| b.id()), Some(original.id()));
        assert!(session.invariant_violation().is_none());
    }

    #[test]
    fn failing_transform_leaves_state_untouched() {
        let mut session = loaded(5);
        let before = session.current().map(|b| b.id());
        let failing = Transform::new("fail", |_: &ImageBuffer| -> anyhow::Result<ImageBuffer> {
            anyhow::bail!("nope")
        });

        assert!(matches!(
            session.apply(&failing),
            Err(SessionError::TransformFailed(_))
        ));
        assert_eq!(session.history_len(), 1);
        assert_eq!(session.current().map(|b| b.id()), before);

        session.preview(&add(1)).expect("preview");
        assert!(session.preview(&failing).is_err());
        assert!(session.is_previewing());
        assert_eq!(session.current().expect("current").pixels()[0], 11);
    }

    #[test]
    fn commit_records_snapshot_then_live_value() {
        let mut session = loaded(5);
        let snapshot = session.current().cloned().expect("current");
        session.preview(&add(3)).expect("preview");
        let live = session.current().cloned().expect("live");

        assert!(session.commit());
        assert!(!session.is_previewing());
        assert_eq!(session.history_len(), 2);
        assert_eq!(session.current().map(|b| b.id()), Some(live.id()));

        assert!(session.undo());
        assert_eq!(session.current().map(|b| b.id()), Some(snapshot.id()));
        assert!(session.redo());
        assert_eq!(session.current().map(|b| b.id()), Some(live.id()));
        assert!(!session.commit());
    }

    #[test]
    fn apply_during_preview_reads_the_snapshot() {
        let mut session = loaded(5);
        session.preview(&add(100)).expect("preview");
        session.apply(&add(1)).expect("apply");

        assert!(!session.is_previewing());
        assert_eq!(session.current().expect("current").pixels()[0], 11);
        assert_eq!(session.history_len(), 2);
    }

    #[test]
    fn undo_discards_active_preview() {
        let mut session = loaded(5);
        session.apply(&add(1)).expect("apply");
        session.preview(&add(50)).expect("preview");
        assert!(session.undo());
        assert!(!session.is_previewing());
        assert_eq!(session.current().expect("current").pixels()[0], 10);
        assert!(session.invariant_violation().is_none());
    }

    #[test]
    fn reset_restores_original_as_only_entry() {
        let mut session = loaded(5);
        session.apply(&add(1)).expect("apply");
        session.apply(&add(1)).expect("apply");
        session.reset_to_original().expect("reset");

        assert_eq!(session.history_len(), 1);
        assert!(!session.can_undo());
        assert_eq!(
            session.current().map(|b| b.id()),
            session.original().map(|b| b.id())
        );
        assert!(session.invariant_violation().is_none());
    }

    #[test]
    fn reclaim_frees_discarded_branches_only() {
        let mut session = loaded(5);
        session.apply(&add(1)).expect("apply");
        let abandoned = session.current().map(|b| b.id()).expect("id");
        session.undo();
        session.apply(&add(2)).expect("apply");

        assert_eq!(session.ref_count(abandoned), 0);
        assert!(session.is_tracked(abandoned));
        let stats = session.reclaim();
        assert_eq!(stats.buffers, 1);
        assert!(!session.is_tracked(abandoned));
        assert!(session.invariant_violation().is_none());
    }

    #[test]
    fn repeated_previews_keep_tracked_memory_bounded() {
        let mut session = store(5);
        session
            .load_buffer(ImageBuffer::filled(100, 100, 3, 0).expect("image"))
            .expect("load");
        let one = session.tracked_bytes();

        for step in 0..200u32 {
            session.preview(&add((step % 250) as u8)).expect("preview");
            assert!(session.tracked_bytes() <= 2 * one);
        }
        assert!(session.commit());
        assert_eq!(session.tracked_bytes(), 2 * one);

        session.preview(&add(9)).expect("preview");
        session.preview(&add(10)).expect("preview");
        assert!(session.cancel_preview());
        assert_eq!(session.tracked_bytes(), 2 * one);
        assert!(session.invariant_violation().is_none());
    }

    #[test]
    fn oversized_buffers_are_rejected_before_state_changes() {
        let mut config = SessionConfig::with_history_capacity(5);
        config.max_image_dimensions = (4, 4);
        let mut session = SessionStore::new(Arc::new(config));
        let err = session
            .load_buffer(ImageBuffer::filled(5, 1, 1, 0).expect("image"))
            .expect_err("too large");
        assert!(err.is_decode());
        assert!(!session.has_image());
    }
}
