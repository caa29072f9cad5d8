use std::sync::{MutexGuard, PoisonError};

use crate::error::Result;
use crate::session::{ExecMode, SessionStore, SharedSession, Transform};

/// Routes user-facing edit requests to the session.
///
/// Remembers the last previewed transform so a dialog's "apply" button can
/// commit whatever the user was looking at.
pub struct EditController {
    session: SharedSession,
    mode: ExecMode,
    last_preview: Option<Transform>,
}

impl EditController {
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            mode: ExecMode::Synchronous,
            last_preview: None,
        }
    }

    /// Run committed transforms on the worker thread.
    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn apply(&mut self, transform: &Transform) -> Result<()> {
        self.last_preview = None;
        self.lock().apply_with(transform, self.mode)
    }

    pub fn preview(&mut self, transform: &Transform) -> Result<()> {
        self.lock().preview(transform)?;
        self.last_preview = Some(transform.clone());
        Ok(())
    }

    /// Commit the live preview, or re-apply the last previewed transform if
    /// the preview has already gone. Returns `false` if there is nothing to
    /// apply.
    pub fn apply_last_preview(&mut self) -> Result<bool> {
        let Some(transform) = self.last_preview.take() else {
            return Ok(false);
        };
        let mut session = self.lock();
        if session.commit() {
            tracing::debug!(transform = transform.name(), "applied last preview");
            return Ok(true);
        }
        session.apply_with(&transform, self.mode)?;
        Ok(true)
    }

    pub fn cancel_preview(&mut self) -> bool {
        self.last_preview = None;
        self.lock().cancel_preview()
    }

    pub fn undo(&mut self) -> bool {
        self.last_preview = None;
        self.lock().undo()
    }

    pub fn redo(&mut self) -> bool {
        self.last_preview = None;
        self.lock().redo()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.last_preview = None;
        self.lock().reset_to_original()
    }

    fn lock(&self) -> MutexGuard<'_, SessionStore> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::EditController;
    use crate::ops;
    use crate::session::{ExecMode, ImageBuffer, SessionStore};
    use crate::settings::SessionConfig;
    use std::sync::Arc;

    fn controller() -> EditController {
        let session = SessionStore::shared(Arc::new(SessionConfig::with_history_capacity(10)));
        session
            .lock()
            .expect("lock")
            .load_buffer(ImageBuffer::filled(2, 2, 3, 40).expect("image"))
            .expect("load");
        EditController::new(session)
    }

    #[test]
    fn apply_last_preview_commits_live_preview() {
        let mut controller = controller();
        controller.preview(&ops::invert()).expect("preview");
        assert!(controller.apply_last_preview().expect("apply"));

        let session = controller.session().lock().expect("lock");
        assert!(!session.is_previewing());
        assert_eq!(session.history_len(), 2);
        assert_eq!(session.current().expect("current").pixels()[0], 215);
    }

    #[test]
    fn cancel_forgets_last_preview() {
        let mut controller = controller();
        controller.preview(&ops::invert()).expect("preview");
        assert!(controller.cancel_preview());
        assert!(!controller.apply_last_preview().expect("nothing"));
    }

    #[test]
    fn queued_mode_goes_through_the_worker() {
        let mut controller = controller().with_mode(ExecMode::Queued);
        controller.apply(&ops::flip_vertical()).expect("apply");
        assert!(controller.undo());
        assert!(controller.redo());
        controller.reset().expect("reset");
        assert_eq!(controller.session().lock().expect("lock").history_len(), 1);
    }
}
