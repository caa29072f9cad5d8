use crate::session::image::SharedImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewPhase {
    Idle,
    Previewing,
}

/// Holds the pre-preview snapshot while a live preview is on screen.
///
/// Every preview in a cycle is computed from the same snapshot, so dragging a
/// slider never compounds one preview onto the next.
#[derive(Debug, Default)]
pub struct PreviewOverlay {
    snapshot: Option<SharedImage>,
}

pub enum PreviewBase {
    /// First preview of a cycle; the caller must adopt the snapshot.
    Started(SharedImage),
    /// A preview is already showing; reuse the stored snapshot.
    Continued(SharedImage),
}

impl PreviewBase {
    pub fn image(&self) -> &SharedImage {
        match self {
            Self::Started(image) | Self::Continued(image) => image,
        }
    }
}

impl PreviewOverlay {
    pub fn phase(&self) -> PreviewPhase {
        if self.snapshot.is_some() {
            PreviewPhase::Previewing
        } else {
            PreviewPhase::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn snapshot(&self) -> Option<&SharedImage> {
        self.snapshot.as_ref()
    }

    /// The buffer a preview transform should read from. Snapshots `current`
    /// only when no preview is active yet.
    pub fn base(&mut self, current: &SharedImage) -> PreviewBase {
        match &self.snapshot {
            Some(snapshot) => PreviewBase::Continued(snapshot.clone()),
            None => {
                self.snapshot = Some(current.clone());
                PreviewBase::Started(current.clone())
            }
        }
    }

    /// End the cycle, handing back the snapshot (commit and cancel both go
    /// through here).
    pub fn take(&mut self) -> Option<SharedImage> {
        self.snapshot.take()
    }
}
