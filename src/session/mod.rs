//! The editing session and the pieces it is built from.

pub mod events;
pub mod executor;
pub mod image;
pub mod preview;
pub mod refs;
pub mod store;
pub mod timeline;

pub use events::{EventBus, SessionEvent};
pub use executor::{ExecMode, OperationExecutor, PendingResult, Transform};
pub use image::{BufferId, ImageBuffer, SharedImage};
pub use preview::{PreviewOverlay, PreviewPhase};
pub use refs::{ReclaimStats, RefTracker};
pub use store::{SessionStore, SharedSession};
pub use timeline::HistoryTimeline;
