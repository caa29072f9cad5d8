use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Failures surfaced at the session boundary.
///
/// None of these are fatal: the session keeps its pre-operation state and the
/// same message is broadcast as an [`crate::session::SessionEvent::Error`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("image {width}x{height} exceeds the {max_width}x{max_height} limit")]
    ImageTooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("failed to encode {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("transform failed: {0}")]
    TransformFailed(String),

    #[error("no image loaded")]
    NoImageLoaded,

    #[error("worker queue error: {0}")]
    WorkerQueue(String),

    #[error("invalid image buffer: {0}")]
    InvalidBuffer(String),
}

impl SessionError {
    pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn encode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Encode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error was raised before any session state was touched
    /// because the input file itself was rejected.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::ImageTooLarge { .. })
    }
}
