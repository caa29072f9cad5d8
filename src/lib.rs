pub mod codec;
pub mod common;
pub mod controller;
pub mod error;
pub mod logging;
pub mod memory;
pub mod ops;
pub mod session;
pub mod settings;
pub mod view;

pub use error::{Result, SessionError};
