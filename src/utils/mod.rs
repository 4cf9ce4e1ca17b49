//! Shared utilities

pub mod error;

pub use error::{ErrorKind, ErrorReport, SessionError, SessionResult};
