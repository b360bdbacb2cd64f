//! Low-level API: error types and hardware access.

pub mod error;
pub mod hw;

pub use error::{BoxError, Errno, Error, Result};
