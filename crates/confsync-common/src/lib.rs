//! # confsync-common
//!
//! Shared types for the confsync CSI plugin:
//! - Common error type and its transport-neutral classification
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{ConfsyncError, ConfsyncResult, ErrorClass};
pub use paths::ConfsyncPaths;
