//! Flowline Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging setup for the Flowline workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`FlowError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber configuration, see [`logging`]
//!
//! # Example
//!
//! ```no_run
//! use flowline_common::{FlowError, Result};
//!
//! fn require_positive(page_size: usize) -> Result<usize> {
//!     if page_size == 0 {
//!         return Err(FlowError::config("page size must be greater than 0"));
//!     }
//!     Ok(page_size)
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{FlowError, Result};
