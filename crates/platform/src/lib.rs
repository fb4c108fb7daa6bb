//! # Sluice Platform
//!
//! Shared types for the Sluice SSH client.
//!
//! This crate provides:
//! - The unified error type (`SluiceError`, `SluiceResult`)
//! - A coarse failure classification (`FailureCategory`)
//!
//! # Examples
//!
//! ```
//! use sluice_platform::{SluiceError, SluiceResult};
//!
//! fn example_function() -> SluiceResult<String> {
//!     Ok("Hello, Sluice!".to_string())
//! }
//!
//! # fn main() -> SluiceResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Sluice!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{FailureCategory, SluiceError, SluiceResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
