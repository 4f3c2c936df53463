//! # Plinth Core Kernel
//!
//! Application-wide constants ([`constants`]) and the aggregate [`Error`]
//! type with its `Result` alias ([`error`]).
pub mod constants;
pub mod error;

pub use error::{Error, Result};
