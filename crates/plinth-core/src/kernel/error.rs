//! # Plinth Core Kernel Errors
//!
//! [`Error`] aggregates the subsystem errors for callers that drive the
//! whole loader, such as the command line front end.
use std::result::Result as StdResult;

use thiserror::Error as ThisError;

use crate::config::ConfigError;
use crate::plugin_system::error::PluginSystemError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Specific, typed plugin system error
    #[error("Plugin system error: {0}")]
    PluginSystem(#[from] PluginSystemError),

    /// Configuration could not be read or written
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Shorthand for Result with our Error type
pub type Result<T> = StdResult<T, Error>;
