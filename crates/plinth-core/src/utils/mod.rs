//! # Plinth Core Utilities
//!
//! Filesystem helpers used by plugin discovery ([`fs`]) and the lock-scoped
//! collections backing the plugin manager's registries ([`sync`]).
pub mod fs;
pub mod sync;

pub use fs::{StagingArea, find_files, find_files_with_extensions};
pub use sync::{OperationLock, ReadWriteList, ReadWriteMap};
