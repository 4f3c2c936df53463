//! # Plinth Plugin System Errors
//!
//! Defines [`PluginSystemError`], the error type shared by discovery,
//! resolution, instantiation and unloading. Every variant that concerns a
//! particular plugin names it, so batch operations can turn any failure into
//! a [`Diagnostic`] without losing track of the offending package.
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::plugin_system::dependency::DependencyError;
use crate::plugin_system::descriptor::ArtifactLocation;
use crate::plugin_system::traits::PluginError;

#[derive(Debug, thiserror::Error)]
pub enum PluginSystemError {
    #[error("Malformed plugin descriptor at '{location}': {message}")]
    MalformedDescriptor {
        location: ArtifactLocation,
        package_name: Option<String>,
        message: String,
    },

    #[error("Malformed plugin metadata at '{location}': {message}")]
    MalformedMetadata {
        location: ArtifactLocation,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Plugin '{package_name}' has unresolvable dependencies: {source}")]
    UnresolvableDependency {
        package_name: String,
        #[source]
        source: DependencyError,
    },

    #[error("No viable factory for plugin '{package_name}' ({entry_point}); unsatisfied: {}", .unsatisfied.join(", "))]
    NoViableFactory {
        package_name: String,
        entry_point: String,
        unsatisfied: Vec<String>,
    },

    #[error("Plugin `{package_name}` cannot be loaded without loading plugin `{dependency}`.")]
    MissingRequiredDependency {
        package_name: String,
        dependency: String,
    },

    #[error("Plugin '{package_name}' requests isolation domain '{domain}', but no factory is registered for it")]
    UnknownDomainFactory {
        package_name: String,
        domain: String,
    },

    #[error("Entry point '{entry_point}' of plugin '{package_name}' is not known to domain '{domain}'")]
    UnknownEntryPoint {
        package_name: String,
        entry_point: String,
        domain: String,
    },

    #[error("Failed to build isolation domain '{domain}' for plugin '{package_name}': {message}")]
    DomainConstruction {
        package_name: String,
        domain: String,
        message: String,
    },

    #[error("Plugin '{package_name}' failed to instantiate: {source}")]
    InstantiationFailed {
        package_name: String,
        #[source]
        source: PluginError,
    },

    #[error(
        "Plugin `{package_name}` cannot be unloaded without unloading plugins {} first.",
        .dependents.iter().map(|d| format!("`{d}`")).collect::<Vec<_>>().join(", ")
    )]
    BlockedUnload {
        package_name: String,
        dependents: Vec<String>,
    },

    #[error("Plugin '{package_name}' is not loaded")]
    NotLoaded { package_name: String },

    #[error("No descriptor known for plugin '{package_name}'")]
    UnknownPackage { package_name: String },

    #[error("Duplicate plugin '{package_name}' at '{location}'; keeping the first one")]
    DuplicatePackage {
        package_name: String,
        location: ArtifactLocation,
    },

    #[error("Plugin '{package_name}' is disabled")]
    PluginDisabled { package_name: String },

    #[error("I/O error during '{operation}' on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl PluginSystemError {
    /// Package name this error concerns, if any
    pub fn package_name(&self) -> Option<&str> {
        match self {
            Self::MalformedDescriptor { package_name, .. } => package_name.as_deref(),
            Self::UnresolvableDependency { package_name, .. }
            | Self::NoViableFactory { package_name, .. }
            | Self::MissingRequiredDependency { package_name, .. }
            | Self::UnknownDomainFactory { package_name, .. }
            | Self::UnknownEntryPoint { package_name, .. }
            | Self::DomainConstruction { package_name, .. }
            | Self::InstantiationFailed { package_name, .. }
            | Self::BlockedUnload { package_name, .. }
            | Self::NotLoaded { package_name }
            | Self::UnknownPackage { package_name }
            | Self::DuplicatePackage { package_name, .. }
            | Self::PluginDisabled { package_name } => Some(package_name.as_str()),
            Self::MalformedMetadata { .. } | Self::Io { .. } => None,
        }
    }

    /// Artifact location this error concerns, if any
    pub fn location(&self) -> Option<&ArtifactLocation> {
        match self {
            Self::MalformedDescriptor { location, .. }
            | Self::MalformedMetadata { location, .. }
            | Self::DuplicatePackage { location, .. } => Some(location),
            _ => None,
        }
    }

    pub(crate) fn io(source: std::io::Error, operation: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }
}

/// A non-fatal failure recorded while making progress through a batch.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub package_name: Option<String>,
    pub location: Option<ArtifactLocation>,
    pub error: Arc<PluginSystemError>,
}

impl Diagnostic {
    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match &*self.error {
            PluginSystemError::MalformedDescriptor { .. } => "MalformedDescriptor",
            PluginSystemError::MalformedMetadata { .. } => "MalformedMetadata",
            PluginSystemError::UnresolvableDependency { .. } => "UnresolvableDependency",
            PluginSystemError::NoViableFactory { .. } => "NoViableFactory",
            PluginSystemError::MissingRequiredDependency { .. } => "MissingRequiredDependency",
            PluginSystemError::UnknownDomainFactory { .. } => "UnknownDomainFactory",
            PluginSystemError::UnknownEntryPoint { .. } => "UnknownEntryPoint",
            PluginSystemError::DomainConstruction { .. } => "DomainConstruction",
            PluginSystemError::InstantiationFailed { .. } => "InstantiationFailed",
            PluginSystemError::BlockedUnload { .. } => "BlockedUnload",
            PluginSystemError::NotLoaded { .. } => "NotLoaded",
            PluginSystemError::UnknownPackage { .. } => "UnknownPackage",
            PluginSystemError::DuplicatePackage { .. } => "DuplicatePackage",
            PluginSystemError::PluginDisabled { .. } => "PluginDisabled",
            PluginSystemError::Io { .. } => "Io",
        }
    }
}

impl From<PluginSystemError> for Diagnostic {
    fn from(error: PluginSystemError) -> Self {
        Self {
            package_name: error.package_name().map(str::to_string),
            location: error.location().cloned(),
            error: Arc::new(error),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind(), self.error)
    }
}

pub type Result<T> = std::result::Result<T, PluginSystemError>;
