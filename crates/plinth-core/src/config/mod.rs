//! # Plinth Core Configuration
//!
//! [`ManagerConfig`] holds the plugin manager's settings: where to discover
//! plugins and libraries, which files count as archives, whether archives are
//! staged into a temporary directory, and per-package enable/disable
//! overrides. Configuration files may be JSON, or YAML / TOML when the
//! `yaml-config` / `toml-config` features are enabled; the format is picked
//! from the file extension.
pub mod error;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::kernel::constants::{
    DEFAULT_ARCHIVE_EXTENSIONS, DEFAULT_LIBRARY_EXTENSIONS, DEFAULT_LIBS_DIR, DEFAULT_PLUGINS_DIR,
};

pub use error::ConfigError;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigFormat {
    /// JSON format (.json)
    Json,
    /// YAML format (.yaml, .yml) - requires "yaml-config" feature
    #[cfg(feature = "yaml-config")]
    Yaml,
    /// TOML format (.toml) - requires "toml-config" feature
    #[cfg(feature = "toml-config")]
    Toml,
}

impl ConfigFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "json",
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => "yaml",
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => "toml",
        }
    }

    /// Determine format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "json" => Some(ConfigFormat::Json),
                #[cfg(feature = "yaml-config")]
                "yaml" | "yml" => Some(ConfigFormat::Yaml),
                #[cfg(feature = "toml-config")]
                "toml" => Some(ConfigFormat::Toml),
                _ => None,
            })
    }
}

/// Settings for a [`PluginManager`](crate::plugin_system::PluginManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory scanned for plugin archives and exploded plugin directories
    pub plugins_dir: PathBuf,
    /// Directory of external libraries exposed in the default domain
    pub libs_dir: Option<PathBuf>,
    /// File extensions treated as plugin archives
    pub archive_extensions: Vec<String>,
    /// File extensions picked up from `libs_dir`
    pub library_extensions: Vec<String>,
    /// Copy archives and libraries into a temporary directory before use
    pub stage_archives: bool,
    /// Packages to load even if their descriptor disables them
    pub enabled: Vec<String>,
    /// Packages never to load; wins over `enabled`
    pub disabled: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            libs_dir: Some(PathBuf::from(DEFAULT_LIBS_DIR)),
            archive_extensions: DEFAULT_ARCHIVE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            library_extensions: DEFAULT_LIBRARY_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            stage_archives: true,
            enabled: Vec::new(),
            disabled: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Defaults with a different plugin directory
    pub fn with_plugins_dir(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `path`, choosing the format by extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.to_path_buf()))?;
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, format)
    }

    /// Deserialize from string based on format
    pub fn parse(data: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let deserialization = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::Deserialization {
            format: format.extension().to_string(),
            source,
        };
        match format {
            ConfigFormat::Json => serde_json::from_str(data).map_err(|e| deserialization(Box::new(e))),
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => serde_yaml::from_str(data).map_err(|e| deserialization(Box::new(e))),
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => toml::from_str(data).map_err(|e| deserialization(Box::new(e))),
        }
    }

    /// Serialize to string based on format
    pub fn render(&self, format: ConfigFormat) -> Result<String, ConfigError> {
        let serialization = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::Serialization {
            format: format.extension().to_string(),
            source,
        };
        match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| serialization(Box::new(e))),
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| serialization(Box::new(e))),
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| serialization(Box::new(e))),
        }
    }

    /// Forced enablement for `package_name`, if the configuration has one
    pub fn enablement_override(&self, package_name: &str) -> Option<bool> {
        if self.disabled.iter().any(|p| p == package_name) {
            Some(false)
        } else if self.enabled.iter().any(|p| p == package_name) {
            Some(true)
        } else {
            None
        }
    }
}
