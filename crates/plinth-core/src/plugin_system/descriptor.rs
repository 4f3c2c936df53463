use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::plugin_system::error::{PluginSystemError, Result};

/// Key of the isolation domain every plugin lands in unless it asks otherwise
pub const DEFAULT_DOMAIN: &str = "default";

/// String-keyed mapping produced by a metadata parser
pub type Metadata = serde_json::Map<String, Value>;

/// Descriptor keys understood by [`PluginDescriptor::from_metadata`]
pub mod keys {
    pub const PACKAGE_NAME: &str = "packageName";
    pub const BASE_CLASS: &str = "baseClass";
    pub const ENTRY_POINT: &str = "entryPoint";
    pub const DEPENDS_ON: &str = "dependsOn";
    pub const ENABLED_BY_DEFAULT: &str = "enabledByDefault";
    pub const NAME: &str = "name";
    pub const AUTHOR: &str = "author";
    pub const DESCRIPTION: &str = "description";
    pub const CLASS_LOADER: &str = "classLoader";
    pub const DOMAIN: &str = "domain";
}

/// Where a plugin's artifact lives (an archive, a staged copy or a directory)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArtifactLocation(PathBuf);

impl ArtifactLocation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for ArtifactLocation {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&Path> for ArtifactLocation {
    fn from(path: &Path) -> Self {
        Self(path.to_path_buf())
    }
}

impl From<&str> for ArtifactLocation {
    fn from(path: &str) -> Self {
        Self(PathBuf::from(path))
    }
}

/// Validated description of one plugin, read before anything is loaded
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    package_name: String,
    entry_point: String,
    dependencies: Vec<String>,
    enabled_by_default: bool,
    domain: String,
    name: String,
    author: Option<String>,
    description: Option<String>,
    location: ArtifactLocation,
    #[serde(skip)]
    metadata: Metadata,
}

impl PluginDescriptor {
    /// Build a descriptor from a parsed metadata mapping.
    ///
    /// `packageName` and `baseClass` (or `entryPoint`) are mandatory and must
    /// be non-empty strings. Every other key is optional, but a key that is
    /// present with the wrong type is rejected rather than ignored.
    pub fn from_metadata(metadata: Metadata, location: ArtifactLocation) -> Result<Self> {
        let package_name = match optional_string(&metadata, &[keys::PACKAGE_NAME], &location, None)? {
            Some(name) => name,
            None => {
                return Err(malformed(
                    &location,
                    None,
                    format!("missing required key '{}'", keys::PACKAGE_NAME),
                ));
            }
        };
        let owner = Some(package_name.as_str());

        let entry_point =
            optional_string(&metadata, &[keys::BASE_CLASS, keys::ENTRY_POINT], &location, owner)?
                .ok_or_else(|| {
                    malformed(
                        &location,
                        owner,
                        format!("missing required key '{}'", keys::BASE_CLASS),
                    )
                })?;

        let dependencies = string_list(&metadata, keys::DEPENDS_ON, &location, owner)?;

        let enabled_by_default = match metadata.get(keys::ENABLED_BY_DEFAULT) {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(malformed(
                    &location,
                    owner,
                    format!("'{}' must be a boolean, found {}", keys::ENABLED_BY_DEFAULT, other),
                ));
            }
        };

        let domain = optional_string(&metadata, &[keys::CLASS_LOADER, keys::DOMAIN], &location, owner)?
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
        let name = optional_string(&metadata, &[keys::NAME], &location, owner)?
            .unwrap_or_else(|| package_name.clone());
        let author = optional_string(&metadata, &[keys::AUTHOR], &location, owner)?;
        let description = optional_string(&metadata, &[keys::DESCRIPTION], &location, owner)?;

        Ok(Self {
            package_name,
            entry_point,
            dependencies,
            enabled_by_default,
            domain,
            name,
            author,
            description,
            location,
            metadata,
        })
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Identifier of the plugin type to instantiate
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Package names this plugin requires, in declaration order
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn depends_on(&self, package_name: &str) -> bool {
        self.dependencies.iter().any(|d| d == package_name)
    }

    pub fn enabled_by_default(&self) -> bool {
        self.enabled_by_default
    }

    /// Key of the isolation domain this plugin should be loaded into
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn uses_default_domain(&self) -> bool {
        self.domain == DEFAULT_DOMAIN
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn location(&self) -> &ArtifactLocation {
        &self.location
    }

    /// The raw mapping, including keys the loader itself does not interpret
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.package_name {
            write!(f, "{}", self.package_name)
        } else {
            write!(f, "{} ({})", self.name, self.package_name)
        }
    }
}

/// Builder for descriptors created in code rather than read from an archive
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    metadata: Metadata,
    location: ArtifactLocation,
}

impl DescriptorBuilder {
    pub fn new(package_name: &str, entry_point: &str) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(keys::PACKAGE_NAME.into(), Value::from(package_name));
        metadata.insert(keys::BASE_CLASS.into(), Value::from(entry_point));
        Self {
            metadata,
            location: ArtifactLocation::new(format!("memory:{}", package_name)),
        }
    }

    pub fn depends_on(mut self, package_name: &str) -> Self {
        let deps = self
            .metadata
            .entry(keys::DEPENDS_ON)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = deps {
            list.push(Value::from(package_name));
        }
        self
    }

    pub fn enabled_by_default(mut self, enabled: bool) -> Self {
        self.metadata.insert(keys::ENABLED_BY_DEFAULT.into(), Value::Bool(enabled));
        self
    }

    pub fn domain(mut self, key: &str) -> Self {
        self.metadata.insert(keys::CLASS_LOADER.into(), Value::from(key));
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.metadata.insert(keys::NAME.into(), Value::from(name));
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.metadata.insert(keys::AUTHOR.into(), Value::from(author));
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.metadata.insert(keys::DESCRIPTION.into(), Value::from(description));
        self
    }

    /// Attach an extra, loader-agnostic metadata key
    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn location(mut self, location: impl Into<ArtifactLocation>) -> Self {
        self.location = location.into();
        self
    }

    pub fn build(self) -> Result<PluginDescriptor> {
        PluginDescriptor::from_metadata(self.metadata, self.location)
    }
}

fn malformed(location: &ArtifactLocation, package_name: Option<&str>, message: String) -> PluginSystemError {
    PluginSystemError::MalformedDescriptor {
        location: location.clone(),
        package_name: package_name.map(str::to_string),
        message,
    }
}

/// First present key among `aliases`, which must be a non-empty string.
fn optional_string(
    metadata: &Metadata,
    aliases: &[&str],
    location: &ArtifactLocation,
    owner: Option<&str>,
) -> Result<Option<String>> {
    for key in aliases {
        match metadata.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.trim().is_empty() => {
                return Err(malformed(location, owner, format!("'{}' must not be empty", key)));
            }
            Some(Value::String(s)) => return Ok(Some(s.clone())),
            Some(other) => {
                return Err(malformed(
                    location,
                    owner,
                    format!("'{}' must be a string, found {}", key, other),
                ));
            }
        }
    }
    Ok(None)
}

/// Ordered, de-duplicated list of strings under `key` (empty when absent).
fn string_list(
    metadata: &Metadata,
    key: &str,
    location: &ArtifactLocation,
    owner: Option<&str>,
) -> Result<Vec<String>> {
    let items = match metadata.get(key) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(malformed(
                location,
                owner,
                format!("'{}' must be a list of strings, found {}", key, other),
            ));
        }
    };

    let mut result: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) if !s.trim().is_empty() => {
                if !result.contains(s) {
                    result.push(s.clone());
                }
            }
            other => {
                return Err(malformed(
                    location,
                    owner,
                    format!("'{}' entries must be non-empty strings, found {}", key, other),
                ));
            }
        }
    }
    Ok(result)
}
