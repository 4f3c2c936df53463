//! Plugin discovery and descriptor parsing.
//!
//! An [`ArchiveSource`] finds candidate plugins and hands back the raw bytes
//! of each one's descriptor file together with its location. A
//! [`MetadataParser`] turns those bytes into a string-keyed mapping, which
//! [`read_descriptors`] validates into [`PluginDescriptor`]s.
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::config::ManagerConfig;
use crate::plugin_system::descriptor::{ArtifactLocation, Metadata, PluginDescriptor};
use crate::plugin_system::error::{Diagnostic, PluginSystemError, Result};
use crate::utils::fs::{StagingArea, find_files_with_extensions, has_extension, sorted_entries};

/// Largest descriptor file read out of an archive
pub const MAX_DESCRIPTOR_BYTES: u64 = 1024 * 1024;

/// Descriptor file names looked up inside an archive or plugin directory, in order
pub const DESCRIPTOR_FILE_NAMES: &[&str] = &["plugin.json", "plugin.yaml", "plugin.yml", "plugin.toml"];

/// Descriptor bytes of one candidate plugin
#[derive(Debug, Clone)]
pub struct RawArchive {
    pub location: ArtifactLocation,
    /// Name of the descriptor file the bytes came from, e.g. `plugin.json`
    pub descriptor_name: String,
    pub bytes: Vec<u8>,
}

impl RawArchive {
    pub fn new(location: impl Into<ArtifactLocation>, descriptor_name: &str, bytes: Vec<u8>) -> Self {
        Self {
            location: location.into(),
            descriptor_name: descriptor_name.to_string(),
            bytes,
        }
    }

    /// A `plugin.json` archive built from a JSON value
    pub fn json(location: impl Into<ArtifactLocation>, value: &Value) -> Self {
        Self::new(location, "plugin.json", value.to_string().into_bytes())
    }
}

/// Everything one discovery pass found
#[derive(Debug, Default)]
pub struct Discovery {
    pub archives: Vec<RawArchive>,
    /// External library locations to expose in the default domain
    pub libraries: Vec<ArtifactLocation>,
    pub diagnostics: Vec<Diagnostic>,
    /// Staging area holding private copies of the discovered artifacts
    pub staging: Option<Arc<StagingArea>>,
}

/// Finds candidate plugin archives
pub trait ArchiveSource: Send + Sync {
    fn discover(&self) -> Discovery;
}

/// Archives supplied in memory
#[derive(Debug, Clone, Default)]
pub struct StaticArchiveSource {
    archives: Vec<RawArchive>,
    libraries: Vec<ArtifactLocation>,
}

impl StaticArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(mut self, archive: RawArchive) -> Self {
        self.archives.push(archive);
        self
    }

    /// Add a `plugin.json` archive; the location defaults to `memory:<n>`
    pub fn with_json(self, value: Value) -> Self {
        let location = format!("memory:{}", self.archives.len());
        self.with_archive(RawArchive::json(location.as_str(), &value))
    }

    pub fn with_library(mut self, location: impl Into<ArtifactLocation>) -> Self {
        self.libraries.push(location.into());
        self
    }
}

impl ArchiveSource for StaticArchiveSource {
    fn discover(&self) -> Discovery {
        Discovery {
            archives: self.archives.clone(),
            libraries: self.libraries.clone(),
            ..Discovery::default()
        }
    }
}

/// Scans a plugin directory for zip archives and exploded plugin directories
#[derive(Debug, Clone)]
pub struct DirectoryArchiveSource {
    plugins_dir: PathBuf,
    libs_dir: Option<PathBuf>,
    archive_extensions: Vec<String>,
    library_extensions: Vec<String>,
    stage_archives: bool,
}

impl DirectoryArchiveSource {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        let defaults = ManagerConfig::default();
        Self {
            plugins_dir: plugins_dir.into(),
            libs_dir: None,
            archive_extensions: defaults.archive_extensions,
            library_extensions: defaults.library_extensions,
            stage_archives: false,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            plugins_dir: config.plugins_dir.clone(),
            libs_dir: config.libs_dir.clone(),
            archive_extensions: config.archive_extensions.clone(),
            library_extensions: config.library_extensions.clone(),
            stage_archives: config.stage_archives,
        }
    }

    pub fn with_libs_dir(mut self, libs_dir: impl Into<PathBuf>) -> Self {
        self.libs_dir = Some(libs_dir.into());
        self
    }

    pub fn with_staging(mut self, stage_archives: bool) -> Self {
        self.stage_archives = stage_archives;
        self
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Copy `path` into the staging area when staging is on.
    fn locate(&self, path: &Path, staging: Option<&Arc<StagingArea>>) -> Result<ArtifactLocation> {
        match staging {
            Some(area) => area
                .stage(path)
                .map(ArtifactLocation::new)
                .map_err(|e| PluginSystemError::io(e, "stage_artifact", path)),
            None => Ok(ArtifactLocation::new(path)),
        }
    }

    fn scan_plugins(&self, staging: Option<&Arc<StagingArea>>, discovery: &mut Discovery) {
        if !self.plugins_dir.is_dir() {
            log::warn!("Plugin directory {} does not exist; nothing to discover", self.plugins_dir.display());
            return;
        }
        let entries = match sorted_entries(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(e) => {
                discovery
                    .diagnostics
                    .push(PluginSystemError::io(e, "read_dir", &self.plugins_dir).into());
                return;
            }
        };

        for path in entries {
            if path.is_dir() {
                match read_exploded_descriptor(&path) {
                    Ok(Some(archive)) => discovery.archives.push(archive),
                    Ok(None) => log::debug!("Skipping {}: no descriptor file", path.display()),
                    Err(e) => discovery.diagnostics.push(e.into()),
                }
            } else if has_extension(&path, &self.archive_extensions) {
                let found = read_archive_descriptor(&path).and_then(|found| match found {
                    Some((name, bytes)) => {
                        let location = self.locate(&path, staging)?;
                        Ok(Some(RawArchive::new(location, &name, bytes)))
                    }
                    None => Ok(None),
                });
                match found {
                    Ok(Some(archive)) => discovery.archives.push(archive),
                    Ok(None) => log::debug!("Skipping {}: archive has no descriptor entry", path.display()),
                    Err(e) => {
                        log::warn!("Skipping unreadable plugin archive {}: {}", path.display(), e);
                        discovery.diagnostics.push(e.into());
                    }
                }
            }
        }
    }

    fn scan_libraries(&self, staging: Option<&Arc<StagingArea>>, discovery: &mut Discovery) {
        let Some(libs_dir) = &self.libs_dir else {
            return;
        };
        if !libs_dir.is_dir() {
            log::debug!("Library directory {} does not exist", libs_dir.display());
            return;
        }
        match find_files_with_extensions(libs_dir, &self.library_extensions) {
            Ok(paths) => {
                for path in paths {
                    match self.locate(&path, staging) {
                        Ok(location) => discovery.libraries.push(location),
                        Err(e) => discovery.diagnostics.push(e.into()),
                    }
                }
            }
            Err(e) => discovery
                .diagnostics
                .push(PluginSystemError::io(e, "scan_libraries", libs_dir).into()),
        }
    }
}

impl ArchiveSource for DirectoryArchiveSource {
    fn discover(&self) -> Discovery {
        let mut discovery = Discovery::default();
        let staging = if self.stage_archives {
            match StagingArea::new() {
                Ok(area) => Some(Arc::new(area)),
                Err(e) => {
                    log::warn!("Could not create a staging directory, loading archives in place: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.scan_plugins(staging.as_ref(), &mut discovery);
        self.scan_libraries(staging.as_ref(), &mut discovery);
        log::debug!(
            "Discovered {} plugin archive(s) and {} librar(ies) under {}",
            discovery.archives.len(),
            discovery.libraries.len(),
            self.plugins_dir.display()
        );
        discovery.staging = staging;
        discovery
    }
}

/// Descriptor of an exploded plugin directory, if it has one
fn read_exploded_descriptor(dir: &Path) -> Result<Option<RawArchive>> {
    for name in DESCRIPTOR_FILE_NAMES {
        let path = dir.join(name);
        if path.is_file() {
            let bytes = fs::read(&path).map_err(|e| PluginSystemError::MalformedMetadata {
                location: ArtifactLocation::new(dir),
                message: format!("cannot read {}: {}", name, e),
                source: Some(Box::new(e)),
            })?;
            return Ok(Some(RawArchive::new(dir, name, bytes)));
        }
    }
    Ok(None)
}

fn too_large(name: &str, size: u64) -> String {
    format!("{} is {} bytes, more than the {} byte limit", name, size, MAX_DESCRIPTOR_BYTES)
}

/// Name and bytes of the first descriptor entry in the zip archive at `path`
fn read_archive_descriptor(path: &Path) -> Result<Option<(String, Vec<u8>)>> {
    let unreadable = |message: String, source: Option<Box<dyn std::error::Error + Send + Sync>>| {
        PluginSystemError::MalformedMetadata {
            location: ArtifactLocation::new(path),
            message,
            source,
        }
    };

    let file = File::open(path).map_err(|e| unreadable(format!("cannot open archive: {}", e), Some(Box::new(e))))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| unreadable(format!("not a readable zip archive: {}", e), Some(Box::new(e))))?;

    for name in DESCRIPTOR_FILE_NAMES {
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => continue,
            Err(e) => return Err(unreadable(format!("cannot read {}: {}", name, e), Some(Box::new(e)))),
        };
        // The declared size comes straight from the archive headers.
        if entry.size() > MAX_DESCRIPTOR_BYTES {
            return Err(unreadable(too_large(name, entry.size()), None));
        }
        let mut bytes = Vec::new();
        (&mut entry)
            .take(MAX_DESCRIPTOR_BYTES + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| unreadable(format!("cannot read {}: {}", name, e), Some(Box::new(e))))?;
        if bytes.len() as u64 > MAX_DESCRIPTOR_BYTES {
            return Err(unreadable(too_large(name, bytes.len() as u64), None));
        }
        return Ok(Some((name.to_string(), bytes)));
    }
    Ok(None)
}

/// Supported descriptor file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    Json,
    #[cfg(feature = "yaml-config")]
    Yaml,
    #[cfg(feature = "toml-config")]
    Toml,
}

impl MetadataFormat {
    /// Determine the format from a descriptor file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "json" => Some(MetadataFormat::Json),
                #[cfg(feature = "yaml-config")]
                "yaml" | "yml" => Some(MetadataFormat::Yaml),
                #[cfg(feature = "toml-config")]
                "toml" => Some(MetadataFormat::Toml),
                _ => None,
            })
    }

    pub fn name(&self) -> &'static str {
        match self {
            MetadataFormat::Json => "JSON",
            #[cfg(feature = "yaml-config")]
            MetadataFormat::Yaml => "YAML",
            #[cfg(feature = "toml-config")]
            MetadataFormat::Toml => "TOML",
        }
    }
}

/// Turns raw descriptor bytes into a string-keyed mapping
pub trait MetadataParser: Send + Sync {
    fn parse(&self, archive: &RawArchive) -> Result<Metadata>;
}

/// Parses JSON, and YAML or TOML when those features are enabled
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMetadataParser;

impl MetadataParser for DefaultMetadataParser {
    fn parse(&self, archive: &RawArchive) -> Result<Metadata> {
        let malformed = |message: String, source: Option<Box<dyn std::error::Error + Send + Sync>>| {
            PluginSystemError::MalformedMetadata {
                location: archive.location.clone(),
                message,
                source,
            }
        };

        let format = MetadataFormat::from_file_name(&archive.descriptor_name)
            .ok_or_else(|| malformed(format!("unsupported descriptor file '{}'", archive.descriptor_name), None))?;

        let value: Value = match format {
            MetadataFormat::Json => serde_json::from_slice(&archive.bytes)
                .map_err(|e| malformed(format!("invalid {}: {}", format.name(), e), Some(Box::new(e))))?,
            #[cfg(feature = "yaml-config")]
            MetadataFormat::Yaml => serde_yaml::from_slice(&archive.bytes)
                .map_err(|e| malformed(format!("invalid {}: {}", format.name(), e), Some(Box::new(e))))?,
            #[cfg(feature = "toml-config")]
            MetadataFormat::Toml => {
                let text = std::str::from_utf8(&archive.bytes)
                    .map_err(|e| malformed(format!("descriptor is not UTF-8: {}", e), Some(Box::new(e))))?;
                toml::from_str(text)
                    .map_err(|e| malformed(format!("invalid {}: {}", format.name(), e), Some(Box::new(e))))?
            }
        };

        match value {
            Value::Object(map) => Ok(map),
            other => Err(malformed(
                format!("descriptor must be a mapping, found {}", json_kind(&other)),
                None,
            )),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Parse and validate every discovered archive.
///
/// Archives that fail to parse or validate become diagnostics. Packages in
/// `loaded` are already active and are skipped. A package name repeated
/// within `archives` is reported as a duplicate and only its first
/// occurrence is kept.
pub fn read_descriptors(
    archives: &[RawArchive],
    parser: &dyn MetadataParser,
    loaded: &HashSet<String>,
) -> (Vec<Arc<PluginDescriptor>>, Vec<Diagnostic>) {
    let mut descriptors: Vec<Arc<PluginDescriptor>> = Vec::with_capacity(archives.len());
    let mut diagnostics = Vec::new();
    let mut seen: HashSet<String> = HashSet::with_capacity(archives.len());

    for archive in archives {
        let parsed = parser
            .parse(archive)
            .and_then(|metadata| PluginDescriptor::from_metadata(metadata, archive.location.clone()));
        match parsed {
            Ok(descriptor) => {
                if loaded.contains(descriptor.package_name()) {
                    log::debug!("Plugin '{}' is already loaded; skipping {}", descriptor.package_name(), archive.location);
                    continue;
                }
                if !seen.insert(descriptor.package_name().to_string()) {
                    log::warn!(
                        "Duplicate plugin '{}' at {}; ignoring it",
                        descriptor.package_name(),
                        archive.location
                    );
                    diagnostics.push(
                        PluginSystemError::DuplicatePackage {
                            package_name: descriptor.package_name().to_string(),
                            location: archive.location.clone(),
                        }
                        .into(),
                    );
                    continue;
                }
                descriptors.push(Arc::new(descriptor));
            }
            Err(e) => {
                log::warn!("Skipping plugin at {}: {}", archive.location, e);
                diagnostics.push(e.into());
            }
        }
    }
    (descriptors, diagnostics)
}
