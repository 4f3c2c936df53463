//! Isolation domains: ownership boundaries for loaded plugin code.
//!
//! The default domain exposes every discovered archive plus the external
//! libraries and resolves entry points through the host's [`PluginCatalog`].
//! Custom domains are built on demand by factories that loaded plugins
//! contribute, and are cached per key until the next batch or until the
//! contributing plugin is unloaded.
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::plugin_system::descriptor::{ArtifactLocation, DEFAULT_DOMAIN, PluginDescriptor};
use crate::plugin_system::error::{PluginSystemError, Result};
use crate::plugin_system::factory::{PluginCatalog, PluginType};
use crate::utils::fs::StagingArea;
use crate::utils::sync::ReadWriteMap;

/// A code-loading boundary and the artifact locations visible inside it
pub trait IsolationDomain: Send + Sync + fmt::Debug {
    fn key(&self) -> &str;

    fn locations(&self) -> &[ArtifactLocation];

    /// Look up the plugin type behind `entry_point`
    fn resolve(&self, entry_point: &str) -> Option<Arc<PluginType>>;

    fn parent(&self) -> Option<&Arc<dyn IsolationDomain>> {
        None
    }

    fn can_see(&self, location: &ArtifactLocation) -> bool {
        self.locations().contains(location)
    }
}

/// Builds a custom domain from the default domain and the full location set
pub type DomainFactory = Arc<
    dyn Fn(&Arc<dyn IsolationDomain>, &[ArtifactLocation]) -> std::result::Result<Arc<dyn IsolationDomain>, String>
        + Send
        + Sync,
>;

/// A custom-domain factory contributed by a plugin, with the key it serves
#[derive(Clone)]
pub struct DomainProvider {
    key: String,
    factory: DomainFactory,
}

impl DomainProvider {
    pub fn new<F>(key: &str, factory: F) -> Self
    where
        F: Fn(&Arc<dyn IsolationDomain>, &[ArtifactLocation]) -> std::result::Result<Arc<dyn IsolationDomain>, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            key: key.to_string(),
            factory: Arc::new(factory),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn build(
        &self,
        parent: &Arc<dyn IsolationDomain>,
        locations: &[ArtifactLocation],
    ) -> std::result::Result<Arc<dyn IsolationDomain>, String> {
        (self.factory)(parent, locations)
    }
}

impl fmt::Debug for DomainProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainProvider").field("key", &self.key).finish_non_exhaustive()
    }
}

/// The domain every plugin lands in unless its descriptor names another one.
///
/// It holds the batch's staging area, so staged archive copies stay on disk
/// for as long as any plugin loaded through this domain is alive.
#[derive(Debug)]
pub struct DefaultDomain {
    locations: Vec<ArtifactLocation>,
    catalog: Arc<PluginCatalog>,
    staging: Option<Arc<StagingArea>>,
}

impl DefaultDomain {
    pub fn new(
        locations: Vec<ArtifactLocation>,
        catalog: Arc<PluginCatalog>,
        staging: Option<Arc<StagingArea>>,
    ) -> Self {
        Self { locations, catalog, staging }
    }

    pub fn staging(&self) -> Option<&Arc<StagingArea>> {
        self.staging.as_ref()
    }

    /// The same domain with `location` visible as well
    fn extended(&self, location: &ArtifactLocation) -> Self {
        let mut locations = self.locations.clone();
        locations.push(location.clone());
        Self::new(locations, Arc::clone(&self.catalog), self.staging.clone())
    }
}

impl IsolationDomain for DefaultDomain {
    fn key(&self) -> &str {
        DEFAULT_DOMAIN
    }

    fn locations(&self) -> &[ArtifactLocation] {
        &self.locations
    }

    fn resolve(&self, entry_point: &str) -> Option<Arc<PluginType>> {
        self.catalog.get(entry_point)
    }
}

/// A custom domain layered over a parent.
///
/// Entry points registered on the derived domain shadow the parent's; the
/// rest fall through to the parent unless the domain is sealed.
#[derive(Debug)]
pub struct DerivedDomain {
    key: String,
    parent: Arc<dyn IsolationDomain>,
    locations: Vec<ArtifactLocation>,
    overrides: PluginCatalog,
    sealed: bool,
}

impl DerivedDomain {
    pub fn new(key: &str, parent: Arc<dyn IsolationDomain>, locations: Vec<ArtifactLocation>) -> Self {
        Self {
            key: key.to_string(),
            parent,
            locations,
            overrides: PluginCatalog::new(),
            sealed: false,
        }
    }

    /// Register a plugin type visible only inside this domain
    pub fn with_type(mut self, plugin_type: PluginType) -> Self {
        self.overrides.register(plugin_type);
        self
    }

    /// Stop falling back to the parent for unknown entry points
    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }
}

impl IsolationDomain for DerivedDomain {
    fn key(&self) -> &str {
        &self.key
    }

    fn locations(&self) -> &[ArtifactLocation] {
        &self.locations
    }

    fn resolve(&self, entry_point: &str) -> Option<Arc<PluginType>> {
        match self.overrides.get(entry_point) {
            Some(found) => Some(found),
            None if self.sealed => None,
            None => self.parent.resolve(entry_point),
        }
    }

    fn parent(&self) -> Option<&Arc<dyn IsolationDomain>> {
        Some(&self.parent)
    }
}

/// Default domain, custom-domain cache and custom-domain factories
#[derive(Debug, Default)]
pub struct DomainRegistry {
    default: RwLock<Option<Arc<DefaultDomain>>>,
    domains: ReadWriteMap<String, Arc<dyn IsolationDomain>>,
    /// Factory per key, with the package that contributed it
    factories: ReadWriteMap<String, (DomainProvider, String)>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build this batch's default domain over every descriptor location and
    /// library location, dropping the custom domains cached for the previous
    /// batch.
    pub fn build_default(
        &self,
        catalog: Arc<PluginCatalog>,
        descriptors: &[Arc<PluginDescriptor>],
        libraries: &[ArtifactLocation],
        staging: Option<Arc<StagingArea>>,
    ) -> Arc<dyn IsolationDomain> {
        let mut locations: Vec<ArtifactLocation> = Vec::with_capacity(descriptors.len() + libraries.len());
        for location in descriptors.iter().map(|d| d.location()).chain(libraries.iter()) {
            if !locations.contains(location) {
                locations.push(location.clone());
            }
        }
        log::debug!("Building default isolation domain over {} location(s)", locations.len());

        let domain = Arc::new(DefaultDomain::new(locations, catalog, staging));
        *self.default.write() = Some(Arc::clone(&domain));
        self.domains.clear();
        domain
    }

    pub fn default_domain(&self) -> Option<Arc<dyn IsolationDomain>> {
        self.default
            .read()
            .as_ref()
            .map(|domain| Arc::clone(domain) as Arc<dyn IsolationDomain>)
    }

    /// Make `location` visible in the default domain for plugins loaded from
    /// now on. Plugins already loaded keep the domain they were loaded into,
    /// and cached custom domains keep the locations they were built over.
    ///
    /// Returns false when there is no default domain yet or it already sees
    /// `location`.
    pub fn add_default_location(&self, location: &ArtifactLocation) -> bool {
        let mut default = self.default.write();
        let Some(current) = default.as_ref() else {
            return false;
        };
        if current.can_see(location) {
            return false;
        }
        log::debug!("Adding {} to the default isolation domain", location);
        *default = Some(Arc::new(current.extended(location)));
        true
    }

    /// Register `provider`; a later registration for the same key wins.
    pub fn register_factory(&self, provider: DomainProvider, provided_by: &str) {
        let key = provider.key().to_string();
        if key == DEFAULT_DOMAIN {
            log::warn!("Plugin '{}' tried to replace the default isolation domain; ignoring", provided_by);
            return;
        }
        if self
            .factories
            .insert(key.clone(), (provider, provided_by.to_string()))
            .is_some()
        {
            log::warn!("Isolation domain factory '{}' replaced by plugin '{}'", key, provided_by);
        } else {
            log::debug!("Plugin '{}' registered isolation domain factory '{}'", provided_by, key);
        }
    }

    pub fn has_factory(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Domain for `key`, building and caching custom domains on first use.
    pub fn resolve(&self, key: &str, requester: &str) -> Result<Arc<dyn IsolationDomain>> {
        let default = self.default_domain().ok_or_else(|| PluginSystemError::DomainConstruction {
            package_name: requester.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            message: "no default domain has been built".to_string(),
        })?;
        if key == DEFAULT_DOMAIN {
            return Ok(default);
        }

        let (provider, _) = self.factories.get(key).ok_or_else(|| PluginSystemError::UnknownDomainFactory {
            package_name: requester.to_string(),
            domain: key.to_string(),
        })?;

        self.domains.compute_if_absent(key.to_string(), |key| {
            log::debug!("Building isolation domain '{}' for plugin '{}'", key, requester);
            provider
                .build(&default, default.locations())
                .map_err(|message| PluginSystemError::DomainConstruction {
                    package_name: requester.to_string(),
                    domain: key.clone(),
                    message,
                })
        })
    }

    /// Drop the factories `package_name` contributed and the custom domains
    /// they built. Plugins already loaded into those domains keep them.
    ///
    /// Returns the keys that were dropped, sorted.
    pub fn remove_factories_of(&self, package_name: &str) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.read_operation(|factories| {
            factories
                .iter()
                .filter(|(_, (_, provided_by))| provided_by == package_name)
                .map(|(key, _)| key.clone())
                .collect()
        });
        keys.sort();
        for key in &keys {
            self.factories.remove(key);
            self.domains.remove(key);
            log::debug!(
                "Dropped isolation domain factory '{}' of unloaded plugin '{}'",
                key,
                package_name
            );
        }
        keys
    }

    /// A domain that is already built (the default one or a cached custom one)
    pub fn get(&self, key: &str) -> Option<Arc<dyn IsolationDomain>> {
        if key == DEFAULT_DOMAIN {
            self.default_domain()
        } else {
            self.domains.get(key)
        }
    }

    /// Keys of the custom domains built so far, sorted
    pub fn custom_keys(&self) -> Vec<String> {
        let mut keys = self.domains.keys();
        keys.sort();
        keys
    }

    /// Keys with a registered factory, sorted
    pub fn factory_keys(&self) -> Vec<String> {
        let mut keys = self.factories.keys();
        keys.sort();
        keys
    }

    /// Forget every domain and factory.
    pub fn clear(&self) {
        *self.default.write() = None;
        self.domains.clear();
        self.factories.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.default.read().is_none() && self.domains.is_empty() && self.factories.is_empty()
    }
}
