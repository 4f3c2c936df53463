//! The plugin manager: discovery, resolution, instantiation, wiring and the
//! load/unload lifecycle.
//!
//! Every mutating operation runs under one exclusive [`OperationLock`] that
//! is re-entrant for the thread holding it, so plugin callbacks are free to
//! query the manager, or even load and unload other plugins, while an
//! operation is in progress. Queries from other threads wait until the
//! operation completes and never observe a half-applied change.
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::ManagerConfig;
use crate::kernel;
use crate::plugin_system::dependency::{DependencyError, DependencyResolver};
use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::domain::{DomainRegistry, IsolationDomain};
use crate::plugin_system::error::{Diagnostic, PluginSystemError, Result};
use crate::plugin_system::factory::{
    Capability, FactorySignature, PluginCatalog, PluginType, RequiredDependencies,
};
use crate::plugin_system::loader::{
    ArchiveSource, DefaultMetadataParser, DirectoryArchiveSource, MetadataParser, read_descriptors,
};
use crate::plugin_system::registry::{LoadedPlugin, PluginEntry, PluginId, PluginTable, PluginWiring};
use crate::plugin_system::traits::{OptionalSlots, Plugin, PluginContext};
use crate::utils::sync::{OperationLock, ReadWriteList};

/// Manager-level hooks around the plugin lifecycle
pub trait ManagerHooks: Send + Sync {
    /// Whether a discovered plugin should be loaded at all
    fn should_enable(&self, descriptor: &PluginDescriptor) -> bool {
        descriptor.enabled_by_default()
    }

    /// Runs after a plugin's own `on_load`
    fn on_plugin_load(&self, plugin: &LoadedPlugin) {
        log::info!("Loaded plugin: {}", plugin.descriptor());
    }

    /// Runs after a plugin's own `on_unload`, before it is dropped
    fn on_plugin_unload(&self, plugin: &LoadedPlugin) {
        log::info!("Unloaded plugin: {}", plugin.descriptor());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ManagerHooks for DefaultHooks {}

/// What one `load_all` batch did
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Package names loaded by this batch, in load order
    pub loaded: Vec<String>,
    /// Package names skipped because they are disabled
    pub disabled: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn diagnostics_for(&self, package_name: &str) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.package_name.as_deref() == Some(package_name))
            .collect()
    }

    /// Whether a diagnostic of `kind` (see [`Diagnostic::kind`]) names `package_name`
    pub fn has_diagnostic(&self, package_name: &str, kind: &str) -> bool {
        self.diagnostics_for(package_name).iter().any(|d| d.kind() == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    Batch,
    Targeted,
}

/// Bookkeeping for one targeted load, used to undo it on failure
#[derive(Default)]
struct TargetedLoad {
    visiting: Vec<String>,
    loaded: Vec<PluginId>,
    registered: Vec<String>,
}

struct ManagerInner {
    config: ManagerConfig,
    catalog: Arc<PluginCatalog>,
    source: Box<dyn ArchiveSource>,
    parser: Box<dyn MetadataParser>,
    hooks: Box<dyn ManagerHooks>,
    lock: OperationLock,
    descriptors: ReadWriteList<Arc<PluginDescriptor>>,
    plugins: PluginTable,
    domains: DomainRegistry,
    diagnostics: ReadWriteList<Diagnostic>,
    next_id: AtomicU64,
}

/// Shared handle to the plugin manager. Clones refer to the same state.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning handle to a [`PluginManager`], as held by plugin contexts
#[derive(Clone, Default)]
pub struct WeakPluginManager {
    inner: Weak<ManagerInner>,
}

impl WeakPluginManager {
    pub fn upgrade(&self) -> Option<PluginManager> {
        self.inner.upgrade().map(|inner| PluginManager { inner })
    }
}

impl fmt::Debug for WeakPluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakPluginManager")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Builder for [`PluginManager`]
pub struct PluginManagerBuilder {
    config: ManagerConfig,
    catalog: PluginCatalog,
    source: Option<Box<dyn ArchiveSource>>,
    parser: Option<Box<dyn MetadataParser>>,
    hooks: Option<Box<dyn ManagerHooks>>,
}

impl PluginManagerBuilder {
    fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            catalog: PluginCatalog::new(),
            source: None,
            parser: None,
            hooks: None,
        }
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: PluginCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Add one plugin type to the catalog
    pub fn register(mut self, plugin_type: PluginType) -> Self {
        self.catalog.register(plugin_type);
        self
    }

    /// Replace the directory scan derived from the config
    pub fn source(mut self, source: impl ArchiveSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn parser(mut self, parser: impl MetadataParser + 'static) -> Self {
        self.parser = Some(Box::new(parser));
        self
    }

    pub fn hooks(mut self, hooks: impl ManagerHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    pub fn build(self) -> PluginManager {
        let source = self
            .source
            .unwrap_or_else(|| Box::new(DirectoryArchiveSource::from_config(&self.config)));
        let parser = self.parser.unwrap_or_else(|| Box::new(DefaultMetadataParser));
        let hooks = self.hooks.unwrap_or_else(|| Box::new(DefaultHooks));
        PluginManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                catalog: Arc::new(self.catalog),
                source,
                parser,
                hooks,
                lock: OperationLock::new(),
                descriptors: ReadWriteList::new(),
                plugins: PluginTable::new(),
                domains: DomainRegistry::new(),
                diagnostics: ReadWriteList::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl PluginManager {
    pub fn builder() -> PluginManagerBuilder {
        PluginManagerBuilder::new()
    }

    /// Manager scanning the directories named in `config`
    pub fn new(catalog: PluginCatalog, config: ManagerConfig) -> Self {
        Self::builder().catalog(catalog).config(config).build()
    }

    /// Manager configured from a JSON, YAML or TOML file
    pub fn from_config_file(path: &Path, catalog: PluginCatalog) -> kernel::Result<Self> {
        let config = ManagerConfig::load(path)?;
        Ok(Self::new(catalog, config))
    }

    pub fn downgrade(&self) -> WeakPluginManager {
        WeakPluginManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.inner.catalog
    }

    // ----- Batch operations -----

    /// Discover, resolve and load every available plugin.
    ///
    /// Failures are isolated per plugin and returned as diagnostics; the
    /// batch always runs to completion.
    pub fn load_all(&self) -> BatchReport {
        let _guard = self.inner.lock.exclusive();
        let inner = &self.inner;
        let mut report = BatchReport::default();

        let discovery = inner.source.discover();
        report.diagnostics.extend(discovery.diagnostics);

        let loaded: HashSet<String> = inner.plugins.package_names().into_iter().collect();
        let (fresh, diagnostics) = read_descriptors(&discovery.archives, inner.parser.as_ref(), &loaded);
        report.diagnostics.extend(diagnostics);
        // A known package that is not loaded rejoins the batch with its rediscovered descriptor.
        inner.descriptors.write_operation(|descriptors| {
            for descriptor in &fresh {
                match descriptors
                    .iter_mut()
                    .find(|known| known.package_name() == descriptor.package_name())
                {
                    Some(known) => {
                        log::debug!(
                            "Plugin '{}' rediscovered at {}",
                            descriptor.package_name(),
                            descriptor.location()
                        );
                        *known = Arc::clone(descriptor);
                    }
                    None => descriptors.push(Arc::clone(descriptor)),
                }
            }
        });

        let resolution = DependencyResolver::new().with_satisfied(loaded).resolve(&fresh);
        for unresolved in resolution.unresolved {
            let package_name = unresolved.descriptor.package_name().to_string();
            log::warn!("Skipping plugin '{}': {}", package_name, unresolved.error);
            report.diagnostics.push(
                PluginSystemError::UnresolvableDependency {
                    package_name,
                    source: unresolved.error,
                }
                .into(),
            );
        }

        inner.domains.build_default(
            Arc::clone(&inner.catalog),
            &inner.descriptors.snapshot(),
            &discovery.libraries,
            discovery.staging,
        );

        for descriptor in &resolution.ordered {
            if !self.should_enable(descriptor) {
                log::info!("Plugin '{}' is disabled; skipping", descriptor.package_name());
                report.disabled.push(descriptor.package_name().to_string());
                continue;
            }
            match self.instantiate(descriptor, LoadMode::Batch) {
                Ok(plugin) => report.loaded.push(plugin.package_name().to_string()),
                Err(e) => {
                    log::warn!("Failed to load plugin '{}': {}", descriptor.package_name(), e);
                    report.diagnostics.push(e.into());
                }
            }
        }

        // Plugins loaded early in the batch pick up optional dependencies loaded after them.
        for plugin in inner.plugins.handles() {
            if inner.plugins.contains(plugin.id()) {
                self.bind_as_consumer(&plugin);
            }
        }
        for plugin in inner.plugins.handles() {
            if inner.plugins.contains(plugin.id()) {
                plugin.instance().on_all_plugins_loaded();
            }
        }

        inner.diagnostics.write_operation(|stored| {
            stored.clear();
            stored.extend(report.diagnostics.iter().cloned());
        });
        log::info!(
            "Plugin batch finished: {} loaded, {} disabled, {} diagnostic(s)",
            report.loaded.len(),
            report.disabled.len(),
            report.diagnostics.len()
        );
        report
    }

    /// Unload everything, then run a fresh batch.
    pub fn reload_all(&self) -> BatchReport {
        let _guard = self.inner.lock.exclusive();
        self.unload_all();
        self.load_all()
    }

    /// Unload every plugin in reverse load order and reset all state.
    pub fn unload_all(&self) {
        let _guard = self.inner.lock.exclusive();
        let inner = &self.inner;

        while let Some(plugin) = inner.plugins.handles().pop() {
            if let Err(e) = self.unload_internal(&plugin, true) {
                log::error!("Failed to unload plugin '{}': {}", plugin.package_name(), e);
                inner.plugins.remove(plugin.id());
            }
        }

        inner.descriptors.clear();
        inner.domains.clear();
        inner.diagnostics.clear();
    }

    // ----- Targeted operations -----

    /// Add a descriptor without loading it, so it can later be loaded by
    /// package name or pulled in as a dependency.
    pub fn register_descriptor(&self, descriptor: PluginDescriptor) -> Result<Arc<PluginDescriptor>> {
        let _guard = self.inner.lock.exclusive();
        if let Some(known) = self.find_descriptor(descriptor.package_name()) {
            return Err(PluginSystemError::DuplicatePackage {
                package_name: known.package_name().to_string(),
                location: descriptor.location().clone(),
            });
        }
        let descriptor = Arc::new(descriptor);
        self.inner.descriptors.push(Arc::clone(&descriptor));
        self.inner.domains.add_default_location(descriptor.location());
        Ok(descriptor)
    }

    /// Load one plugin outside a batch.
    ///
    /// Returns the existing instance when the package is already loaded.
    /// With `with_dependencies`, missing dependencies with known descriptors
    /// are loaded first; otherwise a missing dependency is an error. Either
    /// the plugin ends up loaded or nothing changes: dependencies loaded by
    /// this call are unloaded again if the plugin itself fails.
    pub fn load(&self, descriptor: &Arc<PluginDescriptor>, with_dependencies: bool) -> Result<LoadedPlugin> {
        let _guard = self.inner.lock.exclusive();
        if let Some(existing) = self.inner.plugins.handle_by_name(descriptor.package_name()) {
            return Ok(existing);
        }

        let mut txn = TargetedLoad::default();
        let result = self.load_targeted(descriptor, with_dependencies, &mut txn);
        if let Err(e) = &result {
            log::warn!("Failed to load plugin '{}': {}", descriptor.package_name(), e);
            self.roll_back(txn);
        }
        result
    }

    /// [`load`](Self::load) by package name of a known descriptor
    pub fn load_package(&self, package_name: &str, with_dependencies: bool) -> Result<LoadedPlugin> {
        let _guard = self.inner.lock.exclusive();
        let descriptor = self
            .find_descriptor(package_name)
            .ok_or_else(|| PluginSystemError::UnknownPackage {
                package_name: package_name.to_string(),
            })?;
        self.load(&descriptor, with_dependencies)
    }

    /// Unload one plugin.
    ///
    /// Fails with `BlockedUnload`, changing nothing, when other plugins
    /// require it and `with_dependants` is false. Otherwise those plugins are
    /// unloaded first. Optional dependents are only unbound, never unloaded.
    pub fn unload(&self, plugin: &LoadedPlugin, with_dependants: bool) -> Result<()> {
        let _guard = self.inner.lock.exclusive();
        let current = self
            .inner
            .plugins
            .handle(plugin.id())
            .ok_or_else(|| PluginSystemError::NotLoaded {
                package_name: plugin.package_name().to_string(),
            })?;
        self.unload_internal(&current, with_dependants)
    }

    /// [`unload`](Self::unload) by package name
    pub fn unload_package(&self, package_name: &str, with_dependants: bool) -> Result<()> {
        let _guard = self.inner.lock.exclusive();
        let plugin = self
            .inner
            .plugins
            .handle_by_name(package_name)
            .ok_or_else(|| PluginSystemError::NotLoaded {
                package_name: package_name.to_string(),
            })?;
        self.unload_internal(&plugin, with_dependants)
    }

    // ----- Queries -----

    /// Loaded plugin by package name
    pub fn plugin(&self, package_name: &str) -> Option<LoadedPlugin> {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.handle_by_name(package_name)
    }

    /// Loaded plugin by package name, downcast to its concrete type
    pub fn plugin_as<T: Plugin>(&self, package_name: &str) -> Option<Arc<T>> {
        self.plugin(package_name).and_then(|plugin| plugin.downcast::<T>())
    }

    /// All loaded plugins in load order
    pub fn plugins(&self) -> Vec<LoadedPlugin> {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.handles()
    }

    /// Loaded plugins providing `capability`, in load order
    pub fn plugins_with_capability(&self, capability: &Capability) -> Vec<LoadedPlugin> {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.providers_of(capability)
    }

    /// Loaded plugins whose concrete type is `T`
    pub fn plugins_of_type<T: Plugin>(&self) -> Vec<Arc<T>> {
        self.plugins_with_capability(&Capability::of::<T>())
            .iter()
            .filter_map(|plugin| plugin.downcast::<T>())
            .collect()
    }

    /// First loaded plugin whose concrete type is `T`
    pub fn plugin_of_type<T: Plugin>(&self) -> Option<Arc<T>> {
        self.plugins_of_type::<T>().into_iter().next()
    }

    pub fn is_loaded(&self, package_name: &str) -> bool {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.contains_package(package_name)
    }

    pub fn loaded_count(&self) -> usize {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.len()
    }

    /// Known descriptor by package name, loaded or not
    pub fn descriptor(&self, package_name: &str) -> Option<Arc<PluginDescriptor>> {
        let _shared = self.inner.lock.shared();
        self.find_descriptor(package_name)
    }

    /// Known descriptors in discovery order
    pub fn descriptors(&self) -> Vec<Arc<PluginDescriptor>> {
        let _shared = self.inner.lock.shared();
        self.inner.descriptors.snapshot()
    }

    /// Dependency and dependent edges of a loaded plugin
    pub fn wiring(&self, package_name: &str) -> Option<PluginWiring> {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.wiring(package_name)
    }

    /// Diagnostics recorded by the last batch
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let _shared = self.inner.lock.shared();
        self.inner.diagnostics.snapshot()
    }

    pub fn default_domain(&self) -> Option<Arc<dyn IsolationDomain>> {
        let _shared = self.inner.lock.shared();
        self.inner.domains.default_domain()
    }

    /// A domain that has already been built
    pub fn domain(&self, key: &str) -> Option<Arc<dyn IsolationDomain>> {
        let _shared = self.inner.lock.shared();
        self.inner.domains.get(key)
    }

    /// Domain a loaded plugin was instantiated through
    pub fn domain_of(&self, plugin: &LoadedPlugin) -> Option<Arc<dyn IsolationDomain>> {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.domain_of(plugin.id())
    }

    /// Keys of the custom domains built during the current batch
    pub fn custom_domain_keys(&self) -> Vec<String> {
        let _shared = self.inner.lock.shared();
        self.inner.domains.custom_keys()
    }

    /// Keys with a registered custom-domain factory
    pub fn domain_factory_keys(&self) -> Vec<String> {
        let _shared = self.inner.lock.shared();
        self.inner.domains.factory_keys()
    }

    /// True when nothing is loaded, known or cached
    pub fn is_empty(&self) -> bool {
        let _shared = self.inner.lock.shared();
        self.inner.plugins.is_empty()
            && self.inner.descriptors.is_empty()
            && self.inner.domains.is_empty()
            && self.inner.diagnostics.is_empty()
    }

    // ----- Internals (caller holds the exclusive lock) -----

    fn find_descriptor(&self, package_name: &str) -> Option<Arc<PluginDescriptor>> {
        self.inner
            .descriptors
            .filter_first(|d| d.package_name() == package_name)
    }

    fn should_enable(&self, descriptor: &PluginDescriptor) -> bool {
        match self.inner.config.enablement_override(descriptor.package_name()) {
            Some(enabled) => enabled,
            None => self.inner.hooks.should_enable(descriptor),
        }
    }

    fn ensure_default_domain(&self) {
        if self.inner.domains.default_domain().is_none() {
            self.inner.domains.build_default(
                Arc::clone(&self.inner.catalog),
                &self.inner.descriptors.snapshot(),
                &[],
                None,
            );
        }
    }

    /// Make `descriptor` known, unless a descriptor for the same package
    /// from the same location already is.
    fn ensure_registered(&self, descriptor: &Arc<PluginDescriptor>, txn: &mut TargetedLoad) -> Result<()> {
        match self.find_descriptor(descriptor.package_name()) {
            Some(known) if Arc::ptr_eq(&known, descriptor) || known.location() == descriptor.location() => Ok(()),
            Some(_) => Err(PluginSystemError::DuplicatePackage {
                package_name: descriptor.package_name().to_string(),
                location: descriptor.location().clone(),
            }),
            None => {
                self.inner.descriptors.push(Arc::clone(descriptor));
                self.inner.domains.add_default_location(descriptor.location());
                txn.registered.push(descriptor.package_name().to_string());
                Ok(())
            }
        }
    }

    fn load_targeted(
        &self,
        descriptor: &Arc<PluginDescriptor>,
        with_dependencies: bool,
        txn: &mut TargetedLoad,
    ) -> Result<LoadedPlugin> {
        let package_name = descriptor.package_name();
        if let Some(existing) = self.inner.plugins.handle_by_name(package_name) {
            return Ok(existing);
        }
        if let Some(start) = txn.visiting.iter().position(|p| p == package_name) {
            let mut cycle = txn.visiting[start..].to_vec();
            cycle.push(package_name.to_string());
            return Err(PluginSystemError::UnresolvableDependency {
                package_name: package_name.to_string(),
                source: DependencyError::CyclicDependency(cycle),
            });
        }
        self.ensure_registered(descriptor, txn)?;

        txn.visiting.push(package_name.to_string());
        for dependency in descriptor.dependencies() {
            if self.inner.plugins.contains_package(dependency) {
                continue;
            }
            let known = if with_dependencies { self.find_descriptor(dependency) } else { None };
            match known {
                Some(dependency_descriptor) => {
                    self.load_targeted(&dependency_descriptor, true, txn)?;
                }
                None => {
                    return Err(PluginSystemError::MissingRequiredDependency {
                        package_name: package_name.to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        txn.visiting.pop();

        if !self.should_enable(descriptor) {
            return Err(PluginSystemError::PluginDisabled {
                package_name: package_name.to_string(),
            });
        }

        self.ensure_default_domain();
        let plugin = self.instantiate(descriptor, LoadMode::Targeted)?;
        txn.loaded.push(plugin.id());
        self.bind_as_consumer(&plugin);
        Ok(plugin)
    }

    fn roll_back(&self, txn: TargetedLoad) {
        for id in txn.loaded.into_iter().rev() {
            if let Some(plugin) = self.inner.plugins.handle(id) {
                log::debug!("Rolling back plugin '{}'", plugin.package_name());
                if let Err(e) = self.unload_internal(&plugin, true) {
                    log::error!("Failed to roll back plugin '{}': {}", plugin.package_name(), e);
                }
            }
        }
        for package_name in txn.registered {
            if !self.inner.plugins.contains_package(&package_name) {
                self.inner.descriptors.retain(|d| d.package_name() != package_name);
            }
        }
    }

    /// Pick the first factory signature whose every required capability has
    /// exactly one loaded provider. On failure, returns what was missing.
    fn select_factory(
        &self,
        plugin_type: &PluginType,
    ) -> std::result::Result<(FactorySignature, Vec<(Capability, LoadedPlugin)>), Vec<String>> {
        let mut unsatisfied: Vec<String> = Vec::new();
        if plugin_type.factories().is_empty() {
            unsatisfied.push(format!("{} declares no factory", plugin_type.entry_point()));
            return Err(unsatisfied);
        }

        'signatures: for signature in plugin_type.factories() {
            let mut resolved = Vec::with_capacity(signature.requires().len());
            for capability in signature.requires() {
                let providers = self.inner.plugins.providers_of(capability);
                match providers.as_slice() {
                    [single] => resolved.push((*capability, single.clone())),
                    [] => {
                        let name = capability.name().to_string();
                        if !unsatisfied.contains(&name) {
                            unsatisfied.push(name);
                        }
                        continue 'signatures;
                    }
                    many => {
                        let name = format!("{} ({} candidates)", capability.name(), many.len());
                        if !unsatisfied.contains(&name) {
                            unsatisfied.push(name);
                        }
                        continue 'signatures;
                    }
                }
            }
            return Ok((signature.clone(), resolved));
        }
        Err(unsatisfied)
    }

    /// Construct, wire and activate one plugin.
    fn instantiate(&self, descriptor: &Arc<PluginDescriptor>, mode: LoadMode) -> Result<LoadedPlugin> {
        let inner = &self.inner;
        let package_name = descriptor.package_name();

        let mut required: Vec<PluginId> = Vec::with_capacity(descriptor.dependencies().len());
        for dependency in descriptor.dependencies() {
            match inner.plugins.handle_by_name(dependency) {
                Some(loaded) => required.push(loaded.id()),
                None => {
                    return Err(PluginSystemError::MissingRequiredDependency {
                        package_name: package_name.to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let domain = inner.domains.resolve(descriptor.domain(), package_name)?;
        let plugin_type = domain
            .resolve(descriptor.entry_point())
            .ok_or_else(|| PluginSystemError::UnknownEntryPoint {
                package_name: package_name.to_string(),
                entry_point: descriptor.entry_point().to_string(),
                domain: domain.key().to_string(),
            })?;

        let (signature, resolved) = match self.select_factory(&plugin_type) {
            Ok(found) => found,
            Err(unsatisfied) => {
                return Err(match mode {
                    LoadMode::Batch => PluginSystemError::NoViableFactory {
                        package_name: package_name.to_string(),
                        entry_point: descriptor.entry_point().to_string(),
                        unsatisfied,
                    },
                    LoadMode::Targeted => PluginSystemError::MissingRequiredDependency {
                        package_name: package_name.to_string(),
                        dependency: unsatisfied
                            .into_iter()
                            .next()
                            .unwrap_or_else(|| descriptor.entry_point().to_string()),
                    },
                });
            }
        };
        for (_, provider) in &resolved {
            if !required.contains(&provider.id()) {
                required.push(provider.id());
            }
        }

        let slots = OptionalSlots::declare(plugin_type.optional_slots());
        let context = PluginContext::new(
            self.downgrade(),
            Arc::clone(descriptor),
            Arc::clone(&domain),
            slots.clone(),
        );
        let instance = signature
            .construct(context, RequiredDependencies::new(resolved))
            .map_err(|source| PluginSystemError::InstantiationFailed {
                package_name: package_name.to_string(),
                source,
            })?;

        let id = PluginId::new(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = PluginEntry::new(id, Arc::clone(descriptor), instance, domain, slots, required);
        let plugin = entry.handle();

        for provider in plugin.instance().domain_providers() {
            inner.domains.register_factory(provider, package_name);
        }
        inner.plugins.insert(entry);
        self.bind_as_provider(&plugin);

        plugin.instance().on_load();
        inner.hooks.on_plugin_load(&plugin);
        Ok(plugin)
    }

    /// Fill every empty slot naming `provider` in the other loaded plugins.
    fn bind_as_provider(&self, provider: &LoadedPlugin) {
        let plugins = &self.inner.plugins;
        for (consumer, slots) in plugins.consumers_waiting_for(provider) {
            if !plugins.contains(consumer.id()) || !plugins.contains(provider.id()) {
                continue;
            }
            if slots.bind(provider) {
                plugins.add_optional_edge(consumer.id(), provider.id());
                log::debug!(
                    "Bound optional dependency '{}' of plugin '{}'",
                    provider.package_name(),
                    consumer.package_name()
                );
                consumer.instance().on_dependency_loaded(provider);
            }
        }
    }

    /// Fill `consumer`'s empty slots from the plugins already loaded.
    fn bind_as_consumer(&self, consumer: &LoadedPlugin) {
        let plugins = &self.inner.plugins;
        let Some(slots) = plugins.slots(consumer.id()) else {
            return;
        };
        for package_name in slots.unbound() {
            if package_name == consumer.package_name() {
                continue;
            }
            let Some(provider) = plugins.handle_by_name(&package_name) else {
                continue;
            };
            if !plugins.contains(consumer.id()) {
                return;
            }
            if slots.bind(&provider) {
                plugins.add_optional_edge(consumer.id(), provider.id());
                log::debug!(
                    "Bound optional dependency '{}' of plugin '{}'",
                    provider.package_name(),
                    consumer.package_name()
                );
                consumer.instance().on_dependency_loaded(&provider);
            }
        }
    }

    fn unload_internal(&self, plugin: &LoadedPlugin, with_dependants: bool) -> Result<()> {
        let plugins = &self.inner.plugins;
        if !plugins.contains(plugin.id()) {
            return Err(PluginSystemError::NotLoaded {
                package_name: plugin.package_name().to_string(),
            });
        }

        let dependents = plugins.in_load_order(&plugins.required_dependents(plugin.id()));
        if !dependents.is_empty() && !with_dependants {
            let names = dependents
                .iter()
                .filter_map(|id| plugins.handle(*id))
                .map(|dependent| dependent.package_name().to_string())
                .collect();
            return Err(PluginSystemError::BlockedUnload {
                package_name: plugin.package_name().to_string(),
                dependents: names,
            });
        }

        for dependent_id in plugins.optional_dependents(plugin.id()) {
            let Some(dependent) = plugins.handle(dependent_id) else {
                continue;
            };
            if let Some(slots) = plugins.slots(dependent_id) {
                slots.unbind(plugin.package_name());
            }
            plugins.remove_optional_edge(dependent_id, plugin.id());
            dependent.instance().on_dependency_unloaded(plugin.descriptor());
        }

        for dependent_id in dependents.into_iter().rev() {
            if let Some(dependent) = plugins.handle(dependent_id) {
                self.unload_internal(&dependent, true)?;
            }
        }

        // A callback above may already have unloaded this plugin.
        if !plugins.contains(plugin.id()) {
            return Ok(());
        }
        plugin.instance().on_unload();
        self.inner.hooks.on_plugin_unload(plugin);

        if let Some(slots) = plugins.slots(plugin.id()) {
            for package_name in slots.names() {
                slots.unbind(&package_name);
            }
        }
        plugins.remove(plugin.id());
        self.inner.domains.remove_factories_of(plugin.package_name());
        Ok(())
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.inner.config.plugins_dir)
            .field("catalog", &self.inner.catalog.entry_points())
            .field("loaded", &self.inner.plugins.package_names())
            .finish()
    }
}
