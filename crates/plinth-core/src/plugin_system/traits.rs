use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use thiserror::Error;

use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::domain::{DomainProvider, IsolationDomain};
use crate::plugin_system::factory::Capability;
use crate::plugin_system::manager::{PluginManager, WeakPluginManager};
use crate::plugin_system::registry::{LoadedPlugin, PluginId};

/// Errors a plugin's own code may report back to the loader
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("Plugin initialization error: {0}")]
    InitError(String),

    #[error("Plugin dependency error: {0}")]
    DependencyError(String),

    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
}

/// Core trait implemented by every plugin type.
///
/// All callbacks are invoked synchronously by the [`PluginManager`] on the
/// thread driving the current load or unload. They may call back into the
/// manager (through [`PluginContext::manager`]); the manager's operation lock
/// is re-entrant for that thread.
pub trait Plugin: Any + Send + Sync {
    /// Called once the plugin is wired and visible to lookups.
    fn on_load(&self) {}

    /// Called right before the plugin is removed from the manager.
    fn on_unload(&self) {}

    /// An optional dependency slot of this plugin was just bound to `dependency`.
    fn on_dependency_loaded(&self, _dependency: &LoadedPlugin) {}

    /// An optional dependency of this plugin is going away.
    fn on_dependency_unloaded(&self, _descriptor: &PluginDescriptor) {}

    /// Called once per batch, after every plugin of the batch is loaded and wired.
    fn on_all_plugins_loaded(&self) {}

    /// Capabilities this plugin provides besides its own concrete type.
    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    /// Custom isolation-domain factories this plugin contributes.
    fn domain_providers(&self) -> Vec<DomainProvider> {
        Vec::new()
    }
}

#[derive(Clone)]
struct SlotBinding {
    id: PluginId,
    descriptor: Arc<PluginDescriptor>,
    plugin: Weak<dyn Plugin>,
}

/// Optional dependency slots of one plugin instance.
///
/// Each slot names a package and is either empty or bound to a loaded
/// instance of that package. Bindings are weak: the manager owns instance
/// lifetime, and it clears a slot before the bound plugin is dropped.
#[derive(Clone, Default)]
pub struct OptionalSlots {
    slots: Arc<RwLock<Vec<(String, Option<SlotBinding>)>>>,
}

impl OptionalSlots {
    pub(crate) fn declare(names: &[String]) -> Self {
        let mut slots: Vec<(String, Option<SlotBinding>)> = Vec::with_capacity(names.len());
        for name in names {
            if !slots.iter().any(|(existing, _)| existing == name) {
                slots.push((name.clone(), None));
            }
        }
        Self { slots: Arc::new(RwLock::new(slots)) }
    }

    /// Declared slot names, in declaration order
    pub fn names(&self) -> Vec<String> {
        self.slots.read().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn declares(&self, package_name: &str) -> bool {
        self.slots.read().iter().any(|(name, _)| name == package_name)
    }

    pub fn is_bound(&self, package_name: &str) -> bool {
        self.slots
            .read()
            .iter()
            .any(|(name, binding)| name == package_name && binding.is_some())
    }

    /// Names of declared slots that are currently empty
    pub fn unbound(&self) -> Vec<String> {
        self.slots
            .read()
            .iter()
            .filter(|(_, binding)| binding.is_none())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The plugin bound to `package_name`, if any and still alive
    pub fn get(&self, package_name: &str) -> Option<LoadedPlugin> {
        let slots = self.slots.read();
        let binding = slots
            .iter()
            .find(|(name, _)| name == package_name)
            .and_then(|(_, binding)| binding.as_ref())?;
        let plugin = binding.plugin.upgrade()?;
        Some(LoadedPlugin::new(binding.id, Arc::clone(&binding.descriptor), plugin))
    }

    /// Fill the empty slot named after `plugin`'s package. Returns false when
    /// no such slot is declared or it is already bound.
    pub(crate) fn bind(&self, plugin: &LoadedPlugin) -> bool {
        let mut slots = self.slots.write();
        match slots
            .iter_mut()
            .find(|(name, _)| name == plugin.package_name())
        {
            Some((_, binding @ None)) => {
                *binding = Some(SlotBinding {
                    id: plugin.id(),
                    descriptor: Arc::clone(plugin.descriptor()),
                    plugin: Arc::downgrade(plugin.instance()),
                });
                true
            }
            _ => false,
        }
    }

    /// Clear the slot for `package_name`, returning the id it was bound to.
    pub(crate) fn unbind(&self, package_name: &str) -> Option<PluginId> {
        let mut slots = self.slots.write();
        slots
            .iter_mut()
            .find(|(name, _)| name == package_name)
            .and_then(|(_, binding)| binding.take())
            .map(|binding| binding.id)
    }
}

impl fmt::Debug for OptionalSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_map()
            .entries(slots.iter().map(|(name, binding)| (name, binding.as_ref().map(|b| b.id))))
            .finish()
    }
}

/// Everything a plugin receives at construction.
#[derive(Clone)]
pub struct PluginContext {
    manager: WeakPluginManager,
    descriptor: Arc<PluginDescriptor>,
    domain: Arc<dyn IsolationDomain>,
    slots: OptionalSlots,
}

impl PluginContext {
    pub(crate) fn new(
        manager: WeakPluginManager,
        descriptor: Arc<PluginDescriptor>,
        domain: Arc<dyn IsolationDomain>,
        slots: OptionalSlots,
    ) -> Self {
        Self { manager, descriptor, domain, slots }
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn package_name(&self) -> &str {
        self.descriptor.package_name()
    }

    /// The owning manager, unless it has already been dropped
    pub fn manager(&self) -> Option<PluginManager> {
        self.manager.upgrade()
    }

    /// Isolation domain this plugin was loaded through
    pub fn domain(&self) -> &Arc<dyn IsolationDomain> {
        &self.domain
    }

    pub fn optional_slots(&self) -> &OptionalSlots {
        &self.slots
    }

    /// The plugin currently bound to the optional slot `package_name`
    pub fn optional_dependency(&self, package_name: &str) -> Option<LoadedPlugin> {
        self.slots.get(package_name)
    }

    /// Like [`optional_dependency`](Self::optional_dependency), downcast to `T`
    pub fn optional_dependency_as<T: Plugin>(&self, package_name: &str) -> Option<Arc<T>> {
        self.slots.get(package_name).and_then(|plugin| plugin.downcast::<T>())
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("package_name", &self.descriptor.package_name())
            .field("domain", &self.domain.key())
            .field("slots", &self.slots)
            .finish()
    }
}
