use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::domain::IsolationDomain;
use crate::plugin_system::factory::{Capability, downcast_plugin};
use crate::plugin_system::traits::{OptionalSlots, Plugin};
use crate::utils::sync::ReadWriteList;

/// Identifier of one loaded instance. Never reused within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginId(u64);

impl PluginId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A handle to an active plugin: its id, descriptor and instance
#[derive(Clone)]
pub struct LoadedPlugin {
    id: PluginId,
    descriptor: Arc<PluginDescriptor>,
    instance: Arc<dyn Plugin>,
}

impl LoadedPlugin {
    pub(crate) fn new(id: PluginId, descriptor: Arc<PluginDescriptor>, instance: Arc<dyn Plugin>) -> Self {
        Self { id, descriptor, instance }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn package_name(&self) -> &str {
        self.descriptor.package_name()
    }

    pub fn instance(&self) -> &Arc<dyn Plugin> {
        &self.instance
    }

    pub fn downcast<T: Plugin>(&self) -> Option<Arc<T>> {
        downcast_plugin::<T>(Arc::clone(&self.instance))
    }

    pub fn is<T: Plugin>(&self) -> bool {
        let any: &dyn Any = &*self.instance;
        any.is::<T>()
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.id)
            .field("package_name", &self.descriptor.package_name())
            .finish()
    }
}

/// Dependency and dependent edges of one loaded plugin, by package name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginWiring {
    pub required_dependencies: Vec<String>,
    pub optional_dependencies: Vec<String>,
    pub required_dependents: Vec<String>,
    pub optional_dependents: Vec<String>,
}

/// Manager-side record of one loaded plugin.
///
/// Edges refer to other entries by id; the table owns every instance.
pub(crate) struct PluginEntry {
    pub id: PluginId,
    pub descriptor: Arc<PluginDescriptor>,
    pub instance: Arc<dyn Plugin>,
    pub concrete_type: TypeId,
    pub capabilities: Vec<Capability>,
    pub domain: Arc<dyn IsolationDomain>,
    pub slots: OptionalSlots,
    pub required_dependencies: Vec<PluginId>,
    pub optional_dependencies: Vec<PluginId>,
    pub required_dependents: Vec<PluginId>,
    pub optional_dependents: Vec<PluginId>,
}

impl PluginEntry {
    pub fn new(
        id: PluginId,
        descriptor: Arc<PluginDescriptor>,
        instance: Arc<dyn Plugin>,
        domain: Arc<dyn IsolationDomain>,
        slots: OptionalSlots,
        required_dependencies: Vec<PluginId>,
    ) -> Self {
        let concrete_type = {
            let any: &dyn Any = &*instance;
            any.type_id()
        };
        let capabilities = instance.capabilities();
        Self {
            id,
            descriptor,
            instance,
            concrete_type,
            capabilities,
            domain,
            slots,
            required_dependencies,
            optional_dependencies: Vec::new(),
            required_dependents: Vec::new(),
            optional_dependents: Vec::new(),
        }
    }

    pub fn handle(&self) -> LoadedPlugin {
        LoadedPlugin::new(self.id, Arc::clone(&self.descriptor), Arc::clone(&self.instance))
    }

    /// Whether this plugin can stand in for `capability`
    pub fn provides(&self, capability: &Capability) -> bool {
        self.concrete_type == capability.type_id() || self.capabilities.contains(capability)
    }
}

fn push_unique(ids: &mut Vec<PluginId>, id: PluginId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// The ordered set of loaded plugins and the edges between them.
///
/// Every method takes the table lock for its own duration only, so callers
/// can invoke plugin callbacks between calls without holding it.
#[derive(Default)]
pub(crate) struct PluginTable {
    entries: ReadWriteList<PluginEntry>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add `entry` at the end of the load order and record it as a required
    /// dependent of each of its required dependencies.
    pub fn insert(&self, entry: PluginEntry) {
        self.entries.write_operation(|entries| {
            let id = entry.id;
            for dependency in &entry.required_dependencies {
                if let Some(dep) = entries.iter_mut().find(|e| e.id == *dependency) {
                    push_unique(&mut dep.required_dependents, id);
                }
            }
            entries.push(entry);
        });
    }

    /// Remove `id` and detach every edge that still points at it.
    pub fn remove(&self, id: PluginId) -> Option<LoadedPlugin> {
        self.entries.write_operation(|entries| {
            let index = entries.iter().position(|e| e.id == id)?;
            let removed = entries.remove(index);
            for entry in entries.iter_mut() {
                entry.required_dependencies.retain(|other| *other != id);
                entry.optional_dependencies.retain(|other| *other != id);
                entry.required_dependents.retain(|other| *other != id);
                entry.optional_dependents.retain(|other| *other != id);
            }
            Some(removed.handle())
        })
    }

    pub fn contains(&self, id: PluginId) -> bool {
        self.entries.any(|e| e.id == id)
    }

    pub fn contains_package(&self, package_name: &str) -> bool {
        self.entries.any(|e| e.descriptor.package_name() == package_name)
    }

    pub fn handle(&self, id: PluginId) -> Option<LoadedPlugin> {
        self.entries
            .read_operation(|entries| entries.iter().find(|e| e.id == id).map(PluginEntry::handle))
    }

    pub fn handle_by_name(&self, package_name: &str) -> Option<LoadedPlugin> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .find(|e| e.descriptor.package_name() == package_name)
                .map(PluginEntry::handle)
        })
    }

    /// Handles in load order
    pub fn handles(&self) -> Vec<LoadedPlugin> {
        self.entries
            .read_operation(|entries| entries.iter().map(PluginEntry::handle).collect())
    }

    pub fn package_names(&self) -> Vec<String> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .map(|e| e.descriptor.package_name().to_string())
                .collect()
        })
    }

    /// Every loaded plugin that provides `capability`, in load order
    pub fn providers_of(&self, capability: &Capability) -> Vec<LoadedPlugin> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .filter(|e| e.provides(capability))
                .map(PluginEntry::handle)
                .collect()
        })
    }

    pub fn slots(&self, id: PluginId) -> Option<OptionalSlots> {
        self.entries
            .read_operation(|entries| entries.iter().find(|e| e.id == id).map(|e| e.slots.clone()))
    }

    pub fn domain_of(&self, id: PluginId) -> Option<Arc<dyn IsolationDomain>> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| Arc::clone(&e.domain))
        })
    }

    /// Loaded plugins (other than `provider`) with an empty slot naming
    /// `provider`'s package, in load order
    pub fn consumers_waiting_for(&self, provider: &LoadedPlugin) -> Vec<(LoadedPlugin, OptionalSlots)> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .filter(|e| e.id != provider.id())
                .filter(|e| {
                    e.slots.declares(provider.package_name()) && !e.slots.is_bound(provider.package_name())
                })
                .map(|e| (e.handle(), e.slots.clone()))
                .collect()
        })
    }

    pub fn required_dependents(&self, id: PluginId) -> Vec<PluginId> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| e.required_dependents.clone())
                .unwrap_or_default()
        })
    }

    pub fn optional_dependents(&self, id: PluginId) -> Vec<PluginId> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| e.optional_dependents.clone())
                .unwrap_or_default()
        })
    }

    /// Sort `ids` into load order, dropping any that are no longer loaded.
    pub fn in_load_order(&self, ids: &[PluginId]) -> Vec<PluginId> {
        self.entries.read_operation(|entries| {
            entries
                .iter()
                .map(|e| e.id)
                .filter(|id| ids.contains(id))
                .collect()
        })
    }

    /// Record `consumer` as optionally depending on `provider`, on both sides.
    pub fn add_optional_edge(&self, consumer: PluginId, provider: PluginId) {
        self.entries.write_operation(|entries| {
            for entry in entries.iter_mut() {
                if entry.id == consumer {
                    push_unique(&mut entry.optional_dependencies, provider);
                } else if entry.id == provider {
                    push_unique(&mut entry.optional_dependents, consumer);
                }
            }
        });
    }

    pub fn remove_optional_edge(&self, consumer: PluginId, provider: PluginId) {
        self.entries.write_operation(|entries| {
            for entry in entries.iter_mut() {
                if entry.id == consumer {
                    entry.optional_dependencies.retain(|id| *id != provider);
                } else if entry.id == provider {
                    entry.optional_dependents.retain(|id| *id != consumer);
                }
            }
        });
    }

    /// Edges of `package_name`, resolved to package names
    pub fn wiring(&self, package_name: &str) -> Option<PluginWiring> {
        self.entries.read_operation(|entries| {
            let entry = entries.iter().find(|e| e.descriptor.package_name() == package_name)?;
            let names = |ids: &[PluginId]| -> Vec<String> {
                ids.iter()
                    .filter_map(|id| entries.iter().find(|e| e.id == *id))
                    .map(|e| e.descriptor.package_name().to_string())
                    .collect()
            };
            Some(PluginWiring {
                required_dependencies: names(&entry.required_dependencies),
                optional_dependencies: names(&entry.optional_dependencies),
                required_dependents: names(&entry.required_dependents),
                optional_dependents: names(&entry.optional_dependents),
            })
        })
    }
}
