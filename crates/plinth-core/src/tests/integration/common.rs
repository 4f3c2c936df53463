#![cfg(test)]

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::factory::{PluginCatalog, PluginType};
use crate::plugin_system::loader::StaticArchiveSource;
use crate::plugin_system::manager::PluginManager;
use crate::plugin_system::registry::LoadedPlugin;
use crate::plugin_system::traits::{Plugin, PluginContext};

// ===== JOURNAL =====

/// Shared, ordered record of lifecycle events
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn record(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Journal entries starting with `prefix`, in order
pub fn entries_with_prefix(journal: &Journal, prefix: &str) -> Vec<String> {
    entries(journal)
        .into_iter()
        .filter(|entry| entry.starts_with(prefix))
        .collect()
}

pub fn clear(journal: &Journal) {
    journal.lock().unwrap().clear();
}

// ===== MOCK PLUGINS =====

pub const RECORDER: &str = "test.Recorder";
pub const STORAGE: &str = "test.Storage";
pub const CACHE: &str = "test.Cache";

/// Records every callback it receives
pub struct Recorder {
    context: PluginContext,
    journal: Journal,
}

impl Recorder {
    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    fn name(&self) -> &str {
        self.context.package_name()
    }
}

impl Plugin for Recorder {
    fn on_load(&self) {
        record(&self.journal, format!("load:{}", self.name()));
    }

    fn on_unload(&self) {
        record(&self.journal, format!("unload:{}", self.name()));
    }

    fn on_dependency_loaded(&self, dependency: &LoadedPlugin) {
        record(&self.journal, format!("bind:{}<-{}", self.name(), dependency.package_name()));
    }

    fn on_dependency_unloaded(&self, descriptor: &PluginDescriptor) {
        record(&self.journal, format!("unbind:{}<-{}", self.name(), descriptor.package_name()));
    }

    fn on_all_plugins_loaded(&self) {
        record(&self.journal, format!("ready:{}", self.name()));
    }
}

pub fn recorder_type(entry_point: &str, journal: &Journal) -> PluginType {
    let journal = Arc::clone(journal);
    PluginType::new(entry_point).factory(move |context| {
        Ok(Recorder {
            context,
            journal: Arc::clone(&journal),
        })
    })
}

/// A plugin other plugins can require by type
pub struct Storage {
    pub label: String,
}

impl Plugin for Storage {}

/// Requires exactly one loaded [`Storage`]
pub struct Cache {
    pub storage: Arc<Storage>,
}

impl Plugin for Cache {}

pub fn storage_type() -> PluginType {
    PluginType::new(STORAGE).factory(|context| {
        Ok(Storage {
            label: context.package_name().to_string(),
        })
    })
}

pub fn cache_type() -> PluginType {
    PluginType::new(CACHE).factory_with(|_context, storage: Arc<Storage>| Ok(Cache { storage }))
}

// ===== HELPERS =====

pub fn descriptor_json(package_name: &str, entry_point: &str, depends_on: &[&str]) -> Value {
    json!({
        "packageName": package_name,
        "baseClass": entry_point,
        "dependsOn": depends_on,
    })
}

/// Manager discovering `descriptors`, in order, from memory
pub fn manager_for(catalog: PluginCatalog, descriptors: Vec<Value>) -> PluginManager {
    let source = descriptors
        .into_iter()
        .fold(StaticArchiveSource::new(), |source, descriptor| source.with_json(descriptor));
    PluginManager::builder().catalog(catalog).source(source).build()
}

pub fn loaded_names(manager: &PluginManager) -> Vec<String> {
    manager
        .plugins()
        .iter()
        .map(|plugin| plugin.package_name().to_string())
        .collect()
}
