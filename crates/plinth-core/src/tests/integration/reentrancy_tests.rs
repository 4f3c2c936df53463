#![cfg(test)]

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::plugin_system::descriptor::DescriptorBuilder;
use crate::plugin_system::factory::{PluginCatalog, PluginType};
use crate::plugin_system::traits::{Plugin, PluginContext};
use crate::tests::integration::common::{
    Journal, RECORDER, descriptor_json, entries, entries_with_prefix, journal, manager_for, record, recorder_type,
};

/// Queries the manager from inside its own callbacks
struct Inspector {
    context: PluginContext,
    journal: Journal,
}

impl Plugin for Inspector {
    fn on_load(&self) {
        let Some(manager) = self.context.manager() else {
            return;
        };
        record(
            &self.journal,
            format!(
                "inspect:visible={}:count={}",
                manager.is_loaded(self.context.package_name()),
                manager.loaded_count()
            ),
        );
    }

    fn on_all_plugins_loaded(&self) {
        let Some(manager) = self.context.manager() else {
            return;
        };
        // Pull in a plugin that was registered but not part of the batch.
        match manager.load_package("late", false) {
            Ok(plugin) => record(&self.journal, format!("late:{}", plugin.package_name())),
            Err(e) => record(&self.journal, format!("late-failed:{e}")),
        }
    }

    fn on_unload(&self) {
        if let Some(manager) = self.context.manager() {
            if manager.is_loaded("late") {
                let _ = manager.unload_package("late", true);
            }
        }
    }
}

fn inspector_type(journal: &Journal) -> PluginType {
    let journal = Arc::clone(journal);
    PluginType::new("test.Inspector").factory(move |context| {
        Ok(Inspector {
            context,
            journal: Arc::clone(&journal),
        })
    })
}

fn catalog(journal: &Journal) -> PluginCatalog {
    PluginCatalog::new()
        .with(recorder_type(RECORDER, journal))
        .with(inspector_type(journal))
}

#[test]
fn test_plugin_is_visible_during_its_own_on_load() {
    let journal = journal();
    let manager = manager_for(
        catalog(&journal),
        vec![descriptor_json("first", RECORDER, &[]), descriptor_json("inspector", "test.Inspector", &[])],
    );
    manager.load_all();
    assert_eq!(entries_with_prefix(&journal, "inspect:"), vec!["inspect:visible=true:count=2"]);
}

#[test]
fn test_callbacks_may_load_and_unload_other_plugins() {
    let journal = journal();
    let manager = manager_for(catalog(&journal), vec![descriptor_json("inspector", "test.Inspector", &[])]);
    manager
        .register_descriptor(DescriptorBuilder::new("late", RECORDER).build().unwrap())
        .unwrap();

    manager.load_all();
    assert!(entries(&journal).contains(&"late:late".to_string()), "{:?}", entries(&journal));
    assert!(manager.is_loaded("late"));

    manager.unload_package("inspector", false).unwrap();
    assert!(!manager.is_loaded("late"));
    assert!(manager.plugins().is_empty());
}

/// Spawns a thread that queries the manager while a batch is still running
struct Observer {
    context: PluginContext,
    results: Arc<Mutex<Option<mpsc::Receiver<usize>>>>,
}

impl Plugin for Observer {
    fn on_load(&self) {
        let Some(manager) = self.context.manager() else {
            return;
        };
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let _ = sender.send(manager.loaded_count());
        });
        *self.results.lock().unwrap() = Some(receiver);
    }
}

#[test]
fn test_other_threads_see_only_completed_batches() {
    let results: Arc<Mutex<Option<mpsc::Receiver<usize>>>> = Arc::new(Mutex::new(None));
    let journal = journal();
    let slot = Arc::clone(&results);
    let catalog = catalog(&journal).with(PluginType::new("test.Observer").factory(move |context| {
        Ok(Observer {
            context,
            results: Arc::clone(&slot),
        })
    }));
    let manager = manager_for(
        catalog,
        vec![
            descriptor_json("observer", "test.Observer", &[]),
            descriptor_json("a", RECORDER, &[]),
            descriptor_json("b", RECORDER, &[]),
        ],
    );

    manager.load_all();
    let receiver = results.lock().unwrap().take().unwrap();
    assert_eq!(receiver.recv().unwrap(), 3);
}
