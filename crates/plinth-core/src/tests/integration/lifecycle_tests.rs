#![cfg(test)]

use serde_json::json;

use crate::plugin_system::descriptor::DescriptorBuilder;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::factory::{Capability, PluginCatalog, PluginType};
use crate::plugin_system::traits::PluginError;
use crate::tests::integration::common::{
    CACHE, Cache, RECORDER, STORAGE, Storage, cache_type, clear, descriptor_json, entries, entries_with_prefix,
    journal, loaded_names, manager_for, recorder_type, storage_type,
};

fn recorder_catalog(journal: &crate::tests::integration::common::Journal) -> PluginCatalog {
    PluginCatalog::new()
        .with(recorder_type(RECORDER, journal))
        .with(storage_type())
        .with(cache_type())
}

#[test]
fn test_batch_loads_dependencies_first() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            descriptor_json("c", RECORDER, &["b"]),
            descriptor_json("b", RECORDER, &["a"]),
            descriptor_json("a", RECORDER, &[]),
        ],
    );

    let report = manager.load_all();
    assert!(report.is_clean(), "{:?}", report.diagnostics);
    assert_eq!(report.loaded, vec!["a", "b", "c"]);
    assert_eq!(loaded_names(&manager), vec!["a", "b", "c"]);
    assert_eq!(
        entries(&journal),
        vec!["load:a", "load:b", "load:c", "ready:a", "ready:b", "ready:c"]
    );

    let wiring = manager.wiring("b").unwrap();
    assert_eq!(wiring.required_dependencies, vec!["a".to_string()]);
    assert_eq!(wiring.required_dependents, vec!["c".to_string()]);
}

#[test]
fn test_unload_all_reverses_and_resets() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            descriptor_json("a", RECORDER, &[]),
            descriptor_json("b", RECORDER, &["a"]),
            descriptor_json("c", RECORDER, &["b"]),
        ],
    );
    manager.load_all();
    clear(&journal);

    manager.unload_all();
    assert_eq!(entries(&journal), vec!["unload:c", "unload:b", "unload:a"]);
    assert!(manager.is_empty());
    assert!(manager.descriptors().is_empty());
    assert!(manager.default_domain().is_none());
}

#[test]
fn test_blocked_unload_changes_nothing() {
    let journal = journal();
    let catalog = recorder_catalog(&journal).with(recorder_type("test.Watcher", &journal).optional_dependency("a"));
    let manager = manager_for(
        catalog,
        vec![
            descriptor_json("a", RECORDER, &[]),
            descriptor_json("b", RECORDER, &["a"]),
            descriptor_json("watcher", "test.Watcher", &[]),
        ],
    );
    manager.load_all();
    let wiring_before = manager.wiring("a").unwrap();
    clear(&journal);

    let err = manager.unload_package("a", false).unwrap_err();
    match err {
        PluginSystemError::BlockedUnload { package_name, dependents } => {
            assert_eq!(package_name, "a");
            assert_eq!(dependents, vec!["b".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(entries(&journal).is_empty());
    assert_eq!(loaded_names(&manager), vec!["a", "b", "watcher"]);
    assert_eq!(manager.wiring("a").unwrap(), wiring_before);
    assert_eq!(wiring_before.optional_dependents, vec!["watcher".to_string()]);
}

#[test]
fn test_cascading_unload_goes_in_reverse_load_order() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            descriptor_json("a", RECORDER, &[]),
            descriptor_json("b", RECORDER, &["a"]),
            descriptor_json("c", RECORDER, &["a", "b"]),
            descriptor_json("other", RECORDER, &[]),
        ],
    );
    manager.load_all();
    clear(&journal);

    let a = manager.plugin("a").unwrap();
    manager.unload(&a, true).unwrap();
    assert_eq!(entries(&journal), vec!["unload:c", "unload:b", "unload:a"]);
    assert_eq!(loaded_names(&manager), vec!["other"]);
    assert!(manager.descriptor("a").is_some());
}

#[test]
fn test_unresolvable_plugins_are_diagnosed_and_the_rest_load() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            descriptor_json("needy", RECORDER, &["ghost"]),
            descriptor_json("x", RECORDER, &["y"]),
            descriptor_json("y", RECORDER, &["x"]),
            descriptor_json("fine", RECORDER, &[]),
        ],
    );

    let report = manager.load_all();
    assert_eq!(report.loaded, vec!["fine"]);
    assert!(report.has_diagnostic("needy", "UnresolvableDependency"));
    assert!(report.has_diagnostic("x", "UnresolvableDependency"));
    assert!(report.has_diagnostic("y", "UnresolvableDependency"));
    let cycle = report.diagnostics_for("x")[0].error.to_string();
    assert!(cycle.contains("x -> y -> x"), "{cycle}");
    assert_eq!(manager.diagnostics().len(), 3);
}

#[test]
fn test_disabled_plugin_is_skipped_and_its_dependents_fail() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            json!({ "packageName": "off", "baseClass": RECORDER, "enabledByDefault": false }),
            descriptor_json("needs-off", RECORDER, &["off"]),
            descriptor_json("on", RECORDER, &[]),
        ],
    );

    let report = manager.load_all();
    assert_eq!(report.disabled, vec!["off"]);
    assert_eq!(report.loaded, vec!["on"]);
    assert!(report.has_diagnostic("needs-off", "MissingRequiredDependency"));
    assert!(manager.descriptor("off").is_some());
    assert!(!manager.is_loaded("off"));
}

#[test]
fn test_instantiation_problems_are_isolated() {
    let journal = journal();
    let catalog = recorder_catalog(&journal).with(
        PluginType::new("test.Exploding").factory(|_| -> Result<Storage, PluginError> {
            Err(PluginError::InitError("refusing to start".into()))
        }),
    );
    let manager = manager_for(
        catalog,
        vec![
            descriptor_json("unknown", "test.DoesNotExist", &[]),
            descriptor_json("exploding", "test.Exploding", &[]),
            descriptor_json("after-exploding", RECORDER, &["exploding"]),
            descriptor_json("healthy", RECORDER, &[]),
        ],
    );

    let report = manager.load_all();
    assert_eq!(report.loaded, vec!["healthy"]);
    assert!(report.has_diagnostic("unknown", "UnknownEntryPoint"));
    assert!(report.has_diagnostic("exploding", "InstantiationFailed"));
    assert!(report.has_diagnostic("after-exploding", "MissingRequiredDependency"));
    let message = report.diagnostics_for("exploding")[0].to_string();
    assert!(message.starts_with("[InstantiationFailed]"));
    assert!(message.contains("refusing to start"));
}

#[test]
fn test_duplicate_and_malformed_descriptors() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            descriptor_json("twin", RECORDER, &[]),
            json!({ "packageName": "twin", "baseClass": STORAGE }),
            json!({ "baseClass": RECORDER }),
        ],
    );

    let report = manager.load_all();
    assert_eq!(report.loaded, vec!["twin"]);
    assert!(manager.plugin("twin").unwrap().is::<crate::tests::integration::common::Recorder>());
    assert!(report.has_diagnostic("twin", "DuplicatePackage"));
    assert!(report.diagnostics.iter().any(|d| d.kind() == "MalformedDescriptor"));
}

#[test]
fn test_second_batch_skips_loaded_plugins() {
    let journal = journal();
    let manager = manager_for(recorder_catalog(&journal), vec![descriptor_json("a", RECORDER, &[])]);
    let first = manager.load_all();
    let second = manager.load_all();

    assert_eq!(first.loaded, vec!["a"]);
    assert!(second.loaded.is_empty());
    assert!(second.is_clean());
    assert_eq!(manager.loaded_count(), 1);
    assert_eq!(manager.descriptors().len(), 1);
}

#[test]
fn test_second_batch_reloads_individually_unloaded_plugin() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![descriptor_json("a", RECORDER, &[]), descriptor_json("b", RECORDER, &["a"])],
    );
    manager.load_all();
    manager.unload_package("b", false).unwrap();
    manager.unload_package("a", false).unwrap();
    clear(&journal);

    let second = manager.load_all();
    assert!(second.is_clean(), "{:?}", second.diagnostics);
    assert_eq!(second.loaded, vec!["a", "b"]);
    assert!(manager.is_loaded("a"));
    assert_eq!(entries_with_prefix(&journal, "load:"), vec!["load:a", "load:b"]);
    assert_eq!(manager.descriptors().len(), 2);
}

#[test]
fn test_batch_loads_descriptor_that_was_only_registered() {
    let journal = journal();
    let manager = manager_for(recorder_catalog(&journal), vec![descriptor_json("a", RECORDER, &[])]);
    let registered = manager
        .register_descriptor(DescriptorBuilder::new("a", RECORDER).location("memory:registered").build().unwrap())
        .unwrap();
    assert!(!manager.is_loaded("a"));

    let report = manager.load_all();
    assert_eq!(report.loaded, vec!["a"]);
    let known = manager.descriptor("a").unwrap();
    assert_ne!(known.location(), registered.location());
    assert_eq!(manager.descriptors().len(), 1);
}

#[test]
fn test_factory_resolved_dependency_becomes_required_edge() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![descriptor_json("store", STORAGE, &[]), descriptor_json("cache", CACHE, &[])],
    );

    let report = manager.load_all();
    assert!(report.is_clean(), "{:?}", report.diagnostics);
    let cache = manager.plugin_as::<Cache>("cache").unwrap();
    assert_eq!(cache.storage.label, "store");
    assert_eq!(manager.wiring("cache").unwrap().required_dependencies, vec!["store".to_string()]);

    assert!(matches!(
        manager.unload_package("store", false),
        Err(PluginSystemError::BlockedUnload { .. })
    ));
    manager.unload_package("store", true).unwrap();
    assert!(!manager.is_loaded("cache"));
}

#[test]
fn test_no_viable_factory_in_batch() {
    let journal = journal();
    let manager = manager_for(recorder_catalog(&journal), vec![descriptor_json("cache", CACHE, &[])]);
    let report = manager.load_all();
    assert!(report.has_diagnostic("cache", "NoViableFactory"));

    let journal = self::journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            descriptor_json("store-1", STORAGE, &[]),
            descriptor_json("store-2", STORAGE, &[]),
            descriptor_json("cache", CACHE, &[]),
        ],
    );
    let report = manager.load_all();
    assert_eq!(report.loaded, vec!["store-1", "store-2"]);
    let message = report.diagnostics_for("cache")[0].error.to_string();
    assert!(message.contains("2 candidates"), "{message}");
}

#[test]
fn test_first_viable_signature_wins() {
    let catalog = PluginCatalog::new().with(storage_type()).with(
        PluginType::new("test.Flexible")
            .factory_with(|_ctx, storage: std::sync::Arc<Storage>| {
                Ok(Storage {
                    label: format!("backed-by-{}", storage.label),
                })
            })
            .factory(|_ctx| {
                Ok(Storage {
                    label: "standalone".to_string(),
                })
            }),
    );

    let manager = manager_for(catalog.clone(), vec![descriptor_json("flex", "test.Flexible", &[])]);
    manager.load_all();
    assert_eq!(manager.plugin_as::<Storage>("flex").unwrap().label, "standalone");

    let manager = manager_for(
        catalog,
        vec![descriptor_json("base", STORAGE, &[]), descriptor_json("flex", "test.Flexible", &[])],
    );
    manager.load_all();
    assert_eq!(manager.plugin_as::<Storage>("flex").unwrap().label, "backed-by-base");
}

#[test]
fn test_targeted_load_reports_missing_capability() {
    let journal = journal();
    let manager = manager_for(recorder_catalog(&journal), Vec::new());
    manager
        .register_descriptor(
            crate::plugin_system::descriptor::DescriptorBuilder::new("cache", CACHE)
                .build()
                .unwrap(),
        )
        .unwrap();

    match manager.load_package("cache", true) {
        Err(PluginSystemError::MissingRequiredDependency { package_name, dependency }) => {
            assert_eq!(package_name, "cache");
            assert!(dependency.ends_with("Storage"), "{dependency}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_type_and_capability_queries() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![
            descriptor_json("s1", STORAGE, &[]),
            descriptor_json("rec", RECORDER, &[]),
            descriptor_json("s2", STORAGE, &[]),
        ],
    );
    manager.load_all();

    let storages = manager.plugins_of_type::<Storage>();
    let labels: Vec<&str> = storages.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["s1", "s2"]);
    assert_eq!(manager.plugin_of_type::<Storage>().unwrap().label, "s1");
    assert_eq!(manager.plugins_with_capability(&Capability::of::<Storage>()).len(), 2);
    assert!(manager.plugin_of_type::<Cache>().is_none());
    assert!(manager.plugin_as::<Cache>("s1").is_none());
}

#[test]
fn test_reload_all_creates_fresh_instances() {
    let journal = journal();
    let manager = manager_for(
        recorder_catalog(&journal),
        vec![descriptor_json("a", RECORDER, &[]), descriptor_json("b", RECORDER, &["a"])],
    );
    manager.load_all();
    let old_id = manager.plugin("a").unwrap().id();
    clear(&journal);

    let report = manager.reload_all();
    assert_eq!(report.loaded, vec!["a", "b"]);
    assert_ne!(manager.plugin("a").unwrap().id(), old_id);
    assert_eq!(
        entries_with_prefix(&journal, "unload:"),
        vec!["unload:b", "unload:a"]
    );
    assert_eq!(entries_with_prefix(&journal, "load:"), vec!["load:a", "load:b"]);
}
