#![cfg(test)]

use std::sync::Arc;

use crate::plugin_system::descriptor::DescriptorBuilder;
use crate::plugin_system::factory::PluginCatalog;
use crate::plugin_system::manager::PluginManager;
use crate::tests::integration::common::{
    Journal, RECORDER, Recorder, clear, descriptor_json, entries, entries_with_prefix, journal, manager_for,
    recorder_type,
};

const CONSUMER: &str = "test.Consumer";

fn catalog(journal: &Journal) -> PluginCatalog {
    PluginCatalog::new()
        .with(recorder_type(RECORDER, journal))
        .with(recorder_type(CONSUMER, journal).optional_dependency("metrics"))
}

fn batch(journal: &Journal, consumer_first: bool) -> PluginManager {
    let consumer = descriptor_json("consumer", CONSUMER, &[]);
    let metrics = descriptor_json("metrics", RECORDER, &[]);
    let descriptors = if consumer_first { vec![consumer, metrics] } else { vec![metrics, consumer] };
    let manager = manager_for(catalog(journal), descriptors);
    manager.load_all();
    manager
}

#[test]
fn test_binding_does_not_depend_on_load_order() {
    let first_journal = journal();
    let consumer_first = batch(&first_journal, true);
    let second_journal = journal();
    let provider_first = batch(&second_journal, false);

    for (manager, journal) in [(&consumer_first, &first_journal), (&provider_first, &second_journal)] {
        let wiring = manager.wiring("consumer").unwrap();
        assert_eq!(wiring.optional_dependencies, vec!["metrics".to_string()]);
        assert!(wiring.required_dependencies.is_empty());
        assert_eq!(
            manager.wiring("metrics").unwrap().optional_dependents,
            vec!["consumer".to_string()]
        );
        assert_eq!(entries_with_prefix(journal, "bind:"), vec!["bind:consumer<-metrics"]);
    }
}

#[test]
fn test_binding_happens_before_batch_completion_callbacks() {
    let journal = journal();
    batch(&journal, true);
    let log = entries(&journal);
    let bound = log.iter().position(|e| e == "bind:consumer<-metrics").unwrap();
    let first_ready = log.iter().position(|e| e.starts_with("ready:")).unwrap();
    assert!(bound < first_ready, "{log:?}");
}

#[test]
fn test_bound_dependency_is_reachable_from_the_consumer() {
    let journal = journal();
    let manager = batch(&journal, true);
    let consumer = manager.plugin_as::<Recorder>("consumer").unwrap();

    let metrics = consumer.context().optional_dependency("metrics").unwrap();
    assert_eq!(metrics.package_name(), "metrics");
    assert!(consumer.context().optional_dependency_as::<Recorder>("metrics").is_some());
    assert!(consumer.context().optional_slots().is_bound("metrics"));
}

#[test]
fn test_unloading_provider_only_unbinds_consumer() {
    let journal = journal();
    let manager = batch(&journal, false);
    let consumer = manager.plugin_as::<Recorder>("consumer").unwrap();
    clear(&journal);

    manager.unload_package("metrics", false).unwrap();
    assert_eq!(entries(&journal), vec!["unbind:consumer<-metrics", "unload:metrics"]);
    assert!(manager.is_loaded("consumer"));
    assert!(consumer.context().optional_dependency("metrics").is_none());
    assert!(manager.wiring("consumer").unwrap().optional_dependencies.is_empty());

    // Loading it again fills the slot again.
    clear(&journal);
    manager.load_package("metrics", false).unwrap();
    assert_eq!(entries(&journal), vec!["bind:consumer<-metrics", "load:metrics"]);
    assert!(consumer.context().optional_dependency("metrics").is_some());
}

#[test]
fn test_unloading_consumer_clears_provider_edge() {
    let journal = journal();
    let manager = batch(&journal, true);
    manager.unload_package("consumer", false).unwrap();
    assert!(manager.wiring("metrics").unwrap().optional_dependents.is_empty());
}

#[test]
fn test_targeted_loads_bind_in_either_order() {
    let journal = journal();
    let manager = manager_for(catalog(&journal), Vec::new());
    let consumer = Arc::new(DescriptorBuilder::new("consumer", CONSUMER).build().unwrap());
    let metrics = Arc::new(DescriptorBuilder::new("metrics", RECORDER).build().unwrap());

    manager.load(&consumer, false).unwrap();
    manager.load(&metrics, false).unwrap();
    assert_eq!(manager.wiring("consumer").unwrap().optional_dependencies, vec!["metrics".to_string()]);

    let journal = self::journal();
    let manager = manager_for(catalog(&journal), Vec::new());
    manager.load(&metrics, false).unwrap();
    manager.load(&consumer, false).unwrap();
    assert_eq!(manager.wiring("consumer").unwrap().optional_dependencies, vec!["metrics".to_string()]);
    assert_eq!(entries(&journal), vec!["load:metrics", "load:consumer", "bind:consumer<-metrics"]);
}

#[test]
fn test_slot_naming_itself_stays_empty() {
    let journal = journal();
    let catalog = PluginCatalog::new().with(recorder_type("test.Narcissus", &journal).optional_dependency("self-ref"));
    let manager = manager_for(catalog, vec![descriptor_json("self-ref", "test.Narcissus", &[])]);
    manager.load_all();

    assert!(entries_with_prefix(&journal, "bind:").is_empty());
    assert!(manager.wiring("self-ref").unwrap().optional_dependencies.is_empty());
}

#[test]
fn test_missing_optional_dependency_is_not_an_error() {
    let journal = journal();
    let manager = manager_for(catalog(&journal), vec![descriptor_json("consumer", CONSUMER, &[])]);
    let report = manager.load_all();
    assert!(report.is_clean());
    let consumer = manager.plugin_as::<Recorder>("consumer").unwrap();
    assert_eq!(consumer.context().optional_slots().unbound(), vec!["metrics".to_string()]);
}
