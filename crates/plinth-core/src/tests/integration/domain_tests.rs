#![cfg(test)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use crate::plugin_system::descriptor::{ArtifactLocation, DEFAULT_DOMAIN, DescriptorBuilder};
use crate::plugin_system::PluginSystemError;
use crate::plugin_system::domain::{DerivedDomain, DomainProvider, IsolationDomain};
use crate::plugin_system::factory::{PluginCatalog, PluginType};
use crate::plugin_system::traits::Plugin;
use crate::tests::integration::common::{RECORDER, descriptor_json, journal, manager_for, recorder_type};

const SANDBOX_PROVIDER: &str = "test.SandboxProvider";
const SANDBOX_ONLY: &str = "sandbox.Only";

/// Contributes the "sandbox" domain and counts how often it gets built
struct SandboxProvider {
    builds: Arc<AtomicUsize>,
}

impl Plugin for SandboxProvider {
    fn domain_providers(&self) -> Vec<DomainProvider> {
        let builds = Arc::clone(&self.builds);
        vec![DomainProvider::new("sandbox", move |parent, locations| {
            builds.fetch_add(1, Ordering::SeqCst);
            let domain: Arc<dyn IsolationDomain> = Arc::new(
                DerivedDomain::new("sandbox", Arc::clone(parent), locations.to_vec())
                    .with_type(PluginType::new(SANDBOX_ONLY).factory(|_| Ok(Sandboxed))),
            );
            Ok(domain)
        })]
    }
}

struct Sandboxed;
impl Plugin for Sandboxed {}

fn catalog(builds: &Arc<AtomicUsize>) -> PluginCatalog {
    let builds = Arc::clone(builds);
    PluginCatalog::new()
        .with(recorder_type(RECORDER, &journal()))
        .with(PluginType::new(SANDBOX_PROVIDER).factory(move |_| {
            Ok(SandboxProvider {
                builds: Arc::clone(&builds),
            })
        }))
}

fn sandboxed(package_name: &str, entry_point: &str) -> serde_json::Value {
    json!({
        "packageName": package_name,
        "baseClass": entry_point,
        "classLoader": "sandbox",
        "dependsOn": ["provider"],
    })
}

#[test]
fn test_custom_domain_is_built_once_and_shared() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(
        catalog(&builds),
        vec![
            descriptor_json("provider", SANDBOX_PROVIDER, &[]),
            sandboxed("inside-1", RECORDER),
            sandboxed("inside-2", SANDBOX_ONLY),
            descriptor_json("outside", RECORDER, &[]),
        ],
    );

    let report = manager.load_all();
    assert!(report.is_clean(), "{:?}", report.diagnostics);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(manager.custom_domain_keys(), vec!["sandbox".to_string()]);
    assert_eq!(manager.domain_factory_keys(), vec!["sandbox".to_string()]);

    let first = manager.domain_of(&manager.plugin("inside-1").unwrap()).unwrap();
    let second = manager.domain_of(&manager.plugin("inside-2").unwrap()).unwrap();
    assert_eq!(first.key(), "sandbox");
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &manager.domain("sandbox").unwrap()));
    assert_eq!(manager.domain_of(&manager.plugin("outside").unwrap()).unwrap().key(), DEFAULT_DOMAIN);

    let default = manager.default_domain().unwrap();
    assert_eq!(first.locations(), default.locations());
    assert!(manager.plugin_as::<Sandboxed>("inside-2").is_some());
}

#[test]
fn test_unknown_domain_factory_skips_only_that_plugin() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(
        catalog(&builds),
        vec![
            json!({ "packageName": "lost", "baseClass": RECORDER, "classLoader": "nowhere" }),
            descriptor_json("fine", RECORDER, &[]),
        ],
    );

    let report = manager.load_all();
    assert_eq!(report.loaded, vec!["fine"]);
    assert!(report.has_diagnostic("lost", "UnknownDomainFactory"));
    assert_eq!(builds.load(Ordering::SeqCst), 0);
}

#[test]
fn test_domain_only_types_are_invisible_in_the_default_domain() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(
        catalog(&builds),
        vec![descriptor_json("provider", SANDBOX_PROVIDER, &[]), descriptor_json("misplaced", SANDBOX_ONLY, &[])],
    );
    let report = manager.load_all();
    assert!(report.has_diagnostic("misplaced", "UnknownEntryPoint"));
}

#[test]
fn test_each_batch_rebuilds_custom_domains() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(
        catalog(&builds),
        vec![descriptor_json("provider", SANDBOX_PROVIDER, &[]), sandboxed("inside", RECORDER)],
    );
    manager.load_all();
    let before = manager.domain("sandbox").unwrap();

    manager.reload_all();
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(&before, &manager.domain("sandbox").unwrap()));
}

#[test]
fn test_unload_all_forgets_domains() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(
        catalog(&builds),
        vec![descriptor_json("provider", SANDBOX_PROVIDER, &[]), sandboxed("inside", RECORDER)],
    );
    manager.load_all();
    manager.unload_all();
    assert!(manager.custom_domain_keys().is_empty());
    assert!(manager.domain_factory_keys().is_empty());
    assert!(manager.is_empty());
}

#[test]
fn test_unloading_provider_retires_its_domain_factory() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(
        catalog(&builds),
        vec![descriptor_json("provider", SANDBOX_PROVIDER, &[]), sandboxed("inside", RECORDER)],
    );
    assert!(manager.load_all().is_clean());

    manager.unload_package("provider", true).unwrap();
    assert!(manager.plugin("inside").is_none());
    assert!(manager.domain_factory_keys().is_empty());
    assert!(manager.custom_domain_keys().is_empty());
    assert!(manager.domain("sandbox").is_none());

    let late = manager
        .register_descriptor(DescriptorBuilder::new("late", RECORDER).domain("sandbox").build().unwrap())
        .unwrap();
    match manager.load(&late, false) {
        Err(PluginSystemError::UnknownDomainFactory { package_name, domain }) => {
            assert_eq!(package_name, "late");
            assert_eq!(domain, "sandbox");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    manager.load_package("provider", false).unwrap();
    assert_eq!(manager.domain_factory_keys(), vec!["sandbox".to_string()]);
    let late = manager.load(&late, false).unwrap();
    assert_eq!(manager.domain_of(&late).unwrap().key(), "sandbox");
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[test]
fn test_default_domain_sees_descriptors_registered_after_it_was_built() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(catalog(&builds), vec![]);
    let first = manager
        .register_descriptor(DescriptorBuilder::new("first", RECORDER).location("memory:first").build().unwrap())
        .unwrap();
    manager.load(&first, false).unwrap();

    let second = manager
        .register_descriptor(DescriptorBuilder::new("second", RECORDER).location("memory:second").build().unwrap())
        .unwrap();
    let second = manager.load(&second, false).unwrap();

    let default = manager.default_domain().unwrap();
    assert!(default.can_see(&ArtifactLocation::from("memory:first")));
    assert!(default.can_see(&ArtifactLocation::from("memory:second")));
    assert!(manager.domain_of(&second).unwrap().can_see(&ArtifactLocation::from("memory:second")));
}

#[test]
fn test_default_domain_of_a_batch_grows_with_targeted_loads() {
    let builds = Arc::new(AtomicUsize::new(0));
    let manager = manager_for(catalog(&builds), vec![descriptor_json("batched", RECORDER, &[])]);
    assert!(manager.load_all().is_clean());

    let extra = Arc::new(DescriptorBuilder::new("extra", RECORDER).location("memory:extra").build().unwrap());
    manager.load(&extra, false).unwrap();

    let default = manager.default_domain().unwrap();
    assert!(default.can_see(&ArtifactLocation::from("memory:extra")));
    assert!(default.can_see(manager.plugin("batched").unwrap().descriptor().location()));
}
