use std::path::Path;
use std::sync::Arc;

use plinth_core::plugin_system::{BatchReport, Diagnostic, PluginCatalog, PluginDescriptor, PluginManager, Resolution};

/// Print discovered descriptors, one block per plugin.
pub fn print_descriptors(plugins_dir: &Path, descriptors: &[Arc<PluginDescriptor>]) {
    println!("Discovered {} plugin(s) in '{}':", descriptors.len(), plugins_dir.display());
    for descriptor in descriptors {
        println!(
            "  - {} ({}) at {}",
            descriptor.package_name(),
            descriptor.entry_point(),
            descriptor.location()
        );
        if !descriptor.dependencies().is_empty() {
            println!("      depends on: {}", descriptor.dependencies().join(", "));
        }
        if !descriptor.uses_default_domain() {
            println!("      domain: {}", descriptor.domain());
        }
        if !descriptor.enabled_by_default() {
            println!("      disabled by default");
        }
    }
}

pub fn print_diagnostics<'a>(diagnostics: impl Iterator<Item = &'a Diagnostic>) {
    let diagnostics: Vec<&Diagnostic> = diagnostics.collect();
    if diagnostics.is_empty() {
        return;
    }
    println!("Diagnostics:");
    for diagnostic in diagnostics {
        println!("  - {}", diagnostic);
    }
}

pub fn print_resolution(resolution: &Resolution) {
    println!("Load order:");
    for (index, descriptor) in resolution.ordered.iter().enumerate() {
        println!("  {}. {}", index + 1, descriptor.package_name());
    }
    if !resolution.is_complete() {
        println!("Unresolved:");
        for unresolved in &resolution.unresolved {
            println!("  - {}: {}", unresolved.descriptor.package_name(), unresolved.error);
        }
    }
}

/// Print what a batch loaded, with each plugin's dependency edges.
pub fn print_report(manager: &PluginManager, report: &BatchReport) {
    println!("Loaded {} plugin(s):", report.loaded.len());
    for package_name in &report.loaded {
        let Some(plugin) = manager.plugin(package_name) else {
            continue;
        };
        println!("  - {} {}", package_name, plugin.id());
        if let Some(wiring) = manager.wiring(package_name) {
            if !wiring.required_dependencies.is_empty() {
                println!("      requires: {}", wiring.required_dependencies.join(", "));
            }
            if !wiring.optional_dependencies.is_empty() {
                println!("      uses: {}", wiring.optional_dependencies.join(", "));
            }
        }
    }
    if !report.disabled.is_empty() {
        println!("Disabled: {}", report.disabled.join(", "));
    }
    print_diagnostics(report.diagnostics.iter());
}

pub fn loaded_names(manager: &PluginManager) -> Vec<String> {
    manager
        .plugins()
        .iter()
        .map(|plugin| plugin.package_name().to_string())
        .collect()
}

pub fn print_types(catalog: &PluginCatalog) {
    println!("Known plugin types:");
    for entry_point in catalog.entry_points() {
        println!("  - {}", entry_point);
    }
}
