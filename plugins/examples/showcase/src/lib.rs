//! Plugin types the `plinth` binary registers with its catalog.
//!
//! They are small on purpose but cover every wiring feature of the loader:
//! a required dependency resolved by type, an optional dependency slot, and
//! a custom isolation domain contributed by a loaded plugin.
use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use plinth_core::plugin_system::{
    DerivedDomain, DomainProvider, IsolationDomain, LoadedPlugin, Plugin, PluginCatalog, PluginContext,
    PluginDescriptor, PluginType,
};

pub const CONSOLE_LOGGER: &str = "plinth.showcase.ConsoleLogger";
pub const GREETER: &str = "plinth.showcase.Greeter";
pub const METRICS_COLLECTOR: &str = "plinth.showcase.MetricsCollector";
pub const ECHO: &str = "plinth.showcase.Echo";

/// Package name the greeter's optional metrics slot is bound to
pub const METRICS_PACKAGE: &str = "metrics";

/// Key of the isolation domain contributed by [`MetricsCollector`]
pub const SANDBOX_DOMAIN: &str = "sandboxed";

/// Every plugin type of this crate except [`ECHO`], which only resolves
/// inside the sandboxed domain.
pub fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with(PluginType::new(CONSOLE_LOGGER).factory(|ctx| Ok(ConsoleLogger::new(ctx))))
        .with(
            PluginType::new(GREETER)
                .factory_with(|ctx, logger: Arc<ConsoleLogger>| Ok(Greeter::new(ctx, logger)))
                .optional_dependency(METRICS_PACKAGE),
        )
        .with(PluginType::new(METRICS_COLLECTOR).factory(|_ctx| Ok(MetricsCollector::default())))
}

fn echo_type() -> PluginType {
    PluginType::new(ECHO).factory(|ctx| Ok(Echo { context: ctx }))
}

// ===== CONSOLE LOGGER =====

/// Writes lines through the `log` facade and keeps them for later inspection
pub struct ConsoleLogger {
    context: PluginContext,
    lines: Mutex<Vec<String>>,
}

impl ConsoleLogger {
    fn new(context: PluginContext) -> Self {
        Self {
            context,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self, line: &str) {
        info!("[{}] {}", self.context.package_name(), line);
        self.lines.lock().push(line.to_string());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl Plugin for ConsoleLogger {
    fn on_load(&self) {
        self.log("console logger ready");
    }
}

// ===== GREETER =====

/// Greets through the console logger and counts greetings when metrics are around
pub struct Greeter {
    context: PluginContext,
    logger: Arc<ConsoleLogger>,
}

impl Greeter {
    fn new(context: PluginContext, logger: Arc<ConsoleLogger>) -> Self {
        Self { context, logger }
    }

    pub fn greet(&self, name: &str) -> String {
        let greeting = format!("Hello, {}!", name);
        self.logger.log(&greeting);
        if let Some(metrics) = self.metrics() {
            metrics.increment("greetings");
        }
        greeting
    }

    /// The metrics collector bound to the optional slot, if one is loaded
    pub fn metrics(&self) -> Option<Arc<MetricsCollector>> {
        self.context.optional_dependency_as::<MetricsCollector>(METRICS_PACKAGE)
    }
}

impl Plugin for Greeter {
    fn on_load(&self) {
        self.logger.log("greeter ready");
    }

    fn on_dependency_loaded(&self, dependency: &LoadedPlugin) {
        self.logger
            .log(&format!("metrics available from '{}'", dependency.package_name()));
    }

    fn on_dependency_unloaded(&self, descriptor: &PluginDescriptor) {
        self.logger
            .log(&format!("metrics from '{}' went away", descriptor.package_name()));
    }
}

// ===== METRICS =====

/// Named counters. Also contributes the sandboxed isolation domain.
#[derive(Default)]
pub struct MetricsCollector {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl MetricsCollector {
    pub fn increment(&self, counter: &str) -> u64 {
        let mut counters = self.counters.lock();
        let value = counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        *value
    }

    pub fn count(&self, counter: &str) -> u64 {
        self.counters.lock().get(counter).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl Plugin for MetricsCollector {
    fn domain_providers(&self) -> Vec<DomainProvider> {
        // Sealed: only the echo type resolves in here.
        vec![DomainProvider::new(SANDBOX_DOMAIN, |parent, locations| {
            let domain: Arc<dyn IsolationDomain> = Arc::new(
                DerivedDomain::new(SANDBOX_DOMAIN, Arc::clone(parent), locations.to_vec())
                    .with_type(echo_type())
                    .sealed(),
            );
            Ok(domain)
        })]
    }
}

// ===== ECHO =====

/// Reports which domain it was loaded through
pub struct Echo {
    context: PluginContext,
}

impl Echo {
    pub fn domain_key(&self) -> &str {
        self.context.domain().key()
    }
}

impl Plugin for Echo {
    fn on_load(&self) {
        info!("Echo '{}' loaded in domain '{}'", self.context.package_name(), self.domain_key());
    }
}
