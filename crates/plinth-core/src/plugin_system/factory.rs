//! Plugin types and their factory signatures.
//!
//! A [`PluginType`] is registered in a [`PluginCatalog`] under the entry-point
//! string descriptors refer to. It lists one or more [`FactorySignature`]s,
//! each declaring the capabilities it needs as required dependencies. The
//! manager picks the first signature whose every capability is provided by
//! exactly one loaded plugin.
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::plugin_system::registry::LoadedPlugin;
use crate::plugin_system::traits::{Plugin, PluginContext, PluginError};

/// Something a plugin can be asked for by type.
///
/// Every plugin provides the capability of its own concrete type; further
/// capabilities (typically marker types or `dyn Trait`) are declared through
/// [`Plugin::capabilities`].
#[derive(Clone, Copy)]
pub struct Capability {
    id: TypeId,
    name: &'static str,
}

impl Capability {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Capability {}

impl Hash for Capability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({})", self.name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Downcast a shared plugin to its concrete type.
pub fn downcast_plugin<T: Plugin>(plugin: Arc<dyn Plugin>) -> Option<Arc<T>> {
    let any: Arc<dyn Any + Send + Sync> = plugin;
    any.downcast::<T>().ok()
}

/// Required dependencies resolved for one factory call, in signature order.
#[derive(Clone, Default)]
pub struct RequiredDependencies {
    resolved: Vec<(Capability, LoadedPlugin)>,
}

impl RequiredDependencies {
    pub(crate) fn new(resolved: Vec<(Capability, LoadedPlugin)>) -> Self {
        Self { resolved }
    }

    /// The provider of the concrete type `T`, downcast
    pub fn get<T: Plugin>(&self) -> Option<Arc<T>> {
        self.provider(&Capability::of::<T>())
            .and_then(|plugin| plugin.downcast::<T>())
    }

    /// The provider resolved for `capability`
    pub fn provider(&self, capability: &Capability) -> Option<&LoadedPlugin> {
        self.resolved
            .iter()
            .find(|(cap, _)| cap == capability)
            .map(|(_, plugin)| plugin)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedPlugin> {
        self.resolved.iter().map(|(_, plugin)| plugin)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

type Constructor =
    dyn Fn(PluginContext, RequiredDependencies) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync;

/// One way of constructing a plugin type
#[derive(Clone)]
pub struct FactorySignature {
    requires: Vec<Capability>,
    constructor: Arc<Constructor>,
}

impl FactorySignature {
    pub fn new<F>(requires: Vec<Capability>, constructor: F) -> Self
    where
        F: Fn(PluginContext, RequiredDependencies) -> Result<Arc<dyn Plugin>, PluginError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            requires,
            constructor: Arc::new(constructor),
        }
    }

    /// Capabilities that must each have exactly one loaded provider
    pub fn requires(&self) -> &[Capability] {
        &self.requires
    }

    pub(crate) fn construct(
        &self,
        context: PluginContext,
        dependencies: RequiredDependencies,
    ) -> Result<Arc<dyn Plugin>, PluginError> {
        (self.constructor)(context, dependencies)
    }
}

impl fmt::Debug for FactorySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactorySignature")
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

fn missing<D>() -> PluginError {
    PluginError::DependencyError(format!("required dependency {} was not supplied", type_name::<D>()))
}

/// A loadable plugin type: its factory signatures and declared optional slots
#[derive(Debug, Clone)]
pub struct PluginType {
    entry_point: String,
    factories: Vec<FactorySignature>,
    optional_slots: Vec<String>,
}

impl PluginType {
    pub fn new(entry_point: &str) -> Self {
        Self {
            entry_point: entry_point.to_string(),
            factories: Vec::new(),
            optional_slots: Vec::new(),
        }
    }

    /// Add a factory with no required dependencies.
    pub fn factory<P, F>(self, factory: F) -> Self
    where
        P: Plugin,
        F: Fn(PluginContext) -> Result<P, PluginError> + Send + Sync + 'static,
    {
        self.signature(FactorySignature::new(Vec::new(), move |ctx, _deps| {
            let plugin: Arc<dyn Plugin> = Arc::new(factory(ctx)?);
            Ok(plugin)
        }))
    }

    /// Add a factory requiring one loaded plugin of type `D`.
    pub fn factory_with<P, D, F>(self, factory: F) -> Self
    where
        P: Plugin,
        D: Plugin,
        F: Fn(PluginContext, Arc<D>) -> Result<P, PluginError> + Send + Sync + 'static,
    {
        self.signature(FactorySignature::new(vec![Capability::of::<D>()], move |ctx, deps| {
            let dep = deps.get::<D>().ok_or_else(missing::<D>)?;
            let plugin: Arc<dyn Plugin> = Arc::new(factory(ctx, dep)?);
            Ok(plugin)
        }))
    }

    /// Add a factory requiring loaded plugins of types `D1` and `D2`.
    pub fn factory_with2<P, D1, D2, F>(self, factory: F) -> Self
    where
        P: Plugin,
        D1: Plugin,
        D2: Plugin,
        F: Fn(PluginContext, Arc<D1>, Arc<D2>) -> Result<P, PluginError> + Send + Sync + 'static,
    {
        let requires = vec![Capability::of::<D1>(), Capability::of::<D2>()];
        self.signature(FactorySignature::new(requires, move |ctx, deps| {
            let first = deps.get::<D1>().ok_or_else(missing::<D1>)?;
            let second = deps.get::<D2>().ok_or_else(missing::<D2>)?;
            let plugin: Arc<dyn Plugin> = Arc::new(factory(ctx, first, second)?);
            Ok(plugin)
        }))
    }

    /// Add an arbitrary factory signature.
    pub fn signature(mut self, signature: FactorySignature) -> Self {
        self.factories.push(signature);
        self
    }

    /// Declare an optional dependency slot for `package_name`.
    pub fn optional_dependency(mut self, package_name: &str) -> Self {
        if !self.optional_slots.iter().any(|s| s == package_name) {
            self.optional_slots.push(package_name.to_string());
        }
        self
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Factory signatures in declaration order
    pub fn factories(&self) -> &[FactorySignature] {
        &self.factories
    }

    pub fn optional_slots(&self) -> &[String] {
        &self.optional_slots
    }
}

/// Plugin types known to the host, keyed by entry point
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    types: HashMap<String, Arc<PluginType>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin_type`, replacing any type with the same entry point.
    pub fn register(&mut self, plugin_type: PluginType) -> &mut Self {
        let entry_point = plugin_type.entry_point().to_string();
        if self.types.insert(entry_point.clone(), Arc::new(plugin_type)).is_some() {
            log::warn!("Plugin type '{}' registered twice; keeping the later one", entry_point);
        }
        self
    }

    /// Builder-style variant of [`register`](Self::register)
    pub fn with(mut self, plugin_type: PluginType) -> Self {
        self.register(plugin_type);
        self
    }

    pub fn get(&self, entry_point: &str) -> Option<Arc<PluginType>> {
        self.types.get(entry_point).cloned()
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.types.contains_key(entry_point)
    }

    /// Registered entry points, sorted
    pub fn entry_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
