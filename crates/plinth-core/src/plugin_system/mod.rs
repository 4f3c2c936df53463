//! # Plinth Core Plugin System
//!
//! Runtime discovery, dependency resolution, instantiation and wiring of
//! plugins, plus their load/unload lifecycle.
//!
//! ## Key Submodules and Responsibilities:
//!
//! - **[`descriptor`]**: Validated plugin metadata ([`PluginDescriptor`]) and
//!   artifact locations.
//! - **[`loader`]**: Discovery of plugin archives ([`ArchiveSource`]) and
//!   descriptor parsing ([`MetadataParser`]).
//! - **[`dependency`]**: Topological ordering of descriptors and diagnosis of
//!   missing or circular dependencies.
//! - **[`factory`]**: Plugin types, their factory signatures and the
//!   [`PluginCatalog`] the host registers them in.
//! - **[`domain`]**: Isolation domains, the default one and the custom ones
//!   contributed by loaded plugins.
//! - **[`registry`]**: Loaded plugins and the edges between them.
//! - **[`traits`]**: The [`Plugin`] trait and the [`PluginContext`] each
//!   plugin is constructed with.
//! - **[`manager`]**: The [`PluginManager`] orchestrating all of the above.
//! - **[`error`]**: [`PluginSystemError`] and the per-plugin [`Diagnostic`].
pub mod dependency;
pub mod descriptor;
pub mod domain;
pub mod error;
pub mod factory;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod traits;

pub use dependency::{DependencyError, DependencyResolver, Resolution};
pub use descriptor::{ArtifactLocation, DEFAULT_DOMAIN, DescriptorBuilder, PluginDescriptor};
pub use domain::{DerivedDomain, DomainProvider, IsolationDomain};
pub use error::{Diagnostic, PluginSystemError};
pub use factory::{Capability, FactorySignature, PluginCatalog, PluginType, RequiredDependencies};
pub use loader::{ArchiveSource, DirectoryArchiveSource, MetadataParser, RawArchive, StaticArchiveSource};
pub use manager::{BatchReport, ManagerHooks, PluginManager, PluginManagerBuilder, WeakPluginManager};
pub use registry::{LoadedPlugin, PluginId, PluginWiring};
pub use traits::{OptionalSlots, Plugin, PluginContext, PluginError};
