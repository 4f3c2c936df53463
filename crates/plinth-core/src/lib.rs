pub mod config;
pub mod kernel;
pub mod plugin_system;
pub mod utils;

// Re-export the types hosts and plugins use most
pub use config::ManagerConfig;
pub use kernel::error::Error as KernelError;
pub use plugin_system::{
    Capability, DescriptorBuilder, LoadedPlugin, Plugin, PluginCatalog, PluginContext, PluginDescriptor,
    PluginError, PluginManager, PluginType,
};
