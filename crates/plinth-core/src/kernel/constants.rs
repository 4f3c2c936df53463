/// Application name
pub const APP_NAME: &str = "Plinth";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default plugins directory
pub const DEFAULT_PLUGINS_DIR: &str = "plugins";

/// Default directory of external libraries shared by every plugin
pub const DEFAULT_LIBS_DIR: &str = "libs";

/// File extensions treated as plugin archives by default
pub const DEFAULT_ARCHIVE_EXTENSIONS: &[&str] = &["zip", "jar"];

/// File extensions picked up from the libraries directory by default
pub const DEFAULT_LIBRARY_EXTENSIONS: &[&str] = &["jar", "zip", "so", "dylib", "dll"];

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "plinth.toml";
