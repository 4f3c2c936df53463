mod cli; // Report printing

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{debug, error, info};
use tracing_subscriber::EnvFilter;

use plinth_core::config::ManagerConfig;
use plinth_core::kernel;
use plinth_core::kernel::constants::{APP_NAME, APP_VERSION, CONFIG_FILE_NAME};
use plinth_core::plugin_system::loader::{DefaultMetadataParser, read_descriptors};
use plinth_core::plugin_system::{ArchiveSource, DependencyResolver, DirectoryArchiveSource, PluginManager};

/// Plinth: a runtime plugin loader
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Simple liveness check
    #[arg(long)]
    ping: bool,

    /// Configuration file (JSON, YAML or TOML); defaults to ./plinth.toml when present
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory scanned for plugin archives
    #[arg(long, value_name = "DIR")]
    plugins_dir: Option<PathBuf>,

    /// Directory of external libraries shared by every plugin
    #[arg(long, value_name = "DIR")]
    libs_dir: Option<PathBuf>,

    /// Use archives in place instead of staging private copies
    #[arg(long)]
    no_staging: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the plugin descriptors found in the plugins directory
    Scan,
    /// Print the order plugins would be loaded in
    Order,
    /// Load every plugin, report the outcome, then unload them again
    Load {
        /// Greet this name through a loaded greeter plugin
        #[arg(long, value_name = "NAME")]
        greet: Option<String>,

        /// Unload this package before shutting down
        #[arg(long, value_name = "PACKAGE")]
        unload: Option<String>,

        /// With --unload, also unload the plugins that require it
        #[arg(long, requires = "unload")]
        cascade: bool,
    },
    /// List the plugin types this binary knows how to construct
    Types,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {}", e);
        return;
    }
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records to tracing: {}", e);
    }
}

/// Configuration from `--config`, else `./plinth.toml` if present, else
/// defaults; command line directories override whatever was loaded.
fn resolve_config(args: &CliArgs) -> kernel::Result<ManagerConfig> {
    let mut config = match &args.config {
        Some(path) => ManagerConfig::load(path)?,
        None if Path::new(CONFIG_FILE_NAME).is_file() => {
            debug!("Using configuration file '{}'", CONFIG_FILE_NAME);
            ManagerConfig::load(Path::new(CONFIG_FILE_NAME))?
        }
        None => ManagerConfig::default(),
    };
    if let Some(dir) = &args.plugins_dir {
        config.plugins_dir = dir.clone();
    }
    if let Some(dir) = &args.libs_dir {
        config.libs_dir = Some(dir.clone());
    }
    if args.no_staging {
        config.stage_archives = false;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    if args.ping {
        println!("pong");
        return ExitCode::SUCCESS;
    }

    init_logging(args.verbose);
    info!("{} v{} starting", APP_NAME, APP_VERSION);

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to read configuration: {}", e);
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    let outcome = match args.command {
        Some(Commands::Scan) => {
            scan(&config);
            Ok(())
        }
        Some(Commands::Order) => {
            order(&config);
            Ok(())
        }
        Some(Commands::Types) => {
            cli::print_types(&plinth_showcase::catalog());
            Ok(())
        }
        Some(Commands::Load { greet, unload, cascade }) => load(config, greet.as_deref(), unload.as_deref(), cascade),
        None => load(config, None, None, false),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn scan(config: &ManagerConfig) {
    let discovery = DirectoryArchiveSource::from_config(config).with_staging(false).discover();
    let (descriptors, diagnostics) = read_descriptors(&discovery.archives, &DefaultMetadataParser, &HashSet::new());
    cli::print_descriptors(&config.plugins_dir, &descriptors);
    cli::print_diagnostics(discovery.diagnostics.iter().chain(diagnostics.iter()));
}

fn order(config: &ManagerConfig) {
    let discovery = DirectoryArchiveSource::from_config(config).with_staging(false).discover();
    let (descriptors, _) = read_descriptors(&discovery.archives, &DefaultMetadataParser, &HashSet::new());
    let resolution = DependencyResolver::new().resolve(&descriptors);
    cli::print_resolution(&resolution);
}

fn load(config: ManagerConfig, greet: Option<&str>, unload: Option<&str>, cascade: bool) -> kernel::Result<()> {
    let manager = PluginManager::new(plinth_showcase::catalog(), config);
    let report = manager.load_all();
    cli::print_report(&manager, &report);

    if let Some(name) = greet {
        match manager.plugin_of_type::<plinth_showcase::Greeter>() {
            Some(greeter) => println!("{}", greeter.greet(name)),
            None => eprintln!("No greeter plugin is loaded"),
        }
    }

    let unloaded = match unload {
        Some(package_name) => manager.unload_package(package_name, cascade).map(|()| {
            println!("Unloaded '{}'; still loaded: {}", package_name, cli::loaded_names(&manager).join(", "));
        }),
        None => Ok(()),
    };

    println!("Unloading plugins...");
    manager.unload_all();
    Ok(unloaded?)
}
