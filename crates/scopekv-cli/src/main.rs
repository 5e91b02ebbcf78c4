//! scopekv CLI - Command line access to scoped storage

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scopekv_service::{
    StorageScope, StorageService, StorageTarget, UserDataProfile, WorkspaceIdentifier,
};
use scopekv_storage::{HostConfig, Result, StorageHost};

#[derive(Parser)]
#[command(name = "scopekv")]
#[command(about = "Scoped persistent key-value storage", long_about = None)]
struct Cli {
    /// Storage root directory (overrides the config file)
    #[arg(long, env = "SCOPEKV_ROOT")]
    root: Option<PathBuf>,
    /// JSON host configuration file
    #[arg(long, env = "SCOPEKV_CONFIG")]
    config: Option<PathBuf>,
    /// Active profile id; the default profile when omitted
    #[arg(long, env = "SCOPEKV_PROFILE")]
    profile: Option<String>,
    /// Workspace id
    #[arg(long, env = "SCOPEKV_WORKSPACE", default_value = "default-workspace")]
    workspace: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a value
    Get {
        key: String,
        /// application, profile or workspace
        #[arg(short, long, default_value = "application")]
        scope: StorageScope,
    },
    /// Store a value
    Set {
        key: String,
        value: String,
        #[arg(short, long, default_value = "application")]
        scope: StorageScope,
        /// user or machine
        #[arg(short, long, default_value = "user")]
        target: StorageTarget,
    },
    /// Remove a value
    Delete {
        key: String,
        #[arg(short, long, default_value = "application")]
        scope: StorageScope,
    },
    /// List keys and values of a scope
    List {
        #[arg(short, long, default_value = "application")]
        scope: StorageScope,
        /// Only keys of this target
        #[arg(short, long)]
        target: Option<StorageTarget>,
    },
    /// Delete everything in every scope
    Clear,
    /// Compact the database behind a scope
    Optimize {
        #[arg(short, long, default_value = "application")]
        scope: StorageScope,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref(), cli.root) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading config: {}", e);
            std::process::exit(1);
        }
    };

    let profile = match cli.profile {
        Some(id) if id != UserDataProfile::DEFAULT_ID => UserDataProfile::new(id),
        _ => UserDataProfile::default_profile(),
    };
    let service = StorageService::new(
        StorageHost::new(config),
        profile,
        WorkspaceIdentifier::new(cli.workspace),
    );

    match run(service, cli.command).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Run one command and close the service
///
/// `Ok(false)` means the command ran but found nothing.
async fn run(mut service: StorageService, command: Commands) -> Result<bool> {
    service.initialize().await?;

    let result = match command {
        Commands::Get { key, scope } => cmd_get(&service, &key, scope),
        Commands::Set {
            key,
            value,
            scope,
            target,
        } => service.store(&key, value, scope, target).map(|_| true),
        Commands::Delete { key, scope } => service.remove(&key, scope).map(|_| true),
        Commands::List { scope, target } => cmd_list(&service, scope, target).map(|_| true),
        Commands::Clear => service.clear().await.map(|_| true),
        Commands::Optimize { scope } => service.optimize(scope).await.map(|_| true),
    };

    // Closing flushes anything written above, even when the command failed
    let closed = service.close().await;
    result.and_then(|found| closed.map(|_| found))
}

fn load_config(path: Option<&PathBuf>, root: Option<PathBuf>) -> Result<HostConfig> {
    let mut config = match path {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::default(),
    };
    if let Some(root) = root {
        config.root = root;
    }
    Ok(config)
}

fn cmd_get(service: &StorageService, key: &str, scope: StorageScope) -> Result<bool> {
    match service.get(key, scope)? {
        Some(value) => {
            println!("{}", value);
            Ok(true)
        }
        None => {
            eprintln!("{} is not set in {} storage", key, scope);
            Ok(false)
        }
    }
}

fn cmd_list(
    service: &StorageService,
    scope: StorageScope,
    target: Option<StorageTarget>,
) -> Result<()> {
    let targets = match target {
        Some(target) => vec![target],
        None => vec![StorageTarget::User, StorageTarget::Machine],
    };

    for target in targets {
        for key in service.keys(scope, target)? {
            let value = service.get(&key, scope)?.unwrap_or_default();
            println!("{}\t{}\t{}", target, key, value);
        }
    }
    Ok(())
}
