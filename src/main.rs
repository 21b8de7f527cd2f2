//! Serve a catalog of scientific datasets with per-client access control.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use datacat::import::Importer as _;
use datacat::privilege::PrivilegeSet;
use datacat::server::Server;
use tracing::{debug, error, info};

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

#[derive(Parser)]
#[command(
    version,
    about = "Catalog and access-control core for a scientific-data server."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a datacat config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the catalog until interrupted. SIGHUP reloads the configuration.
    Run,

    /// Validate the configuration and the dataset list, then exit.
    Check,

    /// Show what a client address may access.
    Access {
        /// Client address, e.g. 10.1.2.3.
        address: String,

        /// Explain a single path instead of listing the visible tree.
        #[arg(short, long)]
        path: Option<String>,
    },
}

fn check(config: &Config) -> Result<(), String> {
    let datasets = config
        .datasets
        .importer()
        .import(&[])
        .map_err(|e| e.to_string())?;
    println!(
        "Configuration OK: {} datasets, {} privilege sets, {} address ranges.",
        datasets.len(),
        config.privileges.sets.len(),
        config.privileges.ip_ranges.len()
    );
    Ok(())
}

/// Prints every path below `path` that `privileges` lets the client see.
fn print_tree(server: &Server, privileges: &PrivilegeSet, path: &str, depth: usize) {
    let Ok(children) = server.list_dir(privileges, path) else {
        return;
    };
    for child in children {
        let marker = if child.is_dir { "/" } else { "" };
        println!("{:indent$}{}{marker}", "", child.name, indent = depth * 2);
        if child.is_dir {
            print_tree(server, privileges, &child.name, depth + 1);
        }
    }
}

fn access(config: &Config, address: &str, path: Option<&str>) -> Result<(), String> {
    let services = daemon::Services::ephemeral(config).map_err(|e| e.to_string())?;
    let server = &services.server;
    let privileges = server.privilege_for(address);
    println!("{address} uses privilege set '{}'.", privileges.name());

    match path {
        Some(path) => {
            let verdict = match server.open(&privileges, path) {
                Ok(_) => "accessible",
                Err(_) if privileges.ever_allows(path) => "not found (partially allowed)",
                Err(_) => "not found",
            };
            println!("{path}: {verdict}");
        }
        None => print_tree(server, &privileges, "/", 0),
    }
    Ok(())
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    if let Err(e) = Trc::default().init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }
    debug!(git_sha = GIT_SHA, "Starting datacat.");

    let config = match Config::load_or_default(args.config_path.as_deref()) {
        Ok(config) => config,
        Err(app_config::ConfigError::ValidationErrors(messages)) => {
            error!("Configuration is invalid.");
            for msg in &messages {
                error!(" - {msg}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!(git_sha = GIT_SHA, "Starting datacat daemon.");
            daemon::spawn(config, args.config_path).map_err(|e| e.to_string())
        }
        Command::Check => check(&config),
        Command::Access { address, path } => access(&config, &address, path.as_deref()),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
