use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use appdeck_sudo::{serve, SudoServer};

mod commands;
mod config;

use config::InstallerConfig;

#[derive(Parser, Debug)]
#[command(name = "appdeck")]
#[command(about = "Package lifecycle manager for sandboxed applications", long_about = None)]
struct Cli {
    #[arg(long, default_value = "/etc/appdeck/config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download and install a package
    Install {
        url: String,
        #[arg(long)]
        location: Option<String>,
        /// Acknowledge the package without prompting
        #[arg(long)]
        yes: bool,
    },
    /// Remove an installed application
    Remove {
        application_id: String,
        #[arg(long)]
        keep_documents: bool,
        #[arg(long)]
        force: bool,
    },
    /// List installed applications
    List,
    /// Show the configured installation locations
    Locations,
    /// Mount the image of an application on removable media
    Activate { application_id: String },
    /// Unmount the image of an application on removable media
    Deactivate { application_id: String },
    /// Repair the managed directories after a crash
    Reconcile,
    // The privileged side of the process pair; spawned internally with its
    // stdio as the command channel, never run by hand.
    #[command(hide = true)]
    SudoHelper {
        #[arg(long)]
        allowed_root: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::SudoHelper { allowed_root } = cli.command {
        let server = SudoServer::new(allowed_root);
        let stdin = io::stdin();
        let stdout = io::stdout();
        return serve(&server, stdin.lock(), stdout.lock());
    }

    let config = InstallerConfig::load(&cli.config)?;
    let app = commands::bootstrap(&config)?;

    match cli.command {
        Commands::Install { url, location, yes } => {
            commands::install(&app, &url, location.as_deref(), yes)?;
        }
        Commands::Remove {
            application_id,
            keep_documents,
            force,
        } => {
            commands::remove(&app, &application_id, keep_documents, force)?;
        }
        Commands::List => {
            commands::list(&app);
        }
        Commands::Locations => {
            commands::locations(&app)?;
        }
        Commands::Activate { application_id } => {
            commands::activate(&app, &application_id, true)?;
        }
        Commands::Deactivate { application_id } => {
            commands::activate(&app, &application_id, false)?;
        }
        Commands::Reconcile => {
            // bootstrap() already ran the reconciler.
            println!("reconciliation complete");
        }
        Commands::SudoHelper { .. } => unreachable!(),
    }

    Ok(())
}
