//! `qevault` CLI: master key generation, key vault provisioning and a small
//! encrypted insert/query demo.

#![warn(clippy::pedantic, clippy::nursery)]

mod settings;
mod telemetry;
mod workflow;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qevault::prelude::ProvisionOutcome;
use qevault_kms_local::LocalKeyProvider;

use crate::settings::{LogFormat, Settings};
use crate::workflow::Workflow;

#[derive(Parser)]
#[command(name = "qevault")]
#[command(about = "Key vault and encrypted collection provisioning", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a local master key file
    Keygen {
        /// Where to write the key; an existing file is never overwritten
        #[arg(short, long, default_value = "./master.key")]
        output: PathBuf,
    },
    /// Create missing data keys and the encrypted collection
    Provision {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Find or create a single data key by alt-name
    ResolveKey {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Alt-name of the data key
        #[arg(long)]
        alt_name: String,
    },
    /// Provision, insert a sample document and query it back by email
    Demo {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output } => {
            telemetry::init("info", LogFormat::Text)?;
            LocalKeyProvider::init(&output)
                .with_context(|| format!("failed to write master key to {}", output.display()))?;
            println!("Master key written to {}", output.display());
        }
        Commands::Provision { config } => {
            let workflow = open(&config).await?;
            let (map, outcome) = workflow.provision().await?;
            match outcome {
                ProvisionOutcome::Created => {
                    println!("Encrypted collection {} created.", map.namespace());
                }
                ProvisionOutcome::AlreadyExists => {
                    println!("Encrypted collection {} already exists.", map.namespace());
                }
            }
            println!("{}", serde_json::to_string_pretty(&map.to_document()?)?);
        }
        Commands::ResolveKey { config, alt_name } => {
            let workflow = open(&config).await?;
            let resolved = workflow.resolve_key(&alt_name).await?;
            println!("{} {} ({:?})", resolved.alt_name, resolved.key_id, resolved.outcome);
        }
        Commands::Demo { config } => {
            let workflow = open(&config).await?;
            let report = workflow.demo().await?;
            println!("Inserted memory document with _id: {}", report.inserted_id);
            println!("\nQueried document by encrypted field (decrypted):");
            println!("{}", serde_json::to_string_pretty(&report.decrypted)?);
            println!("\nStored document (raw):");
            println!("{}", serde_json::to_string_pretty(&report.raw)?);
        }
    }
    Ok(())
}

async fn open(config: &Path) -> Result<Workflow> {
    let settings = Settings::load(config)?;
    telemetry::init(&settings.log_level, settings.log_format)?;
    Workflow::open(settings).await
}
