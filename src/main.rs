use std::{
    collections::HashSet,
    io::{Read, Write},
    path::PathBuf,
};

use ::tracing::{error, info, info_span};
use anyhow::{Context, Result};
use blobdir::{
    config::DirectoryConfig,
    directory::BlobDirectory,
    manifest::ManifestStatus,
    tracing::setup_tracing,
};
use clap::{Parser, Subcommand};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("VERGEN_BUILD_TIMESTAMP"),
    ")"
);

#[derive(Debug, Parser)]
#[command(name = "blobdir")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Operate on a search index stored in blob storage", long_about = None)]
struct Cli {
    #[arg(
        global = true,
        short,
        long,
        value_name = "config file",
        help = "Path to config file"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List the files of the latest generation")]
    Ls {
        #[arg(short, long, help = "show sizes and object keys")]
        long: bool,
    },
    #[command(about = "Print a file of the latest generation to stdout")]
    Cat { name: String },
    #[command(about = "Write a file and commit it as a new generation")]
    Put {
        name: String,
        #[arg(help = "local file to upload, stdin if omitted")]
        source: Option<PathBuf>,
    },
    #[command(about = "Remove a file and commit a new generation")]
    Rm { name: String },
    #[command(about = "List manifests and whether they are valid")]
    Generations,
    #[command(subcommand, about = "Inspect or break the write lock")]
    Lock(LockCmd),
    #[command(about = "Delete superseded objects past the grace period")]
    Gc {
        #[arg(long, help = "report what would be deleted")]
        dry_run: bool,
    },
}

#[derive(Debug, Subcommand)]
enum LockCmd {
    Status,
    #[command(about = "Forcibly remove the write lock")]
    Break,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DirectoryConfig::from_path(&path.to_string_lossy())
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => DirectoryConfig::default(),
    };

    let tracer_provider = setup_tracing(&config)?;
    let root_span = info_span!("blobdir", env = config.env, holder = config.holder_id());
    let result = {
        let _guard = root_span.enter();
        run(cli.command, config).await
    };

    // export traces before exiting
    if let Some(tracer_provider) = tracer_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    result
}

async fn run(command: Commands, config: DirectoryConfig) -> Result<()> {
    let holder = config.holder_id();
    let directory = BlobDirectory::new(config).context("failed to open directory")?;
    match command {
        Commands::Ls { long } => {
            if long {
                for entry in directory.entries().await? {
                    println!("{:>12}  {}  {}", entry.size, entry.name, entry.object_key);
                }
            } else {
                for name in directory.list().await? {
                    println!("{}", name);
                }
            }
        }
        Commands::Cat { name } => {
            let input = directory.open(&name).await?;
            std::io::stdout().write_all(input.data())?;
        }
        Commands::Put { name, source } => {
            let content = match source {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let writer = directory.open_writer(&holder).await?;
            let mut output = writer.create_output(&name)?;
            output.write_all(&content).await?;
            output.close().await?;
            let manifest = writer.commit().await?;
            writer.close().await?;
            info!(name, generation = manifest.generation, "committed");
            println!("{}", manifest.generation);
        }
        Commands::Rm { name } => {
            let writer = directory.open_writer(&holder).await?;
            writer.delete_file(&name).await?;
            let manifest = writer.commit().await?;
            writer.close().await?;
            println!("{}", manifest.generation);
        }
        Commands::Generations => {
            for info in directory.generations().await? {
                let status = match info.status {
                    ManifestStatus::Valid { files } => format!("valid, {} files", files),
                    ManifestStatus::Corrupt { reason } => format!("corrupt: {}", reason),
                };
                println!(
                    "{:>8}  {:>13}  {}",
                    info.listing.generation, info.listing.last_modified_ms, status
                );
            }
        }
        Commands::Lock(LockCmd::Status) => match directory.lock_status().await? {
            Some(status) => println!(
                "holder={} lease_id={} expires_at_ms={} released={} active={}",
                status.record.holder,
                status.record.lease_id,
                status.record.expires_at_ms,
                status.record.released,
                status.active
            ),
            None => println!("unlocked"),
        },
        Commands::Lock(LockCmd::Break) => {
            let existed = directory.break_lock().await?;
            println!("{}", if existed { "lock removed" } else { "no lock present" });
        }
        Commands::Gc { dry_run } => {
            let report = directory.collect_garbage(&HashSet::new(), dry_run).await?;
            println!(
                "retained generations {:?}, deleted {} manifests and {} objects{}",
                report.retained_generations,
                report.deleted_manifests.len(),
                report.deleted_objects.len(),
                if dry_run { " (dry run)" } else { "" }
            );
            for key in report.deleted_manifests.iter().chain(&report.deleted_objects) {
                println!("  {}", key);
            }
        }
    }
    Ok(())
}
