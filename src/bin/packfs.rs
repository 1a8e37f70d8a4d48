//! PackFS command-line tool
//!
//! Create, inspect and edit packed archives on the host filesystem

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use packfs_rs::{AccessMode, ArchiveConfig, FileStreamFactory, FileSystemController, FileSystemHandle};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "packfs")]
#[command(about = "Packed single-file virtual filesystem")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty archive (replaces an existing file)
    Create {
        archive: PathBuf,

        /// Maximum number of files
        #[arg(long)]
        max_files: Option<u32>,

        /// Maximum number of block records
        #[arg(long)]
        max_blocks: Option<u32>,

        /// TOML file with archive settings; flags override it
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List files
    Ls { archive: PathBuf },

    /// Store a host file in the archive
    Put {
        archive: PathBuf,
        file: PathBuf,

        /// Name inside the archive [default: the file's name]
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Extract a file to the host filesystem
    Get {
        archive: PathBuf,
        name: String,
        out: PathBuf,
    },

    /// Delete a file
    Rm { archive: PathBuf, name: String },

    /// Rename a file
    Mv {
        archive: PathBuf,
        old: String,
        new: String,
    },

    /// Show capacity and space usage
    Info {
        archive: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the block table tiles the data region
    Check { archive: PathBuf },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let controller = FileSystemController::with_stream_factory(FileStreamFactory);

    let result = run(&controller, args.command);
    controller.shutdown()?;
    result
}

fn run(controller: &FileSystemController, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create {
            archive,
            max_files,
            max_blocks,
            config,
        } => {
            let mut settings = match config {
                Some(path) => ArchiveConfig::from_path(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => ArchiveConfig::default(),
            };
            if let Some(max_files) = max_files {
                settings.max_file_count = max_files;
            }
            if let Some(max_blocks) = max_blocks {
                settings.max_block_count = max_blocks;
            }

            controller.create_file_system_with_config(&archive, &settings)?;
            info!(
                "Created {:?} (max files {}, max blocks {})",
                archive, settings.max_file_count, settings.max_block_count
            );
        }

        Command::Ls { archive } => {
            let fs = open(controller, &archive, AccessMode::Read)?;
            for file in fs.lock().get_all_file_infos() {
                println!("{:>12}  {}", file.length, file.name);
            }
        }

        Command::Put {
            archive,
            file,
            name,
        } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("cannot derive a name from {}", file.display()))?,
            };

            let fs = open(controller, &archive, AccessMode::ReadWrite)?;
            if !fs.lock().write_file_from_path(&name, &file)? {
                bail!("archive {} is full, {} was not stored", archive.display(), name);
            }
        }

        Command::Get { archive, name, out } => {
            let fs = open(controller, &archive, AccessMode::Read)?;
            if !fs.lock().save_as_file(&name, &out)? {
                bail!("no file named {} in {}", name, archive.display());
            }
        }

        Command::Rm { archive, name } => {
            let fs = open(controller, &archive, AccessMode::ReadWrite)?;
            if !fs.lock().delete_file(&name)? {
                bail!("no file named {} in {}", name, archive.display());
            }
        }

        Command::Mv { archive, old, new } => {
            let fs = open(controller, &archive, AccessMode::ReadWrite)?;
            if !fs.lock().rename_file(&old, &new)? {
                bail!("cannot rename {} to {} in {}", old, new, archive.display());
            }
        }

        Command::Info { archive, json } => {
            let fs = open(controller, &archive, AccessMode::Read)?;
            let stats = fs.lock().stats();

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Files:        {} / {}", stats.file_count, stats.max_file_count);
                println!("Blocks:       {} / {}", stats.block_count, stats.max_block_count);
                println!("Data bytes:   {}", stats.data_bytes);
                println!(
                    "Free bytes:   {} in {} extents",
                    stats.free_bytes, stats.free_extent_count
                );
                println!("Fragmentation: {:.3}", stats.fragmentation);
            }
        }

        Command::Check { archive } => {
            let fs = open(controller, &archive, AccessMode::Read)?;
            fs.lock().verify()?;
            println!("{}: ok", archive.display());
        }
    }

    Ok(())
}

fn open(
    controller: &FileSystemController,
    archive: &Path,
    access: AccessMode,
) -> anyhow::Result<FileSystemHandle> {
    controller
        .load_file_system(archive, access)
        .with_context(|| format!("opening {}", archive.display()))
}
