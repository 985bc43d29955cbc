//! AlphaFold archive file-system tools.
//!
//! Presents a corpus of AlphaFold predicted-structure archives (many `.tar`
//! files of gzip-compressed mmCIF members) as a read-only FUSE file-system.
//! Archives are never extracted: every read seeks straight to the member's
//! offset recorded in a SQLite index and decompresses only that member.
//!
//! # Building an index
//! Use the `index` subcommand to scan the archive tree and (re)build the
//! SQLite index, including the UniProt→PDB and UniProt→taxonomy
//! cross-reference tables.
//! ```bash
//! $ alphafold-fs index -a /extra/alphafold/ -s /extra/alphafold/alphafold.sqlite
//! ```
//!
//! # Mounting
//! ```bash
//! $ mkdir m
//! $ alphafold-fs mount --alphafold-dir /extra/alphafold/ \
//!       --sqlpath /extra/alphafold/alphafold.sqlite m
//! $ ls m/v3/uniprot/J/4/
//! A0A1Q1MKJ4_v3.cif ...
//! ```
//! Structures are reachable by UniProt ID, by PDB cross-reference and by
//! taxonomy ID, below each dataset-version root.
//!
//! # Mount management
//! `mountctl query|umount|forceunmount <mountpoint>` inspects or tears down
//! a mount; `updatedb <mountpoint>` keeps locate's updatedb from crawling it.
use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use alphafold_fs::{fs, indexer, mountctl, updatedb};

/// AlphaFold archive file-system tools.
#[doc(hidden)]
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[doc(hidden)]
#[derive(Subcommand)]
enum Commands {
    /// Mount the AlphaFold archive file-system.
    Mount {
        /// Root directory holding version subdirectories of .tar archives.
        #[clap(long, default_value = "/extra/alphafold/")]
        alphafold_dir: String,

        /// Path of the SQLite index file.
        #[clap(long, default_value = "/extra/alphafold/alphafold.sqlite")]
        sqlpath: String,

        /// Mount directory.
        #[clap(value_parser, name = "mountpoint", required = true)]
        mount_point: String,
    },

    /// Scan archives and (re)build the SQLite index.
    Index(indexer::IndexOptions),

    /// Inspect or tear down a mountpoint.
    Mountctl {
        #[clap(subcommand)]
        command: MountctlCommands,
    },

    /// Add a mountpoint to updatedb's PRUNEPATHS.
    Updatedb {
        /// The fuse mountpoint to exclude.
        #[clap(value_parser, name = "mountpoint", required = true)]
        mountpoint: String,

        /// updatedb configuration file to rewrite.
        #[clap(short = 'e', long = "update-config", default_value = "/etc/updatedb.conf")]
        update_config: String,
    },
}

#[doc(hidden)]
#[derive(Subcommand)]
enum MountctlCommands {
    /// Describe the mount state of a path.
    Query {
        #[clap(value_parser, name = "mountpoint", required = true)]
        mountpoint: String,
    },

    /// Attempt to unmount gracefully.
    Umount {
        #[clap(value_parser, name = "mountpoint", required = true)]
        mountpoint: String,
    },

    /// Unmount, killing any process still using the mountpoint.
    Forceunmount {
        #[clap(value_parser, name = "mountpoint", required = true)]
        mountpoint: String,
    },
}

#[doc(hidden)]
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse and dispatch commands.
    let cli = Cli::parse();
    match cli.command {
        Commands::Mount {
            alphafold_dir,
            sqlpath,
            mount_point,
        } => fs::mount(&alphafold_dir, &sqlpath, &mount_point),
        Commands::Index(options) => indexer::run(&options),
        Commands::Mountctl { command } => match command {
            MountctlCommands::Query { mountpoint } => mountctl::query(&mountpoint),
            MountctlCommands::Umount { mountpoint } => mountctl::umount(&mountpoint),
            MountctlCommands::Forceunmount { mountpoint } => {
                mountctl::forceunmount(&mountpoint)
            }
        },
        Commands::Updatedb {
            mountpoint,
            update_config,
        } => updatedb::exclude(&mountpoint, Path::new(&update_config)),
    }
}
