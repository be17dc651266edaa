//! collfs command-line tool.
//!
//! Browses and edits a site whose blocks and records live in a local
//! directory. The current user's home project is mounted at `/home`.
//!
//! Usage:
//!   collfs ls /home
//!   collfs new-collection notes
//!   collfs put ./todo.txt /home/notes/todo.txt
//!   collfs cp /home/notes /home/notes-backup/notes
//!   collfs manifest <collection-uuid>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collfs_keep::{ApiClient, DirStore};
use collfs_kernel::{Backend, FsConfig, OpContext, SiteFs, VfsOps};
use tracing_subscriber::{EnvFilter, fmt};

/// Browse and edit collections in a local store.
#[derive(Parser, Debug)]
#[command(name = "collfs")]
#[command(about = "Collection filesystem over a local store")]
struct Args {
    /// Store directory (default: <data dir>/collfs/store)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Config file (default: <config dir>/collfs/config.toml, if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Check lock acquisition order at runtime
    #[arg(long, global = true)]
    debug_locks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show type and size
    Stat { path: String },
    /// Print a file to stdout
    Cat { path: String },
    /// Copy a local file into the site
    Put { local: PathBuf, path: String },
    /// Create a directory (a new collection inside a project)
    Mkdir { path: String },
    /// Rename within one collection
    Mv { from: String, to: String },
    /// Remove a file or empty directory
    Rm {
        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
        path: String,
    },
    /// Copy a subtree, possibly into another collection
    Cp { from: String, to: String },
    /// Create an empty collection in the home project
    NewCollection { name: String },
    /// Create a subproject in the home project
    NewProject { name: String },
    /// Print a collection's manifest text
    Manifest { id: String },
    /// Per-file sizes of a collection
    Inspect { id: String },
}

impl Command {
    fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Put { .. }
                | Command::Mkdir { .. }
                | Command::Mv { .. }
                | Command::Rm { .. }
                | Command::Cp { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FsConfig::load(path)?,
        None => FsConfig::load_default()?,
    };
    config.debug_locks |= args.debug_locks;

    let root = match args.store {
        Some(root) => root,
        None => dirs::data_dir()
            .context("no data directory on this platform; pass --store")?
            .join("collfs")
            .join("store"),
    };
    let store = Arc::new(
        DirStore::open(&root)
            .await
            .with_context(|| format!("opening store at {}", root.display()))?,
    );
    tracing::debug!(root = %root.display(), "opened store");

    let ctx = OpContext::background();
    let site = SiteFs::new(Backend::from_store(store.clone(), &config), config);
    site.mount_project(&ctx, "home", "").await?;

    let mutates = args.command.mutates();
    run(&ctx, &site, &store, args.command).await?;
    if mutates {
        site.sync(&ctx).await?;
    }
    Ok(())
}

async fn run(ctx: &OpContext, site: &SiteFs, store: &DirStore, command: Command) -> Result<()> {
    match command {
        Command::Ls { path } => {
            for entry in site.readdir(ctx, &path).await? {
                if entry.kind.is_dir() {
                    println!("{}/", entry.name);
                } else {
                    println!("{}", entry.name);
                }
            }
        }
        Command::Stat { path } => {
            let attr = site.stat(ctx, &path).await?;
            let mtime = attr
                .mtime
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let kind = if attr.is_dir() { "directory" } else { "file" };
            println!("{}\t{}\t{}\t{}", path, kind, attr.size, mtime);
        }
        Command::Cat { path } => {
            let data = site.read_all(ctx, &path).await?;
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
        Command::Put { local, path } => {
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("reading {}", local.display()))?;
            site.write_all(ctx, &path, &data).await?;
        }
        Command::Mkdir { path } => site.mkdir(ctx, &path).await?,
        Command::Mv { from, to } => site.rename(ctx, &from, &to).await?,
        Command::Rm { recursive, path } => {
            if recursive {
                site.remove_all(ctx, &path).await?;
            } else {
                site.remove(ctx, &path).await?;
            }
        }
        Command::Cp { from, to } => {
            let snapshot = site.snapshot(ctx, &from).await?;
            site.splice(ctx, &to, &snapshot).await?;
        }
        Command::NewCollection { name } => {
            let home = store.current_user().await?;
            let fs = site.create_collection(ctx, &name, &home.uuid).await?;
            println!("{}", fs.id());
        }
        Command::NewProject { name } => {
            let home = store.current_user().await?;
            let project = store.create_project(&name, &home.uuid).await?;
            println!("{}", project.uuid);
        }
        Command::Manifest { id } => {
            let fs = site.collection(ctx, &id).await?;
            print!("{}", fs.manifest_text()?);
        }
        Command::Inspect { id } => {
            let fs = site.collection(ctx, &id).await?;
            let manifest: collfs_kernel::Manifest = fs.manifest_text()?.parse()?;
            let stats = manifest.inspect();
            for (stream, name, size) in &stats.files {
                println!("{}\t{}/{}", size, stream, name);
            }
            println!("{}\tdata", stats.data_size);
            println!("{}\tpdh", fs.portable_data_hash());
        }
    }
    Ok(())
}
