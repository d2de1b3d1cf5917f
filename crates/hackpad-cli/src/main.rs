//! hackpad filesystem inspector.
//!
//! Composes a mount table from archives and SQLite stores, then runs one
//! command against it.
//!
//! Usage:
//!   # List a Go toolchain archive mounted where the sandbox expects it
//!   hackpad --mount /usr/local/go=go.tar.gz ls /usr/local/go/bin
//!
//!   # Inspect a persisted home directory
//!   hackpad --mount /home=home.db stat --json /home/me/notes.txt
//!
//!   # Count lines, words and bytes; results under artifact-cached prefixes
//!   # are memoized per path
//!   hackpad --mount /usr/local/go=go.tar.gz wc /usr/local/go/VERSION
//!
//! Logs go to stderr; set RUST_LOG=debug to see routing.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use hackpad_fs::vfs::path;
use hackpad_fs::{
    ArchiveFs, ArtifactCache, FsConfig, FsContext, OpenFlags, ReadThroughCache, SqliteStorer,
    StatCache, StorerFs, VfsError, VfsOps,
};

/// Process ID the CLI opens descriptors as.
const CLI_PID: hackpad_fs::Pid = 1;

/// Inspect hackpad virtual filesystems.
#[derive(Parser, Debug)]
#[command(name = "hackpad")]
#[command(about = "Inspect archive and SQLite backed hackpad filesystems")]
struct Args {
    /// RON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mount SOURCE (.tar.gz, .tgz, .db, .sqlite) at PREFIX
    #[arg(short, long = "mount", value_name = "PREFIX=SOURCE", value_parser = parse_mount)]
    mounts: Vec<(String, PathBuf)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List directory entries
    Ls { path: String },
    /// Print file contents
    Cat { path: String },
    /// Show file attributes
    Stat {
        path: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Total bytes beneath a path
    Du { path: String },
    /// Count lines, words and bytes of a file
    Wc { path: String },
    /// Show the mount table
    Mounts,
}

fn parse_mount(arg: &str) -> Result<(String, PathBuf), String> {
    let (prefix, source) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected PREFIX=SOURCE, got {arg:?}"))?;
    if prefix.is_empty() || source.is_empty() {
        return Err(format!("expected PREFIX=SOURCE, got {arg:?}"));
    }
    Ok((path::normalize(prefix), PathBuf::from(source)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Archive,
    Sqlite,
}

fn source_kind(source: &std::path::Path) -> Option<SourceKind> {
    let name = source.file_name()?.to_str()?;
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(SourceKind::Archive)
    } else if name.ends_with(".db") || name.ends_with(".sqlite") {
        Some(SourceKind::Sqlite)
    } else {
        None
    }
}

/// Build the backend stack for one `--mount`.
async fn open_source(prefix: &str, source: &std::path::Path, config: &FsConfig) -> Result<Arc<dyn VfsOps>> {
    tracing::debug!(prefix = %prefix, source = %source.display(), "opening source");
    match source_kind(source) {
        Some(SourceKind::Archive) => {
            let file = std::fs::File::open(source)
                .with_context(|| format!("opening archive {}", source.display()))?;
            let base = Arc::new(ArchiveFs::from_reader(file));
            let store = Arc::new(StorerFs::in_memory().await?);
            Ok(Arc::new(ReadThroughCache::new(base, store)))
        }
        Some(SourceKind::Sqlite) => {
            let storer = SqliteStorer::open(source)
                .with_context(|| format!("opening store {}", source.display()))?;
            let fs = StorerFs::new(Arc::new(storer)).await?;
            Ok(Arc::new(StatCache::new(Arc::new(fs), config.stat_cache_predicate(prefix))))
        }
        None => bail!("unrecognized source {} (want .tar.gz, .tgz, .db or .sqlite)", source.display()),
    }
}

/// Line, word and byte counts of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counts {
    lines: usize,
    words: usize,
    bytes: usize,
}

impl Counts {
    fn of(data: &[u8]) -> Self {
        Self {
            lines: data.iter().filter(|&&b| b == b'\n').count(),
            words: data
                .split(|b| b.is_ascii_whitespace())
                .filter(|w| !w.is_empty())
                .count(),
            bytes: data.len(),
        }
    }
}

/// Artifact layers of every mount, keyed by mount prefix.
type Layers = Vec<(String, Arc<ArtifactCache<Counts>>)>;

async fn count(ctx: &FsContext, layers: &Layers, target: &str) -> Result<Counts> {
    let target = path::normalize(target);
    let layer = layers
        .iter()
        .filter_map(|(prefix, layer)| Some((prefix.len(), path::strip_prefix(&target, prefix)?, layer)))
        .max_by_key(|(len, _, _)| *len);
    match layer {
        Some((_, relative, layer)) => Ok(layer
            .get_or_compile(&relative, |data| async move { Ok::<_, VfsError>(Counts::of(&data)) })
            .await?),
        None => Ok(Counts::of(&ctx.vfs().read_all(&target).await?)),
    }
}

async fn cat(ctx: &FsContext, path: &str) -> Result<()> {
    let fid = ctx.open(CLI_PID, path, OpenFlags::read(), 0).await?;
    let mut stdout = std::io::stdout();
    loop {
        let chunk = ctx.read(fid, 64 * 1024, None).await?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk)?;
    }
    stdout.flush()?;
    ctx.close(CLI_PID, fid).await?;
    Ok(())
}

async fn run(ctx: &FsContext, layers: &Layers, command: Command) -> Result<()> {
    match command {
        Command::Ls { path } => {
            for name in ctx.readdir(&path).await? {
                let full = path::join(&path::normalize(&path), &name);
                let stat = ctx.stat(&full).await?;
                let is_dir = stat.mode & hackpad_fs::vfs::S_IFMT == hackpad_fs::vfs::S_IFDIR;
                println!("{:o}\t{:>10}\t{}{}", stat.mode, stat.size, name, if is_dir { "/" } else { "" });
            }
        }
        Command::Cat { path } => cat(ctx, &path).await?,
        Command::Stat { path, json } => {
            let stat = ctx.stat(&path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stat)?);
            } else {
                println!("  File: {}", path::normalize(&path));
                println!("  Mode: {:o}", stat.mode);
                println!("  Size: {}\tBlocks: {}\tIO Block: {}", stat.size, stat.blocks, stat.blksize);
                println!("Modify: {} ms since epoch", stat.mtime_ms);
            }
        }
        Command::Du { path } => {
            let total = ctx.disk_usage(&path).await?;
            println!("{total}\t{}", path::normalize(&path));
        }
        Command::Wc { path } => {
            let counts = count(ctx, layers, &path).await?;
            println!(
                "{:>8}{:>8}{:>8} {}",
                counts.lines,
                counts.words,
                counts.bytes,
                path::normalize(&path)
            );
        }
        Command::Mounts => {
            for mount in ctx.mounts() {
                let mode = if mount.read_only { "ro" } else { "rw" };
                println!("{}\t{}\t{}", mount.path, mode, mount.backend);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(file) => FsConfig::load(file).with_context(|| format!("loading config {}", file.display()))?,
        None => FsConfig::default(),
    };

    let ctx = FsContext::in_memory(config.clone()).await?;
    let mut layers = Layers::new();
    for (prefix, source) in &args.mounts {
        let fs = open_source(prefix, source, &config).await?;
        ctx.mkdir_all(prefix, 0o755).await?;
        let layer = ctx
            .mount_with_artifacts::<Counts>(prefix, fs)
            .await
            .with_context(|| format!("mounting {} at {prefix}", source.display()))?;
        layers.push((prefix.clone(), layer));
    }

    let outcome = run(&ctx, &layers, args.command).await;
    ctx.shutdown().await?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount() {
        let (prefix, source) = parse_mount("/usr/local/go/=go.tar.gz").unwrap();
        assert_eq!(prefix, "/usr/local/go");
        assert_eq!(source, PathBuf::from("go.tar.gz"));
        assert!(parse_mount("no-equals").is_err());
        assert!(parse_mount("=x.db").is_err());
    }

    #[test]
    fn test_source_kind() {
        assert_eq!(source_kind("a/go.tar.gz".as_ref()), Some(SourceKind::Archive));
        assert_eq!(source_kind("go.tgz".as_ref()), Some(SourceKind::Archive));
        assert_eq!(source_kind("home.sqlite".as_ref()), Some(SourceKind::Sqlite));
        assert_eq!(source_kind("home.db".as_ref()), Some(SourceKind::Sqlite));
        assert_eq!(source_kind("notes.txt".as_ref()), None);
    }

    #[test]
    fn test_counts() {
        let counts = Counts::of(b"package main\n\nfunc main() {}\n");
        assert_eq!(counts, Counts { lines: 3, words: 5, bytes: 29 });
        assert_eq!(Counts::of(b""), Counts { lines: 0, words: 0, bytes: 0 });
    }

    #[tokio::test]
    async fn test_count_goes_through_artifact_layer() {
        let ctx = FsContext::in_memory(FsConfig::default()).await.unwrap();
        ctx.mkdir_all("/usr/local/go", 0o755).await.unwrap();
        let layer = ctx
            .mount_with_artifacts::<Counts>("/usr/local/go", Arc::new(StorerFs::in_memory().await.unwrap()))
            .await
            .unwrap();
        ctx.vfs().write_all("/usr/local/go/VERSION", b"go1.21\n").await.unwrap();
        ctx.vfs().write_all("/outside", b"a b").await.unwrap();
        let layers = vec![("/usr/local/go".to_string(), Arc::clone(&layer))];

        let counts = count(&ctx, &layers, "/usr/local/go/VERSION").await.unwrap();
        assert_eq!(counts.bytes, 7);
        assert_eq!(layer.get("/VERSION"), Some(counts));
        assert_eq!(count(&ctx, &layers, "/outside").await.unwrap().words, 2);
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "hackpad", "--mount", "/home=home.db", "-m", "/go=go.tgz", "stat", "--json", "/home",
        ])
        .unwrap();
        assert_eq!(args.mounts.len(), 2);
        assert!(matches!(args.command, Command::Stat { json: true, .. }));
    }
}
