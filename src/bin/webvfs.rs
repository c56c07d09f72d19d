//! webvfs - query a remote SQLite database over HTTP
//!
//! Registers the web VFS, opens the database at the given URL and runs one
//! query, printing rows as tab-separated text or JSON.

use anyhow::{bail, Context};
use clap::Parser;
use rusqlite::types::ValueRef;
use sqlite_web_vfs::{connect, registered_vfs, VfsConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "webvfs")]
#[command(about = "Query a SQLite database served over HTTP range requests")]
struct Args {
    /// URL of the database file
    url: String,

    /// SQL to run
    #[arg(short = 'q', long, default_value = "SELECT name FROM sqlite_master WHERE type = 'table'")]
    query: String,

    /// TOML configuration file (CLI flags override it)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Page cache capacity in bytes
    #[arg(long)]
    cache_bytes: Option<u64>,

    /// Fetch granularity in bytes
    #[arg(long)]
    page_size: Option<u32>,

    /// Retries for transient HTTP failures
    #[arg(long)]
    max_retries: Option<u32>,

    /// Pages to read ahead on sequential access (0 disables)
    #[arg(long)]
    prefetch_depth: Option<u32>,

    /// Bearer token for the object store
    #[arg(long)]
    auth_token: Option<String>,

    /// Print rows as a JSON array
    #[arg(long)]
    json: bool,

    /// Print cache statistics to stderr when done
    #[arg(long)]
    stats: bool,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn vfs_config(&self) -> anyhow::Result<VfsConfig> {
        let mut config = match &self.config {
            Some(path) => VfsConfig::from_file(path)
                .with_context(|| format!("failed to load config {:?}", path))?,
            None => VfsConfig::default(),
        };

        if let Some(cache_bytes) = self.cache_bytes {
            config.cache_bytes = cache_bytes;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(depth) = self.prefetch_depth {
            config.prefetch_depth = depth;
        }
        if self.auth_token.is_some() {
            config.auth_token = self.auth_token.clone();
        }

        config.check().context("invalid configuration")?;
        Ok(config)
    }
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => f.into(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned().into(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()).into(),
    }
}

fn to_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.vfs_config()?;
    if config.overlay {
        bail!("webvfs only reads; remove `overlay` from the configuration");
    }
    info!(
        "opening {} (page {} bytes, cache {} bytes)",
        args.url, config.page_size, config.cache_bytes
    );

    let conn = connect(&args.url, config).with_context(|| format!("failed to open {}", args.url))?;
    let mut stmt = conn
        .prepare(&args.query)
        .with_context(|| format!("failed to prepare {:?}", args.query))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query([])?;
    let mut json_rows = Vec::new();
    if !args.json {
        println!("{}", columns.join("\t"));
    }
    while let Some(row) = rows.next()? {
        if args.json {
            let mut object = serde_json::Map::new();
            for (i, name) in columns.iter().enumerate() {
                object.insert(name.clone(), to_json(row.get_ref(i)?));
            }
            json_rows.push(serde_json::Value::Object(object));
        } else {
            let fields: Vec<String> = (0..columns.len())
                .map(|i| row.get_ref(i).map(to_text))
                .collect::<Result<_, _>>()?;
            println!("{}", fields.join("\t"));
        }
    }
    drop(rows);
    drop(stmt);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&json_rows)?);
    }

    if args.stats {
        if let Some(vfs) = registered_vfs() {
            eprintln!("{}", serde_json::to_string_pretty(&vfs.stats())?);
        }
    }

    Ok(())
}
