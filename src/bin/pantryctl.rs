/// pantryctl - inspect and maintain pantry durable caches
///
/// Works directly on a durable tier directory, so it can be used on a cache
/// left behind by the app without starting a session.
///
/// Usage:
///   pantryctl list [--type T]                 - List cached keys
///   pantryctl show <type:id>                  - Print one record
///   pantryctl remove <type:id>                - Remove one record
///   pantryctl remove-matching <pattern>       - Remove records matching a regex
///   pantryctl clear                           - Remove every record
///   pantryctl vacuum                          - Drop temp files and corrupt blobs
///   pantryctl stats                           - Show cache statistics
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::*;
use pantry_cache::lifecycle::user_cache_dir;
use pantry_cache::{CacheKey, DurableConfig, DurableStore, FieldValue, KeyPattern, RecordStore};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// pantryctl - pantry cache inspection tool
///
/// Reads and maintains the on-disk tier of the pantry client cache.
#[derive(Parser)]
#[command(name = "pantryctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Cache root directory (default: <platform cache dir>/pantry-cache)
    #[arg(short, long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Select the cache of one user under the cache root
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cached keys
    ///
    /// Examples:
    ///   pantryctl list
    ///   pantryctl list --type Item
    List {
        /// Only list records of this type
        #[arg(short, long = "type")]
        type_name: Option<String>,
    },

    /// Print one record
    ///
    /// Example:
    ///   pantryctl show Item:42
    Show {
        /// Key in format type:id
        key: String,
    },

    /// Remove one record
    Remove {
        /// Key in format type:id
        key: String,
    },

    /// Remove every record matching a pattern
    ///
    /// Examples:
    ///   pantryctl remove-matching '^Item:'
    ///   pantryctl remove-matching Item --type
    RemoveMatching {
        /// Regex over the full key, or a type name with --type
        pattern: String,

        /// Treat the pattern as a type name
        #[arg(long = "type")]
        by_type: bool,
    },

    /// Remove every record
    Clear,

    /// Remove leftover temp files and corrupt blobs
    Vacuum,

    /// Show cache statistics
    Stats,
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pantry-cache")
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Open the store, refusing to create a directory that is not there.
fn open_store(path: &Path) -> Result<DurableStore> {
    if !path.is_dir() {
        bail!("No cache at {}", path.display());
    }
    DurableStore::open(DurableConfig::new(path))
        .with_context(|| format!("Failed to open cache at {}", path.display()))
}

fn parse_key(raw: &str) -> Result<CacheKey> {
    CacheKey::parse(raw).with_context(|| format!("Invalid key '{}', expected type:id", raw))
}

fn format_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Scalar(json) => json.to_string(),
        FieldValue::Reference(key) => format!("-> {}", key).cyan().to_string(),
        FieldValue::ReferenceList(keys) => {
            let rendered: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
            format!("-> [{}]", rendered.join(", ")).cyan().to_string()
        }
    }
}

fn disk_usage(path: &Path) -> Result<(usize, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    for entry in fs::read_dir(path).with_context(|| format!("Failed to read {}", path.display()))? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            files += 1;
            bytes += metadata.len();
        }
    }
    Ok((files, bytes))
}

fn plural(count: usize, one: &str, many: &str) -> String {
    format!("{} {}", count, if count == 1 { one } else { many })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let root = cli.cache_dir.unwrap_or_else(default_cache_root);
    let path = match &cli.user {
        Some(user) => user_cache_dir(&root, user),
        None => root,
    };
    let store = open_store(&path)?;

    match cli.command {
        Commands::List { type_name } => {
            let keys = store.keys().context("Failed to scan cache")?;
            let keys: Vec<CacheKey> = keys
                .into_iter()
                .filter(|key| type_name.as_deref().is_none_or(|t| key.type_name() == t))
                .collect();

            if keys.is_empty() {
                println!("{}", "(no records)".bright_black());
            }
            for key in &keys {
                println!("  {} {}", key.type_name().cyan(), key.id());
            }
            println!();
            println!("{}", plural(keys.len(), "record", "records").bright_black());
        }

        Commands::Show { key } => {
            let key = parse_key(&key)?;
            match store.get(&key).context("Failed to read record")? {
                Some(record) => {
                    println!("{}", key.to_string().bold().cyan());
                    for (name, value) in record.fields() {
                        println!("  {}: {}", name.bright_white(), format_field(value));
                    }
                }
                None => {
                    eprintln!("{}", "Error".red().bold());
                    eprintln!("  Key not found: {}", key);
                    std::process::exit(1);
                }
            }
        }

        Commands::Remove { key } => {
            let key = parse_key(&key)?;
            if store.remove(&key).context("Failed to remove record")? {
                println!("{}", "OK".green().bold());
                println!("  Removed: {}", key.to_string().cyan());
            } else {
                println!("{}", "Nothing to remove".yellow());
            }
        }

        Commands::RemoveMatching { pattern, by_type } => {
            let pattern = if by_type {
                KeyPattern::of_type(pattern)
            } else {
                KeyPattern::regex(&pattern).context("Invalid pattern")?
            };
            let removed = store
                .remove_matching(&pattern)
                .context("Failed to remove records")?;
            println!("{}", "OK".green().bold());
            println!("  Removed {}", plural(removed.len(), "record", "records"));
        }

        Commands::Clear => {
            let count = store.len().context("Failed to count records")?;
            store.clear().context("Failed to clear cache")?;
            println!("{}", "OK".green().bold());
            println!("  Removed {}", plural(count, "record", "records"));
        }

        Commands::Vacuum => {
            let report = store.vacuum().context("Vacuum failed")?;
            println!("{}", "Vacuum complete".bold().cyan());
            println!("  {} {}", "Temp files removed:".bright_white(), report.removed_temp);
            println!("  {} {}", "Corrupt blobs removed:".bright_white(), report.removed_corrupt);
            println!("  {} {}", "Records kept:".bright_white(), report.kept);
        }

        Commands::Stats => {
            let keys = store.keys().context("Failed to scan cache")?;
            let (files, bytes) = disk_usage(store.path())?;
            let mut types: Vec<(String, usize)> = Vec::new();
            for key in &keys {
                match types.iter_mut().find(|(name, _)| name == key.type_name()) {
                    Some((_, count)) => *count += 1,
                    None => types.push((key.type_name().to_string(), 1)),
                }
            }
            types.sort();

            println!("{}", "Cache Status".bold().cyan());
            println!();
            println!("  {} {}", "Path:".bright_white(), store.path().display());
            println!("  {} {}", "Records:".bright_white(), keys.len());
            println!("  {} {}", "Files:".bright_white(), files);
            println!("  {} {} bytes", "Size:".bright_white(), bytes);
            let stats = store.stats();
            if stats.corrupt > 0 {
                println!(
                    "  {} {} (run `pantryctl vacuum`)",
                    "Corrupt:".yellow(),
                    stats.corrupt
                );
            }
            println!();

            if !types.is_empty() {
                println!("{}", "Types:".bright_white());
                for (name, count) in &types {
                    println!("  {} {} ({})", "*".cyan(), name, plural(*count, "record", "records"));
                }
            }
        }
    }

    Ok(())
}
