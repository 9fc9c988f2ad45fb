/*!
Stateward CLI - inspect and reset a Stateward data directory.

Reads the on-disk tiers directly: the primary state record, the critical
field file and the collection cache.
*/

use clap::{Parser, Subcommand};
use stateward_core::compression::decompress_text;
use stateward_core::tiers::{COLLECTION_TABLE, STATE_TABLE};
use stateward_core::{
    EngineConfig, FileFlatStore, FlatStore, GzipCompressor, RecordStore, Snapshot,
    SqliteRecordStore, StatewardError, StorageRecord, TierManager, APP_STATE_ID,
};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "stateward")]
#[command(about = "Inspect and reset Stateward persisted state")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory holding state.db and the critical field file
    #[arg(
        short,
        long,
        global = true,
        env = "STATEWARD_DATA_DIR",
        default_value = "./stateward-data"
    )]
    data_dir: PathBuf,

    /// Engine configuration file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the saved application state record
    Show {
        /// Print the full snapshot JSON as well
        #[arg(long)]
        data: bool,
    },
    /// Print the critical field copy
    Critical,
    /// List cached remote collections
    Collections,
    /// Delete every saved tier and the collection cache
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct CollectionInfo {
    #[tabled(rename = "Collection")]
    name: String,
    #[tabled(rename = "Records")]
    count: usize,
    #[tabled(rename = "Compressed")]
    compressed: bool,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Cached")]
    cached_at: String,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "Fresh")]
    fresh: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Show { data } => show_state(&config, data)?,
        Commands::Critical => show_critical(&config)?,
        Commands::Collections => list_collections(&config)?,
        Commands::Clear { force } => clear_all(&config, force)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig, anyhow::Error> {
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str::<EngineConfig>(&text)?
        }
        None => EngineConfig::default(),
    };
    let config = config.with_data_dir(&cli.data_dir);
    config.validate()?;
    debug!(data_dir = %cli.data_dir.display(), "Configuration loaded");
    Ok(config)
}

/// Open a table of the primary database, or `None` if it was never created
fn open_table(config: &EngineConfig, table: &str) -> Result<Option<SqliteRecordStore>, anyhow::Error> {
    match config.primary_db_path() {
        Some(path) if path.exists() => Ok(Some(SqliteRecordStore::open(path, table)?)),
        Some(path) => {
            println!("No database found at: {}", path.display());
            Ok(None)
        }
        None => Ok(None),
    }
}

fn decode(record: &StorageRecord) -> Result<String, StatewardError> {
    if record.compressed {
        decompress_text(&GzipCompressor::new(), &record.data)
    } else {
        Ok(record.data.clone())
    }
}

fn show_state(config: &EngineConfig, print_data: bool) -> Result<(), anyhow::Error> {
    let Some(store) = open_table(config, STATE_TABLE)? else {
        return Ok(());
    };
    let Some(record) = store.get(APP_STATE_ID)? else {
        println!("No saved application state");
        return Ok(());
    };

    println!("Application State:");
    println!("  ID: {}", record.id);
    println!("  Saved: {}", format_timestamp(record.timestamp));
    println!("  Compressed: {}", record.compressed);
    println!("  Stored Size: {}", format_size(record.data.len() as u64));
    println!("  Checksum: {}", record.checksum);

    let plain = match decode(&record) {
        Ok(plain) => plain,
        Err(e) => {
            error!("Failed to decompress state: {}", e);
            println!("✗ State could not be decompressed");
            return Err(e.into());
        }
    };
    println!("  Size: {}", format_size(plain.len() as u64));

    match record.verify(&plain) {
        Ok(()) => println!("✓ Integrity check passed"),
        Err(StatewardError::IntegrityCheckFailed { expected, actual }) => {
            error!("Integrity check failed: expected {}, got {}", expected, actual);
            return Err(anyhow::anyhow!("Integrity check failed"));
        }
        Err(e) => return Err(e.into()),
    }

    let snapshot = Snapshot::from_json(&plain)?;
    println!("  Version: {}", snapshot.version);
    println!("  Captured: {}", format_timestamp(snapshot.captured_at));
    if let Some(tab) = &snapshot.active_tab {
        println!("  Active Tab: {tab}");
    }
    println!("  Forms: {}", snapshot.forms.len());

    if print_data {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

fn show_critical(config: &EngineConfig) -> Result<(), anyhow::Error> {
    let Some(path) = config.secondary_path() else {
        return Ok(());
    };
    match FileFlatStore::new(&path).get()? {
        Some(fields) => println!("{}", serde_json::to_string_pretty(&fields)?),
        None => println!("No critical field file at: {}", path.display()),
    }
    Ok(())
}

fn list_collections(config: &EngineConfig) -> Result<(), anyhow::Error> {
    let Some(store) = open_table(config, COLLECTION_TABLE)? else {
        return Ok(());
    };
    let now = chrono::Utc::now().timestamp_millis();

    let rows: Vec<CollectionInfo> = store
        .list()?
        .into_iter()
        .map(|record| CollectionInfo {
            name: record.id.clone(),
            count: record.count,
            compressed: record.compressed,
            size: format_size(record.data.len() as u64),
            cached_at: format_timestamp(record.timestamp),
            age: format_age(record.age(now)),
            fresh: record.is_fresh(now, config.cache_duration),
        })
        .collect();

    if rows.is_empty() {
        println!("No cached collections");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn clear_all(config: &EngineConfig, force: bool) -> Result<(), anyhow::Error> {
    if !force {
        print!(
            "Delete all saved state and cached collections in '{}'? (y/N): ",
            config
                .data_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Clear cancelled");
            return Ok(());
        }
    }

    let failures = TierManager::from_config(config)?.clear_all();
    for (tier, e) in &failures {
        warn!("Failed to clear {} tier: {}", tier, e);
    }
    if let Some(cache) = open_table(config, COLLECTION_TABLE)? {
        cache.clear()?;
    }

    if failures.is_empty() {
        info!("Data directory cleared");
        println!("✓ Saved state and collection cache cleared");
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} tier(s) could not be cleared", failures.len()))
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_age(age: std::time::Duration) -> String {
    let minutes = age.as_secs() / 60;
    if minutes < 60 {
        format!("{minutes} min")
    } else {
        format!("{}h {:02}m", minutes / 60, minutes % 60)
    }
}

fn format_timestamp(timestamp_ms: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp_ms.to_string(),
    }
}
