use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use frozendb::{Database, Error, FinderStrategy, OpenMode, Result, Transaction};

#[derive(Debug, Parser)]
#[command(name = "fdb", version, about = "frozenDB: an append-only, single-file key-value store")]
struct Cli {
    /// Path to the database file.
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// Finder used to locate rows.
    #[arg(long, global = true, value_enum, default_value_t = FinderArg::Simple)]
    finder: FinderArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FinderArg {
    /// Linear scan; the reference implementation.
    Simple,
    /// Map-backed lookups built at open.
    Inmemory,
    /// Timestamp bisection within the skew window.
    Binary,
}

impl From<FinderArg> for FinderStrategy {
    fn from(arg: FinderArg) -> Self {
        match arg {
            FinderArg::Simple => FinderStrategy::Linear,
            FinderArg::Inmemory => FinderStrategy::InMemory,
            FinderArg::Binary => FinderStrategy::BinarySearch,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new database file.
    Create {
        /// Fixed width, in bytes, of every row.
        #[arg(long)]
        row_size: u32,
        /// Tolerated key timestamp skew, in milliseconds.
        #[arg(long)]
        skew_ms: u64,
    },
    /// Begin a transaction.
    Begin,
    /// Add a key/value pair to the active transaction.  The literal `NOW`
    /// generates a fresh UUIDv7 key.
    Add { key: String, value: String },
    /// Declare a savepoint on the active transaction's current row.
    Savepoint,
    /// Commit the active transaction.
    Commit,
    /// Roll the active transaction back to a savepoint (0 for all rows).
    Rollback { savepoint: u8 },
    /// Print the committed value stored under a key.
    Get { key: String },
    /// Print header fields and file state.
    Inspect {
        /// Also list every row with its kind, key, and end-control.
        #[arg(long)]
        rows: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let path = cli.path.ok_or_else(|| Error::InvalidInput {
        message: "--path is required".to_string(),
    })?;
    let finder = cli.finder.into();

    match cli.command {
        Command::Create { row_size, skew_ms } => Database::create(&path, row_size, skew_ms).await,
        Command::Begin => {
            let db = Database::open(&path, OpenMode::Write, finder).await?;
            db.begin().await?;
            db.close().await;
            Ok(())
        }
        Command::Add { key, value } => {
            let key = parse_key(&key, true)?;
            // The engine stores values opaquely; syntactic JSON validity is
            // on us as the caller.
            serde_json::from_str::<Value>(&value).map_err(|e| Error::InvalidInput {
                message: format!("value is not valid JSON: {e}"),
            })?;

            let (db, tx) = open_active(&path, finder).await?;
            tx.add(key, value.as_bytes()).await?;
            println!("{key}");
            db.close().await;
            Ok(())
        }
        Command::Savepoint => {
            let (db, tx) = open_active(&path, finder).await?;
            tx.savepoint().await?;
            db.close().await;
            Ok(())
        }
        Command::Commit => {
            let (db, tx) = open_active(&path, finder).await?;
            tx.commit().await?;
            db.close().await;
            Ok(())
        }
        Command::Rollback { savepoint } => {
            let (db, tx) = open_active(&path, finder).await?;
            tx.rollback(savepoint).await?;
            db.close().await;
            Ok(())
        }
        Command::Get { key } => {
            let key = parse_key(&key, false)?;
            let db = Database::open(&path, OpenMode::Read, finder).await?;
            let bytes = db.get_raw(key).await?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| Error::InvalidData {
                message: format!("stored value is not valid JSON: {e}"),
            })?;
            let pretty = serde_json::to_string_pretty(&value).map_err(|e| Error::InvalidData {
                message: format!("cannot render stored value: {e}"),
            })?;
            println!("{pretty}");
            db.close().await;
            Ok(())
        }
        Command::Inspect { rows } => {
            let db = Database::open(&path, OpenMode::Read, finder).await?;
            let header = db.header();
            let row_count = db.row_count().await?;
            println!("path:          {}", path.display());
            println!("row size:      {} bytes", header.row_size());
            println!("skew window:   {} ms", header.skew_ms());
            println!("row slots:     {row_count}");
            println!("max timestamp: {} ms", db.max_timestamp());
            let state = if db.has_partial_tail().await? {
                "active (partial row at tail)"
            } else {
                "idle"
            };
            println!("transaction:   {state}");

            if rows {
                println!();
                for index in 0..row_count {
                    println!("{:>8}  {}", index, describe_row(&db.row_at(index).await?));
                }
            }
            db.close().await;
            Ok(())
        }
    }
}

/// Opens the database writable and resolves the active transaction, begun
/// earlier or recovered from the file tail.
async fn open_active(path: &Path, finder: FinderStrategy) -> Result<(Database, Transaction)> {
    let db = Database::open(path, OpenMode::Write, finder).await?;
    let Some(tx) = db.active_transaction().await else {
        db.close().await;
        return Err(Error::InvalidAction {
            message: "no active transaction; run `begin` first".to_string(),
        });
    };
    Ok((db, tx))
}

fn describe_row(row: &frozendb::Row) -> String {
    use frozendb::{EndControl, Row};

    let end_label = |end: EndControl| {
        let b = end.as_bytes();
        format!("{}{}", b[0] as char, b[1] as char)
    };
    match row {
        Row::Data(data) => format!(
            "data      key={} end={} value={}B",
            data.key,
            end_label(data.end),
            data.value.len()
        ),
        Row::Null(null) => format!("null      key={}", null.key),
        Row::Checksum(checksum) => format!("checksum  crc=0x{:08X}", checksum.crc),
        Row::Partial(_) => "partial".to_string(),
    }
}

fn parse_key(raw: &str, allow_now: bool) -> Result<Uuid> {
    if allow_now && raw.eq_ignore_ascii_case("now") {
        return Ok(Uuid::now_v7());
    }
    Uuid::parse_str(raw).map_err(|e| Error::InvalidInput {
        message: format!("'{raw}' is not a valid UUID: {e}"),
    })
}
