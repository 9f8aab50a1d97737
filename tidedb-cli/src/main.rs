//! TideDB CLI - operator tool for inspecting and maintaining a database

use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use tidedb_core::{destroy_database, repair_database, Database, Options, ReadOptions, WriteOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: tidedb <path> <command> [args]

commands:
  put <key> <value>       store a value (creates the database if missing)
  get <key>               print the value of a key
  delete <key>            remove a key
  scan [start] [limit]    print entries in key order
  property <name>         print an engine property, e.g. tidedb.stats
  compact                 compact the whole key range
  repair                  rebuild the manifest from the surviving files
  destroy                 delete the database";

/// Parsed command line
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Scan { start: Option<String>, limit: Option<usize> },
    Property { name: String },
    Compact,
    Repair,
    Destroy,
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!("missing command\n\n{}", USAGE);
        };
        let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
        let command = match (name.as_str(), rest.as_slice()) {
            ("put", [key, value]) => Command::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
            ("get", [key]) => Command::Get { key: key.to_string() },
            ("delete", [key]) => Command::Delete { key: key.to_string() },
            ("scan", args) if args.len() <= 2 => Command::Scan {
                start: args.first().map(|s| s.to_string()),
                limit: match args.get(1) {
                    Some(limit) => Some(limit.parse().with_context(|| format!("bad limit {:?}", limit))?),
                    None => None,
                },
            },
            ("property", [name]) => Command::Property { name: name.to_string() },
            ("compact", []) => Command::Compact,
            ("repair", []) => Command::Repair,
            ("destroy", []) => Command::Destroy,
            _ => bail!("bad arguments for {:?}\n\n{}", name, USAGE),
        };
        Ok(command)
    }

    /// Only writes may bring a database into existence
    fn creates_database(&self) -> bool {
        matches!(self, Command::Put { .. })
    }
}

/// Execute `command` against the database at `path`, returning what to print
fn run(path: &Path, command: Command) -> anyhow::Result<Vec<String>> {
    let mut options = Options::default();
    options.set_create_if_missing(command.creates_database());

    match command {
        Command::Repair => {
            repair_database(path, &options).with_context(|| format!("repairing {}", path.display()))?;
            info!("Repaired {}", path.display());
            return Ok(Vec::new());
        }
        Command::Destroy => {
            destroy_database(path, &options).with_context(|| format!("destroying {}", path.display()))?;
            info!("Destroyed {}", path.display());
            return Ok(Vec::new());
        }
        _ => {}
    }

    let db = Database::open(path, options).with_context(|| format!("opening {}", path.display()))?;
    let ro = ReadOptions::default();
    let wo = WriteOptions::default();
    let mut out = Vec::new();

    match command {
        Command::Put { key, value } => db.put(&wo, key.as_bytes(), value.as_bytes())?,
        Command::Get { key } => match db.get(&ro, key.as_bytes())? {
            Some(value) => out.push(String::from_utf8_lossy(&value).into_owned()),
            None => bail!("key {:?} not found", key),
        },
        Command::Delete { key } => db.delete(&wo, key.as_bytes())?,
        Command::Scan { start, limit } => {
            let mut iter = db.iter(&ro)?;
            match &start {
                Some(start) => iter.seek(start.as_bytes()),
                None => iter.seek_to_first(),
            }
            let limit = limit.unwrap_or(usize::MAX);
            while out.len() < limit {
                let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                    break;
                };
                out.push(format!("{} => {}", String::from_utf8_lossy(key), String::from_utf8_lossy(value)));
                iter.next();
            }
            iter.status()?;
        }
        Command::Property { name } => match db.property(&name) {
            Some(value) => out.push(value),
            None => bail!("unknown property {:?}", name),
        },
        Command::Compact => {
            db.compact_range(None, None)?;
            if let Some(summary) = db.property("tidedb.stats") {
                out.push(summary);
            }
        }
        Command::Repair | Command::Destroy => {}
    }

    db.close()?;
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((path, rest)) = args.split_first() else {
        bail!("missing database path\n\n{}", USAGE);
    };
    let command = Command::parse(rest)?;

    for line in run(&PathBuf::from(path), command)? {
        println!("{}", line);
    }
    Ok(())
}
