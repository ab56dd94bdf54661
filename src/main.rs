use anyhow::Context;
use clap::{Parser, Subcommand};
use jqlstore::{StorageMode, Store, StoreConfig, TenantId};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jqlstore")]
#[command(about = "jqlstore - JSON document store with the JQL query language", long_about = None)]
struct Args {
    /// Directory holding jqlstore.toml and .env
    #[arg(short, long, default_value = ".")]
    config_dir: PathBuf,

    /// Storage mode: embedded or relational
    #[arg(long)]
    mode: Option<StorageMode>,

    /// Data directory path
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// SQLite database file
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Tenant (account) id
    #[arg(short, long, default_value_t = 1)]
    tenant: TenantId,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert a JSON object or an array of objects
    Insert { collection: String, document: String },
    /// Fetch one document by id
    Get { collection: String, id: i64 },
    /// Replace one document by id
    Update {
        collection: String,
        id: i64,
        document: String,
    },
    /// Delete one document by id
    Remove { collection: String, id: i64 },
    /// Run a query
    Select {
        collection: String,
        query: String,
        /// Placeholder values as JSON, bound to $1, $2, ...
        params: Vec<String>,
    },
    /// Delete every document a query selects
    Delete {
        collection: String,
        query: String,
        params: Vec<String>,
    },
    /// Show the SQL a query translates to
    Explain { query: String, params: Vec<String> },
    /// List the tenant's collections
    Collections,
    /// Drop a collection and its documents
    Drop { collection: String },
}

fn parse_json(text: &str) -> anyhow::Result<Value> {
    serde_json::from_str(text).with_context(|| format!("invalid JSON: {}", text))
}

/// Placeholder values; text that is not JSON binds as a string.
fn parse_params(params: &[String]) -> Vec<Value> {
    params
        .iter()
        .map(|p| serde_json::from_str(p).unwrap_or_else(|_| Value::String(p.clone())))
        .collect()
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_selection(selection: &jqlstore::Selection) -> anyhow::Result<()> {
    for error in &selection.errors {
        eprintln!("warning: {}", error);
    }
    print_json(&selection.documents)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jqlstore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = StoreConfig::load(&args.config_dir)?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(path) = args.sqlite_path {
        config.sqlite_path = Some(path);
    }

    let store = Store::open(config)?;
    let tenant = args.tenant;

    match args.command {
        Command::Insert {
            collection,
            document,
        } => print_json(&store.insert(tenant, &collection, parse_json(&document)?)?)?,
        Command::Get { collection, id } => print_json(&store.get(tenant, &collection, id)?)?,
        Command::Update {
            collection,
            id,
            document,
        } => print_json(&store.update(tenant, &collection, id, parse_json(&document)?)?)?,
        Command::Remove { collection, id } => print_json(&store.remove(tenant, &collection, id)?)?,
        Command::Select {
            collection,
            query,
            params,
        } => print_selection(&store.select(tenant, &collection, &query, &parse_params(&params))?)?,
        Command::Delete {
            collection,
            query,
            params,
        } => print_selection(&store.delete(tenant, &collection, &query, &parse_params(&params))?)?,
        Command::Explain { query, params } => {
            let sql = store.explain(&query, &parse_params(&params))?;
            println!("{}", sql.statement());
            print_json(&sql.params)?;
            for error in &sql.errors {
                eprintln!("warning: {}", error);
            }
        }
        Command::Collections => print_json(&store.list_collections(tenant)?)?,
        Command::Drop { collection } => {
            let count = store.drop_collection(tenant, &collection)?;
            tracing::info!("Dropped '{}' with {} documents", collection, count);
        }
    }

    store.shutdown()?;
    Ok(())
}
