use humanql::cache::{CacheConfig, QueryCache};
use humanql::db::{connect_and_describe, create_adapter, Dialect};
use humanql::export::write_csv;
use humanql::history::{HistoryItem, HistoryStore};
use humanql::llm::{compact_schema, LlmClient, LlmConfig};
use humanql::schema::Schema;
use humanql::{PipelineConfig, QueryOrchestrator, QueryRequest};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "humanql")]
#[command(about = "Ask questions about a PostgreSQL or MySQL database in plain language")]
#[command(version)]
struct Args {
    /// SQLite file holding query history
    #[arg(long, global = true, default_value = ".humanql/history.db")]
    history_db: PathBuf,

    /// JSON file the result cache is persisted to
    #[arg(long, global = true, default_value = ".humanql/cache.json")]
    cache_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, introspect the schema and report the access level
    Connect {
        /// postgresql://… or mysql://… (or set DATABASE_URL)
        #[arg(long)]
        url: Option<String>,

        /// Write the introspected schema as JSON
        #[arg(long)]
        save_schema: Option<PathBuf>,
    },
    /// Turn a question into SQL, run it and summarize the result
    Ask {
        question: String,

        /// postgresql://… or mysql://… (or set DATABASE_URL)
        #[arg(long)]
        url: Option<String>,

        /// Use a saved schema instead of introspecting
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Allow INSERT/UPDATE/DELETE when the connection has write access
        #[arg(long)]
        allow_writes: bool,

        /// Summary language (en or ru)
        #[arg(long, default_value = "en")]
        locale: String,

        /// Do not send row data to the LLM
        #[arg(long)]
        privacy: bool,

        /// Hide table and column names from the LLM
        #[arg(long)]
        anonymize: bool,

        /// Write result rows to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Override the number of repair attempts
        #[arg(long)]
        max_repairs: Option<u32>,
    },
    /// Print the demo schema
    Demo,
    /// Inspect and manage query history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List entries, newest first
    List,
    /// List favorite entries
    Favorites,
    /// Find entries whose question or SQL contains the text
    Search { text: String },
    /// Toggle the favorite flag of an entry
    Favorite { id: String },
    /// Delete one entry
    Delete { id: String },
    /// Delete entries, keeping favorites unless --all is given
    Clear {
        #[arg(long)]
        all: bool,
    },
    /// Write history as JSON to a file or stdout
    Export { path: Option<PathBuf> },
    /// Replace history with a previously exported JSON file
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Connect { url, save_schema } => run_connect(url, save_schema).await,
        Commands::Ask {
            question,
            url,
            schema,
            allow_writes,
            locale,
            privacy,
            anonymize,
            csv,
            max_repairs,
        } => {
            let options = AskOptions {
                question,
                url,
                schema,
                allow_writes,
                locale,
                privacy,
                anonymize,
                csv,
                max_repairs,
            };
            run_ask(options, &args.history_db, &args.cache_file).await
        }
        Commands::Demo => {
            let schema = Schema::demo();
            println!("{}", compact_schema(&schema));
            println!("\n{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::History { action } => run_history(action, &args.history_db),
    }
}

fn database_url(url: Option<String>) -> Result<(String, Dialect)> {
    let url = url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow!("No database URL given (use --url or set DATABASE_URL)"))?;
    let dialect = Dialect::detect(&url)
        .ok_or_else(|| anyhow!("Could not detect database type. Use postgresql:// or mysql:// prefix."))?;
    Ok((url, dialect))
}

async fn run_connect(url: Option<String>, save_schema: Option<PathBuf>) -> Result<()> {
    let (url, dialect) = database_url(url)?;
    let mut adapter = create_adapter(dialect, &url);
    let info = connect_and_describe(adapter.as_mut()).await?;

    println!("Connected to {} ({})", dialect, if info.is_read_only { "read-only" } else { "read-write" });
    for table in &info.schema.tables {
        let rows = table.row_count.map(|n| format!(" ~{} rows", n)).unwrap_or_default();
        println!("  {} ({} columns{})", table.name, table.columns.len(), rows);
    }

    if let Some(path) = save_schema {
        std::fs::write(&path, serde_json::to_string_pretty(&info.schema)?)
            .with_context(|| format!("Failed to write schema to {}", path.display()))?;
        info!("Schema written to {}", path.display());
    }
    Ok(())
}

struct AskOptions {
    question: String,
    url: Option<String>,
    schema: Option<PathBuf>,
    allow_writes: bool,
    locale: String,
    privacy: bool,
    anonymize: bool,
    csv: Option<PathBuf>,
    max_repairs: Option<u32>,
}

async fn run_ask(options: AskOptions, history_db: &PathBuf, cache_file: &PathBuf) -> Result<()> {
    let (url, dialect) = database_url(options.url)?;

    let (schema, read_only) = match &options.schema {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read schema from {}", path.display()))?;
            let schema: Schema = serde_json::from_str(&text)?;
            (schema, !options.allow_writes)
        }
        None => {
            let mut adapter = create_adapter(dialect, &url);
            let info = connect_and_describe(adapter.as_mut()).await?;
            if options.allow_writes && info.is_read_only {
                warn!("Connection has no write access, staying read-only");
            }
            (info.schema, info.is_read_only || !options.allow_writes)
        }
    };

    let mut config = PipelineConfig::from_env()?;
    if let Some(max_repairs) = options.max_repairs {
        config.max_repairs = max_repairs;
    }

    let llm = Arc::new(LlmClient::new(LlmConfig::from_env()?));
    let cache = Arc::new(QueryCache::new(CacheConfig {
        path: Some(cache_file.clone()),
        ..CacheConfig::default()
    }));
    let history = Arc::new(HistoryStore::open(history_db)?);
    let orchestrator = QueryOrchestrator::with_llm(config, llm)
        .with_cache(cache)
        .with_history(history);

    let request = QueryRequest {
        connection_identity: url.clone(),
        question: options.question,
        schema,
        dialect,
        read_only,
        locale: options.locale,
        privacy: options.privacy,
        anonymize: options.anonymize,
    };

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let mut adapter = create_adapter(dialect, &url);
    let response = orchestrator.run(&request, adapter.as_mut(), &cancel).await;

    if !response.success {
        return Err(anyhow!(response.error.unwrap_or_else(|| "Query failed".to_string())));
    }

    if let Some(sql) = &response.sql {
        println!("{}\n", sql);
    }
    if response.was_repaired {
        println!("(query was repaired after a database error)");
    }
    if response.cached {
        println!("(from cache)");
    }
    if let Some(summary) = &response.summary {
        println!("{}\n", summary);
    }

    match &options.csv {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_csv(file, &response.rows, &response.columns)?;
            println!("{} rows written to {}", response.rows.len(), path.display());
        }
        None => write_csv(std::io::stdout(), &response.rows, &response.columns)?,
    }

    Ok(())
}

fn print_items(items: &[HistoryItem]) {
    if items.is_empty() {
        println!("No queries.");
        return;
    }
    for item in items {
        let star = if item.is_favorite { "*" } else { " " };
        let when = chrono::DateTime::from_timestamp_millis(item.timestamp)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{} {}  {}  {} ({} rows)", star, item.id, when, item.question, item.result_count);
        println!("    {}", item.sql);
    }
}

fn run_history(action: HistoryAction, history_db: &PathBuf) -> Result<()> {
    let store = HistoryStore::open(history_db)?;

    match action {
        HistoryAction::List => print_items(&store.history()?),
        HistoryAction::Favorites => print_items(&store.favorites()?),
        HistoryAction::Search { text } => print_items(&store.search(&text)?),
        HistoryAction::Favorite { id } => {
            if !store.toggle_favorite(&id)? {
                return Err(anyhow!("No history entry with id {}", id));
            }
        }
        HistoryAction::Delete { id } => {
            if !store.delete(&id)? {
                return Err(anyhow!("No history entry with id {}", id));
            }
        }
        HistoryAction::Clear { all } => store.clear(!all)?,
        HistoryAction::Export { path } => {
            let json = store.export_json()?;
            match path {
                Some(path) => std::fs::write(&path, json)?,
                None => println!("{}", json),
            }
        }
        HistoryAction::Import { path } => {
            let text = std::fs::read_to_string(&path)?;
            if !store.import_json(&text)? {
                return Err(anyhow!("{} is not a valid history export", path.display()));
            }
        }
    }
    Ok(())
}
