//! # Polarion Copilot CLI (`copilot`)
//!
//! Builds and maintains vector indexes over Polarion work items and answers
//! questions against them.
//!
//! ## Usage
//!
//! ```bash
//! copilot --config ./config/copilot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `copilot init` | Create the SQLite database and run schema migrations |
//! | `copilot save` | Build a new index for a location, release, and set of types |
//! | `copilot update <db_id>` | Append items changed since the last update |
//! | `copilot resume` | Embed every pending cache entry |
//! | `copilot catalog list` | List persisted indexes |
//! | `copilot catalog clean` | Reconcile the catalog with the index directory |
//! | `copilot cache list` | List pending cache entries |
//! | `copilot cache drop <db_id>` | Discard a pending cache entry |
//! | `copilot search <db_id> "<query>"` | Retrieve scored chunks |
//! | `copilot ask [--index <db_id>] ["<question>"]` | Stream an answer, or chat interactively |
//! | `copilot status` | Configuration and storage overview |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polarion_copilot::models::{IndexKey, LocationType, TypeSet, WorkItemType};
use polarion_copilot::progress::ProgressMode;
use polarion_copilot::sync::SyncRequest;
use polarion_copilot::{cache, catalog, chat, config, migrate, search, show, sync};

/// Polarion Copilot: retrieval-augmented chat over Polarion work items.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/copilot.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "copilot",
    about = "Retrieval-augmented chat over Polarion work items",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/copilot.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off`
    /// otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Build a new index.
    ///
    /// Fetches the matching work items, merges continuation fragments,
    /// normalizes and chunks them, and embeds the chunks. If records for the
    /// same target are already staged from an interrupted run, they are
    /// embedded without querying Polarion again.
    Save {
        /// Project id or project group id.
        #[arg(long)]
        location: String,

        #[arg(long, value_enum, default_value = "project")]
        location_type: LocationType,

        /// Work-item types, comma-separated
        /// (requirement, safetydecision, hazard, failuremode).
        #[arg(long, value_delimiter = ',', required = true)]
        types: Vec<WorkItemType>,

        /// Release title in the configuration project. Omit for all releases.
        #[arg(long)]
        release: Option<String>,
    },

    /// Append work items created or updated since the index's last update.
    Update { db_id: String },

    /// Embed every pending cache entry left by failed or interrupted runs.
    Resume,

    /// Inspect and maintain the index catalog.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Inspect pending cache entries.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Retrieve the chunks of an index most similar to a query.
    Search {
        db_id: String,
        query: String,

        /// Number of chunks to return (default: `retrieval.k`).
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Ask a question, grounded in an index when `--index` is given.
    ///
    /// Without a question, starts an interactive session on stdin where
    /// earlier turns are sent along with each new question.
    Ask {
        question: Option<String>,

        #[arg(long = "index")]
        db_id: Option<String>,

        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Show configuration and storage status.
    Status,
}

#[derive(Subcommand)]
enum CatalogAction {
    List,
    /// Drop entries whose index is missing and report unreferenced index
    /// directories.
    Clean {
        /// Delete unreferenced index directories.
        #[arg(long)]
        prune_orphans: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    List,
    Drop { db_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polarion_copilot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Save {
            location,
            location_type,
            types,
            release,
        } => {
            let key = IndexKey {
                location,
                location_type,
                release: release.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
                item_types: TypeSet::new(types),
            };
            sync::run_sync(&cfg, SyncRequest::Create(key), progress.as_ref()).await?;
        }
        Commands::Update { db_id } => {
            sync::run_sync(&cfg, SyncRequest::Update { db_id }, progress.as_ref()).await?;
        }
        Commands::Resume => {
            sync::run_resume(&cfg, progress.as_ref()).await?;
        }
        Commands::Catalog { action } => match action {
            CatalogAction::List => catalog::run_list(&cfg).await?,
            CatalogAction::Clean { prune_orphans } => {
                catalog::run_clean(&cfg, prune_orphans).await?;
            }
        },
        Commands::Cache { action } => match action {
            CacheAction::List => cache::run_list(&cfg).await?,
            CacheAction::Drop { db_id } => cache::run_drop(&cfg, &db_id).await?,
        },
        Commands::Search { db_id, query, k } => {
            search::run_search(&cfg, &db_id, &query, k).await?;
        }
        Commands::Ask { question, db_id, k } => {
            chat::run_ask(&cfg, db_id.as_deref(), question.as_deref(), k).await?;
        }
        Commands::Status => {
            show::run_status(&cfg).await?;
        }
    }

    Ok(())
}
