//! # Ingest Harness CLI (`ingest`)
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create the SQLite database and schema |
//! | `ingest connectors` | List connectors and the connections using them |
//! | `ingest collect <connection>` | Fetch raw records from the vendor API |
//! | `ingest extract <connection>` | Turn raw records into tool rows |
//! | `ingest convert <connection>` | Turn tool rows into domain rows |
//! | `ingest sync <connection>` | All three stages in order |
//!
//! Logs go to stderr; `RUST_LOG` overrides `--verbose`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ingest_harness::config;
use ingest_harness::ingest::{self, Stage};
use ingest_harness::migrate;
use ingest_harness::sources;
use ingest_harness::traits::ConnectorRegistry;

/// Ingest Harness: collect, extract and convert developer-tool API data.
#[derive(Parser)]
#[command(name = "ingest", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List registered connectors.
    Connectors,

    /// Collect raw records for a connection.
    Collect(StageArgs),

    /// Extract tool rows from staged raw records.
    Extract(StageArgs),

    /// Convert tool rows into domain rows.
    Convert {
        /// Connection name from `[connections.<name>]`.
        connection: String,
    },

    /// Collect, extract and convert.
    Sync(StageArgs),
}

#[derive(Args)]
struct StageArgs {
    /// Connection name from `[connections.<name>]`.
    connection: String,

    /// Ignore stored cursors and re-collect everything.
    #[arg(long)]
    full: bool,

    /// Only collect data on or after this date (YYYY-MM-DD).
    #[arg(long)]
    since: Option<String>,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "ingest_harness=debug"
    } else {
        "ingest_harness=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let registry = ConnectorRegistry::builtin();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Connectors => {
            sources::list_connectors(&cfg, &registry)?;
        }
        Commands::Collect(args) => {
            ingest::run_stage(&cfg, &registry, Stage::Collect, &args.connection, args.full, args.since)
                .await?;
        }
        Commands::Extract(args) => {
            ingest::run_stage(&cfg, &registry, Stage::Extract, &args.connection, args.full, args.since)
                .await?;
        }
        Commands::Convert { connection } => {
            ingest::run_stage(&cfg, &registry, Stage::Convert, &connection, false, None).await?;
        }
        Commands::Sync(args) => {
            ingest::run_stage(&cfg, &registry, Stage::Sync, &args.connection, args.full, args.since)
                .await?;
        }
    }

    Ok(())
}
