//! Command-line interface for mongo-postgres-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # Create (or destructively recreate) the mapped tables
//! mongo-postgres-sync create-tables --mapping collections.yml --clobber
//!
//! # Bulk import every mapped collection
//! mongo-postgres-sync import --mapping collections.yml --batch-size 500
//!
//! # Follow change streams and keep PostgreSQL in sync
//! mongo-postgres-sync tail --mapping collections.yml
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use mongo_postgres_sync::{import, mongo, postgres, tail, Catalog, SinkOpts, SourceOpts, SyncEngine};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mongo-postgres-sync")]
#[command(about = "A tool for replicating MongoDB collections into PostgreSQL tables")]
#[command(long_about = None)]
struct Cli {
    /// Collection mapping file (YAML)
    #[arg(long, value_name = "PATH", global = true, default_value = "collections.yml")]
    mapping: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the mapped tables in PostgreSQL
    CreateTables {
        /// Drop and recreate tables that already exist
        #[arg(long)]
        clobber: bool,

        #[command(flatten)]
        sink: SinkOpts,
    },

    /// Bulk import every mapped collection into PostgreSQL
    Import {
        #[command(flatten)]
        source: SourceOpts,

        #[command(flatten)]
        sink: SinkOpts,
    },

    /// Follow MongoDB change streams and keep PostgreSQL in sync
    Tail {
        #[command(flatten)]
        source: SourceOpts,

        #[command(flatten)]
        sink: SinkOpts,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let catalog = Catalog::from_file(&cli.mapping)
        .with_context(|| format!("Failed to load mapping from {:?}", cli.mapping))?;
    tracing::info!(
        "Loaded mapping for {} source database(s)",
        catalog.databases().len()
    );

    match cli.command {
        Commands::CreateTables { clobber, sink } => {
            let pg = postgres::connect(&sink.postgres_uri, sink.pg_schema.as_deref()).await?;
            catalog.create_tables(&pg, clobber).await?;
            tracing::info!("Table creation completed");
        }
        Commands::Import { source, sink } => {
            let mongo = mongo::connect(&source.mongo_uri).await?;
            let pg = postgres::connect(&sink.postgres_uri, sink.pg_schema.as_deref()).await?;

            if sink.dry_run {
                tracing::info!("Running in dry-run mode - no data will be written");
            }

            let opts = import::ImportOpts {
                batch_size: sink.batch_size,
                dry_run: sink.dry_run,
            };
            import::run(&catalog, &mongo, &pg, &opts).await?;
        }
        Commands::Tail { source, sink } => {
            let mongo = mongo::connect(&source.mongo_uri).await?;
            let pg = postgres::connect(&sink.postgres_uri, sink.pg_schema.as_deref()).await?;

            let catalog = Arc::new(catalog);
            let engine = SyncEngine::new(catalog.clone(), pg);
            tail::run(&catalog, &mongo, &engine).await?;
        }
    }

    Ok(())
}
