//! mongo-postgres-sync Library
//!
//! A library for replicating MongoDB collections into PostgreSQL tables
//! according to a declarative YAML mapping.
//!
//! # Features
//!
//! - Schema-driven projection: nested documents become flat rows, with
//!   dotted-path extraction, array cross-expansion into multiple rows,
//!   ObjectId/binary coercion, and JSON overflow capture
//! - Bulk import: COPY-based streaming of whole collections
//! - Incremental synchronization: idempotent upsert/delete plus
//!   position-based reconciliation of related child tables
//! - Change-stream tailing to keep the relational copy current
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the mapped tables
//! mongo-postgres-sync create-tables --mapping collections.yml \
//!   --postgres-uri postgresql://localhost/blog
//!
//! # Seed them from MongoDB
//! mongo-postgres-sync import --mapping collections.yml \
//!   --mongo-uri mongodb://localhost:27017 \
//!   --postgres-uri postgresql://localhost/blog
//!
//! # Keep them in sync
//! mongo-postgres-sync tail --mapping collections.yml \
//!   --mongo-uri mongodb://localhost:27017 \
//!   --postgres-uri postgresql://localhost/blog
//! ```

use clap::Parser;

pub mod copy;
pub mod import;
pub mod mongo;
pub mod postgres;
pub mod schema;
pub mod sync;
pub mod tail;
pub mod transform;
pub mod value;

pub use schema::{Catalog, CollectionSchema, ColumnSpec, SchemaError};
pub use sync::SyncEngine;
pub use transform::TransformError;
pub use value::{PgValue, SqlTypeFamily};

#[derive(Parser, Clone)]
pub struct SourceOpts {
    /// MongoDB connection string
    #[arg(
        long,
        default_value = "mongodb://localhost:27017",
        env = "MONGO_URL"
    )]
    pub mongo_uri: String,
}

#[derive(Parser, Clone)]
pub struct SinkOpts {
    /// PostgreSQL connection string
    #[arg(
        long,
        default_value = "postgresql://localhost:5432",
        env = "POSTGRES_URL"
    )]
    pub postgres_uri: String,

    /// Put mapped tables into this PostgreSQL schema instead of the
    /// connection default
    #[arg(long)]
    pub pg_schema: Option<String>,

    /// Batch size for bulk import
    #[arg(long, default_value = "1000")]
    pub batch_size: usize,

    /// Dry run mode - don't actually write data
    #[arg(long)]
    pub dry_run: bool,
}
