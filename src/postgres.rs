//! PostgreSQL connection bootstrap.

use crate::schema::quote_ident;
use tokio_postgres::{Client, NoTls};

/// Connect to PostgreSQL and optionally switch to a dedicated schema.
///
/// When a schema name is given it is created if absent and put at the
/// front of the connection's search path, so every unqualified table
/// reference lands there.
pub async fn connect(uri: &str, pg_schema: Option<&str>) -> anyhow::Result<Client> {
    tracing::debug!("Connecting to PostgreSQL");
    let (client, connection) = tokio_postgres::connect(uri, NoTls).await?;

    // The connection object drives the socket; it must be polled for the
    // client to make progress.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {e}");
        }
    });

    if let Some(schema) = pg_schema {
        client
            .execute(
                format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)).as_str(),
                &[],
            )
            .await?;
        client
            .execute(
                format!("SET search_path TO {}", quote_ident(schema)).as_str(),
                &[],
            )
            .await?;
        tracing::info!("Using PostgreSQL schema '{schema}'");
    }

    tracing::info!("Connected to PostgreSQL");
    Ok(client)
}
