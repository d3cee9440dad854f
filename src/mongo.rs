//! MongoDB connection bootstrap.

use mongodb::{options::ClientOptions, Client};
use std::time::Duration;

/// Connect to MongoDB with bounded connect/server-selection timeouts so
/// a wrong URI fails fast instead of hanging.
pub async fn connect(uri: &str) -> anyhow::Result<Client> {
    tracing::debug!("Parsing MongoDB connection options");
    let mut options = ClientOptions::parse(uri).await?;
    options.connect_timeout = Some(Duration::from_secs(10));
    options.server_selection_timeout = Some(Duration::from_secs(10));

    let client = Client::with_options(options)?;
    tracing::info!("Connected to MongoDB");
    Ok(client)
}
