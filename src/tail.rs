//! Change-stream driver.
//!
//! Watches each mapped source database and feeds every event to the sync
//! engine: inserts, updates and replacements upsert the row and
//! reconcile its related tables; deletes remove the children and then
//! the row, keyed by the event's document key. Delivery guarantees and
//! resumability are the caller's concern, not this driver's.

use crate::schema::Catalog;
use crate::sync::SyncEngine;
use crate::transform::TransformError;
use bson::Document;
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};

/// Tail every mapped source database until the stream ends or a sink
/// error occurs.
pub async fn run(
    catalog: &Catalog,
    mongo: &mongodb::Client,
    engine: &SyncEngine,
) -> anyhow::Result<()> {
    let tails = catalog
        .databases()
        .into_iter()
        .map(|db| tail_database(catalog, mongo, engine, db.to_string()));
    futures::future::try_join_all(tails).await?;
    Ok(())
}

async fn tail_database(
    catalog: &Catalog,
    mongo: &mongodb::Client,
    engine: &SyncEngine,
    db: String,
) -> anyhow::Result<()> {
    tracing::info!("Tailing change stream for database '{db}'");
    let database = mongo.database(&db);

    // UpdateLookup makes update events carry the full post-image, which
    // is what projection needs.
    let options = ChangeStreamOptions::builder()
        .full_document(Some(FullDocumentType::UpdateLookup))
        .build();
    let mut stream = database.watch().with_options(options).await?;

    while let Some(event) = stream.next().await {
        let event = event?;
        handle_event(catalog, engine, &db, event).await?;
    }

    tracing::info!("Change stream for '{db}' ended");
    Ok(())
}

async fn handle_event(
    catalog: &Catalog,
    engine: &SyncEngine,
    db: &str,
    event: ChangeStreamEvent<Document>,
) -> anyhow::Result<()> {
    let collection = match event.ns.as_ref().and_then(|ns| ns.coll.as_deref()) {
        Some(coll) => coll,
        None => return Ok(()),
    };
    let ns = format!("{db}.{collection}");
    if catalog.find(&ns).is_none() {
        tracing::debug!("No mapping for namespace: {ns}");
        return Ok(());
    }

    match event.operation_type {
        OperationType::Insert | OperationType::Update | OperationType::Replace => {
            let Some(document) = event.full_document else {
                tracing::warn!("Change event for {ns} carried no document, skipping");
                return Ok(());
            };
            apply_upsert(engine, &ns, &document).await
        }
        OperationType::Delete => {
            let Some(key) = event.document_key else {
                tracing::warn!("Delete event for {ns} carried no document key, skipping");
                return Ok(());
            };
            engine.delete_related(&ns, &key).await?;
            engine.delete_row(&ns, &key).await
        }
        other => {
            tracing::debug!("Ignoring change stream operation {other:?} for {ns}");
            Ok(())
        }
    }
}

/// Apply an upsert, skipping documents whose shape defeats projection.
/// Sink errors stay fatal.
async fn apply_upsert(engine: &SyncEngine, ns: &str, document: &Document) -> anyhow::Result<()> {
    let result = async {
        engine.upsert_row(ns, document).await?;
        engine.reconcile_related(ns, document).await
    }
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.downcast_ref::<TransformError>().is_some() => {
            tracing::warn!("Skipping unprojectable document in {ns}: {e:#}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
