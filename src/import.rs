//! Initial full-collection import.
//!
//! A bulk caller of the projector and loader: every mapped collection is
//! streamed out of MongoDB in batches and copied into its table, then
//! into each relation's table. Run it once before tailing to seed the
//! relational copy.

use crate::copy;
use crate::schema::Catalog;
use bson::{doc, Document};
use tokio_postgres::Client;

#[derive(Clone, Debug)]
pub struct ImportOpts {
    /// Documents per COPY batch.
    pub batch_size: usize,
    /// Project and count, but do not write.
    pub dry_run: bool,
}

/// Import every mapped collection.
pub async fn run(
    catalog: &Catalog,
    mongo: &mongodb::Client,
    pg: &Client,
    opts: &ImportOpts,
) -> anyhow::Result<()> {
    let mut total = 0u64;
    for db in catalog.databases() {
        let mongo_db = mongo.database(db);
        for collection_name in catalog.collections_for_database(db) {
            let ns = format!("{db}.{collection_name}");
            total += import_collection(catalog, &mongo_db, pg, &ns, collection_name, opts).await?;
        }
    }
    tracing::info!("Import completed: {total} documents copied");
    Ok(())
}

async fn import_collection(
    catalog: &Catalog,
    mongo_db: &mongodb::Database,
    pg: &Client,
    ns: &str,
    collection_name: &str,
    opts: &ImportOpts,
) -> anyhow::Result<u64> {
    tracing::info!("Importing collection: {ns}");
    let collection = mongo_db.collection::<Document>(collection_name);

    let total_docs = collection.count_documents(doc! {}).await?;
    tracing::info!("Collection '{ns}' contains {total_docs} documents");
    if total_docs == 0 {
        return Ok(0);
    }

    let mut cursor = collection.find(doc! {}).await?;
    let mut batch: Vec<Document> = Vec::with_capacity(opts.batch_size);
    let mut processed = 0u64;

    while cursor.advance().await? {
        let document: Document = cursor.current().try_into()?;
        batch.push(document);

        if batch.len() >= opts.batch_size {
            flush_batch(catalog, pg, ns, &batch, opts.dry_run).await?;
            processed += batch.len() as u64;
            tracing::info!("Processed {processed}/{total_docs} documents from '{ns}'");
            batch.clear();
        }
    }

    if !batch.is_empty() {
        flush_batch(catalog, pg, ns, &batch, opts.dry_run).await?;
        processed += batch.len() as u64;
    }

    tracing::info!("Completed import of '{ns}': {processed} documents");
    Ok(processed)
}

async fn flush_batch(
    catalog: &Catalog,
    pg: &Client,
    ns: &str,
    batch: &[Document],
    dry_run: bool,
) -> anyhow::Result<()> {
    if dry_run {
        tracing::debug!("Dry-run: would copy {} documents into {ns}", batch.len());
        return Ok(());
    }

    copy::bulk_load(pg, catalog, ns, batch).await?;

    // Child rows are loaded through the relation namespaces, from the
    // same batch of parent documents.
    let schema = catalog.find_required(ns)?;
    for (relation, _) in &schema.related {
        let rns = format!("{ns}.{relation}");
        copy::bulk_load(pg, catalog, &rns, batch).await?;
    }
    Ok(())
}
