//! Incremental synchronization against PostgreSQL.
//!
//! Every operation is a self-contained read-modify-write sequence keyed
//! by namespace; no state is carried across calls beyond the sink's own
//! row contents. Concurrent callers for independent documents need no
//! coordination; concurrent upserts of the *same* document are expected
//! and resolved by last-write-wins plus the duplicate-key recovery in
//! [`SyncEngine::upsert_row`].

use crate::schema::{quote_ident, Catalog, CollectionSchema, ColumnSpec};
use crate::transform::{self, resolve_dotted, Resolved, Row};
use crate::value::bson_to_pg;
use anyhow::Context;
use bson::Document;
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

/// Drives single-row upsert, delete, and related-table reconciliation.
pub struct SyncEngine {
    catalog: Arc<Catalog>,
    client: Client,
}

impl SyncEngine {
    pub fn new(catalog: Arc<Catalog>, client: Client) -> Self {
        SyncEngine { catalog, client }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Insert-or-update one document's row, keyed by the primary key.
    ///
    /// A concurrent upsert of the same document may win the race between
    /// our update and insert; the resulting duplicate-key violation is
    /// benign and only logged.
    pub async fn upsert_row(&self, ns: &str, document: &Document) -> anyhow::Result<()> {
        let schema = self.catalog.find_required(ns)?;
        let row = self.project_one(ns, &schema, document)?;
        let columns = transform::all_columns(&schema);
        let families = transform::all_families(&schema);

        let pk_name = self.catalog.primary_key_column(ns)?;
        let pk_index = columns
            .iter()
            .position(|c| *c == pk_name)
            .expect("primary key column is part of the projection");
        let pk_value = row[pk_index].clone();
        let pk_family = families[pk_index];

        let set_list = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let update_sql = format!(
            "UPDATE {} SET {} WHERE {} = ${}",
            quote_ident(&schema.table),
            set_list,
            quote_ident(&pk_name),
            columns.len() + 1
        );

        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = row
            .clone()
            .into_iter()
            .zip(families.iter())
            .map(|(v, f)| v.into_param(*f))
            .collect();
        params.push(pk_value.clone().into_param(pk_family));
        let updated = self
            .client
            .execute(update_sql.as_str(), &param_refs(&params))
            .await?;

        if updated == 0 {
            let placeholders = (1..=columns.len())
                .map(|i| format!("${i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let insert_sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&schema.table),
                column_list(&columns),
                placeholders
            );
            let params: Vec<Box<dyn ToSql + Sync + Send>> = row
                .into_iter()
                .zip(families.iter())
                .map(|(v, f)| v.into_param(*f))
                .collect();
            match self
                .client
                .execute(insert_sql.as_str(), &param_refs(&params))
                .await
            {
                Ok(_) => {}
                Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                    tracing::info!(
                        "Race during upsert of {ns} ({pk_name}={pk_value:?}): a concurrent insert won, ignoring"
                    );
                }
                Err(e) => return Err(e).context(format!("insert into {ns} failed")),
            }
        } else if updated > 1 {
            tracing::warn!(
                "Update affected {updated} rows under presumed-unique key {pk_name}={pk_value:?} in {ns}"
            );
        }

        Ok(())
    }

    /// Delete one document's row by primary key.
    ///
    /// A document that cannot be identified must not silently no-op, so
    /// a null or absent primary-key value is fatal.
    pub async fn delete_row(&self, ns: &str, document: &Document) -> anyhow::Result<()> {
        let schema = self.catalog.find_required(ns)?;
        let row = self.project_one(ns, &schema, document)?;
        let columns = transform::all_columns(&schema);
        let families = transform::all_families(&schema);

        let pk_name = self.catalog.primary_key_column(ns)?;
        let pk_index = columns
            .iter()
            .position(|c| *c == pk_name)
            .expect("primary key column is part of the projection");
        let pk_value = row[pk_index].clone();
        if pk_value.is_null() {
            anyhow::bail!(
                "cannot delete from {ns}: primary key column '{pk_name}' resolved to null"
            );
        }

        let delete_sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(&schema.table),
            quote_ident(&pk_name)
        );
        let params: Vec<Box<dyn ToSql + Sync + Send>> =
            vec![pk_value.into_param(families[pk_index])];
        self.client
            .execute(delete_sql.as_str(), &param_refs(&params))
            .await?;
        Ok(())
    }

    /// Reconcile every related child table of a namespace against the
    /// current document.
    ///
    /// Child rows have no business key, so the diff is positional: the
    /// i-th desired row updates the i-th existing synthetic identity,
    /// further desired rows are inserted, and leftover identities are
    /// deleted. Stable projection order of logically-unchanged data is
    /// what keeps this churn-free.
    pub async fn reconcile_related(&self, ns: &str, document: &Document) -> anyhow::Result<()> {
        let schema = self.catalog.find_required(ns)?;
        for (relation, _) in &schema.related {
            let rns = format!("{ns}.{relation}");
            let rel_schema = self.catalog.find_required(&rns)?;
            self.reconcile_one(&rns, &rel_schema, document)
                .await
                .with_context(|| format!("reconciling {rns}"))?;
        }
        Ok(())
    }

    async fn reconcile_one(
        &self,
        rns: &str,
        rel_schema: &CollectionSchema,
        document: &Document,
    ) -> anyhow::Result<()> {
        let (filter, filter_params) = foreign_key_filter(rel_schema, document)?;

        let select_sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            quote_ident("__id"),
            quote_ident(&rel_schema.table),
            filter,
            quote_ident("__id")
        );
        let existing: Vec<i64> = self
            .client
            .query(select_sql.as_str(), &param_refs(&filter_params))
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let desired = transform::project(rel_schema, document)?;
        let columns = transform::all_columns(rel_schema);
        let families = transform::all_families(rel_schema);

        let mut existing = existing.into_iter();
        for row in desired {
            match existing.next() {
                Some(id) => self.update_child(rel_schema, &columns, &families, row, id).await?,
                None => self.insert_child(rel_schema, &columns, &families, row).await?,
            }
        }

        let leftovers: Vec<i64> = existing.collect();
        if !leftovers.is_empty() {
            tracing::debug!(
                "Deleting {} stale child rows from {rns}",
                leftovers.len()
            );
            let delete_sql = format!(
                "DELETE FROM {} WHERE {} = ANY($1)",
                quote_ident(&rel_schema.table),
                quote_ident("__id")
            );
            self.client
                .execute(delete_sql.as_str(), &[&leftovers])
                .await?;
        }
        Ok(())
    }

    async fn update_child(
        &self,
        rel_schema: &CollectionSchema,
        columns: &[&str],
        families: &[crate::value::SqlTypeFamily],
        row: Row,
        id: i64,
    ) -> anyhow::Result<()> {
        let set_list = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ${}",
            quote_ident(&rel_schema.table),
            set_list,
            quote_ident("__id"),
            columns.len() + 1
        );
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = row
            .into_iter()
            .zip(families.iter())
            .map(|(v, f)| v.into_param(*f))
            .collect();
        params.push(Box::new(id));
        self.client
            .execute(sql.as_str(), &param_refs(&params))
            .await?;
        Ok(())
    }

    async fn insert_child(
        &self,
        rel_schema: &CollectionSchema,
        columns: &[&str],
        families: &[crate::value::SqlTypeFamily],
        row: Row,
    ) -> anyhow::Result<()> {
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&rel_schema.table),
            column_list(columns),
            placeholders
        );
        let params: Vec<Box<dyn ToSql + Sync + Send>> = row
            .into_iter()
            .zip(families.iter())
            .map(|(v, f)| v.into_param(*f))
            .collect();
        self.client
            .execute(sql.as_str(), &param_refs(&params))
            .await?;
        Ok(())
    }

    /// Remove every child row belonging to the document, across all of
    /// the namespace's relations.
    pub async fn delete_related(&self, ns: &str, document: &Document) -> anyhow::Result<()> {
        let schema = self.catalog.find_required(ns)?;
        for (relation, _) in &schema.related {
            let rns = format!("{ns}.{relation}");
            let rel_schema = self.catalog.find_required(&rns)?;
            let (filter, params) = foreign_key_filter(&rel_schema, document)?;
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(&rel_schema.table),
                filter
            );
            self.client
                .execute(sql.as_str(), &param_refs(&params))
                .await
                .with_context(|| format!("deleting children of {rns}"))?;
        }
        Ok(())
    }

    fn project_one(
        &self,
        ns: &str,
        schema: &CollectionSchema,
        document: &Document,
    ) -> anyhow::Result<Row> {
        let mut rows = transform::project(schema, document)?;
        if rows.len() != 1 {
            anyhow::bail!(
                "namespace {ns} projected {} rows, expected exactly one",
                rows.len()
            );
        }
        Ok(rows.remove(0))
    }
}

/// Build the WHERE clause identifying a parent's child rows: every
/// non-expanding relation column, resolved against the parent document.
fn foreign_key_filter(
    rel_schema: &CollectionSchema,
    document: &Document,
) -> anyhow::Result<(String, Vec<Box<dyn ToSql + Sync + Send>>)> {
    let fk_columns: Vec<&ColumnSpec> = rel_schema.foreign_key_columns();
    if fk_columns.is_empty() {
        anyhow::bail!(
            "relation table '{}' declares no parent-derived columns",
            rel_schema.table
        );
    }

    let mut conditions = Vec::with_capacity(fk_columns.len());
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
    for column in fk_columns {
        let value = match resolve_dotted(document, &column.source)? {
            Resolved::One(v) => bson_to_pg(&v, column.family()),
            Resolved::Many(_) => unreachable!("foreign key columns never expand"),
        };
        if value.is_null() {
            conditions.push(format!("{} IS NULL", quote_ident(&column.name)));
        } else {
            params.push(value.into_param(column.family()));
            conditions.push(format!("{} = ${}", quote_ident(&column.name), params.len()));
        }
    }
    Ok((conditions.join(" AND "), params))
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn param_refs(params: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}
