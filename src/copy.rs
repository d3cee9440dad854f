//! Bulk row streaming over the COPY text protocol.
//!
//! One line per row, tab-separated fields in schema column order, `\N`
//! for null, `t`/`f` for booleans, and a backslash prepended to any
//! backslash, tab, carriage return or line feed inside a value. The
//! whole stream is all-or-nothing: any failure aborts the COPY and the
//! caller gets a single error, with no partial commit and no row-level
//! retry.

use crate::schema::{quote_ident, Catalog};
use crate::transform::{self, Row};
use crate::value::PgValue;
use bson::Document;
use bytes::Bytes;
use futures::SinkExt;
use tokio_postgres::Client;

/// Render one field for the COPY stream.
pub fn quote_copy(value: &PgValue) -> String {
    match value {
        PgValue::Null => "\\N".to_string(),
        PgValue::Bool(true) => "t".to_string(),
        PgValue::Bool(false) => "f".to_string(),
        PgValue::Int16(i) => i.to_string(),
        PgValue::Int32(i) => i.to_string(),
        PgValue::Int64(i) => i.to_string(),
        PgValue::Float32(f) => f.to_string(),
        PgValue::Float64(f) => f.to_string(),
        PgValue::Numeric(d) => d.to_string(),
        PgValue::Text(s) => escape_copy(s),
        PgValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        PgValue::Time(t) => t.format("%H:%M:%S%.6f").to_string(),
        PgValue::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        PgValue::TimestampTz(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string(),
        PgValue::Json(j) => escape_copy(&j.to_string()),
    }
}

fn escape_copy(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '\t' | '\n' | '\r') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Encode one row as a COPY line, including the terminating newline.
pub fn encode_row(row: &Row) -> String {
    let mut line = row
        .iter()
        .map(quote_copy)
        .collect::<Vec<_>>()
        .join("\t");
    line.push('\n');
    line
}

/// Stream pre-projected rows into a table.
pub async fn copy_rows(
    client: &Client,
    table: &str,
    columns: &[&str],
    rows: &[Row],
) -> anyhow::Result<u64> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let statement = format!(
        "COPY {} ({}) FROM STDIN",
        quote_ident(table),
        column_list
    );
    tracing::debug!("Starting bulk copy: {statement}");

    let sink = client.copy_in::<_, Bytes>(statement.as_str()).await?;
    futures::pin_mut!(sink);
    for row in rows {
        sink.send(Bytes::from(encode_row(row).into_bytes())).await?;
    }
    let copied = sink.finish().await?;

    tracing::debug!("Bulk copy of {copied} rows completed");
    Ok(copied)
}

/// Project documents for a namespace and stream the rows to its table.
///
/// Multi-row expansions are flattened into the stream. Callers that need
/// related child rows bulk-load the relation namespace separately with
/// the same documents.
pub async fn bulk_load(
    client: &Client,
    catalog: &Catalog,
    ns: &str,
    documents: &[Document],
) -> anyhow::Result<u64> {
    let schema = catalog.find_required(ns)?;
    let columns = transform::all_columns(&schema);

    let mut rows = Vec::with_capacity(documents.len());
    for document in documents {
        rows.extend(transform::project(&schema, document)?);
    }

    copy_rows(client, &schema.table, &columns, &rows).await
}
