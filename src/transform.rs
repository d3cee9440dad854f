//! Projection of documents into relational rows.
//!
//! One document turns into one row, or into several when a column's
//! source path iterates an embedded array. Extraction is a
//! non-destructive read: the document is never mutated, and the set of
//! consumed top-level keys is tracked explicitly so the residual-JSON
//! column can be computed afterwards without aliasing hazards.

use crate::schema::CollectionSchema;
use crate::value::{bson_to_pg, PgValue, SqlTypeFamily};
use bson::{Bson, Document};
use std::collections::HashMap;

/// Error type for data-shape problems during projection.
///
/// Fatal to the triggering projection; the caller decides whether to
/// skip the document or abort.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// An array-marker path segment found a non-array value.
    #[error("expected array at '{key}' while resolving '{path}', got {found}")]
    ExpectedArray {
        path: String,
        key: String,
        found: &'static str,
    },
}

/// One projected row, aligned 1:1 with the schema's column order (plus
/// the trailing extra-properties value when enabled).
pub type Row = Vec<PgValue>;

/// Result of resolving a dotted path: a single value, or a sequence when
/// a path segment carried the array marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    One(Bson),
    Many(Vec<Resolved>),
}

impl Resolved {
    /// Flatten nested sequences into one list of scalars.
    pub fn flattened(&self) -> Vec<Bson> {
        match self {
            Resolved::One(v) => vec![v.clone()],
            Resolved::Many(items) => items.iter().flat_map(|r| r.flattened()).collect(),
        }
    }
}

/// Resolve a dotted path against a document without mutating it.
///
/// Missing intermediate keys yield `Null`, not a failure. A segment
/// ending in `[]` reads the named key as an array (absent key counts as
/// empty) and applies the remaining path to every element independently.
pub fn resolve_dotted(doc: &Document, path: &str) -> Result<Resolved, TransformError> {
    resolve_inner(doc, path, path)
}

fn resolve_inner(doc: &Document, path: &str, full_path: &str) -> Result<Resolved, TransformError> {
    let (key, rest) = match path.split_once('.') {
        Some((key, rest)) => (key, Some(rest)),
        None => (path, None),
    };

    if let Some(name) = key.strip_suffix("[]") {
        let items = match doc.get(name) {
            None | Some(Bson::Null) => &[][..],
            Some(Bson::Array(items)) => items.as_slice(),
            Some(other) => {
                return Err(TransformError::ExpectedArray {
                    path: full_path.to_string(),
                    key: name.to_string(),
                    found: bson_kind(other),
                })
            }
        };
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            resolved.push(match rest {
                None => Resolved::One(item.clone()),
                Some(rest) => match item.as_document() {
                    Some(nested) => resolve_inner(nested, rest, full_path)?,
                    None => Resolved::One(Bson::Null),
                },
            });
        }
        return Ok(Resolved::Many(resolved));
    }

    match rest {
        None => Ok(Resolved::One(doc.get(key).cloned().unwrap_or(Bson::Null))),
        Some(rest) => match doc.get(key).and_then(Bson::as_document) {
            Some(nested) => resolve_inner(nested, rest, full_path),
            None => Ok(Resolved::One(Bson::Null)),
        },
    }
}

enum Cell {
    Scalar(PgValue),
    Sequence(Vec<PgValue>),
}

/// Project one document into rows for the given schema.
///
/// Source paths are memoized per call, so columns sharing a source (the
/// primary key and a synthesized creation timestamp, typically) extract
/// it only once. When no column resolves to a sequence the result is
/// exactly one row; otherwise the row is cross-expanded positionally,
/// each sequence cycling its elements up to the longest sequence's
/// length. A document whose arrays are all empty projects to zero rows.
pub fn project(schema: &CollectionSchema, doc: &Document) -> Result<Vec<Row>, TransformError> {
    let mut resolved: HashMap<&str, Resolved> = HashMap::new();
    let mut cells = Vec::with_capacity(schema.columns.len() + 1);

    for column in &schema.columns {
        if !resolved.contains_key(column.source.as_str()) {
            let value = resolve_dotted(doc, &column.source)?;
            resolved.insert(column.source.as_str(), value);
        }
        let cell = match &resolved[column.source.as_str()] {
            Resolved::One(value) => Cell::Scalar(bson_to_pg(value, column.family())),
            many @ Resolved::Many(_) => Cell::Sequence(
                many.flattened()
                    .iter()
                    .map(|v| bson_to_pg(v, column.family()))
                    .collect(),
            ),
        };
        cells.push(cell);
    }

    if schema.extra_props {
        cells.push(Cell::Scalar(PgValue::Text(residual_json(schema, doc))));
    }

    Ok(expand(cells))
}

/// Serialize every document field not consumed as a column source.
///
/// Binary-valued fields are dropped first: blobs cannot round-trip
/// through text JSON. A consumed key is the leading segment of any
/// column's source path, array marker stripped.
fn residual_json(schema: &CollectionSchema, doc: &Document) -> String {
    let consumed: Vec<&str> = schema
        .columns
        .iter()
        .map(|c| {
            let head = c.source.split('.').next().unwrap_or(&c.source);
            head.strip_suffix("[]").unwrap_or(head)
        })
        .collect();

    let mut residual = serde_json::Map::new();
    for (key, value) in doc {
        if consumed.contains(&key.as_str()) || matches!(value, Bson::Binary(_)) {
            continue;
        }
        residual.insert(key.clone(), value.clone().into_relaxed_extjson());
    }
    serde_json::Value::Object(residual).to_string()
}

/// Cross-expand cells into rows. Scalar cells repeat identically across
/// all output rows; sequence cells supply their `i`-th element,
/// cycling when shorter than the deepest sequence.
fn expand(cells: Vec<Cell>) -> Vec<Row> {
    let depth = cells
        .iter()
        .filter_map(|c| match c {
            Cell::Sequence(items) => Some(items.len()),
            Cell::Scalar(_) => None,
        })
        .max();

    let depth = match depth {
        None => {
            let row = cells
                .into_iter()
                .map(|c| match c {
                    Cell::Scalar(v) => v,
                    Cell::Sequence(_) => unreachable!(),
                })
                .collect();
            return vec![row];
        }
        Some(depth) => depth,
    };

    (0..depth)
        .map(|i| {
            cells
                .iter()
                .map(|cell| match cell {
                    Cell::Scalar(v) => v.clone(),
                    Cell::Sequence(items) if items.is_empty() => PgValue::Null,
                    Cell::Sequence(items) => items[i % items.len()].clone(),
                })
                .collect()
        })
        .collect()
}

/// Destination column names in declaration order, with the
/// extra-properties column appended last when enabled.
pub fn all_columns(schema: &CollectionSchema) -> Vec<&str> {
    let mut columns: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
    if schema.extra_props {
        columns.push("_extra_props");
    }
    columns
}

/// Column families in the same order as [`all_columns`], for parameter
/// binding.
pub fn all_families(schema: &CollectionSchema) -> Vec<SqlTypeFamily> {
    let mut families: Vec<SqlTypeFamily> = schema.columns.iter().map(|c| c.family()).collect();
    if schema.extra_props {
        families.push(SqlTypeFamily::Text);
    }
    families
}

fn bson_kind(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "document",
        Bson::Boolean(_) => "boolean",
        Bson::Null => "null",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::ObjectId(_) => "objectid",
        Bson::DateTime(_) => "datetime",
        Bson::Binary(_) => "binary",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Catalog;
    use bson::doc;

    fn posts_schema() -> CollectionSchema {
        let catalog = Catalog::parse(
            r#"
blog:
  posts:
    meta:
      table: posts
    columns:
      - id:
        source: _id
        type: TEXT
      - title: TEXT
      - tag:
        source: tags[]
        type: TEXT
"#,
        )
        .unwrap();
        catalog.find("blog.posts").unwrap()
    }

    #[test]
    fn test_resolve_dotted_descends() {
        let doc = doc! { "a": { "b": 5 } };
        assert_eq!(
            resolve_dotted(&doc, "a.b").unwrap(),
            Resolved::One(Bson::Int32(5))
        );
    }

    #[test]
    fn test_resolve_dotted_missing_is_null() {
        let doc = doc! { "a": {} };
        assert_eq!(
            resolve_dotted(&doc, "a.b").unwrap(),
            Resolved::One(Bson::Null)
        );
        assert_eq!(
            resolve_dotted(&doc, "x.y.z").unwrap(),
            Resolved::One(Bson::Null)
        );
    }

    #[test]
    fn test_resolve_array_marker() {
        let doc = doc! { "arr": [ { "x": 1 }, { "x": 2 } ] };
        let resolved = resolve_dotted(&doc, "arr[].x").unwrap();
        assert_eq!(
            resolved.flattened(),
            vec![Bson::Int32(1), Bson::Int32(2)]
        );
    }

    #[test]
    fn test_resolve_absent_array_is_empty() {
        let doc = doc! {};
        assert_eq!(
            resolve_dotted(&doc, "arr[]").unwrap(),
            Resolved::Many(vec![])
        );
    }

    #[test]
    fn test_resolve_non_array_fails() {
        let doc = doc! { "arr": 3 };
        match resolve_dotted(&doc, "arr[].x") {
            Err(TransformError::ExpectedArray { key, found, .. }) => {
                assert_eq!(key, "arr");
                assert_eq!(found, "int32");
            }
            other => panic!("expected ExpectedArray, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_does_not_mutate_document() {
        let doc = doc! { "a": { "b": 5 }, "arr": [ { "x": 1 } ] };
        let before = doc.clone();
        resolve_dotted(&doc, "a.b").unwrap();
        resolve_dotted(&doc, "arr[].x").unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn test_project_scalar_document_is_one_row() {
        let schema = posts_schema();
        let doc = doc! { "_id": "p1", "title": "hello", "tags": ["a"] };
        let rows = project(&schema, &doc).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], PgValue::Text("p1".to_string()));
        assert_eq!(rows[0][1], PgValue::Text("hello".to_string()));
    }

    #[test]
    fn test_project_expands_arrays() {
        let schema = posts_schema();
        let doc = doc! { "_id": "p1", "title": "hello", "tags": ["a", "b", "c"] };
        let rows = project(&schema, &doc).unwrap();

        assert_eq!(rows.len(), 3);
        for (i, tag) in ["a", "b", "c"].iter().enumerate() {
            // Scalar columns repeat identically across all rows.
            assert_eq!(rows[i][0], PgValue::Text("p1".to_string()));
            assert_eq!(rows[i][1], PgValue::Text("hello".to_string()));
            assert_eq!(rows[i][2], PgValue::Text(tag.to_string()));
        }
    }

    #[test]
    fn test_project_cycles_shorter_sequences() {
        let catalog = Catalog::parse(
            r#"
blog:
  posts:
    meta:
      table: posts
    columns:
      - a:
        source: xs[]
        type: INTEGER
      - b:
        source: ys[]
        type: INTEGER
"#,
        )
        .unwrap();
        let schema = catalog.find("blog.posts").unwrap();
        let doc = doc! { "xs": [1, 2, 3, 4], "ys": [10, 20] };
        let rows = project(&schema, &doc).unwrap();

        assert_eq!(rows.len(), 4);
        let ys: Vec<_> = rows.iter().map(|r| r[1].clone()).collect();
        assert_eq!(
            ys,
            vec![
                PgValue::Int32(10),
                PgValue::Int32(20),
                PgValue::Int32(10),
                PgValue::Int32(20)
            ]
        );
    }

    #[test]
    fn test_project_empty_arrays_yield_no_rows() {
        let schema = posts_schema();
        let doc = doc! { "_id": "p1", "title": "hello", "tags": [] };
        let rows = project(&schema, &doc).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_extra_props_residual() {
        let catalog = Catalog::parse(
            r#"
blog:
  posts:
    meta:
      table: posts
      extraProps: true
    columns:
      - id:
        source: _id
        type: TEXT
      - author: TEXT
"#,
        )
        .unwrap();
        let schema = catalog.find("blog.posts").unwrap();
        let doc = doc! {
            "_id": "p1",
            "author": "amy",
            "score": 4,
            "blob": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: vec![0, 159] },
        };
        let rows = project(&schema, &doc).unwrap();
        assert_eq!(rows.len(), 1);

        let residual = match rows[0].last().unwrap() {
            PgValue::Text(s) => serde_json::from_str::<serde_json::Value>(s).unwrap(),
            other => panic!("expected text residual, got {other:?}"),
        };
        // Consumed sources and binary blobs are excluded, the rest kept.
        assert_eq!(residual, serde_json::json!({ "score": 4 }));
    }

    #[test]
    fn test_shared_source_extracted_once() {
        let catalog = Catalog::parse(
            r#"
blog:
  posts:
    meta:
      table: posts
      createdAt: true
    columns:
      - id:
        source: _id
        type: TEXT
"#,
        )
        .unwrap();
        let schema = catalog.find("blog.posts").unwrap();
        let oid = bson::oid::ObjectId::from_bytes([
            0x5f, 0, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4,
        ]);
        let rows = project(&schema, &doc! { "_id": oid }).unwrap();

        assert_eq!(rows.len(), 1);
        // Same source, two destinations with different coercions.
        assert_eq!(rows[0][0], PgValue::Text(oid.to_hex()));
        assert_eq!(
            rows[0][1],
            PgValue::Timestamp(
                chrono::DateTime::from_timestamp(0x5f000000, 0)
                    .unwrap()
                    .naive_utc()
            )
        );
    }

    #[test]
    fn test_all_columns_appends_extra_props() {
        let catalog = Catalog::parse(
            r#"
blog:
  posts:
    meta:
      table: posts
      extraProps: true
    columns:
      - id:
        source: _id
        type: TEXT
      - title: TEXT
"#,
        )
        .unwrap();
        let schema = catalog.find("blog.posts").unwrap();
        assert_eq!(all_columns(&schema), vec!["id", "title", "_extra_props"]);
    }
}
