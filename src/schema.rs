//! Declarative collection-to-table mapping.
//!
//! The mapping is authored as YAML, nested `database -> collection -> spec`.
//! [`Catalog::parse`] normalizes it into an immutable catalog that the
//! projector and sync engine query by namespace. A namespace is a dotted
//! identifier: `db.collection` resolves a top-level schema,
//! `db.collection.relation` resolves a related child table.
//!
//! Column entries accept two authoring shapes:
//!
//! ```yaml
//! columns:
//!   - id:
//!     source: _id
//!     type: TEXT
//!   - title: TEXT        # shorthand, source defaults to the name
//! ```

use crate::value::SqlTypeFamily;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio_postgres::Client;

/// Error type for mapping and namespace resolution problems.
///
/// All of these are configuration errors: fatal to the triggering call
/// and never retried.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Error reading the mapping file
    #[error("failed to read mapping file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing YAML
    #[error("failed to parse mapping YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// One or more column entries matched neither accepted shape
    #[error("invalid column entries for {ns}: {details}")]
    MalformedColumns { ns: String, details: String },

    /// Two columns of one table read from the same source path
    #[error("duplicate source '{src}' in column definition '{column}' for {ns}")]
    DuplicateSource {
        ns: String,
        src: String,
        column: String,
    },

    /// Namespace has no mapping (must-resolve lookup)
    #[error("no mapping for namespace: {0}")]
    NamespaceNotFound(String),

    /// Top-level schema lacks an `_id`-sourced key column
    #[error("no primary key column (source '_id') declared for {0}")]
    MissingPrimaryKey(String),
}

/// One mapping rule from a document field path to a relational column.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    /// Dotted document path; may carry the `[]` array marker on a segment.
    pub source: String,
    /// Destination column name.
    pub name: String,
    /// Declared SQL type tag, emitted verbatim into DDL.
    pub sql_type: String,
    /// Whether an `_id`-sourced column acts as the primary key.
    pub key: bool,
}

impl ColumnSpec {
    pub fn family(&self) -> SqlTypeFamily {
        SqlTypeFamily::classify(&self.sql_type)
    }

    /// Whether the source path iterates an embedded array.
    pub fn expands(&self) -> bool {
        self.source.contains("[]")
    }
}

/// Schema for one collection: destination table, ordered columns, and
/// one-to-many related child tables.
#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub extra_props: bool,
    /// Relation name -> ordered child-table columns, in declaration order.
    pub related: Vec<(String, Vec<ColumnSpec>)>,
}

impl CollectionSchema {
    /// Columns identifying a child row's parent: the ones whose source
    /// carries no array marker and therefore resolves against the parent
    /// document to a single value.
    pub fn foreign_key_columns(&self) -> Vec<&ColumnSpec> {
        self.columns.iter().filter(|c| !c.expands()).collect()
    }

    /// Destination name of the `_id`-sourced key column.
    pub fn primary_key_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.source == "_id" && c.key)
            .map(|c| c.name.as_str())
    }
}

/// Immutable mapping catalog: source database -> collection -> schema.
///
/// Built once at startup and shared by reference across all sync tasks;
/// nothing mutates it after construction.
#[derive(Debug, Default)]
pub struct Catalog {
    map: HashMap<String, HashMap<String, CollectionSchema>>,
}

#[derive(serde::Deserialize)]
struct RawCollection {
    meta: RawMeta,
    columns: Vec<serde_yaml::Value>,
    #[serde(default)]
    related: Option<serde_yaml::Mapping>,
}

#[derive(serde::Deserialize)]
struct RawMeta {
    table: String,
    #[serde(default, rename = "extraProps", alias = "extra_props")]
    extra_props: bool,
    #[serde(default, rename = "createdAt", alias = "created_at")]
    created_at: bool,
}

impl Catalog {
    /// Load and parse a mapping file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a YAML mapping into a catalog.
    pub fn parse(yaml: &str) -> Result<Self, SchemaError> {
        let raw: HashMap<String, HashMap<String, RawCollection>> = serde_yaml::from_str(yaml)?;

        let mut map = HashMap::new();
        for (db, collections) in raw {
            let mut parsed = HashMap::new();
            for (name, spec) in collections {
                let ns = format!("{db}.{name}");
                parsed.insert(name, parse_collection(&ns, spec)?);
            }
            map.insert(db, parsed);
        }
        Ok(Catalog { map })
    }

    /// Resolve a namespace to its schema. A three-segment namespace
    /// resolves the named relation, wrapped as a schema whose table name
    /// is the relation name. Absent mappings are `None`, not an error.
    pub fn find(&self, ns: &str) -> Option<CollectionSchema> {
        let mut parts = ns.splitn(3, '.');
        let db = parts.next()?;
        let collection = parts.next()?;
        let relation = parts.next();

        let schema = self.map.get(db)?.get(collection)?;
        match relation {
            None => Some(schema.clone()),
            Some(rel) => {
                let columns = schema
                    .related
                    .iter()
                    .find(|(name, _)| name == rel)
                    .map(|(_, cols)| cols.clone())?;
                Some(CollectionSchema {
                    table: rel.to_string(),
                    columns,
                    extra_props: false,
                    related: Vec::new(),
                })
            }
        }
    }

    /// Must-resolve variant of [`Catalog::find`].
    pub fn find_required(&self, ns: &str) -> Result<CollectionSchema, SchemaError> {
        self.find(ns)
            .ok_or_else(|| SchemaError::NamespaceNotFound(ns.to_string()))
    }

    /// Destination table name for a namespace.
    pub fn table_for_ns(&self, ns: &str) -> Result<String, SchemaError> {
        Ok(self.find_required(ns)?.table)
    }

    /// Destination name of the primary-key column for a namespace.
    pub fn primary_key_column(&self, ns: &str) -> Result<String, SchemaError> {
        self.find_required(ns)?
            .primary_key_column()
            .map(str::to_string)
            .ok_or_else(|| SchemaError::MissingPrimaryKey(ns.to_string()))
    }

    /// Mapped source database names, sorted for deterministic iteration.
    pub fn databases(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Mapped collection names within one source database, sorted.
    pub fn collections_for_database(&self, db: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .map
            .get(db)
            .map(|c| c.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// DDL for every mapped table, in deterministic order.
    ///
    /// Top-level tables get their declared columns and a primary key on
    /// the `_id`-sourced key column, plus `_extra_props TEXT` when
    /// enabled. Related tables get a synthetic `__id BIGSERIAL` identity;
    /// no foreign-key constraint is created, the relationship is enforced
    /// by reconciliation alone.
    pub fn create_table_statements(&self, clobber: bool) -> Vec<String> {
        let mut statements = Vec::new();
        for db in self.databases() {
            for collection in self.collections_for_database(db) {
                let schema = &self.map[db][collection];
                statements.extend(table_ddl(schema, clobber));
            }
        }
        statements
    }

    /// Issue create-table requests for every mapped table.
    pub async fn create_tables(&self, client: &Client, clobber: bool) -> anyhow::Result<()> {
        for statement in self.create_table_statements(clobber) {
            tracing::info!("Executing DDL: {statement}");
            client.execute(statement.as_str(), &[]).await?;
        }
        Ok(())
    }
}

fn parse_collection(ns: &str, raw: RawCollection) -> Result<CollectionSchema, SchemaError> {
    let mut columns = parse_columns(ns, &raw.columns)?;
    check_duplicate_sources(ns, &columns)?;

    // The synthesized creation-timestamp column shares the `_id` source
    // with the primary key on purpose, so it is added after the
    // uniqueness check; the projector memoizes shared sources.
    if raw.meta.created_at {
        columns.push(ColumnSpec {
            source: "_id".to_string(),
            name: "createdAt".to_string(),
            sql_type: "TIMESTAMP".to_string(),
            key: false,
        });
    }

    let mut related = Vec::new();
    if let Some(rels) = raw.related {
        for (name, entries) in &rels {
            let rel_name = name.as_str().ok_or_else(|| SchemaError::MalformedColumns {
                ns: ns.to_string(),
                details: "relation names must be strings".to_string(),
            })?;
            let rns = format!("{ns}.{rel_name}");
            let entries = entries
                .as_sequence()
                .ok_or_else(|| SchemaError::MalformedColumns {
                    ns: rns.clone(),
                    details: "relation columns must be a sequence".to_string(),
                })?;
            let rel_columns = parse_columns(&rns, entries)?;
            check_duplicate_sources(&rns, &rel_columns)?;
            related.push((rel_name.to_string(), rel_columns));
        }
    }

    Ok(CollectionSchema {
        table: raw.meta.table,
        columns,
        extra_props: raw.meta.extra_props,
        related,
    })
}

/// Normalize column entries, reporting every malformed entry at once
/// rather than failing on the first.
fn parse_columns(ns: &str, entries: &[serde_yaml::Value]) -> Result<Vec<ColumnSpec>, SchemaError> {
    let mut columns = Vec::new();
    let mut malformed = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        match parse_column(entry) {
            Some(column) => columns.push(column),
            None => malformed.push(format!("entry #{index} matches neither accepted shape")),
        }
    }

    if malformed.is_empty() {
        Ok(columns)
    } else {
        Err(SchemaError::MalformedColumns {
            ns: ns.to_string(),
            details: malformed.join("; "),
        })
    }
}

fn parse_column(entry: &serde_yaml::Value) -> Option<ColumnSpec> {
    let map = entry.as_mapping()?;

    let source = entry.get("source").and_then(|v| v.as_str());
    let sql_type = entry.get("type").and_then(|v| v.as_str());
    if let (Some(source), Some(sql_type)) = (source, sql_type) {
        // Explicit triple: the remaining key names the destination column.
        let name = map
            .iter()
            .filter_map(|(k, _)| k.as_str())
            .find(|k| *k != "source" && *k != "type")?;
        return Some(ColumnSpec {
            source: source.to_string(),
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            key: true,
        });
    }

    // Shorthand: single `name: TYPE` entry, source defaults to the name.
    if map.len() == 1 {
        let (name, sql_type) = map.iter().next()?;
        let name = name.as_str()?;
        let sql_type = sql_type.as_str()?;
        return Some(ColumnSpec {
            source: name.to_string(),
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            key: true,
        });
    }

    None
}

fn check_duplicate_sources(ns: &str, columns: &[ColumnSpec]) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for column in columns {
        if !seen.insert(column.source.as_str()) {
            return Err(SchemaError::DuplicateSource {
                ns: ns.to_string(),
                src: column.source.clone(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

fn table_ddl(schema: &CollectionSchema, clobber: bool) -> Vec<String> {
    let mut statements = Vec::new();

    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type))
        .collect();
    if schema.extra_props {
        columns.push(format!("{} TEXT", quote_ident("_extra_props")));
    }
    if let Some(pk) = schema.primary_key_column() {
        columns.push(format!("PRIMARY KEY ({})", quote_ident(pk)));
    }
    statements.extend(create_table(&schema.table, &columns, clobber));

    for (relation, rel_columns) in &schema.related {
        let mut columns = vec![format!("{} BIGSERIAL PRIMARY KEY", quote_ident("__id"))];
        columns.extend(
            rel_columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type)),
        );
        statements.extend(create_table(relation, &columns, clobber));
    }

    statements
}

fn create_table(table: &str, columns: &[String], clobber: bool) -> Vec<String> {
    let mut statements = Vec::new();
    if clobber {
        statements.push(format!("DROP TABLE IF EXISTS {}", quote_ident(table)));
        statements.push(format!(
            "CREATE TABLE {} ({})",
            quote_ident(table),
            columns.join(", ")
        ));
    } else {
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            columns.join(", ")
        ));
    }
    statements
}

/// Quote a SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"
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
      - author: TEXT
    related:
      post_comments:
        - post_id:
          source: _id
          type: TEXT
        - body:
          source: comments[].body
          type: TEXT
  users:
    meta:
      table: users
      createdAt: true
    columns:
      - id:
        source: _id
        type: TEXT
      - name: TEXT
"#;

    #[test]
    fn test_parse_both_column_shapes() {
        let catalog = Catalog::parse(MAPPING).unwrap();
        let posts = catalog.find("blog.posts").unwrap();

        assert_eq!(posts.table, "posts");
        assert!(posts.extra_props);
        assert_eq!(posts.columns.len(), 3);

        // Explicit triple reads the declared source.
        assert_eq!(posts.columns[0].source, "_id");
        assert_eq!(posts.columns[0].name, "id");
        assert_eq!(posts.columns[0].sql_type, "TEXT");

        // Shorthand implies source == destination.
        assert_eq!(posts.columns[1].source, "title");
        assert_eq!(posts.columns[1].name, "title");
    }

    #[test]
    fn test_created_at_synthesized_from_id() {
        let catalog = Catalog::parse(MAPPING).unwrap();
        let users = catalog.find("blog.users").unwrap();

        let created = users.columns.last().unwrap();
        assert_eq!(created.source, "_id");
        assert_eq!(created.name, "createdAt");
        assert_eq!(created.family(), SqlTypeFamily::Timestamp);
        assert!(!created.key);

        // The synthesized column must not become the primary key.
        assert_eq!(users.primary_key_column(), Some("id"));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let yaml = r#"
blog:
  posts:
    meta:
      table: posts
    columns:
      - id:
        source: _id
        type: TEXT
      - ident:
        source: _id
        type: TEXT
"#;
        match Catalog::parse(yaml) {
            Err(SchemaError::DuplicateSource { ns, src: source, column }) => {
                assert_eq!(ns, "blog.posts");
                assert_eq!(source, "_id");
                assert_eq!(column, "ident");
            }
            other => panic!("expected DuplicateSource, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_entries_all_reported() {
        let yaml = r#"
blog:
  posts:
    meta:
      table: posts
    columns:
      - id:
        source: _id
        type: TEXT
      - 17
      - broken: 42
"#;
        match Catalog::parse(yaml) {
            Err(SchemaError::MalformedColumns { ns, details }) => {
                assert_eq!(ns, "blog.posts");
                assert!(details.contains("entry #1"));
                assert!(details.contains("entry #2"));
            }
            other => panic!("expected MalformedColumns, got {other:?}"),
        }
    }

    #[test]
    fn test_namespace_lookup() {
        let catalog = Catalog::parse(MAPPING).unwrap();

        assert!(catalog.find("blog.posts").is_some());
        assert!(catalog.find("blog.missing").is_none());
        assert!(catalog.find("other.posts").is_none());
        assert!(matches!(
            catalog.find_required("blog.missing"),
            Err(SchemaError::NamespaceNotFound(_))
        ));

        // Three-segment namespaces resolve the relation as a schema of
        // its own, named after the relation.
        let comments = catalog.find("blog.posts.post_comments").unwrap();
        assert_eq!(comments.table, "post_comments");
        assert_eq!(comments.columns.len(), 2);
        assert!(!comments.extra_props);
        assert!(comments.related.is_empty());
    }

    #[test]
    fn test_foreign_key_columns_exclude_array_sources() {
        let catalog = Catalog::parse(MAPPING).unwrap();
        let comments = catalog.find("blog.posts.post_comments").unwrap();

        let fks = comments.foreign_key_columns();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].name, "post_id");
    }

    #[test]
    fn test_create_table_statements() {
        let catalog = Catalog::parse(MAPPING).unwrap();
        let ddl = catalog.create_table_statements(false);

        let posts = ddl.iter().find(|s| s.contains("\"posts\"")).unwrap();
        assert!(posts.starts_with("CREATE TABLE IF NOT EXISTS"));
        assert!(posts.contains("\"id\" TEXT"));
        assert!(posts.contains("\"_extra_props\" TEXT"));
        assert!(posts.contains("PRIMARY KEY (\"id\")"));

        let comments = ddl
            .iter()
            .find(|s| s.contains("\"post_comments\""))
            .unwrap();
        assert!(comments.contains("\"__id\" BIGSERIAL PRIMARY KEY"));
        assert!(!comments.contains("REFERENCES"));

        let clobbered = catalog.create_table_statements(true);
        assert!(clobbered
            .iter()
            .any(|s| s.starts_with("DROP TABLE IF EXISTS \"posts\"")));
    }

    #[test]
    fn test_primary_key_column_for_ns() {
        let catalog = Catalog::parse(MAPPING).unwrap();
        assert_eq!(catalog.primary_key_column("blog.posts").unwrap(), "id");

        let yaml = r#"
blog:
  posts:
    meta:
      table: posts
    columns:
      - title: TEXT
"#;
        let catalog = Catalog::parse(yaml).unwrap();
        assert!(matches!(
            catalog.primary_key_column("blog.posts"),
            Err(SchemaError::MissingPrimaryKey(_))
        ));
    }
}
