//! The collection map: which namespaces replicate where, and how documents
//! become rows.
//!
//! The map is declared in YAML, one block per database, one per collection:
//!
//! ```yaml
//! blog:
//!   posts:
//!     meta:
//!       table: posts
//!       extra_props: true
//!       filter:
//!         visible: true
//!     columns:
//!       - id:
//!           source: _id
//!           type: TEXT
//!       - title: TEXT
//!       - author_name:
//!           source: author.name
//!           type: TEXT
//! ```
//!
//! A column is either `name: TYPE` shorthand (source field and column share
//! the name) or the full `source`/`type` form. `source` may be a dotted path
//! into nested documents. The columns whose source is `_id` form the
//! destination primary key. With `extra_props`, whatever the columns didn't
//! consume lands in a `_extra_props` JSONB column.

use crate::error::{Result, SyncError};
use crate::sql::{ColumnRef, Row, SqlValue};
use bson::{Bson, Document};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// source field name which identifies primary key columns.
const ID_FIELD: &str = "_id";
/// name and type of the spill column for unmapped fields.
const EXTRA_PROPS_COLUMN: &str = "_extra_props";
const EXTRA_PROPS_TYPE: &str = "JSONB";

/// One mapped column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColSpec {
    /// destination column name.
    pub name: String,
    /// source document field, possibly a dotted path.
    pub source: String,
    /// declared destination SQL type.
    pub sql_type: String,
}

/// Mapping of one collection to its destination table.
#[derive(Debug, Clone)]
pub struct CollSpec {
    /// destination table name.
    pub table: String,
    /// mapped columns, in declaration order.
    pub columns: Vec<ColSpec>,
    /// source-side find filter applied during import.
    pub filter: Option<Document>,
    /// spill unmapped fields into a `_extra_props` JSONB column.
    pub extra_props: bool,
}

/// All collection mappings of one database.
#[derive(Debug, Clone)]
pub struct DbSpec {
    colls: BTreeMap<String, CollSpec>,
}

impl DbSpec {
    /// get the mapping for one collection, `None` if it isn't replicated.
    pub fn collection(&self, name: &str) -> Option<&CollSpec> {
        self.colls.get(name)
    }

    /// iterate mapped collection names.
    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.colls.keys().map(String::as_str)
    }
}

/// The full collection map.
#[derive(Debug, Clone)]
pub struct SchemaMap {
    dbs: BTreeMap<String, DbSpec>,
}

// Raw serde shapes of the YAML file.

#[derive(Deserialize)]
struct RawColl {
    #[serde(default)]
    meta: RawMeta,
    columns: Vec<HashMap<String, RawCol>>,
}

#[derive(Deserialize, Default)]
struct RawMeta {
    table: Option<String>,
    #[serde(default)]
    extra_props: bool,
    filter: Option<Document>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCol {
    Shorthand(String),
    Full {
        source: String,
        #[serde(rename = "type")]
        sql_type: String,
    },
}

impl SchemaMap {
    /// Load a collection map from its YAML text.
    pub fn from_yaml(text: &str) -> Result<SchemaMap> {
        let raw: BTreeMap<String, BTreeMap<String, RawColl>> = serde_yaml::from_str(text)?;

        let mut dbs = BTreeMap::new();
        for (db_name, colls) in raw {
            let mut specs = BTreeMap::new();
            for (coll_name, raw_coll) in colls {
                let ns = format!("{}.{}", db_name, coll_name);
                let mut columns = Vec::with_capacity(raw_coll.columns.len());
                for entry in raw_coll.columns {
                    if entry.len() != 1 {
                        return Err(SyncError::InvalidMapping(format!(
                            "{}: every column entry must have exactly one key",
                            ns
                        )));
                    }
                    for (name, raw_col) in entry {
                        columns.push(match raw_col {
                            RawCol::Shorthand(sql_type) => ColSpec {
                                source: name.clone(),
                                name,
                                sql_type,
                            },
                            RawCol::Full { source, sql_type } => ColSpec {
                                name,
                                source,
                                sql_type,
                            },
                        });
                    }
                }
                if !columns.iter().any(|c| c.source == ID_FIELD) {
                    return Err(SyncError::InvalidMapping(format!(
                        "{}: no column maps the `_id` field, upserts need a primary key",
                        ns
                    )));
                }
                specs.insert(
                    coll_name.clone(),
                    CollSpec {
                        table: raw_coll.meta.table.unwrap_or(coll_name),
                        columns,
                        filter: raw_coll.meta.filter,
                        extra_props: raw_coll.meta.extra_props,
                    },
                );
            }
            dbs.insert(db_name, DbSpec { colls: specs });
        }
        Ok(SchemaMap { dbs })
    }

    /// get the mapping block for one database, `None` if it isn't replicated.
    pub fn find_db(&self, name: &str) -> Option<&DbSpec> {
        self.dbs.get(name)
    }

    /// get the mapping for one namespace, `None` if it isn't replicated.
    pub fn find_ns(&self, ns: &str) -> Option<&CollSpec> {
        let (db, coll) = ns.split_once('.')?;
        self.dbs.get(db)?.collection(coll)
    }

    /// get the mapping for one namespace, failing loudly if it is absent.
    pub fn find_ns_required(&self, ns: &str) -> Result<&CollSpec> {
        self.find_ns(ns)
            .ok_or_else(|| SyncError::UnmappedNamespace(ns.to_string()))
    }

    /// destination columns of a collection in output order, including the
    /// `_extra_props` spill column when enabled.
    pub fn output_columns(&self, spec: &CollSpec) -> Vec<ColumnRef> {
        let mut columns: Vec<ColumnRef> = spec
            .columns
            .iter()
            .map(|c| ColumnRef {
                name: c.name.clone(),
                sql_type: c.sql_type.clone(),
            })
            .collect();
        if spec.extra_props {
            columns.push(ColumnRef {
                name: EXTRA_PROPS_COLUMN.to_string(),
                sql_type: EXTRA_PROPS_TYPE.to_string(),
            });
        }
        columns
    }

    /// primary key columns of a namespace: the columns whose source is the
    /// document `_id`.
    pub fn primary_key_specs(&self, ns: &str) -> Result<Vec<&ColSpec>> {
        let spec = self.find_ns_required(ns)?;
        Ok(spec
            .columns
            .iter()
            .filter(|c| c.source == ID_FIELD)
            .collect())
    }

    /// Transform one document into a destination row.
    ///
    /// Mapped fields are pulled out of (a copy of) the document in column
    /// order; with `extra_props` the untouched remainder becomes the last
    /// value.
    pub fn transform(&self, ns: &str, document: &Document) -> Result<Row> {
        let spec = self.find_ns_required(ns)?;
        let mut remainder = document.clone();
        let mut row = Vec::with_capacity(spec.columns.len() + 1);
        for col in &spec.columns {
            let value = fetch_and_delete_dotted(&mut remainder, &col.source);
            row.push(SqlValue::from_bson(value.as_ref(), &col.sql_type));
        }
        if spec.extra_props {
            row.push(SqlValue::Jsonb(
                Bson::Document(remainder).into_relaxed_extjson(),
            ));
        }
        Ok(row)
    }

    /// DDL recreating the destination schema: optionally drop, then create
    /// every mapped table. Tables shared by several namespaces are emitted
    /// once.
    pub fn create_schema_sql(&self, drop_tables: bool) -> Vec<String> {
        let mut statements = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for db in self.dbs.values() {
            for spec in db.colls.values() {
                if !seen.insert(spec.table.as_str()) {
                    continue;
                }
                if drop_tables {
                    statements.push(format!(
                        "DROP TABLE IF EXISTS {}",
                        quote_ident(&spec.table)
                    ));
                }
                let mut defs: Vec<String> = spec
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type))
                    .collect();
                if spec.extra_props {
                    defs.push(format!(
                        "{} {}",
                        quote_ident(EXTRA_PROPS_COLUMN),
                        EXTRA_PROPS_TYPE
                    ));
                }
                let keys: Vec<String> = spec
                    .columns
                    .iter()
                    .filter(|c| c.source == ID_FIELD)
                    .map(|c| quote_ident(&c.name))
                    .collect();
                defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
                statements.push(format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote_ident(&spec.table),
                    defs.join(", ")
                ));
            }
        }
        statements
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Remove `path` from the document and return its value, descending through
/// nested documents on dots. Emptied parents are removed too, so an
/// `_extra_props` remainder never carries hollowed-out husks.
fn fetch_and_delete_dotted(doc: &mut Document, path: &str) -> Option<Bson> {
    // a literal dotted key wins over path traversal.
    if let Some(value) = doc.remove(path) {
        return Some(value);
    }
    let (head, rest) = path.split_once('.')?;
    let sub = doc.get_document_mut(head).ok()?;
    let value = fetch_and_delete_dotted(sub, rest);
    if sub.is_empty() {
        doc.remove(head);
    }
    value
}
