//! In-memory collaborators used by the integration tests, so the engine's
//! behavior can be exercised without live databases.
#![allow(dead_code)]

use bson::{Document, Timestamp};
use mongo2pg::{
    ColumnRef, Result, Row, SchemaMap, SinkSession, Source, SqlSink, SqlValue, StopHandle,
    SyncError, SyncOptions, Syncer, Tailer,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// collection map shared by most tests; `posts` and `archived_posts` land
/// in the same destination table.
pub const MAPPING: &str = r#"
blog:
  posts:
    columns:
      - id:
          source: _id
          type: TEXT
      - title: TEXT
      - stars:
          source: stars
          type: INTEGER
  archived_posts:
    meta:
      table: posts
    columns:
      - id:
          source: _id
          type: TEXT
      - title: TEXT
      - stars:
          source: stars
          type: INTEGER
  comments:
    columns:
      - id:
          source: _id
          type: TEXT
      - body: TEXT
shop:
  orders:
    columns:
      - id:
          source: _id
          type: TEXT
      - total:
          source: total
          type: DOUBLE PRECISION
"#;

pub fn ts(time: u32, increment: u32) -> Timestamp {
    Timestamp { time, increment }
}

/// a transient source error, as the retry governor classifies them.
pub fn transient_error() -> SyncError {
    SyncError::Mongo(mongodb::error::Error::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "source hiccup",
    )))
}

// ------------------------------------------------------- op builders ----

pub fn insert_op(t: Timestamp, ns: &str, o: Document) -> Document {
    bson::doc! {"ts": t, "op": "i", "ns": ns, "o": o}
}

pub fn update_op(t: Timestamp, ns: &str, o: Document, o2: Document) -> Document {
    bson::doc! {"ts": t, "op": "u", "ns": ns, "o": o, "o2": o2}
}

pub fn delete_op(t: Timestamp, ns: &str, o: Document) -> Document {
    bson::doc! {"ts": t, "op": "d", "ns": ns, "o": o}
}

pub fn noop_op(t: Timestamp) -> Document {
    bson::doc! {"ts": t, "op": "n", "ns": "", "o": {"msg": "periodic noop"}}
}

pub fn apply_ops_cmd(t: Timestamp, ops: Vec<Document>) -> Document {
    bson::doc! {"ts": t, "op": "c", "ns": "admin.$cmd", "o": {"applyOps": ops}}
}

// ---------------------------------------------------------------- sink ----

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Ddl(String),
    Truncate(String),
    BulkCopy { table: String, rows: usize },
    Upsert { table: String },
    Delete { table: String },
}

#[derive(Default)]
pub struct MemSinkState {
    pub events: Vec<SinkEvent>,
    /// table -> primary key rendering -> row.
    pub tables: HashMap<String, BTreeMap<String, Row>>,
    pub reject_bulk_tables: HashSet<String>,
    pub connects: usize,
}

/// In-memory [SqlSink]. Rows are keyed by their first value (the fixtures
/// always put the mapped `_id` column first). Any row carrying the text
/// value `"poison"` is rejected, mimicking a destination constraint.
#[derive(Clone, Default)]
pub struct MemSink {
    pub state: Arc<Mutex<MemSinkState>>,
}

impl MemSink {
    pub fn new() -> MemSink {
        MemSink::default()
    }

    /// make every bulk write against `table` fail wholesale.
    pub fn reject_bulk_for(&self, table: &str) {
        self.state
            .lock()
            .unwrap()
            .reject_bulk_tables
            .insert(table.to_string());
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn truncates(&self, table: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Truncate(t) if t == table))
            .count()
    }

    pub fn bulk_copies(&self, table: &str) -> Vec<usize> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::BulkCopy { table: t, rows } if t == table => Some(*rows),
                _ => None,
            })
            .collect()
    }

    pub fn upserts(&self, table: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Upsert { table: t } if t == table))
            .count()
    }
}

fn is_poison(row: &[SqlValue]) -> bool {
    row.iter()
        .any(|v| matches!(v, SqlValue::Text(s) if s == "poison"))
}

fn row_key(row: &[SqlValue]) -> String {
    row.first()
        .map(|v| format!("{:?}", v))
        .unwrap_or_default()
}

fn rejected(table: &str) -> SyncError {
    SyncError::Rejected {
        table: table.to_string(),
        message: "record refused".to_string(),
    }
}

struct MemSession {
    state: Arc<Mutex<MemSinkState>>,
}

impl SqlSink for MemSink {
    fn connect(&self) -> Result<Box<dyn SinkSession>> {
        self.state.lock().unwrap().connects += 1;
        Ok(Box::new(MemSession {
            state: self.state.clone(),
        }))
    }
}

impl SinkSession for MemSession {
    fn execute_ddl(&mut self, statements: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for stmt in statements {
            state.events.push(SinkEvent::Ddl(stmt.clone()));
        }
        Ok(())
    }

    fn truncate(&mut self, table: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(SinkEvent::Truncate(table.to_string()));
        state.tables.entry(table.to_string()).or_default().clear();
        Ok(())
    }

    fn bulk_copy(&mut self, table: &str, _columns: &[ColumnRef], rows: &[Row]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(SinkEvent::BulkCopy {
            table: table.to_string(),
            rows: rows.len(),
        });
        if state.reject_bulk_tables.contains(table) || rows.iter().any(|r| is_poison(r)) {
            return Err(rejected(table));
        }
        let entries = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            entries.insert(row_key(row), row.clone());
        }
        Ok(())
    }

    fn upsert(
        &mut self,
        table: &str,
        _key_names: &[String],
        _columns: &[ColumnRef],
        row: &Row,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(SinkEvent::Upsert {
            table: table.to_string(),
        });
        if is_poison(row) {
            return Err(rejected(table));
        }
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(row_key(row), row.clone());
        Ok(())
    }

    fn delete(&mut self, table: &str, _keys: &[ColumnRef], values: &[SqlValue]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(SinkEvent::Delete {
            table: table.to_string(),
        });
        let key = row_key(values);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .remove(&key);
        Ok(())
    }
}

// -------------------------------------------------------------- source ----

#[derive(Default)]
pub struct MemSourceState {
    /// namespace -> documents, in scan order.
    pub collections: HashMap<String, Vec<Document>>,
    pub find_one_calls: Vec<(String, Document)>,
    /// namespace -> remaining scans which fail with a transient error.
    pub scan_failures: HashMap<String, u32>,
}

/// In-memory [Source].
#[derive(Clone, Default)]
pub struct MemSource {
    pub state: Arc<Mutex<MemSourceState>>,
}

impl MemSource {
    pub fn new() -> MemSource {
        MemSource::default()
    }

    pub fn insert(&self, ns: &str, docs: Vec<Document>) {
        self.state
            .lock()
            .unwrap()
            .collections
            .entry(ns.to_string())
            .or_default()
            .extend(docs);
    }

    /// make the next `failures` scans of `ns` fail with a transient error.
    pub fn fail_scans(&self, ns: &str, failures: u32) {
        self.state
            .lock()
            .unwrap()
            .scan_failures
            .insert(ns.to_string(), failures);
    }

    pub fn find_one_calls(&self) -> Vec<(String, Document)> {
        self.state.lock().unwrap().find_one_calls.clone()
    }
}

impl Source for MemSource {
    fn database_names(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .collections
            .keys()
            .filter_map(|ns| ns.split_once('.').map(|(db, _)| db.to_string()))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .collections
            .keys()
            .filter_map(|ns| match ns.split_once('.') {
                Some((d, coll)) if d == db => Some(coll.to_string()),
                _ => None,
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn scan<'a>(
        &'a self,
        ns: &str,
        _filter: Option<Document>,
        _batch_size: u32,
    ) -> Result<Box<dyn Iterator<Item = Result<Document>> + 'a>> {
        let mut state = self.state.lock().unwrap();
        if let Some(left) = state.scan_failures.get_mut(ns) {
            if *left > 0 {
                *left -= 1;
                return Err(transient_error());
            }
        }
        let docs = state.collections.get(ns).cloned().unwrap_or_default();
        Ok(Box::new(docs.into_iter().map(Ok)))
    }

    fn find_one(&self, ns: &str, selector: &Document) -> Result<Option<Document>> {
        let mut state = self.state.lock().unwrap();
        state
            .find_one_calls
            .push((ns.to_string(), selector.clone()));
        Ok(state.collections.get(ns).and_then(|docs| {
            docs.iter()
                .find(|doc| selector.iter().all(|(k, v)| doc.get(k) == Some(v)))
                .cloned()
        }))
    }
}

// -------------------------------------------------------------- tailer ----

pub struct MemTailerState {
    pub ops: VecDeque<Document>,
    pub stored: Option<Timestamp>,
    pub saves: Vec<Timestamp>,
    /// what `most_recent_position` hands out.
    pub current: Timestamp,
    pub tails: Vec<Option<Timestamp>>,
    pub filters: Vec<Option<Document>>,
    /// flipped once the op queue drains, so tailing tests terminate.
    pub stop: Option<StopHandle>,
}

impl Default for MemTailerState {
    fn default() -> MemTailerState {
        MemTailerState {
            ops: VecDeque::new(),
            stored: None,
            saves: Vec::new(),
            current: ts(100, 1),
            tails: Vec::new(),
            filters: Vec::new(),
            stop: None,
        }
    }
}

/// In-memory [Tailer] feeding a fixed queue of operations.
pub struct MemTailer {
    pub state: Arc<Mutex<MemTailerState>>,
}

impl Tailer for MemTailer {
    fn read_position(&mut self) -> Result<Option<Timestamp>> {
        Ok(self.state.lock().unwrap().stored)
    }

    fn most_recent_position(
        &mut self,
        _as_of: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Timestamp> {
        Ok(self.state.lock().unwrap().current)
    }

    fn tail(&mut self, from: Option<Timestamp>, filter: Option<Document>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tails.push(from);
        state.filters.push(filter);
        Ok(())
    }

    fn stream(
        &mut self,
        limit: usize,
        apply: &mut dyn FnMut(&Document) -> Result<()>,
    ) -> Result<bool> {
        let mut handled = 0;
        while handled < limit {
            let op = self.state.lock().unwrap().ops.pop_front();
            match op {
                Some(op) => {
                    apply(&op)?;
                    handled += 1;
                    if let Ok(position) = op.get_timestamp("ts") {
                        let mut state = self.state.lock().unwrap();
                        state.stored = Some(position);
                        state.saves.push(position);
                    }
                }
                None => {
                    let state = self.state.lock().unwrap();
                    if let Some(stop) = &state.stop {
                        stop.stop();
                    }
                    break;
                }
            }
        }
        Ok(true)
    }

    fn save_position(&mut self, position: Timestamp) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stored = Some(position);
        state.saves.push(position);
        Ok(())
    }
}

// ------------------------------------------------------------- fixture ----

pub struct Fixture {
    pub mapping: Arc<SchemaMap>,
    pub source: MemSource,
    pub sink: MemSink,
    pub tailer_state: Arc<Mutex<MemTailerState>>,
}

pub fn fixture() -> Fixture {
    Fixture {
        mapping: Arc::new(SchemaMap::from_yaml(MAPPING).unwrap()),
        source: MemSource::new(),
        sink: MemSink::new(),
        tailer_state: Arc::new(Mutex::new(MemTailerState::default())),
    }
}

impl Fixture {
    pub fn syncer(&self, options: SyncOptions) -> Syncer {
        Syncer::new(
            options,
            Box::new(MemTailer {
                state: self.tailer_state.clone(),
            }),
            Arc::new(self.source.clone()),
            Arc::new(self.sink.clone()),
            self.mapping.clone(),
        )
    }

    pub fn saves(&self) -> Vec<Timestamp> {
        self.tailer_state.lock().unwrap().saves.clone()
    }
}
