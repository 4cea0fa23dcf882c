//! Replicate a MongoDB deployment into PostgreSQL.
//!
//! The crate performs a one-time bulk import (parallel collection scan,
//! document transform, batched `COPY`) followed by continuous replay of the
//! MongoDB oplog, keeping the relational copy eventually consistent with the
//! source. Replication is at-least-once: every apply operation is an upsert
//! or delete keyed by the mapped primary key, so redundant replay is safe.
//!
//! Which collections are replicated, and how documents map to rows, is
//! declared in a YAML collection map loaded into a [SchemaMap].
//!
//! # Example:
//! ```no_run
//! use std::sync::Arc;
//! use mongo2pg::{Connection, SchemaMap, SyncOptions, Syncer};
//!
//! let mapping = Arc::new(SchemaMap::from_yaml("blog:\n  posts:\n    columns:\n      - id:\n          source: _id\n          type: TEXT\n      - title: TEXT\n").unwrap());
//! let conn = Connection::new("mongodb://localhost:27017", "postgres://localhost/blog").unwrap();
//! let tailer = Box::new(conn.tailer().unwrap());
//! let mut syncer = Syncer::new(
//!     SyncOptions::default(),
//!     tailer,
//!     Arc::new(conn.source()),
//!     Arc::new(conn.sink()),
//!     mapping,
//! );
//! syncer.sync().unwrap();
//! ```

#![warn(missing_docs)]

#[doc(hidden)]
pub mod blocking;
mod config;
mod error;
pub mod oplog;
pub mod schema;
pub mod source;
pub mod sql;
pub mod tailer;

/// mongodb internal database which saves oplogs.
const OPLOG_DB: &str = "local";
/// mongodb internal collection which saves oplogs.
const OPLOG_COLL: &str = "oplog.rs";

/// oplog namespace key name.
const NAMESPACE_KEY: &str = "ns";
/// oplog timestamp key name.
const TIMESTAMP_KEY: &str = "ts";
/// oplog operation key name.
const OP_KEY: &str = "op";
/// oplog operation payload key name.
const OBJECT_KEY: &str = "o";
/// oplog update selector key name.
const OBJECT2_KEY: &str = "o2";
/// key of the nested operation list inside a batched command oplog.
const APPLY_OPS_KEY: &str = "applyOps";
/// pseudo-collection which carries index definitions, never replicated.
const SYSTEM_INDEXES_COLL: &str = "system.indexes";

pub use blocking::{Connection, OplogApplier, StopHandle, Syncer};
pub use config::{SyncOptions, SyncerConfig};
pub use error::{Result, SyncError};
pub use oplog::Operation;
pub use schema::{ColSpec, CollSpec, SchemaMap};
pub use source::{MongoSource, Source};
pub use sql::{ColumnRef, PgSink, Row, SinkSession, SqlSink, SqlValue};
pub use tailer::{MongoTailer, PgPositionStore, PositionStore, Tailer};
