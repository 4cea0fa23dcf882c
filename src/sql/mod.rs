//! Destination database interface.
//!
//! The syncer core talks to the destination exclusively through the
//! [SqlSink]/[SinkSession] pair: a sink hands out one session (connection)
//! per user, and a session performs the writes. [PgSink] is the PostgreSQL
//! implementation.

mod pg;
mod value;

pub use pg::PgSink;
pub use value::SqlValue;

use crate::error::Result;

/// One transformed document, values in catalog column order.
pub type Row = Vec<SqlValue>;

/// A destination column reference: name plus declared SQL type.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    /// destination column name.
    pub name: String,
    /// declared SQL type, used to cast incoming text values.
    pub sql_type: String,
}

/// Factory for destination connections.
///
/// Import workers run in parallel and each holds its own session, released
/// when the worker's collection is done; the tailing loop holds a single
/// session for its whole lifetime.
pub trait SqlSink: Send + Sync {
    /// open a new destination session.
    fn connect(&self) -> Result<Box<dyn SinkSession>>;
}

/// One live destination connection. Dropping the session disconnects.
pub trait SinkSession {
    /// execute schema DDL statements, one at a time.
    fn execute_ddl(&mut self, statements: &[String]) -> Result<()>;

    /// empty a destination table.
    fn truncate(&mut self, table: &str) -> Result<()>;

    /// write a whole batch of rows in one bulk operation. May fail
    /// wholesale; the caller falls back to row-by-row [SinkSession::upsert].
    fn bulk_copy(&mut self, table: &str, columns: &[ColumnRef], rows: &[Row]) -> Result<()>;

    /// insert-or-update one row, keyed by `key_names`.
    fn upsert(
        &mut self,
        table: &str,
        key_names: &[String],
        columns: &[ColumnRef],
        row: &Row,
    ) -> Result<()>;

    /// delete the row identified by the key columns and values.
    fn delete(&mut self, table: &str, keys: &[ColumnRef], values: &[SqlValue]) -> Result<()>;
}
