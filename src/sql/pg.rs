use super::value::encode_copy_row;
use super::{ColumnRef, Row, SinkSession, SqlSink, SqlValue};
use crate::error::{Result, SyncError};
use postgres::types::ToSql;
use postgres::{Client, NoTls};
use std::io::Write;
use tracing::debug;

/// PostgreSQL implementation of [SqlSink].
///
/// Holds only the connection string; every [SqlSink::connect] call opens a
/// fresh connection, so parallel import workers never share one.
pub struct PgSink {
    url: String,
}

impl PgSink {
    /// create a sink for the given connection string.
    pub fn new(url: impl Into<String>) -> PgSink {
        PgSink { url: url.into() }
    }
}

impl SqlSink for PgSink {
    fn connect(&self) -> Result<Box<dyn SinkSession>> {
        let client = Client::connect(&self.url, NoTls)?;
        Ok(Box::new(PgSession { client }))
    }
}

struct PgSession {
    client: Client,
}

impl SinkSession for PgSession {
    fn execute_ddl(&mut self, statements: &[String]) -> Result<()> {
        for stmt in statements {
            debug!(%stmt, "executing schema statement");
            self.client.batch_execute(stmt.as_str())?;
        }
        Ok(())
    }

    fn truncate(&mut self, table: &str) -> Result<()> {
        let sql = format!("TRUNCATE TABLE {}", quote_ident(table));
        self.client
            .execute(sql.as_str(), &[])
            .map_err(|e| sink_error(table, e))?;
        Ok(())
    }

    fn bulk_copy(&mut self, table: &str, columns: &[ColumnRef], rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = build_copy_sql(table, columns);
        let mut writer = self
            .client
            .copy_in(sql.as_str())
            .map_err(|e| sink_error(table, e))?;
        let mut line = String::new();
        for row in rows {
            line.clear();
            encode_copy_row(row, &mut line);
            writer.write_all(line.as_bytes())?;
        }
        writer.finish().map_err(|e| sink_error(table, e))?;
        Ok(())
    }

    fn upsert(
        &mut self,
        table: &str,
        key_names: &[String],
        columns: &[ColumnRef],
        row: &Row,
    ) -> Result<()> {
        let sql = build_upsert_sql(table, key_names, columns);
        let text: Vec<Option<String>> = row.iter().map(SqlValue::as_sql_text).collect();
        let params: Vec<&(dyn ToSql + Sync)> =
            text.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(sql.as_str(), &params)
            .map_err(|e| sink_error(table, e))?;
        Ok(())
    }

    fn delete(&mut self, table: &str, keys: &[ColumnRef], values: &[SqlValue]) -> Result<()> {
        let sql = build_delete_sql(table, keys);
        let text: Vec<Option<String>> = values.iter().map(SqlValue::as_sql_text).collect();
        let params: Vec<&(dyn ToSql + Sync)> =
            text.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(sql.as_str(), &params)
            .map_err(|e| sink_error(table, e))?;
        Ok(())
    }
}

/// Classify a driver error: a `DbError` means the server itself rejected the
/// record (constraint, cast, length...), which the unsafe policy may skip;
/// everything else is a transport problem.
fn sink_error(table: &str, e: postgres::Error) -> SyncError {
    match e.as_db_error() {
        Some(db) => SyncError::Rejected {
            table: table.to_string(),
            message: format!("{}: {}", db.code().code(), db.message()),
        },
        None => SyncError::Sql(e),
    }
}

/// Double-quote an identifier for PostgreSQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn build_copy_sql(table: &str, columns: &[ColumnRef]) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({}) FROM STDIN",
        quote_ident(table),
        col_list
    )
}

// Incoming values are text; every placeholder is casted to the declared
// column type so the destination performs the conversion.
fn build_upsert_sql(table: &str, key_names: &[String], columns: &[ColumnRef]) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let value_list = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("CAST(${} AS {})", i + 1, c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict_list = key_names
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");
    let update_list = columns
        .iter()
        .filter(|c| !key_names.contains(&c.name))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");

    if update_list.is_empty() {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
            quote_ident(table),
            col_list,
            value_list,
            conflict_list
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            quote_ident(table),
            col_list,
            value_list,
            conflict_list,
            update_list
        )
    }
}

fn build_delete_sql(table: &str, keys: &[ColumnRef]) -> String {
    let predicates = keys
        .iter()
        .enumerate()
        .map(|(i, k)| format!("{} = CAST(${} AS {})", quote_ident(&k.name), i + 1, k.sql_type))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!("DELETE FROM {} WHERE {}", quote_ident(table), predicates)
}
