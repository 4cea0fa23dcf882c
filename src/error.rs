use mongodb::error::{Error as MongoError, ErrorKind};
use std::result::Result as StdResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Mongodb error")]
    Mongo(#[from] MongoError),
    #[error("Bson field access error")]
    BsonAccess(#[from] bson::document::ValueAccessError),
    #[error("Destination database error")]
    Sql(#[from] postgres::Error),
    #[error("Destination rejected record for table {table:?}: {message}")]
    Rejected { table: String, message: String },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Check permission failed, connection string: {uri:?}, detailed: {detail:?}")]
    Permission { uri: String, detail: MongoError },
    #[error("No mapping declared for namespace {0:?}")]
    UnmappedNamespace(String),
    #[error("Invalid schema mapping: {0}")]
    InvalidMapping(String),
    #[error("Invalid namespace {0:?}, expected `db.collection`")]
    InvalidNamespace(String),
    #[error("Failed to parse schema mapping")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to parse oplog filter")]
    FilterJson(#[from] serde_json::Error),
    #[error("Oplog is empty, can't determine a start position")]
    EmptyOplog,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = StdResult<T, SyncError>;

impl SyncError {
    /// Check if the error is a transient source-read failure which is worth
    /// retrying with backoff.
    ///
    /// Duplicate-key (11000/11001) and cursor-not-found (43) failures are
    /// excluded: repeating those can't succeed or would duplicate work, so
    /// they surface to the caller right away. Source-side I/O errors count
    /// as transient.
    pub fn is_retryable_source(&self) -> bool {
        match self {
            SyncError::Mongo(e) => match *e.kind {
                ErrorKind::Io(_) => true,
                ErrorKind::Command(ref c) => !matches!(c.code, 11000 | 11001 | 43),
                _ => false,
            },
            _ => false,
        }
    }

    /// Check if the error is the destination reporting a record it refuses
    /// to store. Only these may be skipped under the `unsafe` option.
    pub fn is_rejected_record(&self) -> bool {
        matches!(self, SyncError::Rejected { .. })
    }
}
