//! mongo2pg basic configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [src]
//! url = "mongodb://localhost:27017"
//!
//! [dst]
//! url = "postgres://localhost/blog"
//!
//! [schema]
//! path = "collections.yml"
//!
//! [sync]
//! threads = 4
//! ignore_delete = false
//! ```
use crate::error::Result;
use bson::Document;
use serde::Deserialize;

/// Global syncer configuration.
#[derive(Deserialize, Debug)]
pub struct SyncerConfig {
    src: Src,
    dst: Dst,
    schema: Schema,
    #[serde(default)]
    sync: SyncOptions,
}

impl SyncerConfig {
    /// get source mongodb url.
    pub fn get_src_url(&self) -> &str {
        &self.src.url
    }

    /// get destination postgresql url.
    pub fn get_dst_url(&self) -> &str {
        &self.dst.url
    }

    /// get path of the YAML collection map.
    pub fn get_schema_path(&self) -> &str {
        &self.schema.path
    }

    /// get replication options.
    pub fn get_options(&self) -> &SyncOptions {
        &self.sync
    }

    /// take replication options out of the configuration.
    pub fn into_options(self) -> SyncOptions {
        self.sync
    }
}

/// Source database configuration.
#[derive(Deserialize, Debug)]
pub struct Src {
    /// Source database url, which begins with 'mongodb://'.
    url: String,
}

/// Destination database configuration.
#[derive(Deserialize, Debug)]
pub struct Dst {
    /// Destination database url, which begins with 'postgres://'.
    url: String,
}

/// Collection map configuration.
#[derive(Deserialize, Debug)]
pub struct Schema {
    /// path of the YAML file which declares replicated collections.
    path: String,
}

/// Replication options recognized by the syncer core.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SyncOptions {
    /// force a full import even when a resume position exists.
    #[serde(default)]
    pub reimport: bool,
    /// import only, never go into tailing mode.
    #[serde(default)]
    pub skip_tail: bool,
    /// keep existing destination tables, and never truncate them.
    #[serde(default)]
    pub no_drop_tables: bool,
    /// restrict the import to one database, skipping the full database scan.
    #[serde(default)]
    pub dbname: Option<String>,
    /// import worker pool size, ignored unless a positive number.
    #[serde(default)]
    pub threads: Option<usize>,
    /// skip records the destination refuses instead of aborting the run.
    #[serde(default, rename = "unsafe")]
    pub unsafe_mode: bool,
    /// never propagate delete operations to the destination.
    #[serde(default)]
    pub ignore_delete: bool,
    /// tail from the newest oplog entry at or before this unix timestamp,
    /// instead of the recorded resume position.
    #[serde(default)]
    pub tail_from: Option<i64>,
    /// extra oplog query filter, as a JSON document.
    #[serde(default)]
    pub oplog_filter: Option<String>,
}

impl SyncOptions {
    /// worker pool size to use, `0` meaning serial import.
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or(0)
    }

    /// parse the configured oplog filter into a bson document.
    pub fn oplog_filter_doc(&self) -> Result<Option<Document>> {
        match &self.oplog_filter {
            Some(text) => Ok(Some(serde_json::from_str(text)?)),
            None => Ok(None),
        }
    }
}
