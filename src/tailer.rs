//! Oplog tailing and durable resume positions.

use crate::error::{Result, SyncError};
use crate::{OPLOG_COLL, OPLOG_DB, TIMESTAMP_KEY};
use bson::{doc, Document, Timestamp};
use chrono::{DateTime, Utc};
use mongodb::options::{CursorType, FindOneOptions, FindOptions};
use mongodb::sync::{Client, Collection, Cursor};
use postgres::NoTls;
use std::time::Duration;
use tracing::{info, warn};

/// Durable storage for the oplog resume position.
pub trait PositionStore {
    /// load the recorded position, `None` on a fresh deployment.
    fn load(&mut self) -> Result<Option<Timestamp>>;
    /// record a new position.
    fn save(&mut self, position: Timestamp) -> Result<()>;
}

/// The oplog side of replication: read and persist positions, establish a
/// live cursor, and stream operations through a callback.
pub trait Tailer {
    /// last durably recorded position.
    fn read_position(&mut self) -> Result<Option<Timestamp>>;

    /// newest position present in the oplog, optionally at or before
    /// `as_of`.
    fn most_recent_position(&mut self, as_of: Option<DateTime<Utc>>) -> Result<Timestamp>;

    /// establish a live cursor starting after `from` (falling back to the
    /// recorded position, then to the end of the oplog), with an optional
    /// extra query filter.
    fn tail(&mut self, from: Option<Timestamp>, filter: Option<Document>) -> Result<()>;

    /// feed up to `limit` operations into `apply`, then persist the position
    /// of the last one handed out. Returns whether the cursor is still
    /// alive; a dead cursor needs a new [Tailer::tail] call.
    fn stream(
        &mut self,
        limit: usize,
        apply: &mut dyn FnMut(&Document) -> Result<()>,
    ) -> Result<bool>;

    /// persist `position` as the resume point.
    fn save_position(&mut self, position: Timestamp) -> Result<()>;
}

/// [Tailer] implementation over `local.oplog.rs` of a replica set member.
pub struct MongoTailer {
    oplog: Collection<Document>,
    store: Box<dyn PositionStore>,
    cursor: Option<Cursor<Document>>,
    last_seen: Option<Timestamp>,
}

impl MongoTailer {
    /// create a tailer reading the oplog of `client` and persisting
    /// positions into `store`.
    pub fn new(client: Client, store: Box<dyn PositionStore>) -> MongoTailer {
        MongoTailer {
            oplog: client.database(OPLOG_DB).collection::<Document>(OPLOG_COLL),
            store,
            cursor: None,
            last_seen: None,
        }
    }

    fn latest_ts(&self, query: Option<Document>) -> Result<Timestamp> {
        self.oplog
            .find_one(
                query,
                FindOneOptions::builder()
                    .sort(doc! {"$natural": -1})
                    .build(),
            )?
            .map(|entry| {
                entry
                    .get_timestamp(TIMESTAMP_KEY)
                    .map_err(SyncError::BsonAccess)
            })
            .unwrap_or(Err(SyncError::EmptyOplog))
    }
}

impl Tailer for MongoTailer {
    fn read_position(&mut self) -> Result<Option<Timestamp>> {
        self.store.load()
    }

    fn most_recent_position(&mut self, as_of: Option<DateTime<Utc>>) -> Result<Timestamp> {
        let query = as_of.map(|moment| {
            let bound = Timestamp {
                time: moment.timestamp() as u32,
                increment: u32::MAX,
            };
            doc! {TIMESTAMP_KEY: {"$lte": bound}}
        });
        self.latest_ts(query)
    }

    fn tail(&mut self, from: Option<Timestamp>, filter: Option<Document>) -> Result<()> {
        let start = match from {
            Some(position) => position,
            None => match self.store.load()? {
                Some(position) => position,
                None => {
                    // nothing recorded: start at the end instead of
                    // replaying the whole history.
                    let latest = self.latest_ts(None)?;
                    info!(?latest, "no recorded position, tailing from the newest entry");
                    latest
                }
            },
        };

        let mut query = doc! {TIMESTAMP_KEY: {"$gt": start}};
        if let Some(extra) = filter {
            for (key, value) in extra {
                query.insert(key, value);
            }
        }

        info!(?start, "establishing oplog cursor");
        let cursor = self.oplog.find(
            query,
            FindOptions::builder()
                .cursor_type(CursorType::TailableAwait)
                .no_cursor_timeout(true)
                .max_await_time(Duration::from_secs(1))
                .build(),
        )?;
        self.cursor = Some(cursor);
        self.last_seen = Some(start);
        Ok(())
    }

    fn stream(
        &mut self,
        limit: usize,
        apply: &mut dyn FnMut(&Document) -> Result<()>,
    ) -> Result<bool> {
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => return Ok(false),
        };

        let mut handled = 0;
        while handled < limit {
            match cursor.next() {
                Some(Ok(entry)) => {
                    let ts = entry.get_timestamp(TIMESTAMP_KEY).ok();
                    apply(&entry)?;
                    if ts.is_some() {
                        self.last_seen = ts;
                    }
                    handled += 1;
                }
                Some(Err(e)) => {
                    let e = SyncError::from(e);
                    if e.is_retryable_source() {
                        warn!(error=%e, "oplog cursor failed, will re-establish");
                        self.cursor = None;
                        break;
                    }
                    return Err(e);
                }
                None => {
                    warn!("oplog cursor exhausted, will re-establish");
                    self.cursor = None;
                    break;
                }
            }
        }

        if handled > 0 {
            if let Some(position) = self.last_seen {
                self.store.save(position)?;
            }
        }
        Ok(self.cursor.is_some())
    }

    fn save_position(&mut self, position: Timestamp) -> Result<()> {
        self.store.save(position)
    }
}

/// table holding the single resume-position row.
const POSITION_TABLE: &str = "mongo2pg_state";

/// [PositionStore] keeping the resume position in the destination database,
/// so the replica and its progress marker live and die together.
pub struct PgPositionStore {
    client: postgres::Client,
}

impl PgPositionStore {
    /// connect and make sure the state table exists.
    pub fn connect(url: &str) -> Result<PgPositionStore> {
        let mut client = postgres::Client::connect(url, NoTls)?;
        client.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id TEXT PRIMARY KEY, ts_time BIGINT NOT NULL, ts_inc BIGINT NOT NULL)",
            POSITION_TABLE
        ))?;
        Ok(PgPositionStore { client })
    }
}

impl PositionStore for PgPositionStore {
    fn load(&mut self) -> Result<Option<Timestamp>> {
        let row = self.client.query_opt(
            format!(
                "SELECT ts_time, ts_inc FROM {} WHERE id = 'default'",
                POSITION_TABLE
            )
            .as_str(),
            &[],
        )?;
        Ok(row.map(|row| {
            let time: i64 = row.get(0);
            let increment: i64 = row.get(1);
            Timestamp {
                time: time as u32,
                increment: increment as u32,
            }
        }))
    }

    fn save(&mut self, position: Timestamp) -> Result<()> {
        self.client.execute(
            format!(
                "INSERT INTO {} (id, ts_time, ts_inc) VALUES ('default', $1, $2) \
                 ON CONFLICT (id) DO UPDATE SET ts_time = EXCLUDED.ts_time, ts_inc = EXCLUDED.ts_inc",
                POSITION_TABLE
            )
            .as_str(),
            &[&(position.time as i64), &(position.increment as i64)],
        )?;
        Ok(())
    }
}
