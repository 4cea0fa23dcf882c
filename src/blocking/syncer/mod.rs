//! The replication engine: one-time bulk import plus continuous oplog
//! replay.

mod import;
mod ops;
mod retry;

pub use ops::OplogApplier;

use crate::config::SyncOptions;
use crate::error::Result;
use crate::schema::SchemaMap;
use crate::source::Source;
use crate::sql::SqlSink;
use crate::tailer::Tailer;
use chrono::{TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// operations handed to the applier per tailing iteration.
const TAIL_BATCH: usize = 1000;

/// Cooperative stop request for a running [Syncer].
///
/// Import workers observe it at batch and collection boundaries, the
/// tailing loop once per iteration; nothing is interrupted mid-batch.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// ask running import/tail loops to wind down at their next boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Replicates the mapped part of a MongoDB deployment into the relational
/// destination.
pub struct Syncer {
    pub(crate) mapping: Arc<SchemaMap>,
    pub(crate) source: Arc<dyn Source>,
    pub(crate) sink: Arc<dyn SqlSink>,
    pub(crate) tailer: Box<dyn Tailer>,
    pub(crate) options: Arc<SyncOptions>,
    pub(crate) done: Arc<AtomicBool>,
    pub(crate) truncated: Arc<Mutex<HashSet<String>>>,
}

impl Syncer {
    /// assemble a syncer from its collaborators.
    pub fn new(
        options: SyncOptions,
        tailer: Box<dyn Tailer>,
        source: Arc<dyn Source>,
        sink: Arc<dyn SqlSink>,
        mapping: Arc<SchemaMap>,
    ) -> Syncer {
        Syncer {
            mapping,
            source,
            sink,
            tailer,
            options: Arc::new(options),
            done: Arc::new(AtomicBool::new(false)),
            truncated: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// handle through which another thread can request a stop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.done.clone())
    }

    /// import if needed, then tail until stopped (unless `skip_tail`).
    pub fn sync(&mut self) -> Result<()> {
        self.import()?;
        if !self.options.skip_tail && !self.done.load(Ordering::Relaxed) {
            self.tail()?;
        }
        Ok(())
    }

    /// Run the full import when forced by `reimport` or when no resume
    /// position has been recorded yet; otherwise do nothing.
    pub fn import(&mut self) -> Result<()> {
        if self.options.reimport || self.tailer.read_position()?.is_none() {
            self.initial_import()
        } else {
            info!("resume position found, skipping the full import");
            Ok(())
        }
    }

    /// Tail the oplog and apply operations, strictly in oplog order, until
    /// stopped.
    pub fn tail(&mut self) -> Result<()> {
        let filter = self.options.oplog_filter_doc()?;
        let from = match self.options.tail_from {
            Some(secs) => {
                let as_of = Utc.timestamp(secs, 0);
                Some(self.tailer.most_recent_position(Some(as_of))?)
            }
            None => None,
        };
        self.tailer.tail(from, filter.clone())?;

        let mut applier = OplogApplier::new(
            self.mapping.clone(),
            self.source.clone(),
            self.options.clone(),
            self.sink.connect()?,
        );
        while !self.done.load(Ordering::Relaxed) {
            let alive = self
                .tailer
                .stream(TAIL_BATCH, &mut |op| applier.handle_op(op))?;
            if !alive && !self.done.load(Ordering::Relaxed) {
                warn!("oplog stream interrupted, re-tailing from the recorded position");
                self.tailer.tail(None, filter.clone())?;
            }
        }
        Ok(())
    }
}
