use super::retry::{unsafe_handle_exceptions, with_retries, MAX_SOURCE_ATTEMPTS};
use super::Syncer;
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::schema::{CollSpec, SchemaMap};
use crate::source::Source;
use crate::sql::{ColumnRef, Row, SinkSession, SqlSink};
use crossbeam::channel;
use rayon::ThreadPoolBuilder;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// rows per bulk write, and documents per source fetch page.
pub(crate) const BATCH: usize = 1000;

/// shared state of one import run, cloned into every worker.
#[derive(Clone)]
pub(crate) struct ImportContext {
    mapping: Arc<SchemaMap>,
    source: Arc<dyn Source>,
    sink: Arc<dyn SqlSink>,
    options: Arc<SyncOptions>,
    done: Arc<AtomicBool>,
    truncated: Arc<Mutex<HashSet<String>>>,
}

impl Syncer {
    pub(crate) fn initial_import(&mut self) -> Result<()> {
        let statements = self.mapping.create_schema_sql(!self.options.no_drop_tables);
        {
            let mut session = self.sink.connect()?;
            session.execute_ddl(&statements)?;
        }

        // The watermark must predate the scan: anything written while we
        // copy shows up again when tailing resumes from here.
        let start_position = if self.options.skip_tail {
            None
        } else {
            let position = self.tailer.most_recent_position(None)?;
            info!(?position, "captured oplog watermark before the scan");
            Some(position)
        };

        let dbnames = match &self.options.dbname {
            Some(name) => {
                info!(db = %name, "skipping database scan, using the configured database");
                vec![name.clone()]
            }
            None => self.source.database_names()?,
        };

        let mut targets: Vec<String> = Vec::new();
        for dbname in &dbnames {
            let db_spec = match self.mapping.find_db(dbname) {
                Some(spec) => spec,
                None => continue,
            };
            for coll in self.source.collection_names(dbname)? {
                if db_spec.collection(&coll).is_some() {
                    targets.push(format!("{}.{}", dbname, coll));
                }
            }
        }
        info!(collections = targets.len(), "collections selected for import");

        let ctx = ImportContext {
            mapping: self.mapping.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            options: self.options.clone(),
            done: self.done.clone(),
            truncated: self.truncated.clone(),
        };

        let threads = self.options.worker_threads();
        if threads >= 1 {
            import_parallel(&ctx, targets, threads)?;
        } else {
            for ns in targets {
                if ctx.done.load(Ordering::Relaxed) {
                    break;
                }
                import_collection(&ctx, &ns)?;
            }
        }

        if let Some(position) = start_position {
            self.tailer.save_position(position)?;
            info!(?position, "recorded import watermark as the resume position");
        }
        Ok(())
    }
}

fn import_parallel(ctx: &ImportContext, targets: Vec<String>, threads: usize) -> Result<()> {
    info!(threads, "importing collections in parallel");
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| SyncError::InvalidConfig(format!("worker pool: {}", e)))?;

    let total = targets.len();
    let (sender, receiver) = channel::bounded(total.max(1));
    for ns in targets {
        let ctx = ctx.clone();
        let sender = sender.clone();
        pool.spawn(move || {
            let result = if ctx.done.load(Ordering::Relaxed) {
                Ok(())
            } else {
                import_collection(&ctx, &ns)
            };
            let _ = sender.send(result);
        });
    }
    drop(sender);

    let mut first_err = None;
    for _ in 0..total {
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    // stand the other workers down at their next boundary,
                    // but keep collecting so none is left running.
                    ctx.done.store(true, Ordering::Relaxed);
                    first_err = Some(e);
                }
            }
            Err(_) => break,
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Import one collection end to end: truncate its table once per run,
/// stream the source in pages, transform, and flush batched writes.
pub(crate) fn import_collection(ctx: &ImportContext, ns: &str) -> Result<()> {
    info!(%ns, "importing collection");
    let spec = ctx.mapping.find_ns_required(ns)?.clone();
    let mut session = ctx.sink.connect()?;

    if !ctx.options.no_drop_tables {
        // several namespaces may share one table; only the first worker to
        // get here truncates it.
        let mut truncated = ctx.truncated.lock().expect("truncated set lock poisoned");
        if truncated.insert(spec.table.clone()) {
            session.truncate(&spec.table)?;
        }
    }

    let columns = ctx.mapping.output_columns(&spec);
    let key_names: Vec<String> = ctx
        .mapping
        .primary_key_specs(ns)?
        .iter()
        .map(|c| c.name.clone())
        .collect();

    let mut count: u64 = 0;
    let mut batch: Vec<Row> = Vec::with_capacity(BATCH);
    let start = Instant::now();
    let mut sql_time = Duration::default();

    with_retries(MAX_SOURCE_ATTEMPTS, || {
        let cursor = ctx.source.scan(ns, spec.filter.clone(), BATCH as u32)?;
        for document in cursor {
            let document = document?;
            batch.push(ctx.mapping.transform(ns, &document)?);
            count += 1;

            if batch.len() >= BATCH {
                let flush = Instant::now();
                bulk_upsert(&mut *session, ctx, ns, &spec, &columns, &key_names, &batch)?;
                sql_time += flush.elapsed();
                batch.clear();
                info!(%ns, count, elapsed = ?start.elapsed(), sql = ?sql_time, "imported rows");
                if ctx.done.load(Ordering::Relaxed) {
                    return Ok(());
                }
            }
        }
        Ok(())
    })?;

    if !batch.is_empty() {
        let flush = Instant::now();
        bulk_upsert(&mut *session, ctx, ns, &spec, &columns, &key_names, &batch)?;
        sql_time += flush.elapsed();
    }

    info!(%ns, count, elapsed = ?start.elapsed(), sql = ?sql_time, "finished importing collection");
    // session drops here, releasing the worker's destination connection.
    Ok(())
}

/// Write a batch in one bulk operation; when the destination turns the
/// batch down, fall back to row-by-row upserts so one bad row can't void
/// the rest.
fn bulk_upsert(
    session: &mut dyn SinkSession,
    ctx: &ImportContext,
    ns: &str,
    spec: &CollSpec,
    columns: &[ColumnRef],
    key_names: &[String],
    batch: &[Row],
) -> Result<()> {
    match session.bulk_copy(&spec.table, columns, batch) {
        Ok(()) => Ok(()),
        Err(e @ (SyncError::Rejected { .. } | SyncError::Sql(_))) => {
            warn!(%ns, error = %e, "bulk write failed, applying rows one by one");
            for row in batch {
                unsafe_handle_exceptions(ctx.options.unsafe_mode, ns, row, || {
                    session.upsert(&spec.table, key_names, columns, row)
                })?;
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
