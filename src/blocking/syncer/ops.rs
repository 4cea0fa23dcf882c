use super::retry::unsafe_handle_exceptions;
use crate::config::SyncOptions;
use crate::error::Result;
use crate::oplog::{is_partial_update, OpParseError, Operation};
use crate::schema::SchemaMap;
use crate::source::{split_namespace, Source};
use crate::sql::{ColumnRef, SinkSession, SqlValue};
use crate::{APPLY_OPS_KEY, SYSTEM_INDEXES_COLL};
use bson::{Bson, Document};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The replication state machine.
///
/// Consumes the oplog one operation at a time and resolves each into an
/// upsert or delete against the destination. Runs single-threaded: later
/// operations on a document may depend on earlier ones, so oplog order is
/// preserved.
pub struct OplogApplier {
    mapping: Arc<SchemaMap>,
    source: Arc<dyn Source>,
    options: Arc<SyncOptions>,
    session: Box<dyn SinkSession>,
}

impl OplogApplier {
    /// create an applier writing through `session`.
    pub fn new(
        mapping: Arc<SchemaMap>,
        source: Arc<dyn Source>,
        options: Arc<SyncOptions>,
        session: Box<dyn SinkSession>,
    ) -> OplogApplier {
        OplogApplier {
            mapping,
            source,
            options,
            session,
        }
    }

    /// Apply one raw oplog document.
    ///
    /// Idempotent with respect to re-delivery of the same logical change:
    /// every resolution is an upsert or delete keyed by the mapped primary
    /// key. Malformed and unrecognized entries are logged and dropped,
    /// never escalated.
    pub fn handle_op(&mut self, raw: &Document) -> Result<()> {
        debug!(?raw, "processing operation");
        let op = match Operation::from_doc(raw) {
            Ok(op) => op,
            Err(OpParseError::Malformed) => {
                warn!(?raw, "malformed oplog entry, skipping");
                return Ok(());
            }
            Err(OpParseError::UnknownKind(kind)) => {
                info!(%kind, "skipping oplog entry of unrecognized kind");
                return Ok(());
            }
        };

        // A batched command carries ordinary operations inside `applyOps`;
        // each goes through the same machinery. Nesting stays shallow in
        // practice.
        if let Operation::Command { command, .. } = &op {
            if let Ok(nested) = command.get_array(APPLY_OPS_KEY) {
                for entry in nested {
                    match entry {
                        Bson::Document(inner) => self.handle_op(inner)?,
                        other => {
                            warn!(?other, "non-document entry in applyOps batch, skipping")
                        }
                    }
                }
                return Ok(());
            }
        }

        if self.mapping.find_ns(op.namespace()).is_none() {
            debug!(ns = %op.namespace(), "skipping operation for unreplicated namespace");
            return Ok(());
        }

        match op {
            Operation::Noop { .. } => debug!("skipping no-op"),
            Operation::Command { ns, .. } => debug!(%ns, "skipping command operation"),
            Operation::Insert { ns, document } => {
                if split_namespace(&ns)?.1 == SYSTEM_INDEXES_COLL {
                    info!(%ns, "skipping index definition");
                } else {
                    unsafe_handle_exceptions(self.options.unsafe_mode, &ns, &document, || {
                        upsert_document(&self.mapping, &mut *self.session, &ns, &document)
                    })?;
                }
            }
            Operation::Update {
                ns,
                update,
                selector,
            } => {
                if is_partial_update(&update) {
                    // the oplog alone can't tell us the resulting document.
                    debug!(%ns, ?selector, "partial update, resyncing from the source");
                    self.sync_object(&ns, &selector)?;
                } else {
                    // A replacement payload preserves the document identity
                    // but isn't guaranteed to spell it out; recover the
                    // primary key fields from the selector.
                    let mut merged = update;
                    for key in self.mapping.primary_key_specs(&ns)? {
                        if !merged.contains_key(&key.source) {
                            if let Some(value) = selector.get(&key.source) {
                                merged.insert(key.source.clone(), value.clone());
                            }
                        }
                    }
                    debug!(%ns, "applying full-document replacement");
                    unsafe_handle_exceptions(self.options.unsafe_mode, &ns, &merged, || {
                        upsert_document(&self.mapping, &mut *self.session, &ns, &merged)
                    })?;
                }
            }
            Operation::Delete { ns, selector } => {
                if self.options.ignore_delete {
                    debug!(%ns, "ignoring delete as instructed");
                } else {
                    delete_by_selector(&self.mapping, &mut *self.session, &ns, &selector)?;
                }
            }
        }
        Ok(())
    }

    /// Re-read the document behind `selector` from the source and replace
    /// the destination row wholesale, or delete the row if the document no
    /// longer exists.
    fn sync_object(&mut self, ns: &str, selector: &Document) -> Result<()> {
        match self.source.find_one(ns, selector)? {
            Some(document) => {
                unsafe_handle_exceptions(self.options.unsafe_mode, ns, &document, || {
                    upsert_document(&self.mapping, &mut *self.session, ns, &document)
                })
            }
            None => delete_by_selector(&self.mapping, &mut *self.session, ns, selector),
        }
    }
}

fn upsert_document(
    mapping: &SchemaMap,
    session: &mut dyn SinkSession,
    ns: &str,
    document: &Document,
) -> Result<()> {
    let spec = mapping.find_ns_required(ns)?;
    let row = mapping.transform(ns, document)?;
    let columns = mapping.output_columns(spec);
    let key_names: Vec<String> = mapping
        .primary_key_specs(ns)?
        .iter()
        .map(|c| c.name.clone())
        .collect();
    session.upsert(&spec.table, &key_names, &columns, &row)
}

fn delete_by_selector(
    mapping: &SchemaMap,
    session: &mut dyn SinkSession,
    ns: &str,
    selector: &Document,
) -> Result<()> {
    let spec = mapping.find_ns_required(ns)?;
    let key_specs = mapping.primary_key_specs(ns)?;
    let keys: Vec<ColumnRef> = key_specs
        .iter()
        .map(|c| ColumnRef {
            name: c.name.clone(),
            sql_type: c.sql_type.clone(),
        })
        .collect();
    let values: Vec<SqlValue> = key_specs
        .iter()
        .map(|c| SqlValue::from_bson(selector.get(&c.source), &c.sql_type))
        .collect();
    session.delete(&spec.table, &keys, &values)
}
