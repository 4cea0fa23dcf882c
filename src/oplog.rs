//! Structured oplog operation definition.
//!
//! Most oplog information comes from here:
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/oplog_entry.idl
//!
//! Useful fields:
//! ts: The time when the oplog entry was created. (Timestamp)
//! op: The operation type. ("i", "u", "d", "c", "n")
//! ns: The namespace on which to apply the operation. (String)
//! o: The operation applied. (Document)
//! o2: Additional information about the operation applied, the selector
//!     for update operations. (Document)

use crate::{NAMESPACE_KEY, OBJECT2_KEY, OBJECT_KEY, OP_KEY};
use bson::Document;
use thiserror::Error;

/// One oplog record, resolved to its kind.
///
/// Consumed once by the applier; never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// no-op, periodically written by the server, nothing to apply.
    Noop {
        /// namespace the entry was recorded under.
        ns: String,
    },
    /// a document was inserted.
    Insert {
        /// namespace the document was inserted into.
        ns: String,
        /// the inserted document.
        document: Document,
    },
    /// a document was updated, either in place (`$`-operator payload) or by
    /// full replacement.
    Update {
        /// namespace the document lives in.
        ns: String,
        /// the update payload.
        update: Document,
        /// selector identifying the updated document.
        selector: Document,
    },
    /// a document was deleted.
    Delete {
        /// namespace the document was deleted from.
        ns: String,
        /// selector identifying the deleted document.
        selector: Document,
    },
    /// a database command, e.g. a nested `applyOps` batch.
    Command {
        /// namespace the command ran against (`db.$cmd`).
        ns: String,
        /// the command document.
        command: Document,
    },
}

/// Reason an oplog document couldn't be resolved to an [Operation].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OpParseError {
    /// namespace, kind or payload is missing or has the wrong type.
    #[error("oplog entry misses namespace, operation kind or payload")]
    Malformed,
    /// the `op` value is none of the known kinds.
    #[error("unrecognized oplog operation kind {0:?}")]
    UnknownKind(String),
}

impl Operation {
    /// Resolve a raw oplog document into an [Operation].
    pub fn from_doc(doc: &Document) -> std::result::Result<Operation, OpParseError> {
        let ns = doc
            .get_str(NAMESPACE_KEY)
            .map_err(|_| OpParseError::Malformed)?
            .to_string();
        let kind = doc.get_str(OP_KEY).map_err(|_| OpParseError::Malformed)?;
        let payload = || {
            doc.get_document(OBJECT_KEY)
                .map(Clone::clone)
                .map_err(|_| OpParseError::Malformed)
        };

        match kind {
            "n" => Ok(Operation::Noop { ns }),
            "i" => Ok(Operation::Insert {
                ns,
                document: payload()?,
            }),
            "u" => Ok(Operation::Update {
                ns,
                update: payload()?,
                selector: doc
                    .get_document(OBJECT2_KEY)
                    .map(Clone::clone)
                    .map_err(|_| OpParseError::Malformed)?,
            }),
            "d" => Ok(Operation::Delete {
                ns,
                selector: payload()?,
            }),
            "c" => Ok(Operation::Command {
                ns,
                command: payload()?,
            }),
            other => Err(OpParseError::UnknownKind(other.to_string())),
        }
    }

    /// namespace the operation applies to.
    pub fn namespace(&self) -> &str {
        match self {
            Operation::Noop { ns }
            | Operation::Insert { ns, .. }
            | Operation::Update { ns, .. }
            | Operation::Delete { ns, .. }
            | Operation::Command { ns, .. } => ns,
        }
    }
}

/// Check whether an update payload is an in-place modification (top-level
/// `$`-operator keys) rather than a full-document replacement.
///
/// The two need completely different handling: an in-place modification
/// doesn't carry the resulting document, a replacement does.
pub fn is_partial_update(update: &Document) -> bool {
    update.keys().any(|k| k.starts_with('$'))
}
