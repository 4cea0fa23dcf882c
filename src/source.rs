//! Source database access used by the syncer core.

use crate::error::{Result, SyncError};
use bson::Document;
use mongodb::options::FindOptions;
use mongodb::sync::Client;

/// Read access to the replicated deployment.
///
/// The import path enumerates databases and collections and scans documents
/// in pages; the oplog applier reads single documents back when resyncing a
/// partially-updated row.
pub trait Source: Send + Sync {
    /// names of every database visible on the source.
    fn database_names(&self) -> Result<Vec<String>>;

    /// names of every collection in one database.
    fn collection_names(&self, db: &str) -> Result<Vec<String>>;

    /// stream the documents of a namespace matching `filter`, fetched in
    /// pages of `batch_size`.
    fn scan<'a>(
        &'a self,
        ns: &str,
        filter: Option<Document>,
        batch_size: u32,
    ) -> Result<Box<dyn Iterator<Item = Result<Document>> + 'a>>;

    /// read back one document by selector, `None` if it no longer exists.
    fn find_one(&self, ns: &str, selector: &Document) -> Result<Option<Document>>;
}

/// split `"db.collection"` into its two halves.
pub(crate) fn split_namespace(ns: &str) -> Result<(&str, &str)> {
    ns.split_once('.')
        .ok_or_else(|| SyncError::InvalidNamespace(ns.to_string()))
}

/// [Source] implementation over a mongodb connection.
#[derive(Clone)]
pub struct MongoSource {
    client: Client,
}

impl MongoSource {
    /// wrap an established client.
    pub fn new(client: Client) -> MongoSource {
        MongoSource { client }
    }
}

impl Source for MongoSource {
    fn database_names(&self) -> Result<Vec<String>> {
        Ok(self.client.list_database_names(None, None)?)
    }

    fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        Ok(self.client.database(db).list_collection_names(None)?)
    }

    fn scan<'a>(
        &'a self,
        ns: &str,
        filter: Option<Document>,
        batch_size: u32,
    ) -> Result<Box<dyn Iterator<Item = Result<Document>> + 'a>> {
        let (db, coll) = split_namespace(ns)?;
        let coll = self.client.database(db).collection::<Document>(coll);
        let cursor = coll.find(
            filter,
            FindOptions::builder()
                .batch_size(batch_size)
                .no_cursor_timeout(true)
                .build(),
        )?;
        Ok(Box::new(cursor.map(|item| item.map_err(SyncError::from))))
    }

    fn find_one(&self, ns: &str, selector: &Document) -> Result<Option<Document>> {
        let (db, coll) = split_namespace(ns)?;
        let coll = self.client.database(db).collection::<Document>(coll);
        Ok(coll.find_one(selector.clone(), None)?)
    }
}
