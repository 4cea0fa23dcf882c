use crate::config::SyncerConfig;
use crate::error::{Result, SyncError};
use crate::source::MongoSource;
use crate::sql::PgSink;
use crate::tailer::{MongoTailer, PgPositionStore};
use mongodb::sync::Client;
use postgres::NoTls;

/// A simple abstraction over the clients behind one replication run.
pub struct Connection {
    mongo: Client,
    src_uri: String,
    dst_url: String,
}

impl Connection {
    /// create a new connection from the source and destination urls.
    pub fn new(src_uri: &str, dst_url: &str) -> Result<Connection> {
        let mongo = Client::with_uri_str(src_uri)?;
        Ok(Connection {
            mongo,
            src_uri: src_uri.to_string(),
            dst_url: dst_url.to_string(),
        })
    }

    /// create a new connection from given `config`.
    pub fn from_config(config: &SyncerConfig) -> Result<Connection> {
        Connection::new(config.get_src_url(), config.get_dst_url())
    }

    /// Check if we can reach both sides before a run starts.
    pub fn check_permissions(&self) -> Result<()> {
        if let Err(e) = self.mongo.list_database_names(None, None) {
            return Err(SyncError::Permission {
                uri: self.src_uri.clone(),
                detail: e,
            });
        }
        // connecting is enough of a probe for the destination side.
        postgres::Client::connect(&self.dst_url, NoTls)?;
        Ok(())
    }

    /// source handle for imports and resync reads.
    pub fn source(&self) -> MongoSource {
        MongoSource::new(self.mongo.clone())
    }

    /// destination sink factory.
    pub fn sink(&self) -> PgSink {
        PgSink::new(self.dst_url.clone())
    }

    /// oplog tailer which persists its position in the destination.
    pub fn tailer(&self) -> Result<MongoTailer> {
        let store = PgPositionStore::connect(&self.dst_url)?;
        Ok(MongoTailer::new(self.mongo.clone(), Box::new(store)))
    }
}
