//! provide blocking replication apis.
mod connection;
#[doc(hidden)]
pub mod syncer;

pub use connection::Connection;
pub use syncer::{OplogApplier, StopHandle, Syncer};
