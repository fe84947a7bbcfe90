pub mod connection;
pub mod poller;
pub mod source;
pub mod types;
pub mod wal2json;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::PgClient;
pub use poller::{PollerEvent, PollerSettings, ReplicationPoller};
pub use source::{KeyCatalog, ReplicationSource, TablePrimaryKey, OUTPUT_PLUGIN};
pub use types::*;
pub use wal2json::{parse_transaction, RawChangeEvent, RawKind, Wal2JsonTransaction};
