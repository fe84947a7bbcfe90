//! Database seams used by the poller and the key cache.

use async_trait::async_trait;

use super::types::SlotChange;
use crate::Result;

/// Output plugin the slot is created with.
pub const OUTPUT_PLUGIN: &str = "wal2json";

/// Slot operations the poller needs.
#[async_trait]
pub trait ReplicationSource: Send + Sync + 'static {
    async fn slot_exists(&self, slot_name: &str) -> Result<bool>;

    async fn create_slot(&self, slot_name: &str, plugin: &str) -> Result<()>;

    /// Every pending change in the slot. Reading does not consume them; the
    /// same rows come back until the slot is advanced past them.
    async fn slot_changes(&self, slot_name: &str, options: &[String]) -> Result<Vec<SlotChange>>;

    /// Marks every change up to and including `lsn` as consumed.
    async fn advance_slot(&self, slot_name: &str, lsn: &str) -> Result<()>;

    /// Releases the connection. Calling it again is a no-op.
    async fn close(&self);
}

/// Primary-key columns of one table, in key ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePrimaryKey {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
}

/// Catalog lookups used to warm the key cache.
#[async_trait]
pub trait KeyCatalog: Send + Sync {
    /// Primary keys of every table in `schemas`; all user schemas when empty.
    async fn primary_keys(&self, schemas: &[String]) -> Result<Vec<TablePrimaryKey>>;
}
