use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::source::{KeyCatalog, ReplicationSource, TablePrimaryKey};
use super::types::SlotChange;
use crate::{Error, Result};

/// Scripted in-memory slot for driving the poller and orchestrator.
///
/// Each read pops the next queued response and appends its rows to the
/// slot. Rows stay in the slot, and are returned by every later read, until
/// it is advanced past them. Once the queue is empty reads return whatever
/// is still pending.
#[derive(Clone, Default)]
pub struct MockSource {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    slots: HashSet<String>,
    created: Vec<(String, String)>,
    responses: VecDeque<std::result::Result<Vec<SlotChange>, String>>,
    pending: Vec<SlotChange>,
    advanced: Vec<String>,
    slot_checks: usize,
    reads: usize,
    read_delay: Option<Duration>,
    closed: bool,
    primary_keys: Vec<TablePrimaryKey>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing_slot(self, slot_name: &str) -> Self {
        self.state().slots.insert(slot_name.to_string());
        self
    }

    pub fn with_read_delay(self, delay: Duration) -> Self {
        self.state().read_delay = Some(delay);
        self
    }

    pub fn with_primary_key(self, schema: &str, table: &str, columns: &[&str]) -> Self {
        self.state().primary_keys.push(TablePrimaryKey {
            schema: schema.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn push_rows(&self, rows: Vec<SlotChange>) {
        self.state().responses.push_back(Ok(rows));
    }

    pub fn push_failure(&self, message: &str) {
        self.state().responses.push_back(Err(message.to_string()));
    }

    pub fn created_slots(&self) -> Vec<(String, String)> {
        self.state().created.clone()
    }

    pub fn slot_checks(&self) -> usize {
        self.state().slot_checks
    }

    pub fn reads(&self) -> usize {
        self.state().reads
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// LSNs the slot was advanced to, in call order.
    pub fn advanced(&self) -> Vec<String> {
        self.state().advanced.clone()
    }

    /// Rows read but not yet advanced past.
    pub fn pending(&self) -> Vec<SlotChange> {
        self.state().pending.clone()
    }

    /// Makes a closed source usable again, like a fresh connection to the
    /// same slot.
    pub fn reopen(&self) {
        self.state().closed = false;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl ReplicationSource for MockSource {
    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        let mut state = self.state();
        state.slot_checks += 1;
        Ok(state.slots.contains(slot_name))
    }

    async fn create_slot(&self, slot_name: &str, plugin: &str) -> Result<()> {
        let mut state = self.state();
        state.slots.insert(slot_name.to_string());
        state
            .created
            .push((slot_name.to_string(), plugin.to_string()));
        Ok(())
    }

    async fn slot_changes(&self, _slot_name: &str, _options: &[String]) -> Result<Vec<SlotChange>> {
        let (response, delay) = {
            let mut state = self.state();
            if state.closed {
                return Err(Error::Connection("connection already closed".to_string()));
            }
            state.reads += 1;
            (state.responses.pop_front(), state.read_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        match response {
            Some(Ok(rows)) => {
                state.pending.extend(rows);
                Ok(state.pending.clone())
            }
            Some(Err(message)) => Err(Error::Connection(message)),
            None => Ok(state.pending.clone()),
        }
    }

    async fn advance_slot(&self, _slot_name: &str, lsn: &str) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::Connection("connection already closed".to_string()));
        }
        let Some(position) = state.pending.iter().position(|row| row.lsn == lsn) else {
            return Err(Error::Connection(format!("unknown lsn {}", lsn)));
        };
        state.pending.drain(..=position);
        state.advanced.push(lsn.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.state().closed = true;
    }
}

#[async_trait]
impl KeyCatalog for MockSource {
    async fn primary_keys(&self, schemas: &[String]) -> Result<Vec<TablePrimaryKey>> {
        Ok(self
            .state()
            .primary_keys
            .iter()
            .filter(|key| schemas.is_empty() || schemas.contains(&key.schema))
            .cloned()
            .collect())
    }
}

pub fn slot_change(xid: u64, data: &str) -> SlotChange {
    SlotChange {
        lsn: format!("0/{:X}", 0x16B3000 + xid),
        xid: xid.to_string(),
        data: data.to_string(),
    }
}
