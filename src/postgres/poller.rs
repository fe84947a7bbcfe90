//! Adaptive poller over a wal2json replication slot.
//!
//! The poller owns the slot source and a single scheduled poll at a time.
//! Outcomes are delivered as [`PollerEvent`]s on an unbounded channel:
//!
//! - a non-empty read produces [`PollerEvent::Batch`] and the poller waits
//!   until [`ReplicationPoller::resume`] is called. Reads do not consume the
//!   slot: the consumer calls [`ReplicationPoller::advance`] for what it has
//!   delivered, and anything not advanced past is read again;
//! - an empty read reschedules itself, widening the interval by `step`
//!   after `throttle_threshold` empty reads in a row (capped at `max`);
//! - a failed read stops the poller, closes the source, and produces
//!   [`PollerEvent::Error`] followed by [`PollerEvent::Stopped`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::source::{ReplicationSource, OUTPUT_PLUGIN};
use super::types::SlotChange;
use crate::config::{ListenerConfig, SlotPolicy, Wal2JsonOptions};
use crate::{Error, Result};

#[derive(Debug)]
pub enum PollerEvent {
    Batch(Vec<SlotChange>),
    Error(Error),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub slot_name: String,
    pub default_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub throttle_threshold: u32,
    pub interval_step: Duration,
    pub slot_policy: SlotPolicy,
    /// Flattened wal2json options, see [`Wal2JsonOptions::to_variadic`].
    pub plugin_options: Vec<String>,
}

impl PollerSettings {
    pub fn from_config(listener: &ListenerConfig, wal2json: &Wal2JsonOptions) -> Self {
        Self {
            slot_name: listener.slot_name.clone(),
            default_interval: listener.poll_interval(),
            min_interval: Duration::from_millis(listener.min_interval_ms),
            max_interval: Duration::from_millis(listener.max_interval_ms),
            throttle_threshold: listener.throttle_threshold.max(1),
            interval_step: Duration::from_millis(listener.interval_step_ms),
            slot_policy: listener.slot_policy,
            plugin_options: wal2json.to_variadic(),
        }
    }

    fn floor_interval(&self) -> Duration {
        self.default_interval
            .clamp(self.min_interval, self.max_interval.max(self.min_interval))
    }
}

/// Mutable state of one poller.
#[derive(Debug)]
struct PollState {
    running: bool,
    /// A poll is scheduled or executing and its outcome not yet delivered.
    waiting_for_result: bool,
    current_interval: Duration,
    consecutive_empty_polls: u32,
    /// Bumped on every start/stop so stale timers never act.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    in_flight: bool,
}

struct Shared<S> {
    source: S,
    settings: PollerSettings,
    state: Mutex<PollState>,
    events: mpsc::UnboundedSender<PollerEvent>,
}

pub struct ReplicationPoller<S: ReplicationSource> {
    shared: Arc<Shared<S>>,
}

impl<S: ReplicationSource> ReplicationPoller<S> {
    pub fn new(source: S, settings: PollerSettings) -> (Self, mpsc::UnboundedReceiver<PollerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = PollState {
            running: false,
            waiting_for_result: false,
            current_interval: settings.floor_interval(),
            consecutive_empty_polls: 0,
            generation: 0,
            timer: None,
            in_flight: false,
        };
        let shared = Arc::new(Shared {
            source,
            settings,
            state: Mutex::new(state),
            events: tx,
        });
        (Self { shared }, rx)
    }

    /// Ensures the slot and schedules the first poll.
    ///
    /// Starting a running poller is signaled as [`Error::AlreadyRunning`] on
    /// the event channel and leaves the poller untouched. Slot setup
    /// failures are returned and leave the poller stopped.
    #[instrument(skip(self), fields(slot = %self.shared.settings.slot_name))]
    pub async fn start(&self) -> Result<()> {
        if self.shared.lock().running {
            warn!("Listener is already running");
            self.shared.signal(PollerEvent::Error(Error::AlreadyRunning));
            return Ok(());
        }

        self.shared.ensure_slot().await?;

        let mut state = self.shared.lock();
        if state.running {
            drop(state);
            self.shared.signal(PollerEvent::Error(Error::AlreadyRunning));
            return Ok(());
        }
        state.running = true;
        state.waiting_for_result = false;
        state.in_flight = false;
        state.consecutive_empty_polls = 0;
        state.current_interval = self.shared.settings.floor_interval();
        state.generation += 1;
        Shared::schedule(&self.shared, &mut state);

        info!(interval_ms = state.current_interval.as_millis() as u64, "Listener started");
        Ok(())
    }

    /// Asks for the next batch once the previous one has been consumed.
    pub fn resume(&self) {
        let mut state = self.shared.lock();
        if !state.running {
            drop(state);
            self.shared.signal(PollerEvent::Error(Error::NotRunning));
        } else if state.waiting_for_result {
            drop(state);
            self.shared.signal(PollerEvent::Error(Error::ConcurrentPoll));
        } else {
            Shared::schedule(&self.shared, &mut state);
        }
    }

    /// Cancels the pending poll and releases the connection.
    ///
    /// A query already executing is left to finish; its result is dropped.
    pub async fn stop(&self) {
        let was_running = {
            let mut state = self.shared.lock();
            let was_running = state.running;
            self.shared.halt(&mut state);
            was_running
        };

        self.shared.source.close().await;

        if was_running {
            info!(slot = %self.shared.settings.slot_name, "Listener stopped");
            self.shared.signal(PollerEvent::Stopped);
        }
    }

    /// Moves the slot past every change up to and including `lsn`.
    ///
    /// Only valid between a batch and the following [`resume`](Self::resume),
    /// while no read is executing.
    pub async fn advance(&self, lsn: &str) -> Result<()> {
        let slot = &self.shared.settings.slot_name;
        self.shared.source.advance_slot(slot, lsn).await?;
        debug!(slot = %slot, lsn = %lsn, "Slot advanced");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn current_interval(&self) -> Duration {
        self.shared.lock().current_interval
    }

    pub fn consecutive_empty_polls(&self) -> u32 {
        self.shared.lock().consecutive_empty_polls
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.shared.settings
    }
}

impl<S: ReplicationSource> Drop for ReplicationPoller<S> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.running = false;
    }
}

impl<S: ReplicationSource> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal(&self, event: PollerEvent) {
        if self.events.send(event).is_err() {
            debug!("Poller event dropped, receiver is gone");
        }
    }

    async fn ensure_slot(&self) -> Result<()> {
        let slot = &self.settings.slot_name;
        let exists = self.source.slot_exists(slot).await?;

        match (exists, self.settings.slot_policy) {
            (false, _) => {
                self.source.create_slot(slot, OUTPUT_PLUGIN).await?;
                info!("Created replication slot '{}'", slot);
                Ok(())
            }
            (true, SlotPolicy::Reuse) => {
                info!("Reusing replication slot '{}'", slot);
                Ok(())
            }
            (true, SlotPolicy::RequireNew) => {
                error!("Replication slot '{}' already exists", slot);
                Err(Error::SlotConflict { slot: slot.clone() })
            }
        }
    }

    fn halt(&self, state: &mut PollState) {
        state.running = false;
        state.waiting_for_result = false;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            if !state.in_flight {
                timer.abort();
            }
        }
    }

    fn schedule(shared: &Arc<Self>, state: &mut PollState) {
        state.waiting_for_result = true;
        let delay = state.current_interval;
        let generation = state.generation;
        let task_shared = Arc::clone(shared);

        debug!(delay_ms = delay.as_millis() as u64, "Scheduling poll");
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Shared::poll(task_shared, generation).await;
        }));
    }

    async fn poll(shared: Arc<Self>, generation: u64) {
        {
            let mut state = shared.lock();
            if !state.running || state.generation != generation {
                return;
            }
            state.in_flight = true;
        }

        let result = shared
            .source
            .slot_changes(&shared.settings.slot_name, &shared.settings.plugin_options)
            .await;

        let outcome = {
            let mut state = shared.lock();
            state.in_flight = false;
            if !state.running || state.generation != generation {
                PollOutcome::Discarded
            } else {
                state.timer = None;
                state.waiting_for_result = false;
                match result {
                    Err(e) => {
                        shared.halt(&mut state);
                        PollOutcome::Failed(e)
                    }
                    Ok(rows) if !rows.is_empty() => {
                        state.current_interval = shared.settings.floor_interval();
                        state.consecutive_empty_polls = 0;
                        PollOutcome::Batch(rows)
                    }
                    Ok(_) => {
                        shared.record_empty_poll(&mut state);
                        Shared::schedule(&shared, &mut state);
                        PollOutcome::Empty
                    }
                }
            }
        };

        match outcome {
            PollOutcome::Discarded => debug!("Discarding poll result of a stopped listener"),
            PollOutcome::Failed(e) => {
                error!("Failed to read replication slot: {}", e);
                shared.source.close().await;
                shared.signal(PollerEvent::Error(e));
                shared.signal(PollerEvent::Stopped);
            }
            PollOutcome::Batch(rows) => {
                debug!(rows = rows.len(), "Read changes from slot");
                shared.signal(PollerEvent::Batch(rows));
            }
            PollOutcome::Empty => {}
        }
    }

    fn record_empty_poll(&self, state: &mut PollState) {
        state.consecutive_empty_polls += 1;
        if state.consecutive_empty_polls < self.settings.throttle_threshold {
            return;
        }

        let widened = state.current_interval + self.settings.interval_step;
        state.current_interval = widened.min(self.settings.max_interval);
        state.consecutive_empty_polls = 0;
        debug!(
            interval_ms = state.current_interval.as_millis() as u64,
            "No changes for a while, widening poll interval"
        );
    }
}

enum PollOutcome {
    Discarded,
    Failed(Error),
    Batch(Vec<SlotChange>),
    Empty,
}
