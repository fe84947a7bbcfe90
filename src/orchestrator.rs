use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::KeyColumnCache;
use crate::normalizer::EventNormalizer;
use crate::postgres::{
    parse_transaction, PollerEvent, PollerSettings, ReplicationPoller, ReplicationSource,
    SlotChange,
};
use crate::sink::ChangeSink;
use crate::{Error, Result};

/// Drives one slot: every batch is normalized and saved in order before the
/// poller is asked for the next one.
pub struct ChangeOrchestrator<S: ReplicationSource, K: ChangeSink> {
    poller: ReplicationPoller<S>,
    events: mpsc::UnboundedReceiver<PollerEvent>,
    cache: Arc<KeyColumnCache>,
    normalizer: EventNormalizer,
    sink: K,
    delivered: u64,
}

impl<S: ReplicationSource, K: ChangeSink> ChangeOrchestrator<S, K> {
    pub fn new(source: S, settings: PollerSettings, cache: Arc<KeyColumnCache>, sink: K) -> Self {
        let (poller, events) = ReplicationPoller::new(source, settings);
        Self {
            poller,
            events,
            cache,
            normalizer: EventNormalizer::new(),
            sink,
            delivered: 0,
        }
    }

    /// Connects the sink, then starts polling.
    pub async fn start(&mut self) -> Result<()> {
        self.sink.connect().await?;
        self.poller.start().await?;
        info!(slot = %self.poller.settings().slot_name, "Change capture started");
        Ok(())
    }

    /// Processes poller events until the poller stops or `shutdown`
    /// resolves.
    ///
    /// Returns the error that stopped the pipeline, if any.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<()> {
        if !self.poller.is_running() {
            return Err(Error::NotRunning);
        }

        tokio::pin!(shutdown);
        let mut shutting_down = false;
        let mut terminal: Option<Error> = None;

        loop {
            let next = tokio::select! {
                _ = &mut shutdown, if !shutting_down => None,
                event = self.events.recv() => Some(event),
            };

            let event = match next {
                None => {
                    info!("Shutdown requested");
                    shutting_down = true;
                    let was_running = self.poller.is_running();
                    self.poller.stop().await;
                    if !was_running {
                        return terminal.map_or(Ok(()), Err);
                    }
                    continue;
                }
                Some(None) => return terminal.map_or(Ok(()), Err),
                Some(Some(event)) => event,
            };

            match event {
                PollerEvent::Batch(rows) => {
                    if let Err(e) = self.handle_batch(&rows).await {
                        error!("Failed to process batch: {}", e);
                        self.poller.stop().await;
                        return Err(e);
                    }
                    self.poller.resume();
                }
                PollerEvent::Error(
                    e @ (Error::AlreadyRunning | Error::NotRunning | Error::ConcurrentPoll),
                ) => {
                    warn!("Listener misuse: {}", e);
                }
                PollerEvent::Error(e) => {
                    error!("Listener failed: {}", e);
                    terminal = Some(e);
                }
                PollerEvent::Stopped => {
                    info!(delivered = self.delivered, "Change capture stopped");
                    return terminal.map_or(Ok(()), Err);
                }
            }
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn stop(&mut self) {
        self.poller.stop().await;
    }

    /// Messages saved since construction.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn poller(&self) -> &ReplicationPoller<S> {
        &self.poller
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Delivers a batch and advances the slot past every row whose events
    /// all reached the sink. On failure the slot still advances past the
    /// rows completed before it, so a restart resumes at the failed row.
    #[instrument(skip_all, fields(rows = rows.len()))]
    async fn handle_batch(&mut self, rows: &[SlotChange]) -> Result<()> {
        let mut outcome = Ok(());
        let mut delivered_through = None;

        for row in rows {
            if let Err(e) = self.deliver_row(row).await {
                outcome = Err(e);
                break;
            }
            delivered_through = Some(row.lsn.as_str());
        }

        if let Some(lsn) = delivered_through {
            match (&outcome, self.poller.advance(lsn).await) {
                (Ok(()), Err(e)) => return Err(e),
                (Err(_), Err(e)) => warn!("Failed to advance slot past delivered rows: {}", e),
                _ => {}
            }
        }

        debug!(delivered = self.delivered, "Batch processed");
        outcome
    }

    async fn deliver_row(&mut self, row: &SlotChange) -> Result<()> {
        let transaction = parse_transaction(row)?;

        for event in &transaction.change {
            let table = event.qualified_table();
            let key_columns = self.cache.get(&table).unwrap_or_else(|| {
                debug!(table = %table, "No known primary key");
                Vec::new()
            });

            let Some(message) = self
                .normalizer
                .normalize(event, &key_columns, transaction.xid)?
            else {
                continue;
            };

            self.sink.save_message(&message).await?;
            self.delivered += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotPolicy;
    use crate::postgres::test_utils::{slot_change, MockSource};
    use crate::postgres::{ChangeKind, ChangeMessage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        connected: bool,
        messages: Vec<ChangeMessage>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ChangeSink for RecordingSink {
        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn save_message(&mut self, message: &ChangeMessage) -> Result<()> {
            if self.fail_after == Some(self.messages.len()) {
                return Err(Error::Sink {
                    message: "disk full".to_string(),
                });
            }
            self.messages.push(message.clone());
            Ok(())
        }
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            slot_name: "test_slot".to_string(),
            default_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            throttle_threshold: 5,
            interval_step: Duration::from_millis(100),
            slot_policy: SlotPolicy::Reuse,
            plugin_options: Vec::new(),
        }
    }

    fn cache() -> Arc<KeyColumnCache> {
        let cache = KeyColumnCache::new(Duration::ZERO, Vec::new());
        cache.set("public.users", vec!["id".to_string()]);
        Arc::new(cache)
    }

    fn insert(id: u64, login: &str) -> serde_json::Value {
        json!({
            "kind": "insert",
            "schema": "public",
            "table": "users",
            "columnnames": ["id", "login"],
            "columntypes": ["bigint", "text"],
            "columnvalues": [id, login]
        })
    }

    fn transaction(xid: u64, changes: Vec<serde_json::Value>) -> SlotChange {
        slot_change(xid, &json!({ "xid": xid, "change": changes }).to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_sink() {
        let mut orchestrator =
            ChangeOrchestrator::new(MockSource::new(), settings(), cache(), RecordingSink::default());

        orchestrator.start().await.unwrap();

        assert!(orchestrator.sink().connected);
        assert!(orchestrator.poller().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_requires_start() {
        let mut orchestrator =
            ChangeOrchestrator::new(MockSource::new(), settings(), cache(), RecordingSink::default());

        assert!(matches!(orchestrator.run().await, Err(Error::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_delivered_in_order() {
        let source = MockSource::new();
        source.push_rows(vec![
            transaction(10, vec![insert(1, "a"), insert(2, "b")]),
            transaction(11, vec![insert(3, "c")]),
        ]);
        source.push_rows(Vec::new());
        source.push_rows(vec![transaction(12, vec![insert(4, "d")])]);

        let mut orchestrator =
            ChangeOrchestrator::new(source.clone(), settings(), cache(), RecordingSink::default());
        orchestrator.start().await.unwrap();
        orchestrator
            .run_until(tokio::time::sleep(Duration::from_secs(2)))
            .await
            .unwrap();

        let sink = orchestrator.sink();
        let ids: Vec<_> = sink
            .messages
            .iter()
            .map(|m| m.primary_key["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);

        let xids: Vec<_> = sink.messages.iter().map(|m| m.xid).collect();
        assert_eq!(xids, vec![Some(10), Some(10), Some(11), Some(12)]);

        assert_eq!(orchestrator.delivered(), 4);
        assert!(!orchestrator.poller().is_running());
        assert!(source.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_end_to_end() {
        let source = MockSource::new();
        source.push_rows(vec![transaction(
            20,
            vec![json!({
                "kind": "update",
                "schema": "public",
                "table": "users",
                "columnnames": ["id", "login"],
                "columntypes": ["bigint", "character varying(128)"],
                "columnvalues": [620, "economist"],
                "oldkeys": {
                    "keynames": ["id", "login"],
                    "keytypes": ["bigint", "character varying(128)"],
                    "keyvalues": [3, "driver"]
                }
            })],
        )]);

        let mut orchestrator =
            ChangeOrchestrator::new(source, settings(), cache(), RecordingSink::default());
        orchestrator.start().await.unwrap();
        orchestrator
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        let message = &orchestrator.sink().messages[0];
        assert_eq!(message.kind, ChangeKind::Update);
        assert_eq!(
            serde_json::to_value(&message.diff).unwrap(),
            json!({
                "id": {"oldValue": 3, "newValue": 620},
                "login": {"oldValue": "driver", "newValue": "economist"}
            })
        );
        assert_eq!(serde_json::to_value(&message.primary_key).unwrap(), json!({"id": 3}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_table_has_empty_primary_key() {
        let source = MockSource::new();
        source.push_rows(vec![transaction(
            30,
            vec![json!({
                "kind": "insert",
                "schema": "public",
                "table": "events",
                "columnnames": ["payload"],
                "columntypes": ["text"],
                "columnvalues": ["x"]
            })],
        )]);

        let mut orchestrator =
            ChangeOrchestrator::new(source, settings(), cache(), RecordingSink::default());
        orchestrator.start().await.unwrap();
        orchestrator
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        let message = &orchestrator.sink().messages[0];
        assert!(message.primary_key.is_empty());
        assert_eq!(message.diff.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_stops_pipeline() {
        let source = MockSource::new();
        source.push_rows(vec![
            transaction(40, vec![insert(1, "a")]),
            slot_change(41, "{\"change\": [{\"kind\": "),
        ]);

        let mut orchestrator =
            ChangeOrchestrator::new(source.clone(), settings(), cache(), RecordingSink::default());
        orchestrator.start().await.unwrap();
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, Error::InvalidMessage { .. }));
        assert_eq!(orchestrator.sink().messages.len(), 1);
        assert_eq!(source.pending().len(), 1);
        assert!(!orchestrator.poller().is_running());
        assert!(source.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_stops_pipeline() {
        let source = MockSource::new();
        source.push_rows(vec![transaction(50, vec![insert(1, "a"), insert(2, "b")])]);
        let sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };

        let mut orchestrator = ChangeOrchestrator::new(source.clone(), settings(), cache(), sink);
        orchestrator.start().await.unwrap();
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, Error::Sink { .. }));
        assert_eq!(orchestrator.delivered(), 1);
        assert!(source.advanced().is_empty());
        assert_eq!(source.pending().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_read_again_after_restart() {
        let source = MockSource::new();
        source.push_rows(vec![
            transaction(60, vec![insert(1, "a")]),
            transaction(61, vec![insert(2, "b")]),
            transaction(62, vec![insert(3, "c")]),
        ]);
        let failing = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };

        let mut orchestrator = ChangeOrchestrator::new(source.clone(), settings(), cache(), failing);
        orchestrator.start().await.unwrap();
        assert!(orchestrator.run().await.is_err());
        assert_eq!(source.advanced().len(), 1);

        source.reopen();
        let mut orchestrator =
            ChangeOrchestrator::new(source.clone(), settings(), cache(), RecordingSink::default());
        orchestrator.start().await.unwrap();
        orchestrator
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        let ids: Vec<_> = orchestrator
            .sink()
            .messages
            .iter()
            .map(|m| m.primary_key["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);
        assert!(source.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_returned() {
        let source = MockSource::new();
        source.push_failure("server closed the connection unexpectedly");

        let mut orchestrator =
            ChangeOrchestrator::new(source, settings(), cache(), RecordingSink::default());
        orchestrator.start().await.unwrap();
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, Error::Connection(_)));
        assert!(!orchestrator.poller().is_running());
    }
}
