//! Writes change messages into the `log` audit table, one row per changed
//! column.

use async_trait::async_trait;
use serde_json::Value;
use tokio_postgres::{Client, Config, NoTls, Statement};
use tracing::{debug, error, info, instrument};

use super::ChangeSink;
use crate::postgres::ChangeMessage;
use crate::{Error, Result};

const CREATE_LOG_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS log (
        id                  BIGSERIAL PRIMARY KEY,
        table_name          TEXT        NOT NULL,
        field               TEXT        NOT NULL,
        old_value           TEXT,
        new_value           TEXT,
        operation_type_code TEXT        NOT NULL,
        pkey                JSONB       NOT NULL DEFAULT '{}'::jsonb,
        xid                 BIGINT,
        dt_create           TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS log_table_name_idx ON log (lower(table_name));
    CREATE INDEX IF NOT EXISTS log_dt_create_idx ON log (dt_create);
    CREATE INDEX IF NOT EXISTS log_pkey_idx ON log USING gin (pkey);";

const INSERT_LOG_ROW: &str = "
    INSERT INTO log (table_name, field, old_value, new_value, operation_type_code, pkey, xid, dt_create)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

/// One `log` row derived from a message.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub table_name: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub operation_type_code: &'static str,
    pub pkey: Value,
    pub xid: Option<i64>,
}

impl LogRow {
    /// Expands a message into rows, one per diff column.
    pub fn from_message(message: &ChangeMessage) -> Result<Vec<LogRow>> {
        let table_name = message.qualified_table();
        let pkey = serde_json::to_value(&message.primary_key)?;
        let xid = message.xid.and_then(|xid| i64::try_from(xid).ok());

        Ok(message
            .diff
            .iter()
            .map(|(field, entry)| LogRow {
                table_name: table_name.clone(),
                field: field.clone(),
                old_value: value_text(&entry.old_value),
                new_value: value_text(&entry.new_value),
                operation_type_code: message.kind.as_str(),
                pkey: pkey.clone(),
                xid,
            })
            .collect())
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

struct Connected {
    client: Client,
    insert: Statement,
    connection_task: tokio::task::JoinHandle<()>,
}

pub struct PostgresSink {
    config: Config,
    create_table: bool,
    connected: Option<Connected>,
}

impl PostgresSink {
    pub fn new(config: Config, create_table: bool) -> Self {
        Self {
            config,
            create_table,
            connected: None,
        }
    }
}

#[async_trait]
impl ChangeSink for PostgresSink {
    async fn connect(&mut self) -> Result<()> {
        if self.connected.is_some() {
            return Ok(());
        }

        info!("Connecting to log database");
        let (client, connection) = self.config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Log database connection error: {}", e);
            }
        });

        if self.create_table {
            client.batch_execute(CREATE_LOG_TABLE).await?;
            debug!("Ensured log table exists");
        }
        let insert = client.prepare(INSERT_LOG_ROW).await?;

        self.connected = Some(Connected {
            client,
            insert,
            connection_task,
        });
        info!("Connected to log database");
        Ok(())
    }

    #[instrument(skip_all, fields(table = %message.qualified_table(), kind = message.kind.as_str()))]
    async fn save_message(&mut self, message: &ChangeMessage) -> Result<()> {
        let connected = self.connected.as_mut().ok_or_else(|| Error::Sink {
            message: "log database is not connected".to_string(),
        })?;

        let rows = LogRow::from_message(message)?;
        let transaction = connected.client.transaction().await?;
        for row in &rows {
            transaction
                .execute(
                    &connected.insert,
                    &[
                        &row.table_name,
                        &row.field,
                        &row.old_value,
                        &row.new_value,
                        &row.operation_type_code,
                        &row.pkey,
                        &row.xid,
                        &message.captured_at,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;

        debug!(rows = rows.len(), "Saved change message");
        Ok(())
    }
}

impl Drop for PostgresSink {
    fn drop(&mut self) {
        if let Some(connected) = self.connected.take() {
            connected.connection_task.abort();
        }
    }
}
