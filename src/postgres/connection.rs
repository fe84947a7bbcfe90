use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, error, info, warn};

use super::source::{KeyCatalog, ReplicationSource, TablePrimaryKey};
use super::types::SlotChange;
use crate::{Error, Result};

const SLOT_EXISTS_QUERY: &str = "
    SELECT 1
    FROM pg_catalog.pg_replication_slots
    WHERE slot_name = $1";

const CREATE_SLOT_QUERY: &str =
    "SELECT pg_catalog.pg_create_logical_replication_slot($1, $2)";

const SLOT_CHANGES_QUERY: &str = "
    SELECT lsn::text AS lsn, xid::text AS xid, data
    FROM pg_catalog.pg_logical_slot_peek_changes(
        $1::text,
        NULL::pg_lsn,
        NULL::integer,
        VARIADIC $2::text[]
    )";

const ADVANCE_SLOT_QUERY: &str = "
    SELECT end_lsn::text
    FROM pg_catalog.pg_replication_slot_advance($1::text, $2::text::pg_lsn)";

const PRIMARY_KEYS_QUERY: &str = "
    SELECT tc.table_schema::text AS schema,
           tc.table_name::text AS \"table\",
           array_agg(kc.column_name::text ORDER BY kc.ordinal_position) AS pk
    FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kc
                  ON kc.table_name = tc.table_name
                      AND kc.table_schema = tc.table_schema
                      AND kc.constraint_name = tc.constraint_name
    WHERE tc.constraint_type = 'PRIMARY KEY'
      AND kc.ordinal_position IS NOT NULL
      AND tc.table_schema NOT IN ('pg_catalog', 'information_schema')
      AND (cardinality($1::text[]) = 0 OR tc.table_schema = ANY ($1::text[]))
    GROUP BY tc.table_schema, tc.table_name";

/// Plain (non-replication) client reading a logical slot through the SQL
/// slot functions.
pub struct PgClient {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    closed: AtomicBool,
}

impl PgClient {
    pub async fn connect(config: &Config) -> Result<Self> {
        info!("Connecting to PostgreSQL");

        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL");

        Ok(Self {
            client,
            connection_task,
            closed: AtomicBool::new(false),
        })
    }

    /// The underlying client, for callers issuing their own statements.
    pub fn client(&self) -> Result<&Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("connection already closed".to_string()));
        }
        Ok(&self.client)
    }
}

#[async_trait]
impl ReplicationSource for PgClient {
    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        let rows = self.client()?.query(SLOT_EXISTS_QUERY, &[&slot_name]).await?;
        debug!(slot = %slot_name, exists = !rows.is_empty(), "Checked replication slot");
        Ok(!rows.is_empty())
    }

    async fn create_slot(&self, slot_name: &str, plugin: &str) -> Result<()> {
        info!("Creating replication slot '{}' with plugin {}", slot_name, plugin);
        self.client()?
            .execute(CREATE_SLOT_QUERY, &[&slot_name, &plugin])
            .await?;
        Ok(())
    }

    async fn slot_changes(&self, slot_name: &str, options: &[String]) -> Result<Vec<SlotChange>> {
        let rows = self
            .client()?
            .query(SLOT_CHANGES_QUERY, &[&slot_name, &options])
            .await?;

        rows.iter()
            .map(|row| {
                Ok(SlotChange {
                    lsn: row.try_get("lsn")?,
                    xid: row.try_get("xid")?,
                    data: row.try_get("data")?,
                })
            })
            .collect()
    }

    async fn advance_slot(&self, slot_name: &str, lsn: &str) -> Result<()> {
        let row = self
            .client()?
            .query_one(ADVANCE_SLOT_QUERY, &[&slot_name, &lsn])
            .await?;
        let end_lsn: Option<String> = row.try_get(0)?;
        debug!(slot = %slot_name, requested = %lsn, end_lsn = ?end_lsn, "Advanced replication slot");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing PostgreSQL connection");
        self.connection_task.abort();
    }
}

#[async_trait]
impl KeyCatalog for PgClient {
    async fn primary_keys(&self, schemas: &[String]) -> Result<Vec<TablePrimaryKey>> {
        let rows = self.client()?.query(PRIMARY_KEYS_QUERY, &[&schemas]).await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: String = row.try_get("schema")?;
            let table: String = row.try_get("table")?;
            let columns: Option<Vec<String>> = row.try_get("pk")?;
            match columns {
                Some(columns) if !columns.is_empty() => keys.push(TablePrimaryKey {
                    schema,
                    table,
                    columns,
                }),
                _ => warn!("Primary key of {}.{} has no columns", schema, table),
            }
        }

        debug!("Loaded primary keys for {} tables", keys.len());
        Ok(keys)
    }
}

impl Drop for PgClient {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}
