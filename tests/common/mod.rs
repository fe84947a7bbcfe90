use std::collections::BTreeMap;
use std::env;
use wal_logger::config::{
    CacheConfig, Config, ListenerConfig, PostgresConfig, SinkConfig, SinkKind, SlotPolicy,
    Wal2JsonOptions,
};

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    };

    let listener = ListenerConfig {
        slot_name: format!("test_slot_{}", std::process::id()),
        poll_interval_ms: 100,
        min_interval_ms: 50,
        max_interval_ms: 1000,
        throttle_threshold: 5,
        interval_step_ms: 100,
        slot_policy: SlotPolicy::Reuse,
    };

    let wal2json = Wal2JsonOptions {
        include_xids: true,
        include_timestamp: false,
        include_types: true,
        filter_tables: None,
        add_tables: Some("public.wal_logger_test".to_string()),
        extra: BTreeMap::new(),
    };

    Config {
        postgres,
        listener,
        wal2json,
        cache: CacheConfig {
            ttl_secs: 0,
            sweep_fraction: 0.2,
            schemas: vec!["public".to_string()],
        },
        sink: SinkConfig {
            kind: SinkKind::Stdout,
            postgres: None,
            create_table: false,
        },
    }
}
