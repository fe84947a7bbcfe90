//! Error types and result handling for wal-logger.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use wal_logger::{Error, Result};
//!
//! fn ensure_slot() -> Result<()> {
//!     Err(Error::SlotConflict { slot: "wal_logger".to_string() })
//! }
//!
//! match ensure_slot() {
//!     Ok(()) => println!("Slot ready"),
//!     Err(Error::SlotConflict { slot }) => eprintln!("Slot {} is taken", slot),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for wal-logger operations.
///
/// Variants fall into the groups the pipeline treats differently:
/// configuration errors are fatal at startup, control-flow errors are
/// signaled on the poller's event channel, transport errors stop the
/// poller, and malformed payloads stop the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically a missing credential or an
    /// inconsistent polling interval.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or query error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON error while decoding a wal2json payload or encoding a message.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from writing messages to stdout.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed or could not be used.
    #[error("Connection error: {0}")]
    Connection(String),

    /// `start()` was called on a poller that is already running.
    #[error("Listener is already running; stop it before starting again")]
    AlreadyRunning,

    /// `resume()` was called on a poller that is not running.
    #[error("Listener must be started before requesting changes")]
    NotRunning,

    /// `resume()` was called while the previous poll is still outstanding.
    #[error("Requested new changes while the previous batch is still being processed")]
    ConcurrentPoll,

    /// The replication slot exists although a fresh slot was required.
    #[error("Replication slot '{slot}' already exists")]
    SlotConflict {
        /// Name of the conflicting slot
        slot: String,
    },

    /// Parallel name/value/type sequences of a row image differ in length.
    #[error("Column arrays differ in length: {names} names, {values} values, {types} types")]
    ArityMismatch {
        /// Number of column names
        names: usize,
        /// Number of column values
        values: usize,
        /// Number of column types
        types: usize,
    },

    /// Invalid or malformed wal2json payload.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// The sink rejected a message.
    #[error("Sink error: {message}")]
    Sink {
        /// Description of the failure
        message: String,
    },
}

/// A convenient Result type alias for wal-logger operations.
///
/// This is equivalent to `std::result::Result<T, wal_logger::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
