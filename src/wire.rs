//! The seam between this library and the wire-protocol driver.
//!
//! This crate does not speak the PostgreSQL wire protocol itself. It drives
//! an externally provided session through the [`Session`] trait and opens
//! new sessions through [`Connect`]. Any driver that can run the extended
//! query protocol with caller-chosen parameter and result formats can sit
//! behind these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Transaction status byte reported by the backend: idle, outside any
/// transaction block.
pub const TX_IDLE: u8 = b'I';
/// In a transaction block with no failed statement.
pub const TX_IN_BLOCK: u8 = b'T';
/// In a transaction block that a failed statement has poisoned.
pub const TX_FAILED: u8 = b'E';

/// Errors produced by the wire driver.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error reported by the server itself.
    #[error("{severity}: {message} ({code})")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    #[error("connection is closed")]
    Closed,
}

/// End-of-command status string, e.g. `INSERT 0 3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag(String);

impl CommandTag {
    pub fn new(tag: impl Into<String>) -> Self {
        CommandTag(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of rows the command affected, parsed from the tag.
    pub fn rows_affected(&self) -> i64 {
        // "INSERT 0 5" -> 5, "UPDATE 3" -> 3, "DELETE 2" -> 2, "SELECT 10" -> 10
        let parts: Vec<&str> = self.0.split_whitespace().collect();
        match parts.as_slice() {
            ["INSERT", _, n] | ["UPDATE", n] | ["DELETE", n] | ["SELECT", n] => {
                n.parse().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// Connection parameters handed to the wire driver when a session is
/// opened. Anything the driver itself does not recognise travels in
/// `runtime_params`.
#[derive(Debug, Clone)]
pub struct WireConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub runtime_params: HashMap<String, String>,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            runtime_params: HashMap::new(),
        }
    }
}

/// One wire-protocol session.
///
/// A session runs at most one statement at a time. `exec_params` leaves the
/// session busy until `finish` has consumed the command tag; `is_busy`
/// reports that state so a pool can refuse to reuse a half-read connection.
#[async_trait]
pub trait Session: Send {
    /// Issues one statement through the extended-query path.
    ///
    /// `param_values` holds one entry per `$n` placeholder; `None` is SQL
    /// NULL. `result_formats` requests text or binary encoding per result
    /// column; an empty slice leaves the choice to the server.
    async fn exec_params(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        param_values: &[Option<&[u8]>],
        param_oids: &[u32],
        param_formats: &[i16],
        result_formats: &[i16],
    ) -> Result<(), WireError>;

    /// Advances to the next row of the pending result. Returns `false`
    /// once all rows have been delivered.
    async fn next_row(&mut self) -> Result<bool, WireError>;

    /// Column values of the current row. `None` is SQL NULL.
    fn row_values(&self) -> &[Option<Bytes>];

    /// Drains the pending result and returns its command tag. Safe to call
    /// when no result is pending.
    async fn finish(&mut self) -> Result<CommandTag, WireError>;

    /// Runs one statement through the simple-query path. Used for
    /// transaction control.
    async fn exec(&mut self, ctx: &CancellationToken, sql: &str) -> Result<CommandTag, WireError>;

    /// Last transaction status byte reported by the backend.
    fn tx_status(&self) -> u8;

    fn is_closed(&self) -> bool;

    fn is_busy(&self) -> bool;

    /// Closes the session and waits for the driver's cleanup to complete.
    /// Callers bound this with a timeout.
    async fn close(&mut self);
}

/// Opens wire sessions; the constructor side of the driver seam.
#[async_trait]
pub trait Connect: Send + Sync {
    type Session: Session + 'static;

    async fn connect(
        &self,
        ctx: &CancellationToken,
        config: &WireConfig,
    ) -> Result<Self::Session, WireError>;
}
