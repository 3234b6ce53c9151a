//! A minimalist PostgreSQL client layer.
//!
//! pgkit sits on top of a wire-protocol driver (the [`wire`] seam) and
//! provides the pieces an application actually touches:
//!
//! - typed parameter encoding and result decoding with NULL-capable
//!   `Option<T>` variants and user-extensible codecs ([`Encode`], [`Decode`])
//! - a per-connection execution engine that reuses its scratch buffers
//!   across calls and streams rows through a caller callback ([`Conn`])
//! - transaction blocks that commit or roll back based on the server's
//!   reported transaction status ([`Conn::begin`])
//! - a bounded connection pool with lifetime and idle eviction, a
//!   minimum-connection maintainer, and health classification on release
//!   ([`Pool`])
//!
//! There is no SQL parsing, no statement cache, and no ORM layer here; the
//! library is deliberately a thin, allocation-conscious bridge between
//! application values and the extended query protocol.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

mod config;
mod conn;
mod error;
mod pool;
pub mod slots;
mod types;
pub mod wire;

#[cfg(test)]
mod mock;

pub use config::{parse_config, PoolConfig};
pub use conn::{Conn, TxFn};
pub use error::{Error, Result};
pub use pool::{Pool, PoolConn, PoolStats};
pub use types::{oid, Date, Decode, Encode, Encoded, Row, Skip, BINARY_FORMAT, TEXT_FORMAT};
pub use wire::{CommandTag, Connect, Session, WireConfig, WireError};

/// The capability shared by [`Conn`] and [`Pool`]: run queries, run
/// statements, run transactions. Code written against `StdDb` runs on
/// either, and on the connection handed to a transaction callback.
#[async_trait]
pub trait StdDb: Send {
    /// Connection type that transaction callbacks receive.
    type Tx: Send;

    /// Runs a statement, decoding each row into `results` and invoking
    /// `row_fn` once per row. Returns the number of rows delivered.
    async fn query<R, F>(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        args: &[&dyn Encode],
        results: &mut R,
        row_fn: F,
    ) -> Result<i64>
    where
        R: Row,
        F: FnMut(&R) -> Result<()> + Send;

    /// Runs a statement and returns the number of rows it affected.
    async fn exec(&mut self, ctx: &CancellationToken, sql: &str, args: &[&dyn Encode])
        -> Result<i64>;

    /// Runs `f` inside a transaction; see [`Conn::begin`] for the commit
    /// and rollback rules.
    async fn begin<'f>(&mut self, ctx: &CancellationToken, f: TxFn<'f, Self::Tx>) -> Result<()>;
}
