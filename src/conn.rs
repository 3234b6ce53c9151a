//! Per-connection execution engine.
//!
//! A [`Conn`] wraps one wire session and owns the scratch buffers used to
//! stage parameters and result formats. Buffers are reused across calls and
//! shrunk when a call leaves them far larger than needed, so a long-lived
//! connection's memory use stays proportional to its recent statements.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{Encode, Encoded, Row};
use crate::wire::{Session, TX_FAILED, TX_IDLE, TX_IN_BLOCK};

/// Transaction body passed to [`Conn::begin`]. It receives the connection
/// it runs on; nested code can be written against [`crate::StdDb`].
pub type TxFn<'a, D> =
    Box<dyn for<'c> FnOnce(&'c mut D) -> BoxFuture<'c, Result<()>> + Send + 'a>;

/// Extra slack allowed before an oversized parameter buffer is released.
const PARAM_BUF_SLACK: usize = 512;

/// Minimum retained capacity of the parameter scratch arrays.
const PARAM_SCRATCH_FLOOR: usize = 32;

/// Minimum retained capacity of the result-format scratch array.
const RESULT_SCRATCH_FLOOR: usize = 64;

// ============================================================================
// Connection
// ============================================================================

/// One PostgreSQL connection.
///
/// A connection runs one statement at a time; it is not shareable between
/// tasks. The pool hands out connections under that exclusive-ownership
/// contract, and a standalone connection relies on `&mut self` for it.
pub struct Conn<S: Session> {
    pub(crate) session: S,

    /// All parameters of one call, packed back to back.
    param_buf: Vec<u8>,
    /// Per-parameter view into `param_buf` as (start, end) byte offsets;
    /// `None` is SQL NULL. Offsets stay valid across buffer growth and are
    /// materialized as slices only once encoding has finished.
    param_ranges: Vec<Option<(usize, usize)>>,
    param_oids: Vec<u32>,
    param_formats: Vec<i16>,

    result_formats: Vec<i16>,
}

impl<S: Session> Conn<S> {
    /// Wraps an externally opened wire session.
    pub fn new(session: S) -> Self {
        Self {
            session,
            param_buf: Vec::new(),
            param_ranges: Vec::new(),
            param_oids: Vec::new(),
            param_formats: Vec::new(),
            result_formats: Vec::new(),
        }
    }

    /// Runs a statement and streams its rows into `results`.
    ///
    /// `results` declares one destination per result column; its requested
    /// formats are sent with the statement. After each row is decoded,
    /// `row_fn` is invoked with the populated destinations. The first
    /// decoder or callback error aborts the iteration and is returned after
    /// the wire result has been drained.
    ///
    /// Returns the number of rows delivered.
    pub async fn query<R, F>(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        args: &[&dyn Encode],
        results: &mut R,
        mut row_fn: F,
    ) -> Result<i64>
    where
        R: Row,
        F: FnMut(&R) -> Result<()> + Send,
    {
        self.prepare_params(args);
        self.prepare_results(results);
        self.issue(ctx, sql, true).await?;

        let mut row_count = 0i64;
        let mut failure = None;

        loop {
            if ctx.is_cancelled() {
                failure = Some(Error::Canceled);
                break;
            }
            match self.session.next_row().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            }
            row_count += 1;

            let decoded = results.decode_row(self.session.row_values());
            if let Err(e) = decoded {
                failure = Some(e);
                break;
            }
            if let Err(e) = row_fn(&*results) {
                failure = Some(e);
                break;
            }
        }

        // The wire result is drained even when the loop aborted early.
        let closed = self.session.finish().await;
        if let Some(e) = failure {
            return Err(e);
        }
        closed?;

        self.release_oversized_param_buf();
        Ok(row_count)
    }

    /// Runs a statement and returns the number of rows it affected.
    pub async fn exec(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        args: &[&dyn Encode],
    ) -> Result<i64> {
        self.prepare_params(args);
        self.issue(ctx, sql, false).await?;

        let tag = self.session.finish().await?;
        self.release_oversized_param_buf();
        Ok(tag.rows_affected())
    }

    /// Runs `f` inside a transaction.
    ///
    /// `BEGIN` is issued first. When `f` returns an error the transaction is
    /// rolled back and the error returned. When `f` succeeds, the server's
    /// transaction status decides the outcome: a clean transaction commits;
    /// a poisoned one rolls back and [`Error::TransactionAbort`] is
    /// returned; a status of idle means `f` ended the transaction itself,
    /// which is reported as [`Error::TransactionMisuse`].
    ///
    /// Nested transactions are not defined; issuing `begin` from inside `f`
    /// has whatever effect the server gives a nested `BEGIN`.
    pub async fn begin<'f>(&mut self, ctx: &CancellationToken, f: TxFn<'f, Self>) -> Result<()> {
        self.session.exec(ctx, "begin").await?;
        let mut tx_in_progress = true;

        let body = f(self).await;

        match body {
            Err(e) => {
                self.rollback(ctx, &mut tx_in_progress).await;
                Err(e)
            }
            Ok(()) => match self.session.tx_status() {
                TX_IN_BLOCK => {
                    tx_in_progress = false;
                    self.session.exec(ctx, "commit").await?;
                    Ok(())
                }
                TX_FAILED => {
                    self.rollback(ctx, &mut tx_in_progress).await;
                    Err(Error::TransactionAbort)
                }
                TX_IDLE => Err(Error::TransactionMisuse),
                other => Err(Error::Protocol(format!(
                    "impossible txStatus: {}",
                    other as char
                ))),
            },
        }
    }

    /// Best-effort rollback. A rollback that itself fails leaves the
    /// session in an unknown state, so the session is closed to force the
    /// pool to discard it.
    async fn rollback(&mut self, ctx: &CancellationToken, tx_in_progress: &mut bool) {
        if !*tx_in_progress {
            return;
        }
        *tx_in_progress = false;
        if let Err(e) = self.session.exec(ctx, "rollback").await {
            warn!(error = %e, "rollback failed, closing connection");
            self.session.close().await;
        }
    }

    // ========================================================================
    // Parameter and result staging
    // ========================================================================

    /// Encodes `args` into the shared parameter buffer.
    ///
    /// The scratch arrays are recycled in place; they are reallocated only
    /// when too small for this call or more than twice as large as it
    /// needs. `param_buf` keeps its capacity so repeated calls do not churn
    /// allocations.
    fn prepare_params(&mut self, args: &[&dyn Encode]) {
        self.param_ranges.clear();
        self.param_oids.clear();
        self.param_formats.clear();
        self.param_buf.clear();
        if args.is_empty() {
            return;
        }

        let max_cap = (args.len() * 2).max(PARAM_SCRATCH_FLOOR);
        if self.param_ranges.capacity() > max_cap {
            let keep = args.len().max(PARAM_SCRATCH_FLOOR);
            self.param_ranges.shrink_to(keep);
            self.param_oids.shrink_to(keep);
            self.param_formats.shrink_to(keep);
        }

        for arg in args {
            let start = self.param_buf.len();
            match arg.encode(&mut self.param_buf) {
                Encoded::Value { oid, format } => {
                    self.param_ranges.push(Some((start, self.param_buf.len())));
                    self.param_oids.push(oid);
                    self.param_formats.push(format);
                }
                Encoded::Null { format } => {
                    // A NULL encoder must not leave bytes behind.
                    self.param_buf.truncate(start);
                    self.param_ranges.push(None);
                    self.param_oids.push(0);
                    self.param_formats.push(format);
                }
            }
        }
    }

    /// Collects the requested result formats, with the same recycling
    /// policy as the parameter arrays.
    fn prepare_results<R: Row>(&mut self, results: &R) {
        self.result_formats.clear();
        results.formats(&mut self.result_formats);

        let max_cap = (self.result_formats.len() * 2).max(RESULT_SCRATCH_FLOOR);
        if self.result_formats.capacity() > max_cap {
            let keep = self.result_formats.len().max(RESULT_SCRATCH_FLOOR);
            self.result_formats.shrink_to(keep);
        }
    }

    /// Materializes the parameter views and issues the wire call. Views are
    /// built from the recorded offsets only now, after all encoders have
    /// run, so buffer growth during encoding cannot invalidate them.
    async fn issue(&mut self, ctx: &CancellationToken, sql: &str, with_results: bool) -> Result<()> {
        let param_values: Vec<Option<&[u8]>> = self
            .param_ranges
            .iter()
            .map(|range| range.map(|(start, end)| &self.param_buf[start..end]))
            .collect();
        let result_formats: &[i16] = if with_results {
            &self.result_formats
        } else {
            &[]
        };

        self.session
            .exec_params(
                ctx,
                sql,
                &param_values,
                &self.param_oids,
                &self.param_formats,
                result_formats,
            )
            .await?;
        Ok(())
    }

    /// Releases the parameter buffer when a call left it mostly empty, so
    /// one unusually large statement does not pin its allocation forever.
    fn release_oversized_param_buf(&mut self) {
        if self.param_buf.len() + PARAM_BUF_SLACK < self.param_buf.capacity() / 2 {
            self.param_buf = Vec::new();
        }
    }

    #[cfg(test)]
    pub(crate) fn param_buf_capacity(&self) -> usize {
        self.param_buf.capacity()
    }

    #[cfg(test)]
    pub(crate) fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

#[async_trait::async_trait]
impl<S: Session + 'static> crate::StdDb for Conn<S> {
    type Tx = Conn<S>;

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
        F: FnMut(&R) -> Result<()> + Send,
    {
        Conn::query(self, ctx, sql, args, results, row_fn).await
    }

    async fn exec(&mut self, ctx: &CancellationToken, sql: &str, args: &[&dyn Encode]) -> Result<i64> {
        Conn::exec(self, ctx, sql, args).await
    }

    async fn begin<'f>(&mut self, ctx: &CancellationToken, f: TxFn<'f, Self::Tx>) -> Result<()> {
        Conn::begin(self, ctx, f).await
    }
}
