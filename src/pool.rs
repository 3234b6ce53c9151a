//! Bounded connection pool.
//!
//! The pool keeps up to `max_conns` connections, rebuilds tainted ones
//! lazily, and runs a background health check that evicts old or idle
//! connections and tops the pool back up to `min_conns`. Slot bookkeeping
//! lives in [`crate::slots`]; this module supplies the connection
//! semantics: how to open one, how to tear one down, and when a returned
//! connection is no longer safe to reuse.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{parse_config, PoolConfig};
use crate::conn::{Conn, TxFn};
use crate::error::Result;
use crate::slots::{Slot, SlotPool, Stat};
use crate::types::{Encode, Row};
use crate::wire::{Connect, Session, WireConfig, TX_IDLE};

/// How long a connection gets to close cleanly before teardown gives up.
const CONN_SHUTDOWN_BUDGET: Duration = Duration::from_secs(15);

/// Budget for one min-conns construction attempt.
const MIN_CONNS_CONSTRUCT_BUDGET: Duration = Duration::from_secs(60);

// ============================================================================
// Pool
// ============================================================================

struct PoolShared<C: Connect + 'static> {
    slots: SlotPool<Conn<C::Session>>,
    config: PoolConfig,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// A bounded pool of [`Conn`]s sharing one wire configuration.
///
/// Cloning the handle is cheap; all clones drive the same pool.
pub struct Pool<C: Connect + 'static> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connect + 'static> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connect + 'static> Pool<C> {
    /// Parses `conn_string` and builds a pool that opens sessions through
    /// `connector`. Must be called from within a tokio runtime; the
    /// health-check task starts immediately.
    pub fn new(conn_string: &str, connector: C) -> Result<Self> {
        let config = parse_config(conn_string)?;
        Self::with_config(config, connector)
    }

    /// Builds a pool from an already parsed configuration.
    ///
    /// # Panics
    ///
    /// Panics if `config` did not come from [`parse_config`]; defaults are
    /// applied there, not here.
    pub fn with_config(config: PoolConfig, connector: C) -> Result<Self> {
        if !config.created_by_parse_config {
            panic!("PoolConfig must be created by parse_config");
        }

        let connector = Arc::new(connector);
        let wire = Arc::new(config.wire.clone());

        let constructor = {
            let connector = Arc::clone(&connector);
            let wire: Arc<WireConfig> = Arc::clone(&wire);
            Box::new(move |ctx: CancellationToken| -> BoxFuture<'static, Result<Conn<C::Session>>> {
                let connector = Arc::clone(&connector);
                let wire = Arc::clone(&wire);
                Box::pin(async move {
                    let session = connector.connect(&ctx, &wire).await?;
                    Ok(Conn::new(session))
                })
            })
        };

        let destructor = Box::new(|mut conn: Conn<C::Session>| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                if tokio::time::timeout(CONN_SHUTDOWN_BUDGET, conn.session.close())
                    .await
                    .is_err()
                {
                    warn!("connection cleanup exceeded its budget");
                }
            })
        });

        let shared = Arc::new(PoolShared {
            slots: SlotPool::new(config.max_conns as u32, constructor, destructor),
            config,
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::maintain(Arc::clone(&shared)));
        *shared.maintenance.lock() = Some(handle);

        Ok(Pool { shared })
    }

    /// Takes a connection out of the pool for exclusive use.
    ///
    /// The returned guard gives the caller the whole [`Conn`] surface. When
    /// it drops, the connection is health-classified: closed, busy,
    /// in-transaction, or over-age connections are destroyed, everything
    /// else goes back to the idle list. That classification runs on every
    /// exit path, panics included.
    pub async fn acquire(&self, ctx: &CancellationToken) -> Result<PoolConn<C::Session>> {
        let slot = self.shared.slots.acquire(ctx).await?;
        Ok(PoolConn {
            slot: Some(slot),
            max_conn_lifetime: self.shared.config.max_conn_lifetime,
        })
    }

    /// Acquires a connection and runs one query on it.
    pub async fn query<R, F>(
        &self,
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
        let mut conn = self.acquire(ctx).await?;
        conn.query(ctx, sql, args, results, row_fn).await
    }

    /// Acquires a connection and runs one statement on it.
    pub async fn exec(
        &self,
        ctx: &CancellationToken,
        sql: &str,
        args: &[&dyn Encode],
    ) -> Result<i64> {
        let mut conn = self.acquire(ctx).await?;
        conn.exec(ctx, sql, args).await
    }

    /// Acquires a connection and runs `f` in a transaction on it.
    pub async fn begin<'f>(
        &self,
        ctx: &CancellationToken,
        f: TxFn<'f, Conn<C::Session>>,
    ) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        conn.begin(ctx, f).await
    }

    /// A point-in-time snapshot of pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            s: self.shared.slots.stat(),
        }
    }

    /// Shuts the pool down: stops the health check, rejects new acquires,
    /// and waits until every connection has been returned and closed.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        let maintenance = self.shared.maintenance.lock().take();
        if let Some(handle) = maintenance {
            let _ = handle.await;
        }
        self.shared.slots.close().await;
    }

    // ========================================================================
    // Background maintenance
    // ========================================================================

    async fn maintain(shared: Arc<PoolShared<C>>) {
        let mut ticker = tokio::time::interval(shared.config.health_check_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    Self::sweep_idle(&shared);
                    Self::ensure_min_conns(&shared);
                }
            }
        }
    }

    /// Destroys idle connections that outlived `max_conn_lifetime` or sat
    /// idle longer than `max_conn_idle_time`.
    fn sweep_idle(shared: &Arc<PoolShared<C>>) {
        for slot in shared.slots.acquire_all_idle() {
            if slot.age() > shared.config.max_conn_lifetime {
                debug!("closing connection past its lifetime");
                slot.destroy();
            } else if slot.idle_duration() > shared.config.max_conn_idle_time {
                debug!("closing connection idle too long");
                slot.destroy();
            } else {
                slot.release_unused();
            }
        }
    }

    /// Spawns construction tasks until the pool is back at `min_conns`.
    fn ensure_min_conns(shared: &Arc<PoolShared<C>>) {
        let total = shared.slots.stat().total() as i32;
        for _ in 0..(shared.config.min_conns - total).max(0) {
            let slots = shared.slots.clone();
            tokio::spawn(async move {
                let ctx = CancellationToken::new();
                let deadline = ctx.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(MIN_CONNS_CONSTRUCT_BUDGET).await;
                    deadline.cancel();
                });
                if let Err(e) = slots.create_resource(&ctx).await {
                    debug!(error = %e, "min-conns construction failed");
                }
                timer.abort();
            });
        }
    }
}

// ============================================================================
// Pooled connection guard
// ============================================================================

/// A connection checked out of the pool.
///
/// Dereferences to [`Conn`]. Dropping the guard returns the connection to
/// the pool after a health classification; there is no way to keep a
/// pooled connection past its guard.
pub struct PoolConn<S: Session + 'static> {
    slot: Option<Slot<Conn<S>>>,
    max_conn_lifetime: Duration,
}

impl<S: Session + 'static> std::fmt::Debug for PoolConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConn").finish()
    }
}

impl<S: Session + 'static> Deref for PoolConn<S> {
    type Target = Conn<S>;

    fn deref(&self) -> &Conn<S> {
        self.slot.as_ref().unwrap().value()
    }
}

impl<S: Session + 'static> DerefMut for PoolConn<S> {
    fn deref_mut(&mut self) -> &mut Conn<S> {
        self.slot.as_mut().unwrap().value_mut()
    }
}

impl<S: Session + 'static> Drop for PoolConn<S> {
    fn drop(&mut self) {
        let slot = match self.slot.take() {
            Some(slot) => slot,
            None => return,
        };
        let session = &slot.value().session;
        if session.is_closed()
            || session.is_busy()
            || session.tx_status() != TX_IDLE
            || slot.age() > self.max_conn_lifetime
        {
            debug!("destroying connection on release");
            slot.destroy();
        } else {
            slot.release();
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Passive snapshot of pool counters.
pub struct PoolStats {
    s: Stat,
}

impl PoolStats {
    /// Cumulative count of successful acquires.
    pub fn acquire_count(&self) -> u64 {
        self.s.acquire_count
    }

    /// Total time spent inside successful acquires.
    pub fn acquire_duration(&self) -> Duration {
        self.s.acquire_duration
    }

    /// Connections currently checked out.
    pub fn acquired_conns(&self) -> u32 {
        self.s.acquired
    }

    /// Cumulative count of acquires abandoned by their cancellation
    /// context.
    pub fn canceled_acquire_count(&self) -> u64 {
        self.s.canceled_acquire_count
    }

    /// Connections currently being opened.
    pub fn constructing_conns(&self) -> u32 {
        self.s.constructing
    }

    /// Cumulative count of acquires that had to wait or open a new
    /// connection because nothing was idle.
    pub fn empty_acquire_count(&self) -> u64 {
        self.s.empty_acquire_count
    }

    /// Connections currently idle.
    pub fn idle_conns(&self) -> u32 {
        self.s.idle
    }

    /// Maximum size of the pool.
    pub fn max_conns(&self) -> u32 {
        self.s.max_size
    }

    /// Idle + acquired + constructing connections.
    pub fn total_conns(&self) -> u32 {
        self.s.total()
    }
}

// ============================================================================
// StdDb
// ============================================================================

#[async_trait::async_trait]
impl<C: Connect + 'static> crate::StdDb for Pool<C> {
    type Tx = Conn<C::Session>;

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
        Pool::query(self, ctx, sql, args, results, row_fn).await
    }

    async fn exec(&mut self, ctx: &CancellationToken, sql: &str, args: &[&dyn Encode]) -> Result<i64> {
        Pool::exec(self, ctx, sql, args).await
    }

    async fn begin<'f>(&mut self, ctx: &CancellationToken, f: TxFn<'f, Self::Tx>) -> Result<()> {
        Pool::begin(self, ctx, f).await
    }
}
