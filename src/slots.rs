//! Generic bounded resource pool.
//!
//! [`SlotPool`] manages the slots the connection pool stores its
//! connections in: bounded construction, an idle list, and per-slot age
//! and idle-time bookkeeping. It knows nothing about connections; the
//! constructor and destructor closures supply the resource semantics.
//!
//! Occupancy is enforced with one semaphore permit per live slot. A permit
//! travels with its resource from construction through the idle list and
//! back out on acquire, and is only returned to the semaphore when the
//! resource is destroyed. The semaphore therefore bounds idle + acquired +
//! under-construction at all times.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Builds one resource. Receives a cancellation context bounding the
/// construction attempt.
pub type Constructor<T> =
    Box<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Tears one resource down. Runs on a spawned task when destruction is
/// triggered from a synchronous path.
pub type Destructor<T> = Box<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct IdleSlot<T> {
    value: T,
    permit: OwnedSemaphorePermit,
    created_at: Instant,
    released_at: Instant,
}

struct State<T> {
    idle: Vec<IdleSlot<T>>,
    acquired: u32,
    constructing: u32,
    destroying: u32,
    closed: bool,

    acquire_count: u64,
    acquire_duration: Duration,
    canceled_acquire_count: u64,
    empty_acquire_count: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    semaphore: Arc<Semaphore>,
    /// Signalled when a slot lands on the idle list.
    idle_available: Notify,
    /// Signalled when acquired/constructing/destroying counts drop, so
    /// `close` can observe the pool draining.
    drained: Notify,
    constructor: Constructor<T>,
    destructor: Destructor<T>,
    max_size: u32,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub acquire_count: u64,
    pub acquire_duration: Duration,
    pub canceled_acquire_count: u64,
    pub empty_acquire_count: u64,
    pub acquired: u32,
    pub constructing: u32,
    pub idle: u32,
    pub max_size: u32,
}

impl Stat {
    /// Idle + acquired + under-construction slots.
    pub fn total(&self) -> u32 {
        self.idle + self.acquired + self.constructing
    }
}

// ============================================================================
// SlotPool
// ============================================================================

pub struct SlotPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for SlotPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> SlotPool<T> {
    pub fn new(max_size: u32, constructor: Constructor<T>, destructor: Destructor<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    idle: Vec::new(),
                    acquired: 0,
                    constructing: 0,
                    destroying: 0,
                    closed: false,
                    acquire_count: 0,
                    acquire_duration: Duration::ZERO,
                    canceled_acquire_count: 0,
                    empty_acquire_count: 0,
                }),
                semaphore: Arc::new(Semaphore::new(max_size as usize)),
                idle_available: Notify::new(),
                drained: Notify::new(),
                constructor,
                destructor,
                max_size,
            }),
        }
    }

    /// Takes a slot, reusing an idle resource when one exists and
    /// constructing a new one otherwise. Waits when the pool is at
    /// capacity with nothing idle.
    pub async fn acquire(&self, ctx: &CancellationToken) -> Result<Slot<T>> {
        let start = Instant::now();
        let mut waited = false;

        loop {
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if let Some(idle) = state.idle.pop() {
                    state.acquired += 1;
                    state.acquire_count += 1;
                    state.acquire_duration += start.elapsed();
                    if waited {
                        state.empty_acquire_count += 1;
                    }
                    let more_idle = !state.idle.is_empty();
                    drop(state);
                    if more_idle {
                        // Chain the wakeup so other waiters see the rest.
                        self.shared.idle_available.notify_one();
                    }
                    return Ok(Slot {
                        shared: Arc::clone(&self.shared),
                        value: Some(idle.value),
                        permit: Some(idle.permit),
                        created_at: idle.created_at,
                        released_at: idle.released_at,
                    });
                }
            }
            waited = true;

            tokio::select! {
                _ = ctx.cancelled() => {
                    self.shared.state.lock().canceled_acquire_count += 1;
                    return Err(Error::Canceled);
                }
                permit = Arc::clone(&self.shared.semaphore).acquire_owned() => {
                    let permit = permit.map_err(|_| Error::PoolClosed)?;
                    let value = self.construct(ctx).await?;
                    let now = Instant::now();
                    // Transfer the slot from constructing to acquired in one
                    // step so close never sees it missing from both counts.
                    let mut state = self.shared.state.lock();
                    state.constructing -= 1;
                    state.acquired += 1;
                    state.acquire_count += 1;
                    state.acquire_duration += start.elapsed();
                    state.empty_acquire_count += 1;
                    return Ok(Slot {
                        shared: Arc::clone(&self.shared),
                        value: Some(value),
                        permit: Some(permit),
                        created_at: now,
                        released_at: now,
                    });
                }
                _ = self.shared.idle_available.notified() => continue,
            }
        }
    }

    /// Takes every currently idle slot. Used by the maintenance sweep; the
    /// slots count as acquired until released or destroyed.
    pub fn acquire_all_idle(&self) -> Vec<Slot<T>> {
        let mut state = self.shared.state.lock();
        let drained: Vec<IdleSlot<T>> = state.idle.drain(..).collect();
        state.acquired += drained.len() as u32;
        drained
            .into_iter()
            .map(|slot| Slot {
                shared: Arc::clone(&self.shared),
                value: Some(slot.value),
                permit: Some(slot.permit),
                created_at: slot.created_at,
                released_at: slot.released_at,
            })
            .collect()
    }

    /// Constructs one resource and parks it on the idle list. Used by the
    /// minimum-connections maintainer.
    pub async fn create_resource(&self, ctx: &CancellationToken) -> Result<()> {
        let permit = tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Canceled),
            permit = Arc::clone(&self.shared.semaphore).acquire_owned() => {
                permit.map_err(|_| Error::PoolClosed)?
            }
        };
        let value = self.construct(ctx).await?;

        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.constructing -= 1;
        if state.closed {
            state.destroying += 1;
            drop(state);
            Shared::spawn_destroy(&self.shared, value, permit);
            return Err(Error::PoolClosed);
        }
        state.idle.push(IdleSlot {
            value,
            permit,
            created_at: now,
            released_at: now,
        });
        drop(state);
        self.shared.idle_available.notify_one();
        Ok(())
    }

    pub fn stat(&self) -> Stat {
        let state = self.shared.state.lock();
        Stat {
            acquire_count: state.acquire_count,
            acquire_duration: state.acquire_duration,
            canceled_acquire_count: state.canceled_acquire_count,
            empty_acquire_count: state.empty_acquire_count,
            acquired: state.acquired,
            constructing: state.constructing,
            idle: state.idle.len() as u32,
            max_size: self.shared.max_size,
        }
    }

    /// Closes the pool: new acquires fail fast, idle resources are
    /// destroyed, and the call returns once every outstanding slot has
    /// been returned and torn down.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                Vec::new()
            } else {
                state.closed = true;
                std::mem::take(&mut state.idle)
            }
        };
        self.shared.semaphore.close();
        self.shared.idle_available.notify_waiters();

        for slot in idle {
            (self.shared.destructor)(slot.value).await;
            drop(slot.permit);
        }

        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            // Register before re-checking so a concurrent decrement cannot
            // slip between the check and the wait.
            drained.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if state.acquired == 0 && state.constructing == 0 && state.destroying == 0 {
                    return;
                }
            }
            drained.await;
        }
    }

    /// Runs the constructor under the caller's capacity permit. On success
    /// the slot is still counted as constructing; the caller transfers it
    /// to its destination state under one lock.
    async fn construct(&self, ctx: &CancellationToken) -> Result<T> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            state.constructing += 1;
        }

        let built = tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            built = (self.shared.constructor)(ctx.clone()) => built,
        };

        match built {
            Ok(value) => Ok(value),
            Err(e) => {
                self.shared.state.lock().constructing -= 1;
                self.shared.drained.notify_waiters();
                Err(e)
            }
        }
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Spawns the destructor. The caller must have moved the slot into the
    /// `destroying` count under the state lock already, so `close` cannot
    /// miss it.
    fn spawn_destroy(shared: &Arc<Shared<T>>, value: T, permit: OwnedSemaphorePermit) {
        let teardown = (shared.destructor)(value);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            teardown.await;
            drop(permit);
            shared.state.lock().destroying -= 1;
            shared.drained.notify_waiters();
        });
    }
}

// ============================================================================
// Slot
// ============================================================================

/// An acquired slot. Exactly one of [`release`](Slot::release),
/// [`release_unused`](Slot::release_unused) or [`destroy`](Slot::destroy)
/// decides its fate; dropping the slot without a verdict releases it back
/// to the pool, so a panic cannot leak capacity.
pub struct Slot<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    value: Option<T>,
    permit: Option<OwnedSemaphorePermit>,
    created_at: Instant,
    released_at: Instant,
}

impl<T: Send + 'static> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").finish()
    }
}

impl<T: Send + 'static> Slot<T> {
    pub fn value(&self) -> &T {
        self.value.as_ref().unwrap()
    }

    pub fn value_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap()
    }

    pub fn creation_time(&self) -> Instant {
        self.created_at
    }

    /// Time since the resource was constructed.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the resource last went idle.
    pub fn idle_duration(&self) -> Duration {
        self.released_at.elapsed()
    }

    /// Returns the resource to the idle list.
    pub fn release(mut self) {
        self.return_to_idle(true);
    }

    /// Returns the resource to the idle list without refreshing its
    /// idle-since timestamp. Used when a maintenance sweep inspected the
    /// resource but did not use it.
    pub fn release_unused(mut self) {
        self.return_to_idle(false);
    }

    /// Removes the resource from the pool and tears it down in the
    /// background, freeing its capacity once teardown finishes.
    pub fn destroy(mut self) {
        let value = self.value.take().unwrap();
        let permit = self.permit.take().unwrap();
        {
            let mut state = self.shared.state.lock();
            state.acquired -= 1;
            state.destroying += 1;
        }
        Shared::spawn_destroy(&self.shared, value, permit);
    }

    fn return_to_idle(&mut self, touch: bool) {
        let value = match self.value.take() {
            Some(value) => value,
            None => return,
        };
        let permit = self.permit.take().unwrap();

        let mut state = self.shared.state.lock();
        state.acquired -= 1;
        if state.closed {
            state.destroying += 1;
            drop(state);
            debug!("pool closed, destroying returned resource");
            Shared::spawn_destroy(&self.shared, value, permit);
            return;
        }
        let released_at = if touch { Instant::now() } else { self.released_at };
        state.idle.push(IdleSlot {
            value,
            permit,
            created_at: self.created_at,
            released_at,
        });
        drop(state);
        self.shared.drained.notify_waiters();
        self.shared.idle_available.notify_one();
    }
}

impl<T: Send + 'static> Drop for Slot<T> {
    fn drop(&mut self) {
        if self.value.is_some() {
            self.return_to_idle(true);
        }
    }
}
