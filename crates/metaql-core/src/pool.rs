//! Bounded connection slots per driver.
//!
//! The pool hands out [`ConnectionHandle`]s under a per-driver and a global
//! limit. Requests over a limit queue in arrival order and are resolved as
//! matching handles come back.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::error::PoolError;

/// Proof of one acquired slot. Return it with [`ConnectionPool::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: u64,
    driver: String,
    acquired_at: Instant,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Time since the slot was granted.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Counters for one driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverPoolStats {
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub limit: usize,
}

/// Snapshot of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub waiting: usize,
    pub global_limit: usize,
    pub drivers: BTreeMap<String, DriverPoolStats>,
}

impl PoolStats {
    pub fn driver(&self, name: &str) -> DriverPoolStats {
        self.drivers.get(name).copied().unwrap_or_default()
    }
}

struct Waiter {
    driver: String,
    ticket: u64,
    tx: oneshot::Sender<ConnectionHandle>,
}

#[derive(Default)]
struct DriverSlots {
    active: usize,
    idle: usize,
}

#[derive(Default)]
struct PoolState {
    drivers: HashMap<String, DriverSlots>,
    outstanding: HashMap<u64, String>,
    waiters: VecDeque<Waiter>,
    active: usize,
    next_id: u64,
}

impl PoolState {
    fn grant(&mut self, driver: &str) -> ConnectionHandle {
        self.next_id += 1;
        let id = self.next_id;
        let slots = self.drivers.entry(driver.to_string()).or_default();
        slots.active += 1;
        slots.idle = slots.idle.saturating_sub(1);
        self.active += 1;
        self.outstanding.insert(id, driver.to_string());
        ConnectionHandle {
            id,
            driver: driver.to_string(),
            acquired_at: Instant::now(),
        }
    }

    fn ungrant(&mut self, handle: &ConnectionHandle) -> bool {
        if self.outstanding.remove(&handle.id).is_none() {
            return false;
        }
        if let Some(slots) = self.drivers.get_mut(&handle.driver) {
            slots.active = slots.active.saturating_sub(1);
        }
        self.active = self.active.saturating_sub(1);
        true
    }

    fn active_for(&self, driver: &str) -> usize {
        self.drivers.get(driver).map(|s| s.active).unwrap_or(0)
    }

    fn has_room(&self, driver: &str, config: &PoolConfig) -> bool {
        self.active < config.global_limit && self.active_for(driver) < config.limit_for(driver)
    }

    fn waiting_for(&self, driver: &str) -> usize {
        self.waiters.iter().filter(|w| w.driver == driver).count()
    }
}

/// Per-driver and global slot accounting with FIFO waiting.
pub struct ConnectionPool {
    config: Mutex<PoolConfig>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Change the limit for one driver. Raising it admits queued waiters.
    pub fn set_driver_limit(&self, driver: &str, limit: usize) -> Result<(), PoolError> {
        if limit == 0 {
            return Err(PoolError::InvalidLimit(driver.to_string()));
        }
        self.config.lock().driver_limits.insert(driver.to_string(), limit);
        let mut state = self.state.lock();
        self.dispatch(&mut state);
        Ok(())
    }

    /// Acquire a slot for `driver`, waiting in line when the driver or the
    /// pool is at its limit.
    pub async fn acquire(&self, driver: &str) -> Result<ConnectionHandle, PoolError> {
        let started = Instant::now();
        let (ticket, mut rx) = {
            let config = self.config.lock().clone();
            let mut state = self.state.lock();
            if state.has_room(driver, &config) && state.waiting_for(driver) == 0 {
                let handle = state.grant(driver);
                trace!(driver, handle = handle.id, "connection acquired");
                return Ok(handle);
            }
            let (tx, rx) = oneshot::channel();
            state.next_id += 1;
            let ticket = state.next_id;
            state.waiters.push_back(Waiter {
                driver: driver.to_string(),
                ticket,
                tx,
            });
            debug!(
                driver,
                active = state.active_for(driver),
                queued = state.waiters.len(),
                "connection pool full, waiting"
            );
            (ticket, rx)
        };

        let timeout = self.config.lock().acquire_timeout;
        let Some(timeout) = timeout else {
            return rx.await.map_err(|_| PoolError::Closed);
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.map_err(|_| PoolError::Closed),
            Err(_) => {
                let mut state = self.state.lock();
                if let Some(pos) = state.waiters.iter().position(|w| w.ticket == ticket) {
                    state.waiters.remove(pos);
                    debug!(driver, waited = ?started.elapsed(), "connection wait timed out");
                    return Err(PoolError::Exhausted {
                        driver: driver.to_string(),
                        waited: started.elapsed(),
                    });
                }
                drop(state);
                // Granted between the timeout firing and taking the lock.
                rx.try_recv().map_err(|_| PoolError::Closed)
            }
        }
    }

    /// Acquire a slot returned to the pool when the guard drops.
    pub async fn acquire_guard(self: &Arc<Self>, driver: &str) -> Result<PooledConnection, PoolError> {
        let handle = self.acquire(driver).await?;
        Ok(PooledConnection {
            handle: Some(handle),
            pool: Arc::clone(self),
        })
    }

    /// Return a slot. The first queued caller that fits takes it over.
    pub fn release(&self, handle: ConnectionHandle) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if !state.ungrant(&handle) {
            return Err(PoolError::UnknownHandle(handle.id));
        }
        if let Some(slots) = state.drivers.get_mut(&handle.driver) {
            slots.idle += 1;
        }
        trace!(driver = %handle.driver, handle = handle.id, held = ?handle.held_for(), "connection released");
        self.dispatch(&mut state);
        Ok(())
    }

    /// Hand free slots to waiters in queue order. Waiters whose driver is
    /// still full keep their place.
    fn dispatch(&self, state: &mut PoolState) {
        let config = self.config.lock().clone();
        let mut index = 0;
        while index < state.waiters.len() && state.active < config.global_limit {
            let driver = state.waiters[index].driver.clone();
            if state.active_for(&driver) >= config.limit_for(&driver) {
                index += 1;
                continue;
            }
            let Some(waiter) = state.waiters.remove(index) else {
                break;
            };
            let handle = state.grant(&driver);
            let id = handle.id;
            if let Err(handle) = waiter.tx.send(handle) {
                // Receiver gone: the caller stopped waiting.
                state.ungrant(&handle);
                if let Some(slots) = state.drivers.get_mut(&driver) {
                    slots.idle += 1;
                }
                trace!(driver = %driver, "skipped abandoned waiter");
                continue;
            }
            trace!(driver = %driver, handle = id, "connection handed to waiter");
        }
    }

    /// Forget idle slots. Returns how many were dropped.
    pub fn close_idle(&self) -> usize {
        let mut state = self.state.lock();
        let mut closed = 0;
        for slots in state.drivers.values_mut() {
            closed += slots.idle;
            slots.idle = 0;
        }
        if closed > 0 {
            debug!(closed, "closed idle connections");
        }
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let config = self.config.lock().clone();
        let state = self.state.lock();
        let mut drivers: BTreeMap<String, DriverPoolStats> = state
            .drivers
            .iter()
            .map(|(name, slots)| {
                (
                    name.clone(),
                    DriverPoolStats {
                        active: slots.active,
                        idle: slots.idle,
                        waiting: 0,
                        limit: config.limit_for(name),
                    },
                )
            })
            .collect();
        for waiter in &state.waiters {
            drivers
                .entry(waiter.driver.clone())
                .or_insert_with(|| DriverPoolStats {
                    limit: config.limit_for(&waiter.driver),
                    ..Default::default()
                })
                .waiting += 1;
        }
        PoolStats {
            active: state.active,
            waiting: state.waiters.len(),
            global_limit: config.global_limit,
            drivers,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").field("stats", &self.stats()).finish()
    }
}

/// A slot that goes back to the pool when dropped.
pub struct PooledConnection {
    handle: Option<ConnectionHandle>,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn driver(&self) -> &str {
        self.handle.as_ref().map(|h| h.driver()).unwrap_or_default()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Handles from acquire_guard are always outstanding.
            let _ = self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn pool(global: usize, per_driver: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            PoolConfig::new()
                .with_global_limit(global)
                .with_default_driver_limit(per_driver),
        ))
    }

    async fn wait_for_queue(pool: &ConnectionPool, depth: usize) {
        while pool.stats().waiting < depth {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_acquire_release_stats() {
        let pool = pool(10, 2);
        let a = pool.acquire("pg").await.unwrap();
        let b = pool.acquire("pg").await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.driver("pg").active, 2);

        pool.release(a).unwrap();
        let stats = pool.stats().driver("pg");
        assert_eq!((stats.active, stats.idle, stats.waiting), (1, 1, 0));

        let b_id = b.id();
        pool.release(b).unwrap();
        assert_eq!(pool.close_idle(), 2);
        assert_eq!(pool.stats().driver("pg").idle, 0);

        let stale = ConnectionHandle {
            id: b_id,
            driver: "pg".into(),
            acquired_at: Instant::now(),
        };
        assert_eq!(pool.release(stale), Err(PoolError::UnknownHandle(b_id)));
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_fifo_order() {
        let pool = pool(10, 1);
        let first = pool.acquire("pg").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for label in ["a", "b", "c"] {
            let task_pool = Arc::clone(&pool);
            let tx = tx.clone();
            let depth = pool.stats().waiting + 1;
            tokio::spawn(async move {
                let handle = task_pool.acquire("pg").await.unwrap();
                tx.send(label).unwrap();
                tokio::task::yield_now().await;
                task_pool.release(handle).unwrap();
            });
            wait_for_queue(&pool, depth).await;
        }

        assert_eq!(pool.stats().driver("pg").waiting, 3);
        assert_eq!(pool.stats().driver("pg").active, 1);
        pool.release(first).unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
            assert!(pool.stats().driver("pg").active <= 1);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_global_limit_across_drivers() {
        let pool = pool(2, 2);
        let a = pool.acquire("pg").await.unwrap();
        let _b = pool.acquire("mongo").await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("mongo").await })
        };
        wait_for_queue(&pool, 1).await;
        assert_eq!(pool.stats().active, 2);

        pool.release(a).unwrap();
        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.driver(), "mongo");
        assert_eq!(pool.stats().driver("mongo").active, 2);
        assert_eq!(pool.stats().active, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_times_out() {
        let pool = Arc::new(ConnectionPool::new(
            PoolConfig::new()
                .with_driver_limit("pg", 1)
                .with_acquire_timeout(Duration::from_millis(50)),
        ));
        let held = pool.acquire("pg").await.unwrap();

        let err = pool.acquire("pg").await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { ref driver, .. } if driver == "pg"));
        assert_eq!(pool.stats().waiting, 0);

        pool.release(held).unwrap();
        assert!(pool.acquire("pg").await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let pool = pool(10, 1);
        let held = pool.acquire("pg").await.unwrap();

        let abandoned = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("pg").await })
        };
        wait_for_queue(&pool, 1).await;
        let next = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("pg").await })
        };
        wait_for_queue(&pool, 2).await;

        abandoned.abort();
        let _ = abandoned.await;
        pool.release(held).unwrap();

        let handle = next.await.unwrap().unwrap();
        assert_eq!(handle.driver(), "pg");
        assert_eq!(pool.stats().driver("pg").active, 1);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let pool = pool(10, 1);
        {
            let guard = pool.acquire_guard("pg").await.unwrap();
            assert_eq!(guard.driver(), "pg");
            assert_eq!(pool.stats().driver("pg").active, 1);
        }
        assert_eq!(pool.stats().driver("pg").active, 0);
        assert!(pool.set_driver_limit("pg", 0).is_err());
    }
}
