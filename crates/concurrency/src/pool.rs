//! Bounded pool of storage slots
//!
//! The pool is the hard concurrency ceiling for storage access: any
//! transaction that needs to touch the store must first win a slot.
//!
//! ## Fairness
//!
//! Blocked callers queue in arrival order. A waiter at queue position `p`
//! may only take a slot once more than `p` slots are idle, so a late caller
//! can never overtake an earlier one that is still waiting. A waiter that
//! times out leaves the queue and wakes the others.
//!
//! ## Conservation
//!
//! `held + idle == size` while the pool is open. `Slot` values are move-only,
//! so a released slot returns to the idle set exactly once.

use crate::slot::{Slot, SlotId};
use cairn_core::{CairnError, CairnResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of slots created at startup
    pub size: usize,
    /// Slots currently idle
    pub idle: usize,
    /// Slots currently held by callers
    pub held: usize,
    /// Callers currently blocked in `acquire`
    pub waiting: usize,
    /// Total acquisitions that timed out
    pub timeouts: u64,
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    held: usize,
    closed: bool,
}

/// Bounded pool of reusable storage slots
pub struct SlotPool<C> {
    state: Mutex<PoolState<C>>,
    available: Condvar,
    size: usize,
    timeouts: AtomicU64,
}

impl<C> SlotPool<C> {
    /// Create a pool owning the given connections, one slot each
    pub fn new(connections: Vec<C>) -> Self {
        let size = connections.len();
        let idle = connections
            .into_iter()
            .enumerate()
            .map(|(i, conn)| Slot::new(SlotId(i), conn))
            .collect();
        Self {
            state: Mutex::new(PoolState {
                idle,
                waiters: VecDeque::new(),
                next_ticket: 0,
                held: 0,
                closed: false,
            }),
            available: Condvar::new(),
            size,
            timeouts: AtomicU64::new(0),
        }
    }

    /// Create a pool of `size` slots, opening each connection with `open`
    ///
    /// Fails with the first connection error.
    pub fn with_factory<F>(size: usize, mut open: F) -> CairnResult<Self>
    where
        F: FnMut(SlotId) -> CairnResult<C>,
    {
        let mut connections = Vec::with_capacity(size);
        for i in 0..size {
            connections.push(open(SlotId(i))?);
        }
        Ok(Self::new(connections))
    }

    /// Number of slots created at startup
    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquire a slot, blocking up to `timeout`
    ///
    /// # Errors
    ///
    /// - `SlotUnavailable` if no slot freed up in time (transient)
    /// - `Shutdown` if the pool is closed
    pub fn acquire(&self, timeout: Duration) -> CairnResult<Slot<C>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.closed {
            return Err(CairnError::Shutdown);
        }

        // Fast path: nobody queued ahead of us
        if state.waiters.is_empty() {
            if let Some(slot) = state.idle.pop_front() {
                state.held += 1;
                debug!(target: "cairn::pool", slot = %slot.id(), "Slot acquired");
                return Ok(slot);
            }
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            if state.closed {
                Self::leave_queue(&mut state, ticket);
                self.available.notify_all();
                return Err(CairnError::Shutdown);
            }

            let position = state
                .waiters
                .iter()
                .position(|t| *t == ticket)
                .unwrap_or(0);
            if position < state.idle.len() {
                Self::leave_queue(&mut state, ticket);
                if let Some(slot) = state.idle.pop_front() {
                    state.held += 1;
                    if !state.idle.is_empty() && !state.waiters.is_empty() {
                        self.available.notify_all();
                    }
                    debug!(target: "cairn::pool", slot = %slot.id(), "Slot acquired after wait");
                    return Ok(slot);
                }
            }

            if Instant::now() >= deadline {
                Self::leave_queue(&mut state, ticket);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                // Our departure may move another waiter into range
                self.available.notify_all();
                warn!(target: "cairn::pool", ?timeout, "No slot available before timeout");
                return Err(CairnError::SlotUnavailable { timeout });
            }

            self.available.wait_until(&mut state, deadline);
        }
    }

    fn leave_queue(state: &mut PoolState<C>, ticket: u64) {
        if let Some(pos) = state.waiters.iter().position(|t| *t == ticket) {
            state.waiters.remove(pos);
        }
    }

    /// Return a slot to the idle set; never blocks on other callers
    ///
    /// After `close`, released slots are dropped instead.
    pub fn release(&self, slot: Slot<C>) {
        let mut state = self.state.lock();
        state.held = state.held.saturating_sub(1);
        if state.closed {
            debug!(target: "cairn::pool", slot = %slot.id(), "Slot dropped, pool closed");
            return;
        }
        debug!(target: "cairn::pool", slot = %slot.id(), "Slot released");
        state.idle.push_back(slot);
        drop(state);
        self.available.notify_all();
    }

    /// Close the pool and hand back the idle slots
    ///
    /// Blocked and future `acquire` calls fail with `Shutdown`. Slots still
    /// held are dropped when released.
    pub fn close(&self) -> Vec<Slot<C>> {
        let mut state = self.state.lock();
        state.closed = true;
        let idle: Vec<Slot<C>> = state.idle.drain(..).collect();
        drop(state);
        self.available.notify_all();
        idle
    }

    /// Run `f` on every idle slot
    ///
    /// Held slots are not visited. Callers waiting in `acquire` are held back
    /// until `f` has seen every idle slot.
    pub fn for_each_idle<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&mut Slot<C>),
    {
        let mut state = self.state.lock();
        for slot in state.idle.iter_mut() {
            f(slot);
        }
        state.idle.len()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Current counters
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            size: self.size,
            idle: state.idle.len(),
            held: state.held,
            waiting: state.waiters.len(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pool(n: usize) -> SlotPool<usize> {
        SlotPool::new((0..n).collect())
    }

    #[test]
    fn test_acquire_release_basic() {
        let pool = pool(2);
        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        let b = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().held, 2);
        assert_eq!(pool.stats().idle, 0);

        pool.release(a);
        pool.release(b);
        let stats = pool.stats();
        assert_eq!(stats.held, 0);
        assert_eq!(stats.idle, 2);
    }

    #[test]
    fn test_acquire_times_out_when_exhausted() {
        let pool = pool(1);
        let held = pool.acquire(Duration::ZERO).unwrap();
        let err = pool.acquire(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(pool.stats().timeouts, 1);
        assert_eq!(pool.stats().waiting, 0);
        pool.release(held);
        assert!(pool.acquire(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let pool = Arc::new(pool(1));
        let held = pool.acquire(Duration::ZERO).unwrap();

        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || p.acquire(Duration::from_secs(5)).map(|s| s.id()));

        thread::sleep(Duration::from_millis(30));
        let id = held.id();
        pool.release(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn test_close_fails_waiters_and_new_callers() {
        let pool = Arc::new(pool(1));
        let held = pool.acquire(Duration::ZERO).unwrap();

        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || p.acquire(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));

        let idle = pool.close();
        assert!(idle.is_empty());
        assert!(matches!(waiter.join().unwrap(), Err(CairnError::Shutdown)));
        assert!(matches!(pool.acquire(Duration::ZERO), Err(CairnError::Shutdown)));

        pool.release(held);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().held, 0);
    }

    #[test]
    fn test_for_each_idle_skips_held_slots() {
        let pool = pool(3);
        let held = pool.acquire(Duration::ZERO).unwrap();
        let visited = pool.for_each_idle(|slot| *slot.connection_mut() += 100);
        assert_eq!(visited, 2);

        pool.release(held);
        let mut values: Vec<usize> = Vec::new();
        pool.for_each_idle(|slot| values.push(*slot.connection()));
        values.sort();
        assert_eq!(values, vec![0, 101, 102]);
    }

    #[test]
    fn test_with_factory_propagates_errors() {
        let result = SlotPool::<usize>::with_factory(3, |id| {
            if id.0 == 2 {
                Err(CairnError::invalid_operation("connection refused"))
            } else {
                Ok(id.0)
            }
        });
        assert!(result.is_err());

        let pool = SlotPool::with_factory(3, |id| Ok(id.0 * 10)).unwrap();
        assert_eq!(pool.size(), 3);
    }
}
