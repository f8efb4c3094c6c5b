//! Slot usage tracking
//!
//! A `SlotTracker` records which transaction currently holds which slot, so
//! that a closing session can wait for outstanding slots to drain and then
//! reclaim whatever is left.
//!
//! ## Protocol
//!
//! ```text
//! acquire:  pool.acquire()  -> tracker.record(txn, slot)  -> txn.current = slot
//! release:  txn.current = None -> tracker.forget(txn, slot) -> pool.release(slot)
//! shutdown: tracker.close() -> tracker.wait(timeout) -> reclaim the returned ids
//! ```
//!
//! Both `record` and `forget` run under the tracker's own lock, together with
//! the count of threads blocked in `wait`, so the views stay consistent.

use crate::slot::SlotId;
use cairn_core::{CairnError, CairnResult, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct TrackerState {
    active: bool,
    records: HashMap<TxnId, SlotId>,
    waiting: usize,
}

/// Bookkeeping of slots held per transaction
pub struct SlotTracker {
    state: Mutex<TrackerState>,
    drained: Condvar,
}

impl SlotTracker {
    /// Create an active, empty tracker
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                active: true,
                records: HashMap::new(),
                waiting: 0,
            }),
            drained: Condvar::new(),
        }
    }

    /// Record that `txn` now holds `slot`
    ///
    /// # Errors
    ///
    /// - `Shutdown` once the tracker is closed
    /// - `Programming` if `txn` already holds a slot
    pub fn record(&self, txn: TxnId, slot: SlotId) -> CairnResult<()> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(CairnError::Shutdown);
        }
        if let Some(existing) = state.records.get(&txn) {
            return Err(CairnError::programming(format!(
                "{} already holds {}, cannot record {}",
                txn, existing, slot
            )));
        }
        state.records.insert(txn, slot);
        debug!(target: "cairn::tracker", txn_id = %txn, slot = %slot, "Slot recorded");
        Ok(())
    }

    /// Forget that `txn` holds `slot`
    ///
    /// Fails without touching the records if `txn` holds another slot or none.
    pub fn forget(&self, txn: TxnId, slot: SlotId) -> CairnResult<()> {
        let mut state = self.state.lock();
        match state.records.get(&txn) {
            Some(recorded) if *recorded == slot => {}
            Some(recorded) => {
                return Err(CairnError::programming(format!(
                    "{} holds {}, not {}",
                    txn, recorded, slot
                )))
            }
            None => {
                return Err(CairnError::programming(format!(
                    "{} holds no slot, cannot forget {}",
                    txn, slot
                )))
            }
        }
        state.records.remove(&txn);
        debug!(target: "cairn::tracker", txn_id = %txn, slot = %slot, "Slot forgotten");
        if state.records.is_empty() && state.waiting > 0 {
            self.drained.notify_all();
        }
        Ok(())
    }

    /// Mark the tracker inactive: further `record` calls fail
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.active = false;
        info!(target: "cairn::tracker", outstanding = state.records.len(), "Tracker closed");
    }

    /// Whether `record` is still accepted
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Wait until every recorded slot is forgotten or `timeout` elapses
    ///
    /// Returns the transactions still holding a slot, sorted by id.
    pub fn wait(&self, timeout: Duration) -> Vec<TxnId> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waiting += 1;
        while !state.records.is_empty() {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.waiting -= 1;
        let mut remaining: Vec<TxnId> = state.records.keys().copied().collect();
        remaining.sort();
        remaining
    }

    /// Slot currently recorded for `txn`
    pub fn held_by(&self, txn: TxnId) -> Option<SlotId> {
        self.state.lock().records.get(&txn).copied()
    }

    /// Number of transactions holding a slot
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether no transaction holds a slot
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of threads blocked in `wait`
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting
    }
}

impl Default for SlotTracker {
    fn default() -> Self {
        Self::new()
    }
}
