//! Sessions
//!
//! A session is an authenticated user's handle on the repository. It owns
//! the slot tracker of its transactions, a shared data map living as long as
//! the session, and a lazily created default transaction used by the
//! forwarding `execute` / `commit` / `rollback` methods.
//!
//! The internal session has no user and runs with security off.

use crate::repository::Repository;
use crate::transaction::{SlotCell, Transaction};
use cairn_concurrency::SlotTracker;
use cairn_core::{CairnError, CairnResult, Eid, Params, Row, Select, SessionId, TxnId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The authenticated user of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    /// Eid of the user entity
    pub eid: Eid,
    /// Login used to connect
    pub login: String,
    /// Groups the user belongs to
    pub groups: BTreeSet<String>,
}

impl UserIdentity {
    /// Whether the user is in `group`
    pub fn is_member(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// Snapshot of a session, for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id
    pub id: SessionId,
    /// Login, `None` for the internal session
    pub login: Option<String>,
    /// Groups of the user
    pub groups: BTreeSet<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Seconds since the last use
    pub idle_secs: u64,
    /// Transactions opened so far
    pub transactions: u64,
    /// Transactions not yet closed
    pub open_transactions: usize,
}

/// A user's handle on the repository
pub struct Session {
    id: SessionId,
    user: Option<UserIdentity>,
    repo: Weak<Repository>,
    data: RwLock<HashMap<String, serde_json::Value>>,
    tracker: SlotTracker,
    cells: Mutex<HashMap<TxnId, Arc<SlotCell>>>,
    default_txn: Mutex<Option<Transaction>>,
    last_usage: Mutex<Instant>,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
    txn_count: AtomicU64,
}

impl Session {
    pub(crate) fn new(user: UserIdentity, repo: Weak<Repository>) -> Self {
        Self::build(Some(user), repo)
    }

    pub(crate) fn internal(repo: Weak<Repository>) -> Self {
        Self::build(None, repo)
    }

    fn build(user: Option<UserIdentity>, repo: Weak<Repository>) -> Self {
        Self {
            id: SessionId::new(),
            user,
            repo,
            data: RwLock::new(HashMap::new()),
            tracker: SlotTracker::new(),
            cells: Mutex::new(HashMap::new()),
            default_txn: Mutex::new(None),
            last_usage: Mutex::new(Instant::now()),
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            txn_count: AtomicU64::new(0),
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Authenticated user, `None` for the internal session
    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    /// Login of the user
    pub fn login(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.login.as_str())
    }

    /// Whether this is the repository's own session
    pub fn is_internal(&self) -> bool {
        self.user.is_none()
    }

    /// Whether the user is in `group`
    pub fn is_member(&self, group: &str) -> bool {
        self.user.as_ref().map_or(false, |u| u.is_member(group))
    }

    /// Tracker of the slots held by this session's transactions
    pub fn tracker(&self) -> &SlotTracker {
        &self.tracker
    }

    /// Record a use of the session
    pub fn touch(&self) {
        *self.last_usage.lock() = Instant::now();
    }

    /// Time since the last use
    pub fn idle_for(&self) -> Duration {
        self.last_usage.lock().elapsed()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Shared data
    // ========================================================================

    /// Value stored under `key` for the whole session
    pub fn get_shared_data(&self, key: &str) -> Option<serde_json::Value> {
        self.data.read().get(key).cloned()
    }

    /// Store `value` under `key`, returning the previous value
    pub fn set_shared_data(&self, key: impl Into<String>, value: serde_json::Value) -> Option<serde_json::Value> {
        self.data.write().insert(key.into(), value)
    }

    /// Remove the value stored under `key`
    pub fn remove_shared_data(&self, key: &str) -> Option<serde_json::Value> {
        self.data.write().remove(key)
    }

    // ========================================================================
    // Transaction cells
    // ========================================================================

    pub(crate) fn register_cell(&self, txn: TxnId, cell: Arc<SlotCell>) {
        self.txn_count.fetch_add(1, Ordering::Relaxed);
        self.cells.lock().insert(txn, cell);
    }

    pub(crate) fn forget_cell(&self, txn: TxnId) {
        self.cells.lock().remove(&txn);
    }

    pub(crate) fn cell(&self, txn: TxnId) -> Option<Arc<SlotCell>> {
        self.cells.lock().get(&txn).cloned()
    }

    /// Number of transactions not yet closed
    pub fn open_transactions(&self) -> usize {
        self.cells.lock().len()
    }

    /// Monitoring snapshot
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            login: self.login().map(str::to_string),
            groups: self.user.as_ref().map(|u| u.groups.clone()).unwrap_or_default(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
            transactions: self.txn_count.load(Ordering::Relaxed),
            open_transactions: self.open_transactions(),
        }
    }

    // ========================================================================
    // Default transaction
    // ========================================================================

    fn with_default_txn<R>(self: &Arc<Self>, f: impl FnOnce(&mut Transaction) -> CairnResult<R>) -> CairnResult<R> {
        if self.is_closed() {
            return Err(CairnError::programming(format!("session {} is closed", self.id)));
        }
        let mut guard = self.default_txn.lock();
        if guard.is_none() {
            let repo = self.repo.upgrade().ok_or(CairnError::Shutdown)?;
            *guard = Some(repo.new_transaction(self)?);
        }
        match guard.as_mut() {
            Some(txn) => f(txn),
            None => Err(CairnError::Shutdown),
        }
    }

    /// Run a query in the default transaction
    pub fn execute(self: &Arc<Self>, select: &Select, params: &Params) -> CairnResult<Vec<Row>> {
        self.with_default_txn(|txn| txn.execute(select, params))
    }

    /// Parse and run a query in the default transaction
    pub fn execute_text(self: &Arc<Self>, text: &str, params: &Params) -> CairnResult<Vec<Row>> {
        self.with_default_txn(|txn| txn.execute_text(text, params))
    }

    /// Commit the default transaction
    pub fn commit(self: &Arc<Self>) -> CairnResult<()> {
        self.with_default_txn(|txn| txn.commit())
    }

    /// Roll back the default transaction
    pub fn rollback(self: &Arc<Self>) -> CairnResult<()> {
        self.with_default_txn(|txn| txn.rollback())
    }

    /// Close the default transaction and refuse further work
    ///
    /// Transactions opened explicitly stay the caller's to close; their
    /// slots are reclaimed at shutdown.
    pub fn close(&self) {
        let default = self.default_txn.lock().take();
        if let Some(mut txn) = default {
            if let Err(e) = txn.close() {
                warn!(target: "cairn::session", session_id = %self.id, error = %e, "Closing default transaction failed");
            }
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(target: "cairn::session", session_id = %self.id, login = ?self.login(), "Session closed");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("login", &self.login())
            .field("closed", &self.is_closed())
            .finish()
    }
}
