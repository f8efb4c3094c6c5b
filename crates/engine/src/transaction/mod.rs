//! Transactions
//!
//! A `Transaction` is one unit of work of a session. It owns at most one
//! pooled slot at a time, a queue of pending operations, and the hook gating
//! and security stacks.
//!
//! # Commit
//!
//! ```text
//! none --commit--> precommit --slot commit--> postcommit --> none
//!   |                  |
//!   |                  +--operation failed--> revert (reverse order) --> rollback
//!   +--validation error--> uncommitable --rollback--> none
//! ```
//!
//! # Slot ownership
//!
//! The slot lives in a shared cell also known to the session, so shutdown can
//! take it back from a transaction that never returns it. Acquisition records
//! the slot in the session's tracker before storing it in the cell; release
//! empties the cell before the tracker forgets it.
//!
//! The repository is held weakly: a session's default transaction lives in
//! the repository's session map. Once the repository is gone, every call
//! needing it fails with `Shutdown`.

pub mod control;
pub mod entities;
pub mod operation;

pub use control::{HooksControl, HooksGuard, HooksMode, SecurityControl, SecurityGuard};
pub use operation::{CheckEntityPermissionOp, DataOperation, ForgetNewEntitiesOp, Operation};

use crate::access;
use crate::hooks::HookContext;
use crate::identity::SourceIndex;
use crate::repository::Repository;
use crate::session::Session;
use crate::source::ConnectionSet;
use cairn_concurrency::Slot;
use cairn_core::{
    CairnError, CairnResult, Eid, EntityInfo, Node, Params, Row, Select, Source, SourceConnection, SourceUri, Term,
    TxnId, Value, EID_RTYPE, FINAL_TYPES,
};
use cairn_security::{AccessKind, SecurityFlag, SecurityRewriter, Solution};
use operation::PendingOperation;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

/// Cell holding the slot of one transaction
pub type SlotCell = Mutex<Option<Slot<ConnectionSet>>>;

/// How a transaction holds its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnMode {
    /// The slot is given back after each query while nothing is pending
    Read,
    /// The slot is kept until commit or rollback
    Write,
    /// The slot is kept across commits
    Transaction,
}

/// Where the transaction is in its commit cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    /// Not committing
    None,
    /// Running precommit operations
    Precommit,
    /// Running postcommit operations
    Postcommit,
    /// Must be rolled back
    Uncommitable,
}

/// One unit of work
pub struct Transaction {
    id: TxnId,
    repo: Weak<Repository>,
    session: Arc<Session>,
    cell: Arc<SlotCell>,
    mode: TxnMode,
    default_mode: TxnMode,
    commit_state: CommitState,
    pending: VecDeque<PendingOperation>,
    hooks: HooksControl,
    security: SecurityControl,
    data: HashMap<String, serde_json::Value>,
    closed: bool,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, repo: Weak<Repository>, session: Arc<Session>, cell: Arc<SlotCell>) -> Self {
        let security = if session.is_internal() {
            SecurityControl::disabled()
        } else {
            SecurityControl::new()
        };
        Self {
            id,
            repo,
            session,
            cell,
            mode: TxnMode::Read,
            default_mode: TxnMode::Read,
            commit_state: CommitState::None,
            pending: VecDeque::new(),
            hooks: HooksControl::new(),
            security,
            data: HashMap::new(),
            closed: false,
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Owning session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Repository, `None` once it was dropped
    pub fn repository(&self) -> Option<Arc<Repository>> {
        self.repo.upgrade()
    }

    pub(crate) fn repo(&self) -> CairnResult<Arc<Repository>> {
        self.repo.upgrade().ok_or(CairnError::Shutdown)
    }

    /// Current mode
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// Set the mode, also used after each commit or rollback
    pub fn set_mode(&mut self, mode: TxnMode) {
        self.mode = mode;
        self.default_mode = mode;
    }

    /// Commit state
    pub fn commit_state(&self) -> CommitState {
        self.commit_state
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a slot is currently held
    pub fn has_slot(&self) -> bool {
        self.cell.lock().is_some()
    }

    /// Scratch data, cleared at the end of each commit or rollback
    pub fn transaction_data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    /// Mutable scratch data
    pub fn transaction_data_mut(&mut self) -> &mut HashMap<String, serde_json::Value> {
        &mut self.data
    }

    // ========================================================================
    // Hook gating and security switches
    // ========================================================================

    /// Only hooks of `categories` run until the guard is dropped
    pub fn deny_all_but<S: AsRef<str>>(&mut self, categories: &[S]) -> HooksGuard<'_> {
        HooksGuard::new(self, HooksMode::DenyAllBut, categories)
    }

    /// Hooks of `categories` are skipped until the guard is dropped
    pub fn allow_all_but<S: AsRef<str>>(&mut self, categories: &[S]) -> HooksGuard<'_> {
        HooksGuard::new(self, HooksMode::AllowAllBut, categories)
    }

    /// Whether hooks of `category` currently run
    pub fn is_category_activated(&self, category: &str) -> bool {
        self.hooks.is_category_activated(category)
    }

    /// Current hook mode
    pub fn hooks_mode(&self) -> HooksMode {
        self.hooks.mode()
    }

    /// Number of nested hook contexts
    pub fn hooks_ctx_count(&self) -> usize {
        self.hooks.ctx_count()
    }

    /// Switch read and/or write security until the guard is dropped
    ///
    /// `None` leaves a switch as it is.
    pub fn security_enabled(&mut self, read: Option<bool>, write: Option<bool>) -> SecurityGuard<'_> {
        SecurityGuard::new(self, read, write)
    }

    /// Whether queries are rewritten
    pub fn read_security(&self) -> bool {
        self.security.flag(AccessKind::Read).is_enabled()
    }

    /// Whether mutations are permission checked
    pub fn write_security(&self) -> bool {
        self.security.flag(AccessKind::Write).is_enabled()
    }

    /// Three-valued flag of `kind`
    pub fn security_flag(&self, kind: AccessKind) -> SecurityFlag {
        self.security.flag(kind)
    }

    /// Whether the innermost security context moved `kind` away from its
    /// never-touched default
    pub fn security_from_default(&self, kind: AccessKind) -> bool {
        self.security.from_default(kind)
    }

    fn bypasses_security(&self) -> bool {
        self.session.is_internal()
            || self
                .repo
                .upgrade()
                .map_or(false, |repo| self.session.is_member(&repo.config().manager_group))
    }

    // ========================================================================
    // Slot handling
    // ========================================================================

    pub(crate) fn ensure_open(&self) -> CairnResult<()> {
        if self.closed {
            return Err(CairnError::ClosedTransaction(self.id));
        }
        if self.session.is_closed() {
            return Err(CairnError::programming(format!("session {} is closed", self.session.id())));
        }
        Ok(())
    }

    fn ensure_slot(&mut self) -> CairnResult<()> {
        if self.cell.lock().is_some() {
            return Ok(());
        }
        let repo = self.repo()?;
        let slot = repo.pool().acquire(repo.config().acquire_timeout())?;
        if let Err(e) = self.session.tracker().record(self.id, slot.id()) {
            repo.pool().release(slot);
            return Err(e);
        }
        debug!(target: "cairn::txn", txn_id = %self.id, slot = %slot.id(), "Slot bound");
        *self.cell.lock() = Some(slot);
        Ok(())
    }

    fn release_slot(&mut self) {
        let taken = self.cell.lock().take();
        if let Some(slot) = taken {
            if let Err(e) = self.session.tracker().forget(self.id, slot.id()) {
                warn!(target: "cairn::txn", txn_id = %self.id, slot = %slot.id(), error = %e, "Tracker out of sync");
            }
            debug!(target: "cairn::txn", txn_id = %self.id, slot = %slot.id(), "Slot released");
            if let Some(repo) = self.repo.upgrade() {
                repo.pool().release(slot);
            }
        }
    }

    /// Give the slot back in `Read` mode when nothing is pending
    fn release_if_idle(&mut self) {
        if self.mode == TxnMode::Read && self.pending.is_empty() && self.commit_state == CommitState::None {
            self.release_slot();
        }
    }

    /// Run `f` on this transaction's connection to `source`
    ///
    /// # Errors
    ///
    /// `SlotUnavailable` when no slot frees up in time, `Shutdown` when the
    /// slot was reclaimed.
    pub fn with_source<R, F>(&mut self, source: &Arc<dyn Source>, f: F) -> CairnResult<R>
    where
        F: FnOnce(&mut dyn SourceConnection) -> CairnResult<R>,
    {
        self.ensure_open()?;
        self.ensure_slot()?;
        let mut cell = self.cell.lock();
        let slot = cell.as_mut().ok_or(CairnError::Shutdown)?;
        let conn = slot.connection_mut().connection(source)?;
        f(conn)
    }

    fn mark_write(&mut self) {
        if self.mode == TxnMode::Read {
            trace!(target: "cairn::txn", txn_id = %self.id, "Switching to write mode");
            self.mode = TxnMode::Write;
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Where `eid` lives
    ///
    /// # Errors
    ///
    /// `UnknownId` when the entity does not exist.
    pub fn entity_info(&mut self, eid: Eid) -> CairnResult<EntityInfo> {
        let repo = self.repo()?;
        if let Some(info) = repo.identity().cached(eid) {
            return Ok(info);
        }
        let system = repo.sources().system()?;
        let info = self.with_source(&system, |conn| {
            repo.identity().resolve(eid, &mut SourceIndex::new(system.as_ref(), conn))
        });
        self.release_if_idle();
        info
    }

    fn eid_types(&mut self, select: &Select, params: &Params) -> CairnResult<HashMap<Eid, String>> {
        let mut eids = BTreeSet::new();
        for value in params.values() {
            if let Value::Eid(eid) = value {
                eids.insert(*eid);
            }
        }
        if let Some(node) = &select.restriction {
            collect_eids(node, params, &mut eids);
        }

        let mut types = HashMap::new();
        for eid in eids {
            match self.entity_info(eid) {
                Ok(info) => {
                    types.insert(eid, info.etype);
                }
                Err(CairnError::UnknownId(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(types)
    }

    fn route(&self, solutions: &[Solution]) -> CairnResult<Arc<dyn Source>> {
        let repo = self.repo()?;
        let sources = repo.sources();
        let uris: BTreeSet<SourceUri> = solutions
            .iter()
            .flat_map(|s| s.values())
            .filter(|t| !FINAL_TYPES.contains(&t.as_str()))
            .map(|t| sources.uri_for_type(t))
            .collect();
        match uris.len() {
            0 => sources.system(),
            1 => match uris.into_iter().next() {
                Some(uri) => sources.get(&uri),
                None => sources.system(),
            },
            _ => Err(CairnError::Query(format!(
                "query spans several sources: {}",
                uris.iter().map(|u| u.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query
    ///
    /// Unless read security is off, the query is first rewritten so it only
    /// returns what the session's user may read. The `u` parameter is set to
    /// the user's eid.
    pub fn execute(&mut self, select: &Select, params: &Params) -> CairnResult<Vec<Row>> {
        self.ensure_open()?;
        self.session.touch();

        let mut params = params.clone();
        if let Some(user) = self.session.user() {
            params.insert("u".to_string(), Value::Eid(user.eid));
        }

        let repo = self.repo()?;
        let types = self.eid_types(select, &params)?;
        let lookup = |eid: Eid| types.get(&eid).cloned();
        let rewriter = SecurityRewriter::new(repo.schema(), &lookup);
        let solutions = rewriter.solutions(select, &params);

        let rewritten = match self.session.user() {
            Some(user) if self.read_security() && !self.bypasses_security() => {
                access::rewrite_for_read(&rewriter, repo.schema(), &user.groups, select, &params, &solutions)?
            }
            _ => select.clone(),
        };

        let source = self.route(&solutions)?;
        trace!(target: "cairn::txn", txn_id = %self.id, source = %source.uri(), query = %rewritten, "Executing");
        let rows = self.with_source(&source, |conn| {
            source.execute(conn, repo.schema(), &rewritten, &params)
        })?;

        self.release_if_idle();
        Ok(rows)
    }

    /// Parse and run a query
    pub fn execute_text(&mut self, text: &str, params: &Params) -> CairnResult<Vec<Row>> {
        let repo = self.repo()?;
        let parser = repo
            .parser()
            .ok_or_else(|| CairnError::programming("no query parser registered"))?;
        let select = parser.parse(text)?;
        self.execute(&select, params)
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Run the hooks of `ctx.event` that are active and select the context
    pub(crate) fn fire(&mut self, ctx: HookContext) -> CairnResult<()> {
        let hooks = self.repo()?.hooks().for_event(ctx.event);
        for hook in hooks {
            if !self.hooks.is_category_activated(&hook.category) || !hook.selects(&ctx) {
                continue;
            }
            trace!(target: "cairn::hooks", txn_id = %self.id, hook = %hook.name, event = %ctx.event, "Running hook");
            hook.call(self, &ctx)?;
        }
        Ok(())
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Commit; the slot is kept only in `Transaction` mode
    pub fn commit(&mut self) -> CairnResult<()> {
        let release = self.mode != TxnMode::Transaction;
        self.commit_with(release)
    }

    /// Commit, releasing the slot afterwards if `release` is set
    ///
    /// # Errors
    ///
    /// - `Query` if the transaction is uncommitable
    /// - the error of the first failing precommit operation, after every
    ///   operation already through precommit was reverted in reverse order
    ///   and the transaction was rolled back
    pub fn commit_with(&mut self, release: bool) -> CairnResult<()> {
        self.ensure_open()?;
        if self.commit_state == CommitState::Uncommitable {
            return Err(CairnError::Query(
                "transaction is uncommitable and must be rolled back".to_string(),
            ));
        }
        if !self.has_slot() && self.pending.is_empty() {
            self.clear();
            return Ok(());
        }

        debug!(target: "cairn::txn", txn_id = %self.id, pending = self.pending.len(), "Commit started");
        self.commit_state = CommitState::Precommit;
        let mut processed: Vec<PendingOperation> = Vec::new();
        while let Some(mut pending) = self.pending.pop_front() {
            trace!(target: "cairn::ops", txn_id = %self.id, operation = pending.op.name(), "Precommit");
            if let Err(e) = pending.op.precommit_event(self) {
                pending.failed = true;
                error!(target: "cairn::ops", txn_id = %self.id, operation = pending.op.name(), error = %e, "Precommit failed");
                self.revert_precommit(&mut processed);
                let remainder: Vec<PendingOperation> = self.pending.drain(..).collect();
                self.pending.extend(processed);
                self.pending.push_back(pending);
                self.pending.extend(remainder);
                self.rollback_after_failure(release);
                return Err(e);
            }
            processed.push(pending);
        }

        let committed = match self.cell.lock().as_mut() {
            Some(slot) => slot.commit(),
            None => Ok(()),
        };
        if let Err(e) = committed {
            error!(target: "cairn::txn", txn_id = %self.id, error = %e, "Physical commit failed");
            self.revert_precommit(&mut processed);
            let remainder: Vec<PendingOperation> = self.pending.drain(..).collect();
            self.pending.extend(processed);
            self.pending.extend(remainder);
            self.rollback_after_failure(release);
            return Err(e);
        }

        self.commit_state = CommitState::Postcommit;
        self.pending.extend(processed);
        while let Some(mut pending) = self.pending.pop_front() {
            if let Err(e) = pending.op.postcommit_event(self) {
                error!(target: "cairn::ops", txn_id = %self.id, operation = pending.op.name(), error = %e, "Postcommit failed");
            }
        }

        if release {
            self.release_slot();
        }
        self.clear();
        info!(target: "cairn::txn", txn_id = %self.id, "Transaction committed");
        Ok(())
    }

    fn revert_precommit(&mut self, processed: &mut [PendingOperation]) {
        for pending in processed.iter_mut().rev() {
            if let Err(e) = pending.op.revertprecommit_event(self) {
                error!(target: "cairn::ops", txn_id = %self.id, operation = pending.op.name(), error = %e, "Revert precommit failed");
            }
        }
    }

    fn rollback_after_failure(&mut self, release: bool) {
        if let Err(e) = self.do_rollback(release) {
            warn!(target: "cairn::txn", txn_id = %self.id, error = %e, "Rollback after failed commit failed");
        }
    }

    /// Roll back; the slot is kept only in `Transaction` mode
    pub fn rollback(&mut self) -> CairnResult<()> {
        let release = self.mode != TxnMode::Transaction;
        self.rollback_with(release)
    }

    /// Roll back, releasing the slot afterwards if `release` is set
    ///
    /// Every pending operation's rollback callback runs, even when some fail.
    /// The error of the physical rollback is returned after cleanup.
    pub fn rollback_with(&mut self, release: bool) -> CairnResult<()> {
        self.ensure_open()?;
        self.do_rollback(release)
    }

    fn do_rollback(&mut self, release: bool) -> CairnResult<()> {
        debug!(target: "cairn::txn", txn_id = %self.id, pending = self.pending.len(), "Rollback started");
        while let Some(mut pending) = self.pending.pop_front() {
            if let Err(e) = pending.op.rollback_event(self) {
                error!(target: "cairn::ops", txn_id = %self.id, operation = pending.op.name(), error = %e, "Rollback callback failed");
            }
        }

        let result = match self.cell.lock().as_mut() {
            Some(slot) => slot.rollback(),
            None => Ok(()),
        };
        if release {
            self.release_slot();
        }
        self.clear();
        info!(target: "cairn::txn", txn_id = %self.id, "Transaction rolled back");
        result
    }

    /// Mark the transaction as only fit for rollback
    pub fn set_uncommitable(&mut self) {
        self.commit_state = CommitState::Uncommitable;
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.commit_state = CommitState::None;
        self.data.clear();
        self.mode = self.default_mode;
    }

    /// Roll back anything outstanding, give the slot back and close
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> CairnResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = if self.has_slot() || !self.pending.is_empty() {
            self.do_rollback(true)
        } else {
            Ok(())
        };
        self.release_slot();
        self.closed = true;
        self.hooks.reset();
        self.session.forget_cell(self.id);
        debug!(target: "cairn::txn", txn_id = %self.id, "Transaction closed");
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(target: "cairn::txn", txn_id = %self.id, error = %e, "Close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("mode", &self.mode)
            .field("commit_state", &self.commit_state)
            .field("pending", &self.pending)
            .field("closed", &self.closed)
            .finish()
    }
}

fn collect_eids(node: &Node, params: &Params, out: &mut BTreeSet<Eid>) {
    match node {
        Node::Relation(rel) => {
            let value = match &rel.object {
                Term::Const(v) => Some(v),
                Term::Param(name) => params.get(name),
                Term::Var(_) => None,
            };
            match value {
                Some(Value::Eid(eid)) => {
                    out.insert(*eid);
                }
                Some(v) if rel.rtype == EID_RTYPE => {
                    if let Some(eid) = v.as_eid() {
                        out.insert(eid);
                    }
                }
                _ => {}
            }
        }
        Node::IsType { .. } => {}
        Node::And(nodes) | Node::Or(nodes) => nodes.iter().for_each(|n| collect_eids(n, params, out)),
        Node::Not(inner) | Node::Exists(inner) => collect_eids(inner, params, out),
    }
}
