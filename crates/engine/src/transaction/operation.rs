//! Operations scheduled on a transaction
//!
//! An operation is a side effect bound to the commit or rollback of the
//! transaction that scheduled it. Each callback runs at most once per
//! instance. Within a phase operations run in registration order; reversion
//! of a failed precommit runs in reverse order.
//!
//! `DataOperation` is the coalescing pattern: one operation instance per key
//! and transaction, accumulating items through `Transaction::add_data`.

use super::Transaction;
use cairn_core::{Action, CairnError, CairnResult, Eid, Node, Params, Select, Value};
use cairn_security::RewriteContext;
use std::any::Any;
use std::fmt;
use tracing::debug;

/// Side effect bound to a transaction outcome
///
/// Every callback defaults to a no-op.
pub trait Operation: Send + 'static {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Runs before the physical commit; an error aborts the commit
    fn precommit_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        Ok(())
    }

    /// Undo `precommit_event` after a later operation failed
    fn revertprecommit_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        Ok(())
    }

    /// Runs when the transaction rolls back
    fn rollback_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        Ok(())
    }

    /// Runs after the physical commit; errors are only logged
    fn postcommit_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        Ok(())
    }

    /// Coalescing key, for operations registered once per transaction
    fn key(&self) -> Option<&str> {
        None
    }

    /// Downcasting hook used by `add_data`
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An operation coalescing items under one key
pub trait DataOperation: Operation + Sized {
    /// Accumulated item
    type Item;

    /// Key shared by every instance of this operation
    const KEY: &'static str;

    /// Empty instance
    fn create() -> Self;

    /// Accumulate one item
    fn add_data(&mut self, item: Self::Item);
}

/// Operation queued on a transaction
pub(crate) struct PendingOperation {
    pub(crate) op: Box<dyn Operation>,
    pub(crate) failed: bool,
}

impl PendingOperation {
    pub(crate) fn new(op: Box<dyn Operation>) -> Self {
        Self { op, failed: false }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("name", &self.op.name())
            .field("failed", &self.failed)
            .finish()
    }
}

impl Transaction {
    /// Append an operation to the pending queue
    ///
    /// # Errors
    ///
    /// `ClosedTransaction` once the transaction is closed.
    pub fn schedule(&mut self, op: Box<dyn Operation>) -> CairnResult<()> {
        self.ensure_open()?;
        debug!(target: "cairn::ops", txn_id = %self.id, operation = op.name(), "Operation scheduled");
        self.pending.push_back(PendingOperation::new(op));
        Ok(())
    }

    /// Insert an operation at `index` of the pending queue
    ///
    /// An index past the end appends.
    pub fn schedule_at(&mut self, index: usize, op: Box<dyn Operation>) -> CairnResult<()> {
        self.ensure_open()?;
        debug!(target: "cairn::ops", txn_id = %self.id, operation = op.name(), index, "Operation scheduled");
        let index = index.min(self.pending.len());
        self.pending.insert(index, PendingOperation::new(op));
        Ok(())
    }

    /// Add an item to the pending `O` of this transaction, scheduling it first
    /// if needed
    pub fn add_data<O: DataOperation>(&mut self, item: O::Item) -> CairnResult<()> {
        self.ensure_open()?;
        let existing = self
            .pending
            .iter_mut()
            .filter(|p| p.op.key() == Some(O::KEY))
            .find_map(|p| p.op.as_any_mut().downcast_mut::<O>());
        match existing {
            Some(op) => op.add_data(item),
            None => {
                let mut op = O::create();
                op.add_data(item);
                self.schedule(Box::new(op))?;
            }
        }
        Ok(())
    }

    /// Number of pending operations
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Names of pending operations, in queue order
    pub fn pending_names(&self) -> Vec<String> {
        self.pending.iter().map(|p| p.op.name().to_string()).collect()
    }
}

// ============================================================================
// Built-in operations
// ============================================================================

/// Checks expression-based write permissions before commit
///
/// Items are `(eid, etype, action)`; at precommit each entity must satisfy
/// at least one rule expression of its type for the action.
#[derive(Debug, Default)]
pub struct CheckEntityPermissionOp {
    items: Vec<(Eid, String, Action)>,
}

impl Operation for CheckEntityPermissionOp {
    fn name(&self) -> &str {
        "check_entity_permission"
    }

    fn precommit_event(&mut self, txn: &mut Transaction) -> CairnResult<()> {
        for (eid, etype, action) in std::mem::take(&mut self.items) {
            if !txn.satisfies_rules(eid, &etype, action)? {
                return Err(CairnError::unauthorized(format!(
                    "{} of {} {} is not permitted",
                    action, etype, eid
                )));
            }
        }
        Ok(())
    }

    fn key(&self) -> Option<&str> {
        Some(Self::KEY)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl DataOperation for CheckEntityPermissionOp {
    type Item = (Eid, String, Action);
    const KEY: &'static str = "check_entity_permission";

    fn create() -> Self {
        Self::default()
    }

    fn add_data(&mut self, item: Self::Item) {
        if !self.items.contains(&item) {
            self.items.push(item);
        }
    }
}

/// Drops the cached identity of entities created by a rolled back transaction
#[derive(Debug, Default)]
pub struct ForgetNewEntitiesOp {
    eids: Vec<Eid>,
}

impl Operation for ForgetNewEntitiesOp {
    fn name(&self) -> &str {
        "forget_new_entities"
    }

    fn rollback_event(&mut self, txn: &mut Transaction) -> CairnResult<()> {
        let repo = txn.repo()?;
        for eid in &self.eids {
            repo.identity().invalidate(*eid);
        }
        Ok(())
    }

    fn key(&self) -> Option<&str> {
        Some(Self::KEY)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl DataOperation for ForgetNewEntitiesOp {
    type Item = Eid;
    const KEY: &'static str = "forget_new_entities";

    fn create() -> Self {
        Self::default()
    }

    fn add_data(&mut self, item: Eid) {
        self.eids.push(item);
    }
}

impl Transaction {
    /// Whether `eid` satisfies one of the rule expressions of `etype` for
    /// `action`, evaluated with read security off
    pub(crate) fn satisfies_rules(&mut self, eid: Eid, etype: &str, action: Action) -> CairnResult<bool> {
        let perms = match self.repo()?.schema().permissions(etype, action) {
            Some(perms) => perms,
            None => return Ok(false),
        };
        let mut params = Params::new();
        if let Some(user) = self.session.user() {
            params.insert("u".to_string(), Value::Eid(user.eid));
        }
        let mut unsafe_txn = self.security_enabled(Some(false), None);
        for rule in &perms.expressions {
            let rule_query = Select::any(&[rule.main_var.as_str()], rule.restriction.clone());
            let subject = RewriteContext::new(&rule_query, Vec::new()).fresh_var();
            let renamed = rule
                .restriction
                .rename(&[(rule.main_var.clone(), subject.clone())].into_iter().collect());
            let select = Select::any(&[subject.as_str()], Node::and(vec![Node::eid(&subject, eid), renamed]));
            if !unsafe_txn.execute(&select, &params)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
