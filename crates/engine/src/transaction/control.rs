//! Scoped hook gating and security switches
//!
//! Both are stacks of frames owned by the transaction. A guard pushes a frame
//! when created and pops it when dropped, so the previous state comes back on
//! every exit path. Guards deref to the transaction and can be nested.
//!
//! ## Hook gating
//!
//! In `AllowAllBut` mode the frame's set lists disabled categories; in
//! `DenyAllBut` mode it lists enabled ones. A new frame extends the set of the
//! nearest frame of the same mode, so leaving an inner context of the other
//! mode restores the outer one exactly.

use super::Transaction;
use cairn_security::{AccessKind, SecurityFlag, SecurityFrame};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use tracing::trace;

/// How a hook frame reads its category set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HooksMode {
    /// Every category is active except the listed ones
    AllowAllBut,
    /// Only the listed categories are active
    DenyAllBut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HooksFrame {
    mode: HooksMode,
    categories: BTreeSet<String>,
}

/// Stack of hook frames
#[derive(Debug, Clone)]
pub struct HooksControl {
    frames: Vec<HooksFrame>,
}

impl HooksControl {
    /// Everything allowed, no nested context
    pub fn new() -> Self {
        Self {
            frames: vec![HooksFrame {
                mode: HooksMode::AllowAllBut,
                categories: BTreeSet::new(),
            }],
        }
    }

    fn top(&self) -> &HooksFrame {
        &self.frames[self.frames.len() - 1]
    }

    /// Current mode
    pub fn mode(&self) -> HooksMode {
        self.top().mode
    }

    /// Categories the current mode pairs with
    pub fn categories(&self) -> &BTreeSet<String> {
        &self.top().categories
    }

    /// Number of nested contexts
    pub fn ctx_count(&self) -> usize {
        self.frames.len() - 1
    }

    /// Whether hooks of `category` run
    pub fn is_category_activated(&self, category: &str) -> bool {
        let top = self.top();
        match top.mode {
            HooksMode::AllowAllBut => !top.categories.contains(category),
            HooksMode::DenyAllBut => top.categories.contains(category),
        }
    }

    pub(crate) fn push<S: AsRef<str>>(&mut self, mode: HooksMode, categories: &[S]) {
        let mut set = self
            .frames
            .iter()
            .rev()
            .find(|f| f.mode == mode)
            .map(|f| f.categories.clone())
            .unwrap_or_default();
        set.extend(categories.iter().map(|c| c.as_ref().to_string()));
        self.frames.push(HooksFrame { mode, categories: set });
    }

    pub(crate) fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub(crate) fn reset(&mut self) {
        self.frames.truncate(1);
    }
}

impl Default for HooksControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stack of security frames
#[derive(Debug, Clone)]
pub struct SecurityControl {
    frames: Vec<SecurityFrame>,
}

impl SecurityControl {
    /// Both switches at their default
    pub fn new() -> Self {
        Self {
            frames: vec![SecurityFrame::default()],
        }
    }

    /// Stack starting with both switches off
    pub fn disabled() -> Self {
        Self {
            frames: vec![SecurityFrame::default().child(Some(false), Some(false))],
        }
    }

    fn top(&self) -> &SecurityFrame {
        &self.frames[self.frames.len() - 1]
    }

    /// Three-valued flag for `kind`
    pub fn flag(&self, kind: AccessKind) -> SecurityFlag {
        self.top().flag(kind)
    }

    /// Whether the top frame moved `kind` away from its default
    pub fn from_default(&self, kind: AccessKind) -> bool {
        self.top().from_default(kind)
    }

    /// Number of nested contexts
    pub fn ctx_count(&self) -> usize {
        self.frames.len() - 1
    }

    pub(crate) fn push(&mut self, read: Option<bool>, write: Option<bool>) {
        let next = self.top().child(read, write);
        self.frames.push(next);
    }

    pub(crate) fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }
}

impl Default for SecurityControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by `deny_all_but` / `allow_all_but`
pub struct HooksGuard<'a> {
    txn: &'a mut Transaction,
}

impl<'a> HooksGuard<'a> {
    pub(crate) fn new<S: AsRef<str>>(txn: &'a mut Transaction, mode: HooksMode, categories: &[S]) -> Self {
        txn.hooks.push(mode, categories);
        trace!(target: "cairn::hooks", txn_id = %txn.id, mode = ?mode, depth = txn.hooks.ctx_count(), "Hook context entered");
        Self { txn }
    }
}

impl Deref for HooksGuard<'_> {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        self.txn
    }
}

impl DerefMut for HooksGuard<'_> {
    fn deref_mut(&mut self) -> &mut Transaction {
        self.txn
    }
}

impl Drop for HooksGuard<'_> {
    fn drop(&mut self) {
        self.txn.hooks.pop();
        trace!(target: "cairn::hooks", txn_id = %self.txn.id, depth = self.txn.hooks.ctx_count(), "Hook context left");
    }
}

/// Guard returned by `security_enabled`
pub struct SecurityGuard<'a> {
    txn: &'a mut Transaction,
}

impl<'a> SecurityGuard<'a> {
    pub(crate) fn new(txn: &'a mut Transaction, read: Option<bool>, write: Option<bool>) -> Self {
        txn.security.push(read, write);
        trace!(target: "cairn::security", txn_id = %txn.id, read = ?read, write = ?write, "Security context entered");
        Self { txn }
    }
}

impl Deref for SecurityGuard<'_> {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        self.txn
    }
}

impl DerefMut for SecurityGuard<'_> {
    fn deref_mut(&mut self) -> &mut Transaction {
        self.txn
    }
}

impl Drop for SecurityGuard<'_> {
    fn drop(&mut self) {
        self.txn.security.pop();
    }
}
