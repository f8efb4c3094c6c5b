//! Hook registration and dispatch data
//!
//! A hook binds a callback to one event. Hooks carry a category so a
//! transaction can switch whole groups on or off (see `control`), and an
//! optional selector restricting them to some entity or relation types.

use crate::transaction::Transaction;
use cairn_core::{Attributes, CairnResult, Eid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Named event points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Before an entity is stored
    BeforeAddEntity,
    /// After an entity is stored
    AfterAddEntity,
    /// Before attributes change
    BeforeUpdateEntity,
    /// After attributes changed
    AfterUpdateEntity,
    /// Before an entity is deleted
    BeforeDeleteEntity,
    /// After an entity was deleted
    AfterDeleteEntity,
    /// Before a relation is added
    BeforeAddRelation,
    /// After a relation was added
    AfterAddRelation,
    /// Before a relation is removed
    BeforeDeleteRelation,
    /// After a relation was removed
    AfterDeleteRelation,
    /// A session was opened
    SessionOpen,
    /// The repository opened
    ServerStartup,
    /// The repository is shutting down
    ServerShutdown,
}

impl HookEvent {
    /// Event name
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeAddEntity => "before_add_entity",
            HookEvent::AfterAddEntity => "after_add_entity",
            HookEvent::BeforeUpdateEntity => "before_update_entity",
            HookEvent::AfterUpdateEntity => "after_update_entity",
            HookEvent::BeforeDeleteEntity => "before_delete_entity",
            HookEvent::AfterDeleteEntity => "after_delete_entity",
            HookEvent::BeforeAddRelation => "before_add_relation",
            HookEvent::AfterAddRelation => "after_add_relation",
            HookEvent::BeforeDeleteRelation => "before_delete_relation",
            HookEvent::AfterDeleteRelation => "after_delete_relation",
            HookEvent::SessionOpen => "session_open",
            HookEvent::ServerStartup => "server_startup",
            HookEvent::ServerShutdown => "server_shutdown",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook is told about the event
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    /// Event being dispatched
    pub event: HookEvent,
    /// Affected entity
    pub eid: Option<Eid>,
    /// Type of the affected entity
    pub etype: Option<String>,
    /// Attributes being written
    pub attrs: Option<Attributes>,
    /// Relation type
    pub rtype: Option<String>,
    /// Relation subject
    pub subject: Option<Eid>,
    /// Relation object
    pub object: Option<Eid>,
}

impl HookContext {
    /// Context carrying nothing but the event
    pub fn bare(event: HookEvent) -> Self {
        Self {
            event,
            eid: None,
            etype: None,
            attrs: None,
            rtype: None,
            subject: None,
            object: None,
        }
    }

    /// Context of an entity event
    pub fn entity(event: HookEvent, eid: Eid, etype: &str) -> Self {
        Self {
            eid: Some(eid),
            etype: Some(etype.to_string()),
            ..Self::bare(event)
        }
    }

    /// Context of a relation event
    pub fn relation(event: HookEvent, subject: Eid, rtype: &str, object: Eid) -> Self {
        Self {
            rtype: Some(rtype.to_string()),
            subject: Some(subject),
            object: Some(object),
            ..Self::bare(event)
        }
    }

    /// Attach written attributes
    pub fn with_attrs(mut self, attrs: &Attributes) -> Self {
        self.attrs = Some(attrs.clone());
        self
    }
}

/// Hook callback
pub type HookCallback = Arc<dyn Fn(&mut Transaction, &HookContext) -> CairnResult<()> + Send + Sync>;

/// A callback bound to an event
#[derive(Clone)]
pub struct Hook {
    /// Unique name
    pub name: String,
    /// Event it listens to
    pub event: HookEvent,
    /// Category used by hook gating
    pub category: String,
    /// Entity or relation types it applies to; `None` means all
    pub selector: Option<BTreeSet<String>>,
    callback: HookCallback,
}

impl Hook {
    /// Hook on `event` in `category`
    pub fn new<F>(name: &str, event: HookEvent, category: &str, callback: F) -> Self
    where
        F: Fn(&mut Transaction, &HookContext) -> CairnResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            event,
            category: category.to_string(),
            selector: None,
            callback: Arc::new(callback),
        }
    }

    /// Restrict the hook to some entity or relation types
    pub fn for_types<S: AsRef<str>>(mut self, types: &[S]) -> Self {
        self.selector = Some(types.iter().map(|t| t.as_ref().to_string()).collect());
        self
    }

    /// Whether the hook applies to this context
    pub fn selects(&self, ctx: &HookContext) -> bool {
        match &self.selector {
            None => true,
            Some(types) => [&ctx.etype, &ctx.rtype]
                .iter()
                .any(|t| t.as_ref().map_or(false, |t| types.contains(t))),
        }
    }

    /// Run the callback
    pub fn call(&self, txn: &mut Transaction, ctx: &HookContext) -> CairnResult<()> {
        (self.callback)(txn, ctx)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("event", &self.event)
            .field("category", &self.category)
            .field("selector", &self.selector)
            .finish()
    }
}

/// Hooks of a repository
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<Hook>>>,
}

impl HookRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook; a hook with the same name is replaced
    pub fn register(&self, hook: Hook) {
        let mut hooks = self.hooks.write();
        hooks.retain(|h| h.name != hook.name);
        debug!(target: "cairn::hooks", name = %hook.name, event = %hook.event, category = %hook.category, "Hook registered");
        hooks.push(Arc::new(hook));
    }

    /// Remove a hook by name
    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.name != name);
        hooks.len() != before
    }

    /// Hooks listening to `event`, in registration order
    pub fn for_event(&self, event: HookEvent) -> Vec<Arc<Hook>> {
        self.hooks
            .read()
            .iter()
            .filter(|h| h.event == event)
            .cloned()
            .collect()
    }

    /// Every category in use
    pub fn categories(&self) -> BTreeSet<String> {
        self.hooks.read().iter().map(|h| h.category.clone()).collect()
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    /// Whether no hook is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }
}
