//! Transaction lifecycle tests
//!
//! Covers:
//! - Commit: precommit order, reversion on failure, physical commit failure
//! - Rollback: every callback runs even when some fail
//! - Hook gating and security switches through guards
//! - Mutations: validation, write permissions, single-valued relations
//! - Slot holding per transaction mode

use cairn_core::{
    Action, Attributes, CairnError, CairnResult, Credentials, Eid, MemorySchema, Node, Params, Permissions,
    RuleExpression, Select, Term, Value, EID_RTYPE,
};
use cairn_engine::{
    access, CommitState, Hook, HookEvent, HooksMode, MemorySource, Operation, Repository, RepositoryConfig, Session,
    Transaction, TxnMode,
};
use cairn_security::{project, SecurityRewriter};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn owned_by_user() -> RuleExpression {
    RuleExpression::new(Node::relation("X", "owned_by", Term::Param("u".to_string())))
}

/// Rule over `D` that names the owner `X`
fn draft_owned_by_user() -> RuleExpression {
    RuleExpression {
        main_var: "D".to_string(),
        restriction: Node::and(vec![
            Node::relation("D", "owned_by", Term::Var("X".to_string())),
            Node::relation("X", EID_RTYPE, Term::Param("u".to_string())),
        ]),
    }
}

fn schema() -> MemorySchema {
    let guarded = || Permissions::groups(&["managers"]).with_expression(owned_by_user());
    MemorySchema::builder()
        .attribute("User", "login", "String", true)
        .attribute("Doc", "title", "String", true)
        .attribute("Doc", "pages", "Int", false)
        .entity_type("Folder")
        .relation("in_folder", "Doc", "Folder", "?*")
        .relation("owned_by", "Doc", "User", "**")
        .permissions("Doc", Action::Read, guarded())
        .permissions("Doc", Action::Update, guarded())
        .permissions("Doc", Action::Delete, guarded())
        .attribute("Note", "body", "String", false)
        .relation("owned_by", "Note", "User", "**")
        .permissions("Note", Action::Read, guarded())
        .entity_type("Secret")
        .permissions("Secret", Action::Read, Permissions::groups(&["managers"]))
        .attribute("Draft", "title", "String", true)
        .relation("owned_by", "Draft", "User", "**")
        .permissions(
            "Draft",
            Action::Update,
            Permissions::groups(&["managers"]).with_expression(draft_owned_by_user()),
        )
        .build()
}

struct Fixture {
    repo: Arc<Repository>,
    system: Arc<MemorySource>,
    alice: Eid,
}

impl Fixture {
    fn new() -> Self {
        Self::with_hooks(Vec::new())
    }

    fn with_hooks(hooks: Vec<Hook>) -> Self {
        let system = Arc::new(MemorySource::system());
        let alice = system.add_user("alice", "secret", &["users"]);
        system.add_user("admin", "root", &["managers"]);
        system.add_user("guest", "guest", &["guests"]);
        let config = RepositoryConfig::default()
            .with_slot_count(2)
            .with_acquire_timeout(Duration::from_millis(200))
            .with_sweep_interval(Duration::ZERO);
        let mut builder = Repository::builder(Arc::new(schema()))
            .config(config)
            .system_source(system.clone());
        for hook in hooks {
            builder = builder.hook(hook);
        }
        let repo = builder.open().unwrap();
        Self { repo, system, alice }
    }

    fn session(&self, login: &str, password: &str) -> Arc<Session> {
        self.repo
            .connect(login, &Credentials::Password(password.to_string()))
            .unwrap()
    }

    fn txn(&self, session: &Arc<Session>) -> Transaction {
        self.repo.new_transaction(session).unwrap()
    }

    /// Two docs created by a manager; only the first is owned by alice
    fn docs(&self) -> (Eid, Eid) {
        let admin = self.session("admin", "root");
        let mut txn = self.txn(&admin);
        let mine = txn.add_entity("Doc", doc("mine")).unwrap();
        let other = txn.add_entity("Doc", doc("other")).unwrap();
        txn.add_relation(mine, "owned_by", self.alice).unwrap();
        txn.commit().unwrap();
        (mine, other)
    }
}

fn doc(title: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("title".to_string(), Value::from(title));
    attrs
}

fn all_docs() -> Select {
    Select::any(&["X"], Node::is("X", "Doc"))
}

fn eids(rows: &[Vec<Value>]) -> Vec<Eid> {
    let mut out: Vec<Eid> = rows.iter().filter_map(|r| r[0].as_eid()).collect();
    out.sort();
    out
}

/// Operation recording each callback in a shared log
struct RecordingOp {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    fail_precommit: bool,
    fail_rollback: bool,
    fail_postcommit: bool,
}

impl RecordingOp {
    fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            fail_precommit: false,
            fail_rollback: false,
            fail_postcommit: false,
        }
    }

    fn record(&self, event: &str) {
        self.log.lock().push(format!("{}.{}", self.name, event));
    }
}

impl Operation for RecordingOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn precommit_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        self.record("precommit");
        if self.fail_precommit {
            return Err(CairnError::invalid_operation(format!("{} refused", self.name)));
        }
        Ok(())
    }

    fn revertprecommit_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        self.record("revert");
        Ok(())
    }

    fn rollback_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        self.record("rollback");
        if self.fail_rollback {
            return Err(CairnError::invalid_operation("rollback failed"));
        }
        Ok(())
    }

    fn postcommit_event(&mut self, _txn: &mut Transaction) -> CairnResult<()> {
        self.record("postcommit");
        if self.fail_postcommit {
            return Err(CairnError::invalid_operation("postcommit failed"));
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// Commit protocol
// ============================================================================

#[test]
fn test_commit_runs_precommit_then_postcommit_in_order() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut txn = fx.txn(&admin);
    txn.add_entity("Doc", doc("a")).unwrap();
    txn.schedule(Box::new(RecordingOp::new("a", &log))).unwrap();
    txn.schedule(Box::new(RecordingOp::new("b", &log))).unwrap();

    txn.commit().unwrap();
    assert_eq!(
        *log.lock(),
        vec!["a.precommit", "b.precommit", "a.postcommit", "b.postcommit"]
    );
    assert_eq!(txn.pending_count(), 0);
    assert_eq!(txn.commit_state(), CommitState::None);
    assert_eq!(fx.system.entity_count(), 4);
}

#[test]
fn test_failed_precommit_reverts_in_reverse_and_rolls_back() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut txn = fx.txn(&admin);
    let eid = txn.add_entity("Doc", doc("lost")).unwrap();

    let mut failing = RecordingOp::new("c", &log);
    failing.fail_precommit = true;
    txn.schedule(Box::new(RecordingOp::new("a", &log))).unwrap();
    txn.schedule(Box::new(RecordingOp::new("b", &log))).unwrap();
    txn.schedule(Box::new(failing)).unwrap();
    txn.schedule(Box::new(RecordingOp::new("d", &log))).unwrap();
    assert_eq!(
        txn.pending_names(),
        vec!["forget_new_entities", "a", "b", "c", "d"]
    );

    let err = txn.commit().unwrap_err();
    assert!(matches!(err, CairnError::InvalidOperation(_)));
    assert_eq!(
        *log.lock(),
        vec![
            "a.precommit",
            "b.precommit",
            "c.precommit",
            "b.revert",
            "a.revert",
            "a.rollback",
            "b.rollback",
            "c.rollback",
            "d.rollback",
        ]
    );

    // Nothing reached the store and the new eid is forgotten
    assert_eq!(fx.system.entity_count(), 3);
    assert_eq!(txn.commit_state(), CommitState::None);
    assert!(!txn.has_slot());
    assert!(fx.repo.identity().cached(eid).is_none());
    assert!(matches!(txn.entity_info(eid), Err(CairnError::UnknownId(_))));
}

#[test]
fn test_physical_commit_failure_reverts_everything() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut txn = fx.txn(&admin);
    txn.add_entity("Doc", doc("lost")).unwrap();
    txn.schedule(Box::new(RecordingOp::new("a", &log))).unwrap();

    fx.system.fail_next_commit();
    assert!(txn.commit().is_err());
    assert_eq!(*log.lock(), vec!["a.precommit", "a.revert", "a.rollback"]);
    assert_eq!(fx.system.entity_count(), 3);
}

#[test]
fn test_postcommit_failures_do_not_escalate() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut txn = fx.txn(&admin);
    txn.add_entity("Doc", doc("kept")).unwrap();
    let mut failing = RecordingOp::new("a", &log);
    failing.fail_postcommit = true;
    txn.schedule(Box::new(failing)).unwrap();
    txn.schedule(Box::new(RecordingOp::new("b", &log))).unwrap();

    txn.commit().unwrap();
    assert_eq!(
        *log.lock(),
        vec!["a.precommit", "b.precommit", "a.postcommit", "b.postcommit"]
    );
    assert_eq!(fx.system.entity_count(), 4);
}

#[test]
fn test_interleaved_write_transactions_both_persist() {
    let fx = Fixture::new();
    let first = fx.session("admin", "root");
    let second = fx.session("admin", "root");
    let mut a = fx.txn(&first);
    let mut b = fx.txn(&second);

    let doc_a = a.add_entity("Doc", doc("A")).unwrap();
    let doc_b = b.add_entity("Doc", doc("B")).unwrap();
    a.commit().unwrap();
    b.commit().unwrap();

    assert_eq!(fx.system.entity_count(), 5);
    assert_eq!(fx.system.committed_attribute(doc_a, "title"), Some(Value::from("A")));
    assert_eq!(fx.system.committed_attribute(doc_b, "title"), Some(Value::from("B")));

    fx.repo.clear_caches();
    assert_eq!(a.entity_info(doc_b).unwrap().etype, "Doc");
    assert_eq!(b.entity_info(doc_a).unwrap().etype, "Doc");
}

#[test]
fn test_uncommitable_transaction_must_roll_back() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);

    let mut attrs = doc("x");
    attrs.insert("colour".to_string(), Value::from("red"));
    let err = txn.add_entity("Doc", attrs).unwrap_err();
    assert!(err.is_validation());
    assert_eq!(txn.commit_state(), CommitState::Uncommitable);
    assert!(matches!(txn.commit(), Err(CairnError::Query(_))));

    txn.rollback().unwrap();
    assert_eq!(txn.commit_state(), CommitState::None);
    txn.add_entity("Doc", doc("y")).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_validation_reports_every_attribute() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);

    let mut attrs = Attributes::new();
    attrs.insert("pages".to_string(), Value::from("many"));
    match txn.add_entity("Doc", attrs) {
        Err(CairnError::Validation { eid, errors }) => {
            assert_eq!(eid, None);
            assert!(errors.contains_key("title"));
            assert!(errors.contains_key("pages"));
        }
        other => panic!("expected a validation error, got {:?}", other),
    }
    assert!(txn.add_entity("Nope", Attributes::new()).unwrap_err().is_validation());
}

// ============================================================================
// Rollback
// ============================================================================

#[test]
fn test_rollback_runs_every_callback() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut txn = fx.txn(&admin);
    let mut failing = RecordingOp::new("a", &log);
    failing.fail_rollback = true;
    txn.schedule(Box::new(failing)).unwrap();
    txn.schedule(Box::new(RecordingOp::new("b", &log))).unwrap();
    txn.transaction_data_mut()
        .insert("seen".to_string(), serde_json::json!(true));

    txn.rollback().unwrap();
    assert_eq!(*log.lock(), vec!["a.rollback", "b.rollback"]);
    assert!(txn.transaction_data().is_empty());
    assert_eq!(txn.pending_count(), 0);
}

#[test]
fn test_close_rolls_back_pending_work() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    txn.add_entity("Doc", doc("draft")).unwrap();
    txn.close().unwrap();

    assert!(txn.is_closed());
    assert_eq!(fx.system.entity_count(), 3);
    assert_eq!(fx.repo.pool_stats().idle, 2);
    assert!(matches!(
        txn.execute(&all_docs(), &Params::new()),
        Err(CairnError::ClosedTransaction(_))
    ));
    assert!(txn.close().is_ok());
}

#[test]
fn test_scratch_data_cleared_after_commit() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    txn.transaction_data_mut()
        .insert("counter".to_string(), serde_json::json!(1));
    txn.commit().unwrap();
    assert!(txn.transaction_data().is_empty());
}

// ============================================================================
// Hook gating
// ============================================================================

#[test]
fn test_nested_gating_contexts_restore_outer_state() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    {
        let mut outer = txn.deny_all_but(&["integrity"]);
        assert_eq!(outer.hooks_mode(), HooksMode::DenyAllBut);
        assert!(outer.is_category_activated("integrity"));
        {
            let inner = outer.allow_all_but(&["integrity"]);
            assert_eq!(inner.hooks_mode(), HooksMode::AllowAllBut);
            assert!(!inner.is_category_activated("integrity"));
            assert!(inner.is_category_activated("metadata"));
            assert_eq!(inner.hooks_ctx_count(), 2);
        }
        assert_eq!(outer.hooks_mode(), HooksMode::DenyAllBut);
        assert!(outer.is_category_activated("integrity"));
        assert!(!outer.is_category_activated("metadata"));
    }
    assert_eq!(txn.hooks_ctx_count(), 0);
    assert!(txn.is_category_activated("metadata"));
}

#[test]
fn test_disabled_category_skips_hooks() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let hook = Hook::new("count_docs", HookEvent::AfterAddEntity, "audit", move |_txn, ctx| {
        assert_eq!(ctx.etype.as_deref(), Some("Doc"));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .for_types(&["Doc"]);
    let fx = Fixture::with_hooks(vec![hook]);
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);

    txn.add_entity("Doc", doc("a")).unwrap();
    txn.add_entity("Folder", Attributes::new()).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    {
        let mut quiet = txn.allow_all_but(&["audit"]);
        quiet.add_entity("Doc", doc("b")).unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    txn.commit().unwrap();
}

#[test]
fn test_failing_before_hook_aborts_mutation() {
    let hook = Hook::new("no_drafts", HookEvent::BeforeAddEntity, "integrity", |_txn, ctx| {
        let title = ctx.attrs.as_ref().and_then(|a| a.get("title")).and_then(|v| v.as_str());
        if title == Some("draft") {
            return Err(CairnError::validation(None, "title", "drafts are not stored"));
        }
        Ok(())
    });
    let fx = Fixture::with_hooks(vec![hook]);
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    assert!(txn.add_entity("Doc", doc("draft")).unwrap_err().is_validation());
    txn.rollback().unwrap();
    txn.add_entity("Doc", doc("final")).unwrap();
    txn.commit().unwrap();
    assert_eq!(fx.system.entity_count(), 4);
}

#[test]
fn test_hook_can_write_scratch_data() {
    let hook = Hook::new("remember", HookEvent::AfterAddEntity, "metadata", |txn, ctx| {
        let eid = ctx.eid.map(|e| e.0).unwrap_or_default();
        txn.transaction_data_mut()
            .insert("last_added".to_string(), serde_json::json!(eid));
        Ok(())
    });
    let fx = Fixture::with_hooks(vec![hook]);
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    let eid = txn.add_entity("Doc", doc("a")).unwrap();
    assert_eq!(txn.transaction_data()["last_added"], serde_json::json!(eid.0));
}

// ============================================================================
// Security
// ============================================================================

#[test]
fn test_read_rewriting_limits_user_to_owned_docs() {
    let fx = Fixture::new();
    let (mine, other) = fx.docs();

    let alice = fx.session("alice", "secret");
    let mut txn = fx.txn(&alice);
    let rows = txn.execute(&all_docs(), &Params::new()).unwrap();
    assert_eq!(eids(&rows), vec![mine]);

    {
        let mut unsafe_txn = txn.security_enabled(Some(false), None);
        assert!(!unsafe_txn.read_security());
        let rows = unsafe_txn.execute(&all_docs(), &Params::new()).unwrap();
        assert_eq!(eids(&rows), vec![mine, other]);
    }
    assert!(txn.read_security());

    let admin = fx.session("admin", "root");
    let mut admin_txn = fx.txn(&admin);
    let rows = admin_txn.execute(&all_docs(), &Params::new()).unwrap();
    assert_eq!(eids(&rows), vec![mine, other]);
}

fn docs_and_notes() -> Select {
    Select::any(&["X"], Node::is_in("X", &["Doc", "Note"]))
}

#[test]
fn test_ambiguous_owner_gets_one_typed_branch_per_type() {
    let schema = schema();
    let mut params = Params::new();
    params.insert("u".to_string(), Value::Eid(Eid(1)));
    let lookup = |eid: Eid| (eid == Eid(1)).then(|| "User".to_string());
    let rewriter = SecurityRewriter::new(&schema, &lookup);
    let q = docs_and_notes();
    let original = rewriter.solutions(&q, &params);
    assert_eq!(original.len(), 2);

    let users: BTreeSet<String> = ["users".to_string()].into_iter().collect();
    let rewritten = access::rewrite_for_read(&rewriter, &schema, &users, &q, &params, &original).unwrap();
    let text = rewritten.to_string();
    assert!(text.contains(" OR "), "expected one branch per type in {}", text);
    assert!(text.contains("X is Doc, X owned_by %(u)s"), "missing Doc branch in {}", text);
    assert!(text.contains("X is Note, X owned_by %(u)s"), "missing Note branch in {}", text);

    let after = rewriter.solutions(&rewritten, &params);
    let vars: BTreeSet<String> = ["X".to_string()].into_iter().collect();
    assert_eq!(project(&after, &vars), project(&original, &vars));
}

#[test]
fn test_ambiguous_owner_reads_only_owned_entities_of_each_type() {
    let fx = Fixture::new();
    let (mine, _) = fx.docs();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    let my_note = txn.add_entity("Note", Attributes::new()).unwrap();
    let other_note = txn.add_entity("Note", Attributes::new()).unwrap();
    txn.add_relation(my_note, "owned_by", fx.alice).unwrap();
    txn.commit().unwrap();
    assert_eq!(txn.execute(&docs_and_notes(), &Params::new()).unwrap().len(), 4);

    let alice = fx.session("alice", "secret");
    let mut alice_txn = fx.txn(&alice);
    let rows = alice_txn.execute(&docs_and_notes(), &Params::new()).unwrap();
    let mut expected = vec![mine, my_note];
    expected.sort();
    assert_eq!(eids(&rows), expected);
    assert!(!eids(&rows).contains(&other_note));
}

#[test]
fn test_denied_read_is_unauthorized() {
    let fx = Fixture::new();
    fx.docs();
    let guest = fx.session("guest", "guest");
    let mut txn = fx.txn(&guest);
    // Docs are rule guarded: none is owned by the guest
    assert!(txn.execute(&all_docs(), &Params::new()).unwrap().is_empty());

    let secrets = Select::any(&["X"], Node::is("X", "Secret"));
    let err = txn.execute(&secrets, &Params::new()).unwrap_err();
    assert!(err.is_unauthorized());
}

#[test]
fn test_write_permission_by_group() {
    let fx = Fixture::new();
    let guest = fx.session("guest", "guest");
    let mut txn = fx.txn(&guest);
    assert!(txn.add_entity("Doc", doc("a")).unwrap_err().is_unauthorized());

    {
        let mut unchecked = txn.security_enabled(None, Some(false));
        unchecked.add_entity("Doc", doc("a")).unwrap();
    }
    txn.commit().unwrap();
}

#[test]
fn test_rule_guarded_update_checked_at_precommit() {
    let fx = Fixture::new();
    let (mine, other) = fx.docs();
    let alice = fx.session("alice", "secret");
    let mut txn = fx.txn(&alice);

    txn.update_entity(other, doc("stolen")).unwrap();
    assert!(txn.commit().unwrap_err().is_unauthorized());
    assert_eq!(fx.system.committed_attribute(other, "title"), Some(Value::from("other")));

    txn.update_entity(mine, doc("renamed")).unwrap();
    txn.commit().unwrap();
    assert_eq!(fx.system.committed_attribute(mine, "title"), Some(Value::from("renamed")));
}

#[test]
fn test_rule_variables_kept_apart_from_checked_entity() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut setup = fx.txn(&admin);
    let mine = setup.add_entity("Draft", doc("mine")).unwrap();
    let other = setup.add_entity("Draft", doc("other")).unwrap();
    setup.add_relation(mine, "owned_by", fx.alice).unwrap();
    setup.commit().unwrap();

    let alice = fx.session("alice", "secret");
    let mut txn = fx.txn(&alice);
    txn.update_entity(mine, doc("renamed")).unwrap();
    txn.commit().unwrap();
    assert_eq!(fx.system.committed_attribute(mine, "title"), Some(Value::from("renamed")));

    txn.update_entity(other, doc("stolen")).unwrap();
    assert!(txn.commit().unwrap_err().is_unauthorized());
    assert_eq!(fx.system.committed_attribute(other, "title"), Some(Value::from("other")));
}

#[test]
fn test_rule_guarded_delete_checked_immediately() {
    let fx = Fixture::new();
    let (mine, other) = fx.docs();
    let alice = fx.session("alice", "secret");
    let mut txn = fx.txn(&alice);

    assert!(txn.delete_entities(&[other]).unwrap_err().is_unauthorized());
    txn.delete_entities(&[mine]).unwrap();
    assert!(fx.repo.identity().cached(mine).is_none());
    assert!(matches!(txn.entity_info(mine), Err(CairnError::UnknownId(_))));
    txn.commit().unwrap();
    assert_eq!(fx.system.entity_count(), 4);
}

// ============================================================================
// Relations
// ============================================================================

#[test]
fn test_single_valued_relation_replaces_previous_link() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    let d = txn.add_entity("Doc", doc("a")).unwrap();
    let f1 = txn.add_entity("Folder", Attributes::new()).unwrap();
    let f2 = txn.add_entity("Folder", Attributes::new()).unwrap();
    txn.add_relation(d, "in_folder", f1).unwrap();
    txn.add_relation(d, "in_folder", f2).unwrap();
    txn.commit().unwrap();

    let folders = Select::any(
        &["F"],
        Node::and(vec![Node::eid("D", d), Node::rel("D", "in_folder", "F")]),
    );
    let rows = txn.execute(&folders, &Params::new()).unwrap();
    assert_eq!(eids(&rows), vec![f2]);

    txn.delete_relation(d, "in_folder", f2).unwrap();
    txn.commit().unwrap();
    assert!(txn.execute(&folders, &Params::new()).unwrap().is_empty());
}

#[test]
fn test_relation_checks_schema() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    let d = txn.add_entity("Doc", doc("a")).unwrap();
    let f = txn.add_entity("Folder", Attributes::new()).unwrap();

    assert!(txn.add_relation(d, "title", f).is_err());
    assert!(txn.add_relation(f, "in_folder", d).unwrap_err().is_validation());
    assert_eq!(txn.commit_state(), CommitState::Uncommitable);
}

// ============================================================================
// Slot holding
// ============================================================================

#[test]
fn test_read_mode_returns_slot_after_query() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    assert_eq!(txn.mode(), TxnMode::Read);

    txn.execute(&all_docs(), &Params::new()).unwrap();
    assert!(!txn.has_slot());

    txn.add_entity("Doc", doc("a")).unwrap();
    assert_eq!(txn.mode(), TxnMode::Write);
    txn.execute(&all_docs(), &Params::new()).unwrap();
    assert!(txn.has_slot());

    txn.commit().unwrap();
    assert!(!txn.has_slot());
    assert_eq!(txn.mode(), TxnMode::Read);
}

#[test]
fn test_read_mode_returns_slot_after_identity_lookup() {
    let fx = Fixture::new();
    let (mine, _) = fx.docs();
    fx.repo.clear_caches();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);

    assert_eq!(txn.entity_info(mine).unwrap().etype, "Doc");
    assert!(!txn.has_slot());
    assert!(matches!(txn.entity_info(Eid(9999)), Err(CairnError::UnknownId(_))));
    assert!(!txn.has_slot());
    assert_eq!(fx.repo.pool_stats().held, 0);

    // A writing transaction keeps its slot
    txn.add_entity("Doc", doc("a")).unwrap();
    fx.repo.clear_caches();
    txn.entity_info(mine).unwrap();
    assert!(txn.has_slot());
}

#[test]
fn test_transaction_mode_keeps_slot_across_commits() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    txn.set_mode(TxnMode::Transaction);

    txn.add_entity("Doc", doc("a")).unwrap();
    txn.commit().unwrap();
    assert!(txn.has_slot());
    assert_eq!(fx.repo.pool_stats().held, 1);

    txn.close().unwrap();
    assert!(!txn.has_slot());
    assert_eq!(fx.repo.pool_stats().held, 0);
}

#[test]
fn test_coalesced_operation_scheduled_once() {
    let fx = Fixture::new();
    let admin = fx.session("admin", "root");
    let mut txn = fx.txn(&admin);
    txn.add_entity("Doc", doc("a")).unwrap();
    txn.add_entity("Doc", doc("b")).unwrap();
    assert_eq!(txn.pending_names(), vec!["forget_new_entities"]);
}
