//! Repository: the owner of every shared registry
//!
//! A `Repository` holds the schema, the source registry, the slot pool, the
//! identity cache, the hook registry and the open sessions. It is always used
//! behind an `Arc`; sessions, transactions and the sweeper only keep weak
//! references back.
//!
//! # Shutdown
//!
//! 1. refuse new transactions, stop the sweeper and run `server_shutdown`
//!    hooks once
//! 2. close every session's tracker, then wait for outstanding slots until the
//!    drain deadline
//! 3. reclaim what is left: reset each slot hard and put it back in the pool
//! 4. close all sessions and the pool

use crate::config::RepositoryConfig;
use crate::hooks::{Hook, HookContext, HookEvent, HookRegistry};
use crate::identity::IdentityRegistry;
use crate::session::{Session, SessionInfo, UserIdentity};
use crate::source::{ConnectionSet, MemorySource, SourceDef, SourceRegistry};
use crate::sweeper::SessionSweeper;
use crate::transaction::{SlotCell, Transaction};
use cairn_concurrency::{PoolStats, SlotPool};
use cairn_core::{CairnError, CairnResult, Credentials, QueryParser, Schema, SessionId, Source, SourceUri, TxnId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Builder for [`Repository`]
pub struct RepositoryBuilder {
    schema: Arc<dyn Schema>,
    config: RepositoryConfig,
    system: Option<Arc<dyn Source>>,
    sources: Vec<(SourceDef, Arc<dyn Source>)>,
    hooks: Vec<Hook>,
    parser: Option<Arc<dyn QueryParser>>,
}

impl RepositoryBuilder {
    /// Start from `schema` with the default configuration
    pub fn new(schema: Arc<dyn Schema>) -> Self {
        Self {
            schema,
            config: RepositoryConfig::default(),
            system: None,
            sources: Vec::new(),
            hooks: Vec::new(),
            parser: None,
        }
    }

    /// Use `config`
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML file
    pub fn config_file(mut self, path: &Path) -> CairnResult<Self> {
        self.config = RepositoryConfig::from_file(path)?;
        Ok(self)
    }

    /// Use `source` as the system source instead of an in-memory one
    pub fn system_source(mut self, source: Arc<dyn Source>) -> Self {
        self.system = Some(source);
        self
    }

    /// Register a federated source
    pub fn source(mut self, def: SourceDef, source: Arc<dyn Source>) -> Self {
        self.sources.push((def, source));
        self
    }

    /// Register a hook
    pub fn hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Register the parser used by `execute_text`
    pub fn parser(mut self, parser: Arc<dyn QueryParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Open the repository: fill the pool, run `server_startup` hooks and
    /// start the sweeper
    ///
    /// # Errors
    ///
    /// - `Config` for an invalid configuration or a misregistered source
    /// - any error of a source opening its connections
    /// - any error of a `server_startup` hook
    pub fn open(self) -> CairnResult<Arc<Repository>> {
        self.config.validate()?;
        let system = self
            .system
            .unwrap_or_else(|| Arc::new(MemorySource::system()) as Arc<dyn Source>);
        if !system.uri().is_system() {
            return Err(CairnError::Config(format!(
                "system source must be registered as {}, not {}",
                SourceUri::system(),
                system.uri()
            )));
        }
        let sources = SourceRegistry::new(system);
        for (def, source) in self.sources {
            if &def.uri != source.uri() {
                return Err(CairnError::Config(format!(
                    "source {} registered under {}",
                    source.uri(),
                    def.uri
                )));
            }
            sources.add(def, source)?;
        }

        let pool = SlotPool::with_factory(self.config.slot_count, |_| ConnectionSet::open(&sources))?;
        let hooks = HookRegistry::new();
        for hook in self.hooks {
            hooks.register(hook);
        }

        let repo = Arc::new_cyclic(|weak| Repository {
            config: self.config,
            schema: self.schema,
            sources,
            pool,
            identity: IdentityRegistry::new(),
            hooks,
            parser: self.parser,
            sessions: DashMap::new(),
            internal: Arc::new(Session::internal(weak.clone())),
            next_txn: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        {
            let mut txn = repo.internal_transaction()?;
            txn.fire(HookContext::bare(HookEvent::ServerStartup))?;
            txn.commit()?;
            txn.close()?;
        }

        if let Some(interval) = repo.config.sweep_interval() {
            let sweeper = SessionSweeper::start(Arc::downgrade(&repo), interval)?;
            *repo.sweeper.lock() = Some(sweeper);
        }

        info!(
            target: "cairn::repo",
            slots = repo.config.slot_count,
            sources = repo.sources.defs().len(),
            hooks = repo.hooks.len(),
            "Repository opened"
        );
        Ok(repo)
    }
}

/// What `shutdown` did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Sessions closed, the internal one excluded
    pub sessions_closed: usize,
    /// Slots taken back from transactions that did not release them in time
    pub reclaimed: usize,
    /// Slots that could not be taken back
    pub reclaim_failures: usize,
}

/// Owner of every shared registry
pub struct Repository {
    config: RepositoryConfig,
    schema: Arc<dyn Schema>,
    sources: SourceRegistry,
    pool: SlotPool<ConnectionSet>,
    identity: IdentityRegistry,
    hooks: HookRegistry,
    parser: Option<Arc<dyn QueryParser>>,
    sessions: DashMap<SessionId, Arc<Session>>,
    internal: Arc<Session>,
    next_txn: AtomicU64,
    shutting_down: AtomicBool,
    sweeper: Mutex<Option<SessionSweeper>>,
}

impl Repository {
    /// Builder over `schema`
    pub fn builder(schema: Arc<dyn Schema>) -> RepositoryBuilder {
        RepositoryBuilder::new(schema)
    }

    /// Configuration in use
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Schema
    pub fn schema(&self) -> &dyn Schema {
        self.schema.as_ref()
    }

    /// Registered sources
    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Slot pool
    pub fn pool(&self) -> &SlotPool<ConnectionSet> {
        &self.pool
    }

    /// Identity cache
    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    /// Hook registry; hooks registered after open apply to later events
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Query parser, if one was registered
    pub fn parser(&self) -> Option<&Arc<dyn QueryParser>> {
        self.parser.as_ref()
    }

    /// Pool snapshot
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Whether `shutdown` started
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> CairnResult<()> {
        if self.is_shutting_down() {
            return Err(CairnError::Shutdown);
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction of `session`
    ///
    /// # Errors
    ///
    /// `Shutdown` once shutdown started, `Programming` if the session is
    /// closed.
    pub fn new_transaction(self: &Arc<Self>, session: &Arc<Session>) -> CairnResult<Transaction> {
        self.ensure_running()?;
        if session.is_closed() {
            return Err(CairnError::programming(format!("session {} is closed", session.id())));
        }
        Ok(self.open_transaction(session))
    }

    fn open_transaction(self: &Arc<Self>, session: &Arc<Session>) -> Transaction {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        let cell: Arc<SlotCell> = Arc::new(Mutex::new(None));
        session.register_cell(id, Arc::clone(&cell));
        debug!(target: "cairn::txn", txn_id = %id, session_id = %session.id(), "Transaction opened");
        Transaction::new(id, Arc::downgrade(self), Arc::clone(session), cell)
    }

    /// Open a transaction of the repository's own session, security off
    pub fn internal_transaction(self: &Arc<Self>) -> CairnResult<Transaction> {
        let internal = Arc::clone(&self.internal);
        self.new_transaction(&internal)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Authenticate `login` and open a session
    ///
    /// Sources are tried system first; the first one accepting the
    /// credentials identifies the user. Groups are collected from every
    /// source.
    ///
    /// # Errors
    ///
    /// - `Authentication` when no source accepts the credentials
    /// - any error of a `session_open` hook, after which the session is closed
    pub fn connect(self: &Arc<Self>, login: &str, credentials: &Credentials) -> CairnResult<Arc<Session>> {
        self.ensure_running()?;
        let mut txn = self.internal_transaction()?;
        let mut user = None;
        for def in self.sources.defs() {
            let source = self.sources.get(&def.uri)?;
            match txn.with_source(&source, |conn| source.authenticate(conn, login, credentials)) {
                Ok(eid) => {
                    user = Some(eid);
                    break;
                }
                Err(CairnError::Authentication { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        let eid = match user {
            Some(eid) => eid,
            None => {
                warn!(target: "cairn::session", login, "Authentication failed");
                return Err(CairnError::Authentication {
                    login: login.to_string(),
                });
            }
        };

        let mut groups = BTreeSet::new();
        for def in self.sources.defs() {
            let source = self.sources.get(&def.uri)?;
            groups.extend(txn.with_source(&source, |conn| source.user_groups(conn, eid))?);
        }
        txn.close()?;

        let session = Arc::new(Session::new(
            UserIdentity {
                eid,
                login: login.to_string(),
                groups,
            },
            Arc::downgrade(self),
        ));
        self.sessions.insert(session.id(), Arc::clone(&session));

        let opened = self.internal_transaction().and_then(|mut txn| {
            let ctx = HookContext {
                eid: Some(eid),
                ..HookContext::bare(HookEvent::SessionOpen)
            };
            txn.fire(ctx)?;
            txn.commit()?;
            txn.close()
        });
        if let Err(e) = opened {
            warn!(target: "cairn::session", login, error = %e, "session_open hook failed");
            self.close_session(session.id());
            return Err(e);
        }

        info!(target: "cairn::session", session_id = %session.id(), login, eid = %eid, "Session opened");
        Ok(session)
    }

    /// Open session `id`
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshots of every open session
    pub fn session_infos(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.value().info()).collect()
    }

    /// Close session `id`; `false` if it was not open
    pub fn close_session(&self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close sessions idle for longer than the configured timeout
    ///
    /// Sessions with a transaction holding a slot are in use and kept.
    /// Returns how many sessions were closed.
    pub fn clean_sessions(&self) -> usize {
        let timeout = self.config.session_idle_timeout();
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() > timeout && s.tracker().is_empty())
            .map(|s| *s.key())
            .collect();
        let closed = idle.into_iter().filter(|id| self.close_session(*id)).count();
        if closed > 0 {
            info!(target: "cairn::session", closed, remaining = self.sessions.len(), "Idle sessions cleaned");
        }
        closed
    }

    // ========================================================================
    // Sources and caches
    // ========================================================================

    /// Register a federated source
    pub fn add_source(&self, def: SourceDef, source: Arc<dyn Source>) -> CairnResult<()> {
        if &def.uri != source.uri() {
            return Err(CairnError::Config(format!(
                "source {} registered under {}",
                source.uri(),
                def.uri
            )));
        }
        self.sources.add(def, source)
    }

    /// Unregister a federated source and drop its cached identities
    ///
    /// Idle slots close their connection to the source right away; slots
    /// held by a transaction open a new one if the uri is registered again.
    pub fn remove_source(&self, uri: &SourceUri) -> CairnResult<SourceDef> {
        let def = self.sources.remove(uri)?;
        self.identity.forget_source(uri);
        let mut closed = 0;
        self.pool.for_each_idle(|slot| {
            if slot.connection_mut().close_connection(uri) {
                closed += 1;
            }
        });
        debug!(target: "cairn::repo", uri = %uri, closed, "Connections to removed source closed");
        Ok(def)
    }

    /// Definitions of every registered source
    pub fn source_defs(&self) -> Vec<SourceDef> {
        self.sources.defs()
    }

    /// Drop every cached identity
    pub fn clear_caches(&self) {
        self.identity.clear();
        info!(target: "cairn::repo", "Caches cleared");
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Drain and close everything
    ///
    /// Transactions still holding a slot after the drain timeout have their
    /// slot reset and returned to the pool; failures are logged and counted.
    /// Calling `shutdown` twice returns an empty report.
    pub fn shutdown(self: &Arc<Self>) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return report;
        }
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }

        let mut txn = self.open_transaction(&self.internal);
        let hooks_run = txn
            .fire(HookContext::bare(HookEvent::ServerShutdown))
            .and_then(|()| txn.commit())
            .and_then(|()| txn.close());
        if let Err(e) = hooks_run {
            error!(target: "cairn::repo", error = %e, "server_shutdown hook failed");
        }

        let mut sessions: Vec<Arc<Session>> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        sessions.push(Arc::clone(&self.internal));
        for session in &sessions {
            session.tracker().close();
        }

        let deadline = Instant::now() + self.config.drain_timeout();
        for session in &sessions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            for txn in session.tracker().wait(remaining) {
                if self.reclaim(session, txn) {
                    report.reclaimed += 1;
                } else {
                    report.reclaim_failures += 1;
                }
            }
        }

        report.sessions_closed = self.sessions.len();
        for session in &sessions {
            session.close();
        }
        self.sessions.clear();

        for mut slot in self.pool.close() {
            if let Err(e) = slot.reset() {
                warn!(target: "cairn::repo", slot = %slot.id(), error = %e, "Slot reset failed");
            }
        }
        info!(
            target: "cairn::repo",
            sessions = report.sessions_closed,
            reclaimed = report.reclaimed,
            failures = report.reclaim_failures,
            "Repository shut down"
        );
        report
    }

    fn reclaim(&self, session: &Session, txn: TxnId) -> bool {
        let cell = match session.cell(txn) {
            Some(cell) => cell,
            None => return true,
        };
        let taken = match cell.try_lock_for(self.config.reclaim_lock_timeout()) {
            Some(mut guard) => guard.take(),
            None => {
                error!(target: "cairn::repo", txn_id = %txn, session_id = %session.id(), "Slot still in use, cannot reclaim");
                return false;
            }
        };
        let Some(mut slot) = taken else {
            return true;
        };
        if let Err(e) = session.tracker().forget(txn, slot.id()) {
            warn!(target: "cairn::repo", txn_id = %txn, error = %e, "Tracker out of sync");
        }
        let reset = slot.reset();
        let slot_id = slot.id();
        self.pool.release(slot);
        match reset {
            Ok(()) => {
                warn!(target: "cairn::repo", txn_id = %txn, slot = %slot_id, "Slot reclaimed");
                true
            }
            Err(e) => {
                error!(target: "cairn::repo", txn_id = %txn, slot = %slot_id, error = %e, "Slot reset failed");
                false
            }
        }
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        for session in self.sessions.iter() {
            session.close();
        }
        self.internal.close();
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
