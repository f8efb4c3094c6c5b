//! Source registration and per-slot connections
//!
//! - `SourceRegistry`: sources by uri, with the system source always present
//! - `ConnectionSet`: what a pooled slot holds, one connection per source
//!   opened on first use

pub mod memory;

pub use memory::{MemoryConnection, MemorySource};

use cairn_concurrency::SlotConnection;
use cairn_core::{CairnError, CairnResult, Source, SourceConnection, SourceUri};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Kinds of sources a deployment can register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Holds the entity index and every type no other source claims
    System,
    /// Holds the entities of the types it declares
    Federated,
}

/// Public description of a registered source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDef {
    /// Uri the source is registered under
    pub uri: SourceUri,
    /// Kind of source
    pub kind: SourceKind,
    /// Entity types stored there (empty for the system source)
    pub entity_types: BTreeSet<String>,
}

impl SourceDef {
    /// Definition of the system source
    pub fn system() -> Self {
        Self {
            uri: SourceUri::system(),
            kind: SourceKind::System,
            entity_types: BTreeSet::new(),
        }
    }

    /// Definition of a federated source holding `entity_types`
    pub fn federated<S: AsRef<str>>(uri: &str, entity_types: &[S]) -> Self {
        Self {
            uri: SourceUri::new(uri),
            kind: SourceKind::Federated,
            entity_types: entity_types.iter().map(|t| t.as_ref().to_string()).collect(),
        }
    }
}

struct RegisteredSource {
    def: SourceDef,
    source: Arc<dyn Source>,
}

/// Sources by uri
pub struct SourceRegistry {
    sources: RwLock<BTreeMap<SourceUri, RegisteredSource>>,
}

impl SourceRegistry {
    /// Registry holding only the system source
    pub fn new(system: Arc<dyn Source>) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(
            SourceUri::system(),
            RegisteredSource {
                def: SourceDef::system(),
                source: system,
            },
        );
        Self {
            sources: RwLock::new(sources),
        }
    }

    /// Register a federated source
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the uri is taken, the definition is not
    /// federated, or one of its types is already claimed by another source.
    pub fn add(&self, def: SourceDef, source: Arc<dyn Source>) -> CairnResult<()> {
        if def.kind != SourceKind::Federated {
            return Err(CairnError::invalid_operation("only federated sources can be added"));
        }
        let mut sources = self.sources.write();
        if sources.contains_key(&def.uri) {
            return Err(CairnError::invalid_operation(format!(
                "source {} already registered",
                def.uri
            )));
        }
        if let Some(clash) = sources
            .values()
            .find(|r| !r.def.entity_types.is_disjoint(&def.entity_types))
        {
            return Err(CairnError::invalid_operation(format!(
                "source {} already holds some of the types of {}",
                clash.def.uri, def.uri
            )));
        }
        info!(target: "cairn::repo", uri = %def.uri, types = def.entity_types.len(), "Source added");
        sources.insert(def.uri.clone(), RegisteredSource { def, source });
        Ok(())
    }

    /// Unregister a federated source
    pub fn remove(&self, uri: &SourceUri) -> CairnResult<SourceDef> {
        if uri.is_system() {
            return Err(CairnError::invalid_operation("the system source cannot be removed"));
        }
        let removed = self
            .sources
            .write()
            .remove(uri)
            .ok_or_else(|| CairnError::UnknownSource(uri.clone()))?;
        info!(target: "cairn::repo", uri = %uri, "Source removed");
        Ok(removed.def)
    }

    /// Source registered under `uri`
    pub fn get(&self, uri: &SourceUri) -> CairnResult<Arc<dyn Source>> {
        self.sources
            .read()
            .get(uri)
            .map(|r| Arc::clone(&r.source))
            .ok_or_else(|| CairnError::UnknownSource(uri.clone()))
    }

    /// The system source
    pub fn system(&self) -> CairnResult<Arc<dyn Source>> {
        self.get(&SourceUri::system())
    }

    /// Uri of the source storing `etype`
    pub fn uri_for_type(&self, etype: &str) -> SourceUri {
        self.sources
            .read()
            .values()
            .find(|r| r.def.entity_types.contains(etype))
            .map(|r| r.def.uri.clone())
            .unwrap_or_else(SourceUri::system)
    }

    /// Definitions of every registered source, system first
    pub fn defs(&self) -> Vec<SourceDef> {
        let sources = self.sources.read();
        let mut defs: Vec<SourceDef> = sources.values().map(|r| r.def.clone()).collect();
        defs.sort_by_key(|d| (d.kind != SourceKind::System, d.uri.clone()));
        defs
    }

    /// Whether `uri` is registered
    pub fn contains(&self, uri: &SourceUri) -> bool {
        self.sources.read().contains_key(uri)
    }
}

struct OpenConnection {
    // Source instance the connection was opened on
    owner: Weak<dyn Source>,
    conn: Box<dyn SourceConnection>,
}

impl OpenConnection {
    fn open(source: &Arc<dyn Source>) -> CairnResult<Self> {
        Ok(Self {
            owner: Arc::downgrade(source),
            conn: source.open_connection()?,
        })
    }

    fn opened_on(&self, source: &Arc<dyn Source>) -> bool {
        self.owner
            .upgrade()
            .map_or(false, |owner| Arc::ptr_eq(&owner, source))
    }
}

/// The connections held by one slot
///
/// The system connection is opened with the slot; others on first use.
/// Connections belong to the source instance that opened them: a source
/// removed and registered again under the same uri gets a new connection.
pub struct ConnectionSet {
    conns: HashMap<SourceUri, OpenConnection>,
}

impl ConnectionSet {
    /// Open the system connection of a new slot
    pub fn open(registry: &SourceRegistry) -> CairnResult<Self> {
        let system = registry.system()?;
        let mut conns = HashMap::new();
        conns.insert(SourceUri::system(), OpenConnection::open(&system)?);
        Ok(Self { conns })
    }

    /// Connection to `source`, opened if needed
    pub fn connection(&mut self, source: &Arc<dyn Source>) -> CairnResult<&mut dyn SourceConnection> {
        let uri = source.uri();
        let current = self.conns.get(uri).map_or(false, |open| open.opened_on(source));
        if !current {
            let fresh = OpenConnection::open(source)?;
            if let Some(mut stale) = self.conns.insert(uri.clone(), fresh) {
                debug!(target: "cairn::repo", uri = %uri, "Replacing connection to a removed source");
                if let Err(e) = stale.conn.rollback() {
                    warn!(target: "cairn::repo", uri = %uri, error = %e, "Rollback of stale connection failed");
                }
            }
        }
        self.conns
            .get_mut(uri)
            .map(|open| -> &mut dyn SourceConnection { open.conn.as_mut() })
            .ok_or_else(|| CairnError::UnknownSource(uri.clone()))
    }

    /// Drop the connection to `uri`, rolling back whatever it staged
    pub fn close_connection(&mut self, uri: &SourceUri) -> bool {
        match self.conns.remove(uri) {
            Some(mut open) => {
                if let Err(e) = open.conn.rollback() {
                    warn!(target: "cairn::repo", uri = %uri, error = %e, "Rollback of closed connection failed");
                }
                true
            }
            None => false,
        }
    }

    /// Uris with an open connection
    pub fn open_uris(&self) -> Vec<SourceUri> {
        self.conns.keys().cloned().collect()
    }

    // Non-system sources first: the entity index is committed last
    fn ordered(&mut self) -> Vec<(&SourceUri, &mut Box<dyn SourceConnection>)> {
        let mut conns: Vec<_> = self.conns.iter_mut().map(|(uri, open)| (uri, &mut open.conn)).collect();
        conns.sort_by_key(|(uri, _)| (uri.is_system(), (*uri).clone()));
        conns
    }
}

impl SlotConnection for ConnectionSet {
    fn commit(&mut self) -> CairnResult<()> {
        let mut failure = None;
        for (uri, conn) in self.ordered() {
            if failure.is_some() {
                if let Err(e) = conn.rollback() {
                    warn!(target: "cairn::txn", uri = %uri, error = %e, "Rollback after failed commit failed");
                }
                continue;
            }
            if let Err(e) = conn.commit() {
                warn!(target: "cairn::txn", uri = %uri, error = %e, "Source commit failed");
                failure = Some(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn rollback(&mut self) -> CairnResult<()> {
        let mut first = None;
        for (uri, conn) in self.ordered() {
            if let Err(e) = conn.rollback() {
                warn!(target: "cairn::txn", uri = %uri, error = %e, "Source rollback failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn reset(&mut self) -> CairnResult<()> {
        let mut first = None;
        for (uri, conn) in self.ordered() {
            if let Err(e) = conn.reset() {
                warn!(target: "cairn::repo", uri = %uri, error = %e, "Source reset failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
