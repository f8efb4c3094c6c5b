//! Core trait definitions
//!
//! These are the narrow interfaces through which the core consumes its
//! external collaborators:
//! - `Source`: a storage backend holding entities for some entity types
//! - `SourceConnection`: one physical connection to a source
//! - `QueryParser`: the query-language front end

use crate::error::{CairnError, CairnResult};
use crate::schema::Schema;
use crate::syntax::{Params, Select};
use crate::types::{Eid, EntityInfo, ExtId, SourceUri};
use crate::value::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

/// One result row
pub type Row = Vec<Value>;

/// Attribute values of an entity
pub type Attributes = BTreeMap<String, Value>;

/// Credentials presented at login
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Plain password, checked by the source
    Password(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// One physical connection to a source
///
/// A connection accumulates the work of the transaction that currently holds
/// it; `commit` and `rollback` end that unit of work.
pub trait SourceConnection: Send {
    /// Make the accumulated work durable
    fn commit(&mut self) -> CairnResult<()>;

    /// Discard the accumulated work
    fn rollback(&mut self) -> CairnResult<()>;

    /// Hard reset, used when reclaiming a connection from its owner
    fn reset(&mut self) -> CairnResult<()> {
        self.rollback()
    }

    /// Downcasting hook for source implementations
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Storage backend interface
///
/// Every source handles data operations for the entity types it holds. The
/// system source additionally indexes every entity of every source: it
/// allocates eids and maps eids to `(type, extid, source)`. Those methods
/// default to an error for other sources.
pub trait Source: Send + Sync {
    /// Uri under which this source is registered
    fn uri(&self) -> &SourceUri;

    /// Open a new physical connection
    fn open_connection(&self) -> CairnResult<Box<dyn SourceConnection>>;

    /// Check credentials; `Err(Authentication)` when rejected
    fn authenticate(
        &self,
        conn: &mut dyn SourceConnection,
        login: &str,
        credentials: &Credentials,
    ) -> CairnResult<Eid>;

    /// Groups the user belongs to
    fn user_groups(&self, _conn: &mut dyn SourceConnection, _user: Eid) -> CairnResult<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }

    /// Evaluate a (possibly rewritten) query
    fn execute(
        &self,
        conn: &mut dyn SourceConnection,
        schema: &dyn Schema,
        select: &Select,
        params: &Params,
    ) -> CairnResult<Vec<Row>>;

    /// Store a new entity
    fn add_entity(
        &self,
        conn: &mut dyn SourceConnection,
        eid: Eid,
        etype: &str,
        attrs: &Attributes,
    ) -> CairnResult<()>;

    /// Modify attributes of an entity
    fn update_entity(&self, conn: &mut dyn SourceConnection, eid: Eid, attrs: &Attributes) -> CairnResult<()>;

    /// Remove entities and their relations
    fn delete_entities(&self, conn: &mut dyn SourceConnection, eids: &[Eid]) -> CairnResult<()>;

    /// Add relations of one type
    fn add_relations(&self, conn: &mut dyn SourceConnection, rtype: &str, pairs: &[(Eid, Eid)]) -> CairnResult<()>;

    /// Remove a single relation
    fn delete_relation(
        &self,
        conn: &mut dyn SourceConnection,
        subject: Eid,
        rtype: &str,
        object: Eid,
    ) -> CairnResult<()>;

    /// Allocate a fresh eid
    fn create_eid(&self, _conn: &mut dyn SourceConnection) -> CairnResult<Eid> {
        Err(not_indexing(self.uri()))
    }

    /// Where an entity lives, `None` if the id is unknown
    fn eid_type_source(&self, _conn: &mut dyn SourceConnection, _eid: Eid) -> CairnResult<Option<EntityInfo>> {
        Err(not_indexing(self.uri()))
    }

    /// Eid mapped to an external id of `source`
    fn extid2eid(
        &self,
        _conn: &mut dyn SourceConnection,
        _source: &SourceUri,
        _extid: &ExtId,
    ) -> CairnResult<Option<Eid>> {
        Err(not_indexing(self.uri()))
    }

    /// Record the bookkeeping entry of a new entity
    fn add_info(&self, _conn: &mut dyn SourceConnection, _eid: Eid, _info: &EntityInfo) -> CairnResult<()> {
        Err(not_indexing(self.uri()))
    }

    /// Drop the bookkeeping entry of a deleted entity
    fn delete_info(&self, _conn: &mut dyn SourceConnection, _eid: Eid) -> CairnResult<()> {
        Err(not_indexing(self.uri()))
    }
}

fn not_indexing(uri: &SourceUri) -> CairnError {
    CairnError::invalid_operation(format!("source {} does not index entities", uri))
}

/// Query-language front end
pub trait QueryParser: Send + Sync {
    /// Parse query text into a syntax tree
    fn parse(&self, text: &str) -> CairnResult<Select>;
}

impl<F> QueryParser for F
where
    F: Fn(&str) -> CairnResult<Select> + Send + Sync,
{
    fn parse(&self, text: &str) -> CairnResult<Select> {
        self(text)
    }
}
