//! In-memory source
//!
//! Holds entities, relations, the entity index and a login table in a shared
//! store. Each connection works on a private copy made at its first write and
//! keeps a log of the changes it made; commit replays the log onto the shared
//! store, rollback drops both. Writes from concurrent connections therefore
//! only overlap on the entities and relations they both touched, where the
//! last commit wins. Queries are evaluated by a nested-loop walk over the
//! restriction tree.

use cairn_core::{
    Attributes, CairnError, CairnResult, Credentials, Eid, EntityInfo, ExtId, Node, Params,
    Relation, Row, Schema, Select, Source, SourceConnection, SourceUri, Term, Value, EID_RTYPE,
};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct StoredEntity {
    etype: String,
    attrs: Attributes,
}

/// One staged write, replayed onto the shared store at commit
#[derive(Debug, Clone)]
enum Change {
    AddEntity(Eid, StoredEntity),
    UpdateEntity(Eid, Attributes),
    DeleteEntities(Vec<Eid>),
    AddRelation(Eid, String, Eid),
    DeleteRelation(Eid, String, Eid),
    AddInfo(Eid, EntityInfo),
    DeleteInfo(Eid),
}

impl Change {
    fn apply(&self, store: &mut Store) {
        match self {
            Change::AddEntity(eid, entity) => {
                store.entities.insert(*eid, entity.clone());
            }
            Change::UpdateEntity(eid, attrs) => {
                // Deleted by a concurrent commit: nothing left to update
                if let Some(entity) = store.entities.get_mut(eid) {
                    for (name, value) in attrs {
                        entity.attrs.insert(name.clone(), value.clone());
                    }
                }
            }
            Change::DeleteEntities(eids) => {
                for eid in eids {
                    store.entities.remove(eid);
                }
                store
                    .relations
                    .retain(|(s, _, o)| !eids.contains(s) && !eids.contains(o));
            }
            Change::AddRelation(subject, rtype, object) => {
                store.relations.insert((*subject, rtype.clone(), *object));
            }
            Change::DeleteRelation(subject, rtype, object) => {
                store.relations.remove(&(*subject, rtype.clone(), *object));
            }
            Change::AddInfo(eid, info) => {
                if let Some(extid) = &info.extid {
                    store.extids.insert((info.source.clone(), extid.clone()), *eid);
                }
                store.infos.insert(*eid, info.clone());
            }
            Change::DeleteInfo(eid) => {
                if let Some(EntityInfo {
                    source,
                    extid: Some(extid),
                    ..
                }) = store.infos.remove(eid)
                {
                    let key = (source, extid);
                    if store.extids.get(&key) == Some(eid) {
                        store.extids.remove(&key);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct UserRecord {
    eid: Eid,
    password: String,
    groups: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
struct Store {
    entities: BTreeMap<Eid, StoredEntity>,
    relations: BTreeSet<(Eid, String, Eid)>,
    infos: BTreeMap<Eid, EntityInfo>,
    extids: BTreeMap<(SourceUri, ExtId), Eid>,
    users: BTreeMap<String, UserRecord>,
}

/// Source keeping everything in memory
pub struct MemorySource {
    uri: SourceUri,
    shared: Arc<RwLock<Store>>,
    next_eid: AtomicI64,
    fail_next_commit: Arc<AtomicBool>,
}

/// Connection to a `MemorySource`
pub struct MemoryConnection {
    uri: SourceUri,
    shared: Arc<RwLock<Store>>,
    work: Option<Store>,
    log: Vec<Change>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemorySource {
    /// Source registered under `uri`
    pub fn new(uri: &str) -> Self {
        Self {
            uri: SourceUri::new(uri),
            shared: Arc::new(RwLock::new(Store::default())),
            next_eid: AtomicI64::new(1),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The system source
    pub fn system() -> Self {
        Self::new(cairn_core::SYSTEM_SOURCE)
    }

    /// Create a user with a password and groups, outside any transaction
    ///
    /// The user is stored as a `User` entity with a `login` attribute.
    pub fn add_user<S: AsRef<str>>(&self, login: &str, password: &str, groups: &[S]) -> Eid {
        let eid = Eid(self.next_eid.fetch_add(1, Ordering::SeqCst));
        let mut store = self.shared.write();
        let mut attrs = Attributes::new();
        attrs.insert("login".to_string(), Value::from(login));
        store.entities.insert(
            eid,
            StoredEntity {
                etype: "User".to_string(),
                attrs,
            },
        );
        store.infos.insert(
            eid,
            EntityInfo {
                etype: "User".to_string(),
                extid: None,
                source: self.uri.clone(),
            },
        );
        store.users.insert(
            login.to_string(),
            UserRecord {
                eid,
                password: password.to_string(),
                groups: groups.iter().map(|g| g.as_ref().to_string()).collect(),
            },
        );
        eid
    }

    /// Record that `(source, extid)` was moved away from entity `eid`
    pub fn mark_moved(&self, source: &SourceUri, extid: &ExtId, eid: Eid) {
        self.shared
            .write()
            .extids
            .insert((source.clone(), extid.clone()), eid.moved());
    }

    /// Make the next commit on any connection of this source fail
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of committed entities
    pub fn entity_count(&self) -> usize {
        self.shared.read().entities.len()
    }

    /// Committed attribute value
    pub fn committed_attribute(&self, eid: Eid, attr: &str) -> Option<Value> {
        self.shared
            .read()
            .entities
            .get(&eid)
            .and_then(|e| e.attrs.get(attr).cloned())
    }

    fn conn<'c>(&self, conn: &'c mut dyn SourceConnection) -> CairnResult<&'c mut MemoryConnection> {
        conn.as_any_mut()
            .downcast_mut::<MemoryConnection>()
            .ok_or_else(|| CairnError::programming(format!("foreign connection passed to source {}", self.uri)))
    }
}

impl MemoryConnection {
    fn read<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        match &self.work {
            Some(work) => f(work),
            None => f(&*self.shared.read()),
        }
    }

    fn stage(&mut self, change: Change) {
        let shared = &self.shared;
        let work = self.work.get_or_insert_with(|| shared.read().clone());
        change.apply(work);
        self.log.push(change);
    }

    fn discard(&mut self) {
        self.work = None;
        self.log.clear();
    }
}

impl SourceConnection for MemoryConnection {
    fn commit(&mut self) -> CairnResult<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.discard();
            return Err(CairnError::source(&self.uri, "commit refused"));
        }
        let log = std::mem::take(&mut self.log);
        self.work = None;
        if !log.is_empty() {
            let mut shared = self.shared.write();
            for change in &log {
                change.apply(&mut shared);
            }
            debug!(target: "cairn::txn", uri = %self.uri, changes = log.len(), "Memory store committed");
        }
        Ok(())
    }

    fn rollback(&mut self) -> CairnResult<()> {
        self.discard();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Source for MemorySource {
    fn uri(&self) -> &SourceUri {
        &self.uri
    }

    fn open_connection(&self) -> CairnResult<Box<dyn SourceConnection>> {
        Ok(Box::new(MemoryConnection {
            uri: self.uri.clone(),
            shared: Arc::clone(&self.shared),
            work: None,
            log: Vec::new(),
            fail_next_commit: Arc::clone(&self.fail_next_commit),
        }))
    }

    fn authenticate(
        &self,
        conn: &mut dyn SourceConnection,
        login: &str,
        credentials: &Credentials,
    ) -> CairnResult<Eid> {
        let conn = self.conn(conn)?;
        let Credentials::Password(password) = credentials;
        conn.read(|store| match store.users.get(login) {
            Some(user) if &user.password == password => Ok(user.eid),
            _ => Err(CairnError::Authentication {
                login: login.to_string(),
            }),
        })
    }

    fn user_groups(&self, conn: &mut dyn SourceConnection, user: Eid) -> CairnResult<BTreeSet<String>> {
        let conn = self.conn(conn)?;
        Ok(conn.read(|store| {
            store
                .users
                .values()
                .find(|u| u.eid == user)
                .map(|u| u.groups.clone())
                .unwrap_or_default()
        }))
    }

    fn execute(
        &self,
        conn: &mut dyn SourceConnection,
        schema: &dyn Schema,
        select: &Select,
        params: &Params,
    ) -> CairnResult<Vec<Row>> {
        let conn = self.conn(conn)?;
        trace!(target: "cairn::txn", uri = %self.uri, query = %select, "Evaluating query");
        conn.read(|store| Evaluator { store, schema, params }.rows(select))
    }

    fn add_entity(
        &self,
        conn: &mut dyn SourceConnection,
        eid: Eid,
        etype: &str,
        attrs: &Attributes,
    ) -> CairnResult<()> {
        let conn = self.conn(conn)?;
        if conn.read(|store| store.entities.contains_key(&eid)) {
            return Err(CairnError::source(&self.uri, format!("entity {} already exists", eid)));
        }
        conn.stage(Change::AddEntity(
            eid,
            StoredEntity {
                etype: etype.to_string(),
                attrs: attrs.clone(),
            },
        ));
        Ok(())
    }

    fn update_entity(&self, conn: &mut dyn SourceConnection, eid: Eid, attrs: &Attributes) -> CairnResult<()> {
        let conn = self.conn(conn)?;
        if !conn.read(|store| store.entities.contains_key(&eid)) {
            return Err(CairnError::UnknownId(eid));
        }
        conn.stage(Change::UpdateEntity(eid, attrs.clone()));
        Ok(())
    }

    fn delete_entities(&self, conn: &mut dyn SourceConnection, eids: &[Eid]) -> CairnResult<()> {
        self.conn(conn)?.stage(Change::DeleteEntities(eids.to_vec()));
        Ok(())
    }

    fn add_relations(&self, conn: &mut dyn SourceConnection, rtype: &str, pairs: &[(Eid, Eid)]) -> CairnResult<()> {
        let conn = self.conn(conn)?;
        for (subject, object) in pairs {
            conn.stage(Change::AddRelation(*subject, rtype.to_string(), *object));
        }
        Ok(())
    }

    fn delete_relation(
        &self,
        conn: &mut dyn SourceConnection,
        subject: Eid,
        rtype: &str,
        object: Eid,
    ) -> CairnResult<()> {
        self.conn(conn)?
            .stage(Change::DeleteRelation(subject, rtype.to_string(), object));
        Ok(())
    }

    fn create_eid(&self, _conn: &mut dyn SourceConnection) -> CairnResult<Eid> {
        Ok(Eid(self.next_eid.fetch_add(1, Ordering::SeqCst)))
    }

    fn eid_type_source(&self, conn: &mut dyn SourceConnection, eid: Eid) -> CairnResult<Option<EntityInfo>> {
        let conn = self.conn(conn)?;
        Ok(conn.read(|store| store.infos.get(&eid).cloned()))
    }

    fn extid2eid(
        &self,
        conn: &mut dyn SourceConnection,
        source: &SourceUri,
        extid: &ExtId,
    ) -> CairnResult<Option<Eid>> {
        let conn = self.conn(conn)?;
        Ok(conn.read(|store| store.extids.get(&(source.clone(), extid.clone())).copied()))
    }

    fn add_info(&self, conn: &mut dyn SourceConnection, eid: Eid, info: &EntityInfo) -> CairnResult<()> {
        let uri = self.uri.clone();
        let conn = self.conn(conn)?;
        if let Some(extid) = &info.extid {
            let key = (info.source.clone(), extid.clone());
            if conn.read(|store| store.extids.contains_key(&key)) {
                return Err(CairnError::source(
                    &uri,
                    format!("external id {} of {} is already indexed", extid, info.source),
                ));
            }
        }
        conn.stage(Change::AddInfo(eid, info.clone()));
        Ok(())
    }

    fn delete_info(&self, conn: &mut dyn SourceConnection, eid: Eid) -> CairnResult<()> {
        self.conn(conn)?.stage(Change::DeleteInfo(eid));
        Ok(())
    }
}

// ============================================================================
// Query evaluation
// ============================================================================

type Binding = BTreeMap<String, Value>;

struct Evaluator<'s> {
    store: &'s Store,
    schema: &'s dyn Schema,
    params: &'s Params,
}

impl Evaluator<'_> {
    fn rows(&self, select: &Select) -> CairnResult<Vec<Row>> {
        let mut bindings = match &select.restriction {
            Some(node) => self.solve(node, vec![Binding::new()])?,
            None => vec![Binding::new()],
        };
        for var in &select.selection {
            bindings = bindings
                .into_iter()
                .flat_map(|b| self.bind_any(var, b))
                .collect();
        }

        let mut rows: Vec<Row> = Vec::new();
        for binding in bindings {
            let row: Row = select
                .selection
                .iter()
                .map(|v| binding.get(v).cloned().unwrap_or(Value::Null))
                .collect();
            if !rows.contains(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Bind an unbound variable to every entity
    fn bind_any(&self, var: &str, binding: Binding) -> Vec<Binding> {
        if binding.contains_key(var) {
            return vec![binding];
        }
        self.store
            .entities
            .keys()
            .map(|eid| {
                let mut b = binding.clone();
                b.insert(var.to_string(), Value::Eid(*eid));
                b
            })
            .collect()
    }

    fn solve(&self, node: &Node, bindings: Vec<Binding>) -> CairnResult<Vec<Binding>> {
        match node {
            Node::And(nodes) => {
                let mut ordered: Vec<&Node> = nodes.iter().collect();
                ordered.sort_by_key(|n| match n {
                    Node::Relation(_) | Node::IsType { .. } => 0,
                    Node::Or(_) => 1,
                    Node::Exists(_) => 2,
                    Node::Not(_) => 3,
                    Node::And(_) => 0,
                });
                let mut current = bindings;
                for n in ordered {
                    if current.is_empty() {
                        break;
                    }
                    current = self.solve(n, current)?;
                }
                Ok(current)
            }
            Node::Or(branches) => {
                let mut out = Vec::new();
                for b in bindings {
                    for branch in branches {
                        for found in self.solve(branch, vec![b.clone()])? {
                            if !out.contains(&found) {
                                out.push(found);
                            }
                        }
                    }
                }
                Ok(out)
            }
            Node::Exists(inner) => {
                let mut out = Vec::new();
                for b in bindings {
                    if !self.solve(inner, vec![b.clone()])?.is_empty() {
                        out.push(b);
                    }
                }
                Ok(out)
            }
            Node::Not(inner) => {
                let mut out = Vec::new();
                for b in bindings {
                    if self.solve(inner, vec![b.clone()])?.is_empty() {
                        out.push(b);
                    }
                }
                Ok(out)
            }
            Node::IsType { var, etypes } => Ok(bindings
                .into_iter()
                .flat_map(|b| self.is_type(var, etypes, b))
                .collect()),
            Node::Relation(rel) => {
                let mut out = Vec::new();
                for b in bindings {
                    out.extend(self.relation(rel, b)?);
                }
                Ok(out)
            }
        }
    }

    fn is_type(&self, var: &str, etypes: &[String], binding: Binding) -> Vec<Binding> {
        let matches = |eid: &Eid| {
            self.store
                .entities
                .get(eid)
                .map_or(false, |e| etypes.iter().any(|t| *t == e.etype))
        };
        match binding.get(var) {
            Some(value) => match value.as_eid() {
                Some(eid) if matches(&eid) => vec![binding],
                _ => vec![],
            },
            None => self
                .store
                .entities
                .keys()
                .filter(|eid| matches(eid))
                .map(|eid| {
                    let mut b = binding.clone();
                    b.insert(var.to_string(), Value::Eid(*eid));
                    b
                })
                .collect(),
        }
    }

    fn object_value(&self, term: &Term, binding: &Binding) -> CairnResult<Option<Value>> {
        match term {
            Term::Var(v) => Ok(binding.get(v).cloned()),
            Term::Const(v) => Ok(Some(v.clone())),
            Term::Param(name) => self
                .params
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| CairnError::Query(format!("missing parameter {}", name))),
        }
    }

    fn is_attribute(&self, etype: &str, rtype: &str) -> bool {
        self.schema.attributes(etype).iter().any(|a| a.name == rtype)
    }

    fn relation(&self, rel: &Relation, binding: Binding) -> CairnResult<Vec<Binding>> {
        let object = self.object_value(&rel.object, &binding)?;

        if rel.rtype == EID_RTYPE {
            let eid = match object.as_ref().and_then(Value::as_eid) {
                Some(eid) if self.store.entities.contains_key(&eid) => eid,
                _ => return Ok(vec![]),
            };
            return Ok(match binding.get(&rel.subject) {
                Some(v) if v.as_eid() == Some(eid) => vec![binding],
                Some(_) => vec![],
                None => {
                    let mut b = binding;
                    b.insert(rel.subject.clone(), Value::Eid(eid));
                    vec![b]
                }
            });
        }

        let subjects: Vec<Eid> = match binding.get(&rel.subject) {
            Some(v) => v.as_eid().into_iter().collect(),
            None => self.store.entities.keys().copied().collect(),
        };

        let mut out = Vec::new();
        for subject in subjects {
            let entity = match self.store.entities.get(&subject) {
                Some(e) => e,
                None => continue,
            };
            let mut base = binding.clone();
            base.insert(rel.subject.clone(), Value::Eid(subject));

            let candidates: Vec<Value> = if self.is_attribute(&entity.etype, &rel.rtype) {
                entity
                    .attrs
                    .get(&rel.rtype)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .into_iter()
                    .collect()
            } else {
                self.store
                    .relations
                    .range((subject, rel.rtype.clone(), Eid(i64::MIN))..=(subject, rel.rtype.clone(), Eid(i64::MAX)))
                    .map(|(_, _, o)| Value::Eid(*o))
                    .collect()
            };

            for candidate in candidates {
                match &object {
                    Some(expected) => {
                        let same = match (expected.as_eid(), candidate.as_eid()) {
                            (Some(a), Some(b)) if matches!(candidate, Value::Eid(_)) => a == b,
                            _ => *expected == candidate,
                        };
                        if same {
                            out.push(base.clone());
                        }
                    }
                    None => {
                        let mut b = base.clone();
                        if let Term::Var(v) = &rel.object {
                            b.insert(v.clone(), candidate);
                        }
                        out.push(b);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::MemorySchema;

    fn schema() -> MemorySchema {
        MemorySchema::builder()
            .attribute("Doc", "title", "String", true)
            .relation("in_folder", "Doc", "Folder", "?*")
            .build()
    }

    fn seeded() -> (MemorySource, Box<dyn SourceConnection>) {
        let source = MemorySource::system();
        let mut conn = source.open_connection().unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("title".to_string(), Value::from("a"));
        source.add_entity(conn.as_mut(), Eid(10), "Doc", &attrs).unwrap();
        attrs.insert("title".to_string(), Value::from("b"));
        source.add_entity(conn.as_mut(), Eid(11), "Doc", &attrs).unwrap();
        source
            .add_entity(conn.as_mut(), Eid(20), "Folder", &Attributes::new())
            .unwrap();
        source
            .add_relations(conn.as_mut(), "in_folder", &[(Eid(10), Eid(20))])
            .unwrap();
        conn.commit().unwrap();
        (source, conn)
    }

    fn run(source: &MemorySource, conn: &mut dyn SourceConnection, select: &Select) -> Vec<Row> {
        source.execute(conn, &schema(), select, &Params::new()).unwrap()
    }

    #[test]
    fn test_uncommitted_work_is_private() {
        let source = MemorySource::system();
        let mut a = source.open_connection().unwrap();
        let mut b = source.open_connection().unwrap();
        source
            .add_entity(a.as_mut(), Eid(1), "Doc", &Attributes::new())
            .unwrap();

        let q = Select::any(&["X"], Node::is("X", "Doc"));
        assert_eq!(run(&source, a.as_mut(), &q).len(), 1);
        assert!(run(&source, b.as_mut(), &q).is_empty());

        a.commit().unwrap();
        assert_eq!(run(&source, b.as_mut(), &q).len(), 1);
    }

    #[test]
    fn test_interleaved_commits_keep_both_writes() {
        let (source, _) = seeded();
        let mut a = source.open_connection().unwrap();
        let mut b = source.open_connection().unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("title".to_string(), Value::from("from a"));
        source.add_entity(a.as_mut(), Eid(30), "Doc", &attrs).unwrap();
        attrs.insert("title".to_string(), Value::from("renamed"));
        source.update_entity(b.as_mut(), Eid(11), &attrs).unwrap();
        source
            .add_relations(b.as_mut(), "in_folder", &[(Eid(11), Eid(20))])
            .unwrap();

        a.commit().unwrap();
        b.commit().unwrap();

        assert_eq!(source.entity_count(), 4);
        assert_eq!(source.committed_attribute(Eid(30), "title"), Some(Value::from("from a")));
        assert_eq!(source.committed_attribute(Eid(11), "title"), Some(Value::from("renamed")));
        let q = Select::any(&["X"], Node::rel("X", "in_folder", "F"));
        assert_eq!(run(&source, a.as_mut(), &q).len(), 2);
    }

    #[test]
    fn test_update_of_concurrently_deleted_entity_is_dropped() {
        let (source, _) = seeded();
        let mut a = source.open_connection().unwrap();
        let mut b = source.open_connection().unwrap();
        source.delete_entities(a.as_mut(), &[Eid(10)]).unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("title".to_string(), Value::from("late"));
        source.update_entity(b.as_mut(), Eid(10), &attrs).unwrap();

        a.commit().unwrap();
        b.commit().unwrap();
        assert_eq!(source.committed_attribute(Eid(10), "title"), None);
        assert_eq!(source.entity_count(), 2);
    }

    #[test]
    fn test_rollback_discards_work() {
        let (source, mut conn) = seeded();
        source.delete_entities(conn.as_mut(), &[Eid(10)]).unwrap();
        conn.rollback().unwrap();
        assert_eq!(source.entity_count(), 3);
    }

    #[test]
    fn test_attribute_and_relation_evaluation() {
        let (source, mut conn) = seeded();
        let q = Select::any(
            &["T"],
            Node::and(vec![Node::rel("X", "in_folder", "F"), Node::rel("X", "title", "T")]),
        );
        assert_eq!(run(&source, conn.as_mut(), &q), vec![vec![Value::from("a")]]);

        let q = Select::any(
            &["X"],
            Node::and(vec![
                Node::is("X", "Doc"),
                Node::not(Node::rel("X", "in_folder", "F")),
            ]),
        );
        assert_eq!(run(&source, conn.as_mut(), &q), vec![vec![Value::Eid(Eid(11))]]);
    }

    #[test]
    fn test_exists_and_or() {
        let (source, mut conn) = seeded();
        let q = Select::any(
            &["X"],
            Node::and(vec![
                Node::is("X", "Doc"),
                Node::or(vec![
                    Node::exists(Node::rel("X", "in_folder", "F")),
                    Node::relation("X", "title", Term::Const(Value::from("b"))),
                ]),
            ]),
        );
        assert_eq!(run(&source, conn.as_mut(), &q).len(), 2);
    }

    #[test]
    fn test_missing_parameter_is_query_error() {
        let (source, mut conn) = seeded();
        let q = Select::any(&["X"], Node::relation("X", "title", Term::Param("t".to_string())));
        let err = source
            .execute(conn.as_mut(), &schema(), &q, &Params::new())
            .unwrap_err();
        assert!(matches!(err, CairnError::Query(_)));
    }

    #[test]
    fn test_authentication_and_groups() {
        let source = MemorySource::system();
        let eid = source.add_user("alice", "secret", &["users"]);
        let mut conn = source.open_connection().unwrap();

        let ok = source.authenticate(conn.as_mut(), "alice", &Credentials::Password("secret".into()));
        assert_eq!(ok.unwrap(), eid);
        let bad = source.authenticate(conn.as_mut(), "alice", &Credentials::Password("nope".into()));
        assert!(matches!(bad, Err(CairnError::Authentication { .. })));
        assert!(source.user_groups(conn.as_mut(), eid).unwrap().contains("users"));
    }

    #[test]
    fn test_index_rejects_duplicate_extid() {
        let source = MemorySource::system();
        let mut conn = source.open_connection().unwrap();
        let info = EntityInfo {
            etype: "Person".to_string(),
            extid: Some(ExtId::new("cn=bob")),
            source: SourceUri::new("ldap"),
        };
        source.add_info(conn.as_mut(), Eid(5), &info).unwrap();
        assert!(source.add_info(conn.as_mut(), Eid(6), &info).is_err());
        assert_eq!(
            source
                .extid2eid(conn.as_mut(), &SourceUri::new("ldap"), &ExtId::new("cn=bob"))
                .unwrap(),
            Some(Eid(5))
        );

        source.delete_info(conn.as_mut(), Eid(5)).unwrap();
        assert!(source.eid_type_source(conn.as_mut(), Eid(5)).unwrap().is_none());
    }

    #[test]
    fn test_injected_commit_failure() {
        let source = MemorySource::system();
        let mut conn = source.open_connection().unwrap();
        source
            .add_entity(conn.as_mut(), Eid(1), "Doc", &Attributes::new())
            .unwrap();
        source.fail_next_commit();
        assert!(conn.commit().is_err());
        assert_eq!(source.entity_count(), 0);
        conn.commit().unwrap();
    }
}
