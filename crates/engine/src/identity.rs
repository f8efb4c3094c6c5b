//! Entity identity cache
//!
//! Maps `eid -> (type, extid, source)` and `(source, extid) -> eid`, backed by
//! the entity index of the system source. Reads are lock-free on `DashMap`;
//! allocation for a given `(source, extid)` is serialized on a striped mutex
//! so two threads never insert the same external entity twice.
//!
//! A negative eid in the reverse map marks an external id that moved to
//! another source and must be treated as already handled. Any other reverse
//! entry has a forward entry, so invalidating an eid only touches its own
//! two keys.

use cairn_core::{CairnError, CairnResult, Eid, EntityInfo, ExtId, Source, SourceConnection, SourceUri};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{debug, trace};

const STRIPES: usize = 16;

/// Authoritative entity index consulted on cache misses
pub trait EntityIndex {
    /// Where an entity lives, `None` if the id is unknown
    fn eid_type_source(&mut self, eid: Eid) -> CairnResult<Option<EntityInfo>>;

    /// Eid mapped to an external id
    fn extid2eid(&mut self, source: &SourceUri, extid: &ExtId) -> CairnResult<Option<Eid>>;

    /// Allocate a fresh eid
    fn create_eid(&mut self) -> CairnResult<Eid>;

    /// Record the bookkeeping entry of a new entity
    fn add_info(&mut self, eid: Eid, info: &EntityInfo) -> CairnResult<()>;
}

/// `EntityIndex` over the system source and one of its connections
pub struct SourceIndex<'a> {
    source: &'a dyn Source,
    conn: &'a mut dyn SourceConnection,
}

impl<'a> SourceIndex<'a> {
    /// Index backed by `source`
    pub fn new(source: &'a dyn Source, conn: &'a mut dyn SourceConnection) -> Self {
        Self { source, conn }
    }
}

impl EntityIndex for SourceIndex<'_> {
    fn eid_type_source(&mut self, eid: Eid) -> CairnResult<Option<EntityInfo>> {
        self.source.eid_type_source(self.conn, eid)
    }

    fn extid2eid(&mut self, source: &SourceUri, extid: &ExtId) -> CairnResult<Option<Eid>> {
        self.source.extid2eid(self.conn, source, extid)
    }

    fn create_eid(&mut self) -> CairnResult<Eid> {
        self.source.create_eid(self.conn)
    }

    fn add_info(&mut self, eid: Eid, info: &EntityInfo) -> CairnResult<()> {
        self.source.add_info(self.conn, eid, info)
    }
}

/// Outcome of `allocate_for_source`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// The external id was already mapped
    Existing(Eid),
    /// A fresh eid was allocated and indexed
    Created(Eid),
    /// The external id moved away from this eid
    Moved(Eid),
}

impl Allocation {
    /// The eid, whatever the outcome
    pub fn eid(&self) -> Eid {
        match self {
            Allocation::Existing(eid) | Allocation::Created(eid) | Allocation::Moved(eid) => *eid,
        }
    }

    /// Whether this call created the entity
    pub fn is_created(&self) -> bool {
        matches!(self, Allocation::Created(_))
    }
}

/// Cache of entity identities
pub struct IdentityRegistry {
    by_eid: DashMap<Eid, EntityInfo>,
    by_extid: DashMap<(SourceUri, ExtId), Eid>,
    stripes: Vec<Mutex<()>>,
}

impl IdentityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            by_eid: DashMap::new(),
            by_extid: DashMap::new(),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe<K: Hash>(&self, key: &K) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % STRIPES]
    }

    /// Cached entry, without consulting the index
    pub fn cached(&self, eid: Eid) -> Option<EntityInfo> {
        self.by_eid.get(&eid).map(|e| e.value().clone())
    }

    /// Where `eid` lives
    ///
    /// # Errors
    ///
    /// `UnknownId` if the index has no entry for it.
    pub fn resolve(&self, eid: Eid, index: &mut dyn EntityIndex) -> CairnResult<EntityInfo> {
        if let Some(info) = self.cached(eid) {
            return Ok(info);
        }
        let info = index
            .eid_type_source(eid)?
            .ok_or(CairnError::UnknownId(eid))?;
        trace!(target: "cairn::identity", eid = %eid, etype = %info.etype, "Identity cached");
        self.register(eid, info.clone());
        Ok(info)
    }

    /// Insert both directions of an entry
    pub fn register(&self, eid: Eid, info: EntityInfo) {
        if let Some(extid) = &info.extid {
            self.by_extid.insert((info.source.clone(), extid.clone()), eid);
        }
        self.by_eid.insert(eid, info);
    }

    /// Eid of `(source, extid)`, allocating one when `insert` is set
    ///
    /// Returns `None` when the external id is unknown and `insert` is false.
    /// If indexing the fresh eid fails, the entries cached by this call are
    /// dropped before the error is returned.
    pub fn allocate_for_source(
        &self,
        index: &mut dyn EntityIndex,
        source: &SourceUri,
        extid: &ExtId,
        etype: &str,
        insert: bool,
    ) -> CairnResult<Option<Allocation>> {
        let key = (source.clone(), extid.clone());
        if let Some(eid) = self.by_extid.get(&key).map(|e| *e.value()) {
            return Ok(Some(classify(eid)));
        }

        let _stripe = self.stripe(&key).lock();
        // Another thread may have finished while we waited
        if let Some(eid) = self.by_extid.get(&key).map(|e| *e.value()) {
            return Ok(Some(classify(eid)));
        }

        if let Some(eid) = index.extid2eid(source, extid)? {
            if eid.is_moved() {
                self.by_extid.insert(key, eid);
            } else if let Some(info) = index.eid_type_source(eid)? {
                self.register(eid, info);
            }
            return Ok(Some(classify(eid)));
        }
        if !insert {
            return Ok(None);
        }

        let eid = index.create_eid()?;
        let info = EntityInfo {
            etype: etype.to_string(),
            extid: Some(extid.clone()),
            source: source.clone(),
        };
        self.insert_speculative(index, eid, info)?;
        debug!(target: "cairn::identity", eid = %eid, source = %source, extid = %extid, "External entity indexed");
        Ok(Some(Allocation::Created(eid)))
    }

    /// Allocate and index a fresh eid for an entity created here
    pub fn allocate(&self, index: &mut dyn EntityIndex, etype: &str, source: &SourceUri) -> CairnResult<Eid> {
        let eid = index.create_eid()?;
        let info = EntityInfo {
            etype: etype.to_string(),
            extid: None,
            source: source.clone(),
        };
        self.insert_speculative(index, eid, info)?;
        debug!(target: "cairn::identity", eid = %eid, etype = %etype, source = %source, "Entity allocated");
        Ok(eid)
    }

    fn insert_speculative(&self, index: &mut dyn EntityIndex, eid: Eid, info: EntityInfo) -> CairnResult<()> {
        self.register(eid, info.clone());
        if let Err(e) = index.add_info(eid, &info) {
            self.invalidate(eid);
            debug!(target: "cairn::identity", eid = %eid, error = %e, "Allocation undone");
            return Err(e);
        }
        Ok(())
    }

    /// Drop both directions of an entry
    pub fn invalidate(&self, eid: Eid) {
        if let Some((_, info)) = self.by_eid.remove(&eid) {
            if let Some(extid) = info.extid {
                self.by_extid.remove_if(&(info.source, extid), |_, mapped| *mapped == eid);
            }
        }
        trace!(target: "cairn::identity", eid = %eid, "Identity invalidated");
    }

    /// Drop every entry of `source`
    pub fn forget_source(&self, source: &SourceUri) {
        self.by_eid.retain(|_, info| &info.source != source);
        self.by_extid.retain(|(uri, _), _| uri != source);
        debug!(target: "cairn::identity", source = %source, "Source identities dropped");
    }

    /// Drop everything
    pub fn clear(&self) {
        self.by_eid.clear();
        self.by_extid.clear();
        debug!(target: "cairn::identity", "Identity cache cleared");
    }

    /// Number of cached eids
    pub fn len(&self) -> usize {
        self.by_eid.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.by_eid.is_empty()
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(eid: Eid) -> Allocation {
    if eid.is_moved() {
        Allocation::Moved(eid.unmoved())
    } else {
        Allocation::Existing(eid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeIndex {
        infos: BTreeMap<Eid, EntityInfo>,
        extids: BTreeMap<(SourceUri, ExtId), Eid>,
        next: i64,
        fail_add: bool,
        lookups: usize,
    }

    impl EntityIndex for FakeIndex {
        fn eid_type_source(&mut self, eid: Eid) -> CairnResult<Option<EntityInfo>> {
            self.lookups += 1;
            Ok(self.infos.get(&eid).cloned())
        }

        fn extid2eid(&mut self, source: &SourceUri, extid: &ExtId) -> CairnResult<Option<Eid>> {
            Ok(self.extids.get(&(source.clone(), extid.clone())).copied())
        }

        fn create_eid(&mut self) -> CairnResult<Eid> {
            self.next += 1;
            Ok(Eid(self.next))
        }

        fn add_info(&mut self, eid: Eid, info: &EntityInfo) -> CairnResult<()> {
            if self.fail_add {
                return Err(CairnError::source(&info.source, "duplicate key"));
            }
            if let Some(extid) = &info.extid {
                self.extids.insert((info.source.clone(), extid.clone()), eid);
            }
            self.infos.insert(eid, info.clone());
            Ok(())
        }
    }

    fn ldap() -> SourceUri {
        SourceUri::new("ldap")
    }

    #[test]
    fn test_resolve_is_cache_first() {
        let reg = IdentityRegistry::new();
        let mut index = FakeIndex::default();
        index.infos.insert(Eid(3), EntityInfo::system("Doc"));

        assert_eq!(reg.resolve(Eid(3), &mut index).unwrap().etype, "Doc");
        assert_eq!(reg.resolve(Eid(3), &mut index).unwrap().etype, "Doc");
        assert_eq!(index.lookups, 1);
    }

    #[test]
    fn test_resolve_unknown_id() {
        let reg = IdentityRegistry::new();
        let err = reg.resolve(Eid(99), &mut FakeIndex::default()).unwrap_err();
        assert!(matches!(err, CairnError::UnknownId(Eid(99))));
    }

    #[test]
    fn test_allocate_for_source_creates_once() {
        let reg = IdentityRegistry::new();
        let mut index = FakeIndex::default();
        let extid = ExtId::new("cn=bob");

        let first = reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", true)
            .unwrap()
            .unwrap();
        assert!(first.is_created());
        let second = reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", true)
            .unwrap()
            .unwrap();
        assert_eq!(second, Allocation::Existing(first.eid()));
    }

    #[test]
    fn test_allocate_without_insert() {
        let reg = IdentityRegistry::new();
        let mut index = FakeIndex::default();
        let found = reg
            .allocate_for_source(&mut index, &ldap(), &ExtId::new("cn=x"), "Person", false)
            .unwrap();
        assert!(found.is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_moved_extid_is_reported() {
        let reg = IdentityRegistry::new();
        let mut index = FakeIndex::default();
        index.extids.insert((ldap(), ExtId::new("cn=gone")), Eid(8).moved());

        let found = reg
            .allocate_for_source(&mut index, &ldap(), &ExtId::new("cn=gone"), "Person", true)
            .unwrap();
        assert_eq!(found, Some(Allocation::Moved(Eid(8))));
        assert_eq!(index.next, 0);
    }

    #[test]
    fn test_failed_allocation_leaves_no_cache_entry() {
        let reg = IdentityRegistry::new();
        let mut index = FakeIndex {
            fail_add: true,
            ..Default::default()
        };
        let extid = ExtId::new("cn=bob");
        assert!(reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", true)
            .is_err());
        assert!(reg.is_empty());

        // A retry goes back to the index instead of trusting a poisoned entry
        index.fail_add = false;
        let retry = reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", true)
            .unwrap()
            .unwrap();
        assert!(retry.is_created());
        assert_eq!(reg.resolve(retry.eid(), &mut index).unwrap().source, ldap());
    }

    #[test]
    fn test_invalidate_drops_both_directions() {
        let reg = IdentityRegistry::new();
        let mut index = FakeIndex::default();
        let extid = ExtId::new("cn=bob");
        let eid = reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", true)
            .unwrap()
            .unwrap()
            .eid();

        reg.invalidate(eid);
        assert!(reg.cached(eid).is_none());

        // The reverse lookup now goes back to the index
        index.extids.clear();
        let again = reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", false)
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_indexed_extid_cached_in_both_directions() {
        let reg = IdentityRegistry::new();
        let mut index = FakeIndex::default();
        let extid = ExtId::new("cn=ann");
        let info = EntityInfo {
            etype: "Person".to_string(),
            extid: Some(extid.clone()),
            source: ldap(),
        };
        index.add_info(Eid(7), &info).unwrap();

        let found = reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", true)
            .unwrap();
        assert_eq!(found, Some(Allocation::Existing(Eid(7))));
        assert_eq!(reg.cached(Eid(7)), Some(info));

        reg.invalidate(Eid(7));
        assert!(reg.is_empty());
        index.extids.clear();
        assert!(reg
            .allocate_for_source(&mut index, &ldap(), &extid, "Person", false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalidate_keeps_reverse_entry_of_new_owner() {
        let reg = IdentityRegistry::new();
        let extid = ExtId::new("cn=bob");
        let info = EntityInfo {
            etype: "Person".to_string(),
            extid: Some(extid.clone()),
            source: ldap(),
        };
        reg.register(Eid(1), info.clone());
        // The external id was indexed again under a new eid
        reg.register(Eid(2), info);

        reg.invalidate(Eid(1));
        let found = reg
            .allocate_for_source(&mut FakeIndex::default(), &ldap(), &extid, "Person", false)
            .unwrap();
        assert_eq!(found, Some(Allocation::Existing(Eid(2))));
    }

    #[test]
    fn test_forget_source() {
        let reg = IdentityRegistry::new();
        reg.register(Eid(1), EntityInfo::system("Doc"));
        reg.register(
            Eid(2),
            EntityInfo {
                etype: "Person".to_string(),
                extid: Some(ExtId::new("cn=a")),
                source: ldap(),
            },
        );
        reg.forget_source(&ldap());
        assert_eq!(reg.len(), 1);
        assert!(reg.cached(Eid(1)).is_some());
    }
}
