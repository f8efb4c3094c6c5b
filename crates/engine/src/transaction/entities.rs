//! Entity and relation mutations
//!
//! Every mutation validates against the schema, checks write permissions,
//! fires its before/after hooks and routes the change to the source holding
//! the entity type. Relations are stored by the source of their subject.

use super::{CheckEntityPermissionOp, ForgetNewEntitiesOp, Transaction};
use crate::hooks::{HookContext, HookEvent};
use crate::identity::{Allocation, SourceIndex};
use cairn_core::{
    Action, Attributes, CairnError, CairnResult, Eid, EntityInfo, ExtId, Node, Params, RelationDef, Row, Select,
    Source, SourceUri,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a write permission check made before the change
enum WriteAccess {
    Granted,
    /// Rule expressions must be checked against the entity
    Deferred,
}

impl Transaction {
    fn validate(&mut self, etype: &str, attrs: &Attributes, creating: bool, eid: Option<Eid>) -> CairnResult<()> {
        let defs = self.repo()?.schema().attributes(etype);
        let mut errors = BTreeMap::new();
        for (name, value) in attrs {
            match defs.iter().find(|d| &d.name == name) {
                None => {
                    errors.insert(name.clone(), format!("{} has no attribute {}", etype, name));
                }
                Some(def) if value.is_null() => {
                    if def.required {
                        errors.insert(name.clone(), "required attribute".to_string());
                    }
                }
                Some(def) if value.type_name() != def.value_type => {
                    errors.insert(
                        name.clone(),
                        format!("expected {}, got {}", def.value_type, value.type_name()),
                    );
                }
                Some(_) => {}
            }
        }
        if creating {
            for def in defs.iter().filter(|d| d.required && !attrs.contains_key(&d.name)) {
                errors.insert(def.name.clone(), "required attribute".to_string());
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        warn!(target: "cairn::txn", txn_id = %self.id, etype, errors = errors.len(), "Validation failed, transaction is uncommitable");
        self.set_uncommitable();
        Err(CairnError::Validation { eid, errors })
    }

    fn check_write(&self, etype: &str, action: Action) -> CairnResult<WriteAccess> {
        if !self.write_security() || self.bypasses_security() {
            return Ok(WriteAccess::Granted);
        }
        let groups = self
            .session
            .user()
            .map(|u| u.groups.clone())
            .unwrap_or_default();
        let perms = self
            .repo()?
            .schema()
            .permissions(etype, action)
            .ok_or_else(|| CairnError::unauthorized(format!("{} of unknown type {}", action, etype)))?;
        if perms.grants_group(&groups) {
            Ok(WriteAccess::Granted)
        } else if perms.expressions.is_empty() {
            Err(CairnError::unauthorized(format!("{} of {} is not permitted", action, etype)))
        } else {
            Ok(WriteAccess::Deferred)
        }
    }

    fn defer_check(&mut self, access: WriteAccess, eid: Eid, etype: &str, action: Action) -> CairnResult<()> {
        match access {
            WriteAccess::Granted => Ok(()),
            WriteAccess::Deferred => self.add_data::<CheckEntityPermissionOp>((eid, etype.to_string(), action)),
        }
    }

    fn source_for(&self, uri: &SourceUri) -> CairnResult<Arc<dyn Source>> {
        self.repo()?.sources().get(uri)
    }

    /// Create an entity of `etype`
    ///
    /// # Errors
    ///
    /// - `Validation` (and the transaction becomes uncommitable) for unknown
    ///   types, unknown attributes, type mismatches or missing required
    ///   attributes
    /// - `Unauthorized` when the user may not add entities of this type
    pub fn add_entity(&mut self, etype: &str, attrs: Attributes) -> CairnResult<Eid> {
        self.ensure_open()?;
        if !self.repo()?.schema().has_entity_type(etype) {
            self.set_uncommitable();
            return Err(CairnError::validation(None, "etype", format!("unknown entity type {}", etype)));
        }
        self.validate(etype, &attrs, true, None)?;
        let access = self.check_write(etype, Action::Add)?;
        self.mark_write();

        let repo = self.repo()?;
        let uri = repo.sources().uri_for_type(etype);
        let system = repo.sources().system()?;
        let eid = self.with_source(&system, |conn| {
            repo.identity()
                .allocate(&mut SourceIndex::new(system.as_ref(), conn), etype, &uri)
        })?;
        self.add_data::<ForgetNewEntitiesOp>(eid)?;
        self.defer_check(access, eid, etype, Action::Add)?;

        self.fire(HookContext::entity(HookEvent::BeforeAddEntity, eid, etype).with_attrs(&attrs))?;
        let source = self.source_for(&uri)?;
        self.with_source(&source, |conn| source.add_entity(conn, eid, etype, &attrs))?;
        self.fire(HookContext::entity(HookEvent::AfterAddEntity, eid, etype).with_attrs(&attrs))?;
        debug!(target: "cairn::txn", txn_id = %self.id, eid = %eid, etype, source = %uri, "Entity added");
        Ok(eid)
    }

    /// Change attributes of an entity
    pub fn update_entity(&mut self, eid: Eid, attrs: Attributes) -> CairnResult<()> {
        self.ensure_open()?;
        let info = self.entity_info(eid)?;
        self.validate(&info.etype, &attrs, false, Some(eid))?;
        let access = self.check_write(&info.etype, Action::Update)?;
        self.mark_write();
        self.defer_check(access, eid, &info.etype, Action::Update)?;

        self.fire(HookContext::entity(HookEvent::BeforeUpdateEntity, eid, &info.etype).with_attrs(&attrs))?;
        let source = self.source_for(&info.source)?;
        self.with_source(&source, |conn| source.update_entity(conn, eid, &attrs))?;
        self.fire(HookContext::entity(HookEvent::AfterUpdateEntity, eid, &info.etype).with_attrs(&attrs))?;
        debug!(target: "cairn::txn", txn_id = %self.id, eid = %eid, "Entity updated");
        Ok(())
    }

    /// Delete entities and their relations
    ///
    /// Rule-guarded delete permissions are checked right away, since the
    /// entity is gone by precommit. Cached identities are dropped before this
    /// returns.
    pub fn delete_entities(&mut self, eids: &[Eid]) -> CairnResult<()> {
        self.ensure_open()?;
        let mut targets: Vec<(Eid, EntityInfo)> = Vec::with_capacity(eids.len());
        for eid in eids {
            let info = self.entity_info(*eid)?;
            if let WriteAccess::Deferred = self.check_write(&info.etype, Action::Delete)? {
                if !self.satisfies_rules(*eid, &info.etype, Action::Delete)? {
                    return Err(CairnError::unauthorized(format!(
                        "delete of {} {} is not permitted",
                        info.etype, eid
                    )));
                }
            }
            targets.push((*eid, info));
        }
        self.mark_write();

        for (eid, info) in &targets {
            self.fire(HookContext::entity(HookEvent::BeforeDeleteEntity, *eid, &info.etype))?;
        }

        let mut by_source: BTreeMap<SourceUri, Vec<Eid>> = BTreeMap::new();
        for (eid, info) in &targets {
            by_source.entry(info.source.clone()).or_default().push(*eid);
        }
        for (uri, group) in &by_source {
            let source = self.source_for(uri)?;
            self.with_source(&source, |conn| source.delete_entities(conn, group))?;
        }

        let repo = self.repo()?;
        let system = repo.sources().system()?;
        self.with_source(&system, |conn| {
            for (eid, _) in &targets {
                system.delete_info(conn, *eid)?;
            }
            Ok(())
        })?;
        for (eid, _) in &targets {
            repo.identity().invalidate(*eid);
        }

        for (eid, info) in &targets {
            self.fire(HookContext::entity(HookEvent::AfterDeleteEntity, *eid, &info.etype))?;
        }
        debug!(target: "cairn::txn", txn_id = %self.id, count = targets.len(), "Entities deleted");
        Ok(())
    }

    fn relation_def(&mut self, subject: &EntityInfo, rtype: &str, object: &EntityInfo, eid: Eid) -> CairnResult<RelationDef> {
        let rdef = self.repo()?.schema().rdef(rtype, &subject.etype, &object.etype);
        match rdef {
            Some(rdef) if !rdef.is_attribute() => Ok(rdef),
            Some(_) => Err(CairnError::programming(format!("{} is an attribute, use update_entity", rtype))),
            None => {
                self.set_uncommitable();
                Err(CairnError::validation(
                    Some(eid),
                    rtype,
                    format!("{} {} {} is not allowed", subject.etype, rtype, object.etype),
                ))
            }
        }
    }

    /// Link `subject` to `object`
    ///
    /// An existing relation is removed first when the relation is single
    /// valued on either side.
    pub fn add_relation(&mut self, subject: Eid, rtype: &str, object: Eid) -> CairnResult<()> {
        self.ensure_open()?;
        let sinfo = self.entity_info(subject)?;
        let oinfo = self.entity_info(object)?;
        let rdef = self.relation_def(&sinfo, rtype, &oinfo, subject)?;
        let access = self.check_write(&sinfo.etype, Action::Update)?;
        self.mark_write();
        self.defer_check(access, subject, &sinfo.etype, Action::Update)?;

        self.fire(HookContext::relation(HookEvent::BeforeAddRelation, subject, rtype, object))?;
        self.del_existing_rel_if_needed(subject, rtype, object, &rdef, &sinfo.source)?;
        let source = self.source_for(&sinfo.source)?;
        self.with_source(&source, |conn| source.add_relations(conn, rtype, &[(subject, object)]))?;
        self.fire(HookContext::relation(HookEvent::AfterAddRelation, subject, rtype, object))?;
        debug!(target: "cairn::txn", txn_id = %self.id, subject = %subject, rtype, object = %object, "Relation added");
        Ok(())
    }

    /// Unlink `subject` from `object`
    pub fn delete_relation(&mut self, subject: Eid, rtype: &str, object: Eid) -> CairnResult<()> {
        self.ensure_open()?;
        let sinfo = self.entity_info(subject)?;
        let access = self.check_write(&sinfo.etype, Action::Update)?;
        self.mark_write();
        self.defer_check(access, subject, &sinfo.etype, Action::Update)?;

        self.fire(HookContext::relation(HookEvent::BeforeDeleteRelation, subject, rtype, object))?;
        let source = self.source_for(&sinfo.source)?;
        self.with_source(&source, |conn| source.delete_relation(conn, subject, rtype, object))?;
        self.fire(HookContext::relation(HookEvent::AfterDeleteRelation, subject, rtype, object))?;
        debug!(target: "cairn::txn", txn_id = %self.id, subject = %subject, rtype, object = %object, "Relation deleted");
        Ok(())
    }

    fn del_existing_rel_if_needed(
        &mut self,
        subject: Eid,
        rtype: &str,
        object: Eid,
        rdef: &RelationDef,
        uri: &SourceUri,
    ) -> CairnResult<()> {
        let source = self.source_for(uri)?;
        if rdef.subject_cardinality.is_single() {
            let select = Select::any(&["O"], Node::and(vec![Node::eid("S", subject), Node::rel("S", rtype, "O")]));
            for other in self.linked(&source, &select)? {
                if other != object {
                    self.delete_relation(subject, rtype, other)?;
                }
            }
        }
        if rdef.object_cardinality.is_single() {
            let select = Select::any(&["S"], Node::and(vec![Node::eid("O", object), Node::rel("S", rtype, "O")]));
            for other in self.linked(&source, &select)? {
                if other != subject {
                    self.delete_relation(other, rtype, object)?;
                }
            }
        }
        Ok(())
    }

    fn linked(&mut self, source: &Arc<dyn Source>, select: &Select) -> CairnResult<BTreeSet<Eid>> {
        let repo = self.repo()?;
        let rows: Vec<Row> = self.with_source(source, |conn| {
            source.execute(conn, repo.schema(), select, &Params::new())
        })?;
        Ok(rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.as_eid()))
            .collect())
    }

    /// Eid of an entity known to `source` as `extid`
    ///
    /// With `insert`, an unknown external id gets a fresh eid indexed in this
    /// transaction; it is forgotten again if the transaction rolls back.
    pub fn entity_from_source(
        &mut self,
        source: &SourceUri,
        extid: &ExtId,
        etype: &str,
        insert: bool,
    ) -> CairnResult<Option<Allocation>> {
        self.ensure_open()?;
        let repo = self.repo()?;
        if !repo.sources().contains(source) {
            return Err(CairnError::UnknownSource(source.clone()));
        }
        let system = repo.sources().system()?;
        let found = self.with_source(&system, |conn| {
            repo.identity().allocate_for_source(
                &mut SourceIndex::new(system.as_ref(), conn),
                source,
                extid,
                etype,
                insert,
            )
        })?;
        if let Some(Allocation::Created(eid)) = found {
            self.mark_write();
            self.add_data::<ForgetNewEntitiesOp>(eid)?;
        }
        Ok(found)
    }
}
