//! Schema interface
//!
//! Schema definition loading lives outside the core. The engine only needs:
//! - relation definitions with cardinality and composite role (`rdef`)
//! - the (subject, object) type signatures of each relation type
//! - attribute definitions, for validation
//! - permission rules per entity type and action
//!
//! `MemorySchema` is a plain in-memory implementation built with
//! `SchemaBuilder`, used by tests and embedders that declare their schema in
//! code.

use crate::syntax::Node;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Value types that are attribute targets rather than entity types
pub const FINAL_TYPES: &[&str] = &["Bool", "Int", "Float", "String", "Eid"];

/// How many objects a subject may have for a relation, or the reverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// Exactly one (`1`)
    One,
    /// Zero or one (`?`)
    ZeroOrOne,
    /// Any number (`*`)
    Many,
    /// At least one (`+`)
    OneOrMore,
}

impl Cardinality {
    /// Parse the one-character notation
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '1' => Some(Cardinality::One),
            '?' => Some(Cardinality::ZeroOrOne),
            '*' => Some(Cardinality::Many),
            '+' => Some(Cardinality::OneOrMore),
            _ => None,
        }
    }

    /// Whether at most one value is allowed
    pub fn is_single(&self) -> bool {
        matches!(self, Cardinality::One | Cardinality::ZeroOrOne)
    }

    /// Whether at least one value is required
    pub fn is_required(&self) -> bool {
        matches!(self, Cardinality::One | Cardinality::OneOrMore)
    }
}

/// Which side of a composite relation owns the other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeRole {
    /// Subject owns its objects
    Subject,
    /// Object owns its subjects
    Object,
}

/// Relation definition for one (subject type, object type) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    /// Relation type
    pub rtype: String,
    /// Subject entity type
    pub subject: String,
    /// Object entity or final type
    pub object: String,
    /// Cardinality on the subject side: how many objects one subject may have
    pub subject_cardinality: Cardinality,
    /// Cardinality on the object side: how many subjects one object may have
    pub object_cardinality: Cardinality,
    /// Composite role, if any
    pub composite: Option<CompositeRole>,
}

impl RelationDef {
    /// Whether this definition targets a final (attribute) type
    pub fn is_attribute(&self) -> bool {
        FINAL_TYPES.contains(&self.object.as_str())
    }
}

/// Attribute definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDef {
    /// Attribute name
    pub name: String,
    /// Final value type name
    pub value_type: String,
    /// Whether a value must be provided at creation
    pub required: bool,
}

/// Actions subject to permission rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    /// Read entities of the type
    Read,
    /// Create entities of the type
    Add,
    /// Modify entities or their relations
    Update,
    /// Delete entities of the type
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Read => "read",
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Permission-rule snippet: a small query fragment about `main_var`
///
/// The fragment may use other free variables; they are local to the rule.
/// The current user is available as the `%(u)s` parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleExpression {
    /// Variable standing for the checked entity
    pub main_var: String,
    /// Restriction that must hold for access to be granted
    pub restriction: Node,
}

impl RuleExpression {
    /// Rule over `X`
    pub fn new(restriction: Node) -> Self {
        Self {
            main_var: "X".to_string(),
            restriction,
        }
    }
}

impl fmt::Display for RuleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.restriction)
    }
}

/// Permission rules for one (entity type, action)
///
/// Members of any listed group are granted access outright; everyone else
/// must satisfy at least one expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Permissions {
    /// Groups granted unconditionally
    pub groups: BTreeSet<String>,
    /// Conditional rules
    pub expressions: Vec<RuleExpression>,
}

impl Permissions {
    /// Grant to the given groups
    pub fn groups<S: AsRef<str>>(groups: &[S]) -> Self {
        Self {
            groups: groups.iter().map(|g| g.as_ref().to_string()).collect(),
            expressions: Vec::new(),
        }
    }

    /// Add a conditional rule
    pub fn with_expression(mut self, expr: RuleExpression) -> Self {
        self.expressions.push(expr);
        self
    }

    /// Whether one of `user_groups` is granted unconditionally
    pub fn grants_group(&self, user_groups: &BTreeSet<String>) -> bool {
        !self.groups.is_disjoint(user_groups)
    }
}

/// Schema lookups consumed by the core
pub trait Schema: Send + Sync {
    /// Known entity types (final types excluded)
    fn entity_types(&self) -> Vec<String>;

    /// Whether `etype` is a known entity type
    fn has_entity_type(&self, etype: &str) -> bool {
        self.entity_types().iter().any(|e| e == etype)
    }

    /// Definition of `rtype` between the given types
    fn rdef(&self, rtype: &str, subject: &str, object: &str) -> Option<RelationDef>;

    /// Every (subject type, object type) pair allowed for `rtype`
    fn relation_signatures(&self, rtype: &str) -> Vec<(String, String)>;

    /// Attribute definitions of `etype`
    fn attributes(&self, etype: &str) -> Vec<AttributeDef>;

    /// Permission rules for `etype`; `None` when the type is unknown
    fn permissions(&self, etype: &str, action: Action) -> Option<Permissions>;
}

/// In-memory schema
#[derive(Debug, Clone, Default)]
pub struct MemorySchema {
    entity_types: BTreeSet<String>,
    attributes: BTreeMap<String, Vec<AttributeDef>>,
    relations: BTreeMap<String, Vec<RelationDef>>,
    permissions: BTreeMap<(String, Action), Permissions>,
}

impl MemorySchema {
    /// Start building a schema
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    fn default_permissions(action: Action) -> Permissions {
        match action {
            Action::Read => Permissions::groups(&["managers", "users", "guests"]),
            _ => Permissions::groups(&["managers", "users"]),
        }
    }
}

impl Schema for MemorySchema {
    fn entity_types(&self) -> Vec<String> {
        self.entity_types.iter().cloned().collect()
    }

    fn has_entity_type(&self, etype: &str) -> bool {
        self.entity_types.contains(etype)
    }

    fn rdef(&self, rtype: &str, subject: &str, object: &str) -> Option<RelationDef> {
        self.relations
            .get(rtype)?
            .iter()
            .find(|r| r.subject == subject && r.object == object)
            .cloned()
    }

    fn relation_signatures(&self, rtype: &str) -> Vec<(String, String)> {
        self.relations
            .get(rtype)
            .map(|defs| {
                defs.iter()
                    .map(|r| (r.subject.clone(), r.object.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn attributes(&self, etype: &str) -> Vec<AttributeDef> {
        self.attributes.get(etype).cloned().unwrap_or_default()
    }

    fn permissions(&self, etype: &str, action: Action) -> Option<Permissions> {
        if !self.entity_types.contains(etype) {
            return None;
        }
        Some(
            self.permissions
                .get(&(etype.to_string(), action))
                .cloned()
                .unwrap_or_else(|| Self::default_permissions(action)),
        )
    }
}

/// Builder for `MemorySchema`
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    schema: MemorySchema,
}

impl SchemaBuilder {
    /// Declare an entity type
    pub fn entity_type(mut self, etype: &str) -> Self {
        self.schema.entity_types.insert(etype.to_string());
        self
    }

    /// Declare an attribute; the entity type is declared if needed
    pub fn attribute(mut self, etype: &str, name: &str, value_type: &str, required: bool) -> Self {
        self.schema.entity_types.insert(etype.to_string());
        self.schema
            .attributes
            .entry(etype.to_string())
            .or_default()
            .push(AttributeDef {
                name: name.to_string(),
                value_type: value_type.to_string(),
                required,
            });
        let card = if required {
            Cardinality::One
        } else {
            Cardinality::ZeroOrOne
        };
        self.push_rdef(name, etype, value_type, card, Cardinality::Many, None)
    }

    /// Declare a relation with its two-character cardinality (e.g. `"?*"`)
    ///
    /// Unknown cardinality characters fall back to `*`.
    pub fn relation(self, rtype: &str, subject: &str, object: &str, cardinality: &str) -> Self {
        self.relation_def(rtype, subject, object, cardinality, None)
    }

    /// Declare a composite relation
    pub fn composite_relation(
        self,
        rtype: &str,
        subject: &str,
        object: &str,
        cardinality: &str,
        role: CompositeRole,
    ) -> Self {
        self.relation_def(rtype, subject, object, cardinality, Some(role))
    }

    fn relation_def(
        mut self,
        rtype: &str,
        subject: &str,
        object: &str,
        cardinality: &str,
        composite: Option<CompositeRole>,
    ) -> Self {
        let mut chars = cardinality.chars();
        let subj_card = chars
            .next()
            .and_then(Cardinality::from_char)
            .unwrap_or(Cardinality::Many);
        let obj_card = chars
            .next()
            .and_then(Cardinality::from_char)
            .unwrap_or(Cardinality::Many);
        self.schema.entity_types.insert(subject.to_string());
        self.schema.entity_types.insert(object.to_string());
        self.push_rdef(rtype, subject, object, subj_card, obj_card, composite)
    }

    fn push_rdef(
        mut self,
        rtype: &str,
        subject: &str,
        object: &str,
        subject_cardinality: Cardinality,
        object_cardinality: Cardinality,
        composite: Option<CompositeRole>,
    ) -> Self {
        self.schema
            .relations
            .entry(rtype.to_string())
            .or_default()
            .push(RelationDef {
                rtype: rtype.to_string(),
                subject: subject.to_string(),
                object: object.to_string(),
                subject_cardinality,
                object_cardinality,
                composite,
            });
        self
    }

    /// Set the permission rules for an (entity type, action)
    pub fn permissions(mut self, etype: &str, action: Action, permissions: Permissions) -> Self {
        self.schema
            .permissions
            .insert((etype.to_string(), action), permissions);
        self
    }

    /// Finish building
    pub fn build(self) -> MemorySchema {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> MemorySchema {
        MemorySchema::builder()
            .attribute("Doc", "title", "String", true)
            .relation("in_folder", "Doc", "Folder", "?*")
            .relation("in_folder", "Doc", "Archive", "?*")
            .permissions("Doc", Action::Read, Permissions::groups(&["managers"]))
            .build()
    }

    #[test]
    fn test_cardinality_parsing() {
        assert_eq!(Cardinality::from_char('?'), Some(Cardinality::ZeroOrOne));
        assert_eq!(Cardinality::from_char('x'), None);
        assert!(Cardinality::One.is_single());
        assert!(!Cardinality::OneOrMore.is_single());
        assert!(Cardinality::OneOrMore.is_required());
    }

    #[test]
    fn test_rdef_lookup() {
        let s = schema();
        let rdef = s.rdef("in_folder", "Doc", "Folder").unwrap();
        assert_eq!(rdef.subject_cardinality, Cardinality::ZeroOrOne);
        assert_eq!(rdef.object_cardinality, Cardinality::Many);
        assert!(s.rdef("in_folder", "Folder", "Doc").is_none());
        assert_eq!(s.relation_signatures("in_folder").len(), 2);
    }

    #[test]
    fn test_attribute_is_final_relation() {
        let s = schema();
        let rdef = s.rdef("title", "Doc", "String").unwrap();
        assert!(rdef.is_attribute());
        assert_eq!(s.attributes("Doc")[0].name, "title");
        assert!(!s.has_entity_type("String"));
    }

    #[test]
    fn test_permissions_defaults_and_overrides() {
        let s = schema();
        let read = s.permissions("Doc", Action::Read).unwrap();
        assert!(read.groups.contains("managers"));
        assert!(!read.groups.contains("users"));
        let add = s.permissions("Folder", Action::Add).unwrap();
        assert!(add.groups.contains("users"));
        assert!(s.permissions("Nope", Action::Read).is_none());
    }
}
