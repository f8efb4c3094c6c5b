//! Query syntax tree
//!
//! The parser library hands the engine trees of this shape; the security
//! rewriter splices permission fragments into them and sources evaluate them.
//!
//! A query is a `Select` with a projection and an optional restriction
//! formula built from:
//! - `Relation`: `X rtype <term>` where the subject is always a variable
//! - `IsType`: `X is Foo` / `X is IN(Foo, Bar)`
//! - `And`, `Or`, `Not`, `Exists`
//!
//! The special relation type `eid` binds a variable to an entity id.

use crate::types::Eid;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Named query parameters (`%(name)s`)
pub type Params = BTreeMap<String, Value>;

/// Relation type binding a variable to an entity id
pub const EID_RTYPE: &str = "eid";

/// Object side of a relation
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Query variable
    Var(String),
    /// Literal constant
    Const(Value),
    /// Named parameter, substituted at execution
    Param(String),
}

impl Term {
    /// Variable name, if this term is a variable
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Term::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Resolve constants and parameters to a value
    pub fn value<'a>(&'a self, params: &'a Params) -> Option<&'a Value> {
        match self {
            Term::Var(_) => None,
            Term::Const(v) => Some(v),
            Term::Param(name) => params.get(name),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(name) => f.write_str(name),
            Term::Const(v) => write!(f, "{}", v),
            Term::Param(name) => write!(f, "%({})s", name),
        }
    }
}

/// `subject rtype object`
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    /// Subject variable
    pub subject: String,
    /// Relation type
    pub rtype: String,
    /// Object term
    pub object: Term,
}

/// Restriction formula
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Relation atom
    Relation(Relation),
    /// Type restriction on a variable
    IsType {
        /// Restricted variable
        var: String,
        /// Accepted entity types
        etypes: Vec<String>,
    },
    /// Conjunction
    And(Vec<Node>),
    /// Disjunction
    Or(Vec<Node>),
    /// Negation
    Not(Box<Node>),
    /// Existential sub-formula; its own variables are not projected
    Exists(Box<Node>),
}

impl Node {
    /// `subject rtype object`
    pub fn relation(subject: &str, rtype: &str, object: Term) -> Node {
        Node::Relation(Relation {
            subject: subject.to_string(),
            rtype: rtype.to_string(),
            object,
        })
    }

    /// `subject rtype object` where the object is a variable
    pub fn rel(subject: &str, rtype: &str, object: &str) -> Node {
        Node::relation(subject, rtype, Term::Var(object.to_string()))
    }

    /// `var eid <eid>`
    pub fn eid(var: &str, eid: Eid) -> Node {
        Node::relation(var, EID_RTYPE, Term::Const(Value::Eid(eid)))
    }

    /// `var is etype`
    pub fn is(var: &str, etype: &str) -> Node {
        Node::IsType {
            var: var.to_string(),
            etypes: vec![etype.to_string()],
        }
    }

    /// `var is IN(etypes)`
    pub fn is_in<S: AsRef<str>>(var: &str, etypes: &[S]) -> Node {
        Node::IsType {
            var: var.to_string(),
            etypes: etypes.iter().map(|e| e.as_ref().to_string()).collect(),
        }
    }

    /// Conjunction, flattening nested conjunctions
    pub fn and(nodes: Vec<Node>) -> Node {
        let mut flat = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Node::And(flat)
        }
    }

    /// Disjunction
    pub fn or(nodes: Vec<Node>) -> Node {
        if nodes.len() == 1 {
            let mut nodes = nodes;
            nodes.remove(0)
        } else {
            Node::Or(nodes)
        }
    }

    /// Negation
    pub fn not(node: Node) -> Node {
        Node::Not(Box::new(node))
    }

    /// Existential wrapper
    pub fn exists(node: Node) -> Node {
        Node::Exists(Box::new(node))
    }

    /// Collect every variable referenced below this node
    pub fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Node::Relation(rel) => {
                out.insert(rel.subject.clone());
                if let Term::Var(name) = &rel.object {
                    out.insert(name.clone());
                }
            }
            Node::IsType { var, .. } => {
                out.insert(var.clone());
            }
            Node::And(nodes) | Node::Or(nodes) => {
                for node in nodes {
                    node.collect_variables(out);
                }
            }
            Node::Not(inner) | Node::Exists(inner) => inner.collect_variables(out),
        }
    }

    /// Variables referenced below this node
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    /// Top-level conjuncts (the node itself unless it is an `And`)
    pub fn conjuncts(&self) -> Vec<&Node> {
        match self {
            Node::And(nodes) => nodes.iter().collect(),
            other => vec![other],
        }
    }

    /// Copy of this node with variables renamed through `map`
    ///
    /// Variables absent from the map keep their name.
    pub fn rename(&self, map: &HashMap<String, String>) -> Node {
        let name = |n: &String| map.get(n).cloned().unwrap_or_else(|| n.clone());
        match self {
            Node::Relation(rel) => Node::Relation(Relation {
                subject: name(&rel.subject),
                rtype: rel.rtype.clone(),
                object: match &rel.object {
                    Term::Var(v) => Term::Var(name(v)),
                    other => other.clone(),
                },
            }),
            Node::IsType { var, etypes } => Node::IsType {
                var: name(var),
                etypes: etypes.clone(),
            },
            Node::And(nodes) => Node::And(nodes.iter().map(|n| n.rename(map)).collect()),
            Node::Or(nodes) => Node::Or(nodes.iter().map(|n| n.rename(map)).collect()),
            Node::Not(inner) => Node::Not(Box::new(inner.rename(map))),
            Node::Exists(inner) => Node::Exists(Box::new(inner.rename(map))),
        }
    }

    /// Whether `var` carries an explicit type restriction at the top level
    pub fn has_type_restriction(&self, var: &str) -> bool {
        self.conjuncts()
            .iter()
            .any(|n| matches!(n, Node::IsType { var: v, .. } if v == var))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Relation(rel) => write!(f, "{} {} {}", rel.subject, rel.rtype, rel.object),
            Node::IsType { var, etypes } if etypes.len() == 1 => {
                write!(f, "{} is {}", var, etypes[0])
            }
            Node::IsType { var, etypes } => write!(f, "{} is IN({})", var, etypes.join(", ")),
            Node::And(nodes) => {
                let parts: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
                f.write_str(&parts.join(", "))
            }
            Node::Or(nodes) => {
                let parts: Vec<String> = nodes.iter().map(|n| format!("({})", n)).collect();
                f.write_str(&parts.join(" OR "))
            }
            Node::Not(inner) => write!(f, "NOT {}", inner),
            Node::Exists(inner) => write!(f, "EXISTS({})", inner),
        }
    }
}

/// A selection query
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    /// Projected variables, in column order
    pub selection: Vec<String>,
    /// Restriction formula
    pub restriction: Option<Node>,
}

impl Select {
    /// `Any <selection> WHERE <restriction>`
    pub fn any<S: AsRef<str>>(selection: &[S], restriction: Node) -> Self {
        Self {
            selection: selection.iter().map(|s| s.as_ref().to_string()).collect(),
            restriction: Some(restriction),
        }
    }

    /// Every variable used by the query
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.selection.iter().cloned().collect();
        if let Some(node) = &self.restriction {
            node.collect_variables(&mut out);
        }
        out
    }

    /// Add a conjunct to the restriction
    pub fn add_restriction(&mut self, node: Node) {
        self.restriction = Some(match self.restriction.take() {
            Some(existing) => Node::and(vec![existing, node]),
            None => node,
        });
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Any {}", self.selection.join(", "))?;
        if let Some(node) = &self.restriction {
            write!(f, " WHERE {}", node)?;
        }
        Ok(())
    }
}
