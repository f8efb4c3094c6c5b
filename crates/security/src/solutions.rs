//! Type-solution inference
//!
//! A solution assigns one type to every variable of a query. The solution set
//! of a query is every assignment under which the restriction formula is
//! type-consistent with the schema:
//! - `X rtype Y` needs `(type(X), type(Y))` among the signatures of `rtype`
//! - `X eid N` needs `type(X)` to be the type of entity `N`
//! - `X is T` needs `type(X) == T`
//! - `Or` needs one branch, `Exists` its content, `Not` nothing
//!
//! ## Pruning
//!
//! Domains are narrowed by arc consistency before enumeration. An atom under
//! an `Or` branch or a `Not` only narrows variables that occur nowhere else,
//! so a false branch never removes types the rest of the query needs.

use cairn_core::{Eid, Node, Params, Relation, Schema, Select, Term, Value, EID_RTYPE, FINAL_TYPES};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One type per variable
pub type Solution = BTreeMap<String, String>;

/// Lookup of the entity type of an eid
pub type EtypeLookup<'a> = &'a dyn Fn(Eid) -> Option<String>;

/// Which variables an atom is allowed to narrow
#[derive(Debug, Clone)]
enum Prunable {
    All,
    Only(BTreeSet<String>),
}

impl Prunable {
    fn allows(&self, var: &str) -> bool {
        match self {
            Prunable::All => true,
            Prunable::Only(vars) => vars.contains(var),
        }
    }

    fn restrict(&self, local: BTreeSet<String>) -> Prunable {
        match self {
            Prunable::All => Prunable::Only(local),
            Prunable::Only(vars) => Prunable::Only(vars.intersection(&local).cloned().collect()),
        }
    }
}

/// Inference over one query
pub struct SolutionInference<'a> {
    schema: &'a dyn Schema,
    params: &'a Params,
    lookup: EtypeLookup<'a>,
}

impl<'a> SolutionInference<'a> {
    /// Create an inference bound to a schema, parameters and eid lookup
    pub fn new(schema: &'a dyn Schema, params: &'a Params, lookup: EtypeLookup<'a>) -> Self {
        Self {
            schema,
            params,
            lookup,
        }
    }

    /// Every type-consistent assignment for `select`, sorted
    pub fn solve(&self, select: &Select) -> Vec<Solution> {
        let vars: Vec<String> = select.variables().into_iter().collect();
        if vars.is_empty() {
            return Vec::new();
        }

        let mut domains = self.initial_domains(select, &vars);

        let mut atoms: Vec<(&Node, Prunable)> = Vec::new();
        if let Some(root) = &select.restriction {
            let mut totals = HashMap::new();
            count_occurrences(root, &mut totals);
            for v in &select.selection {
                *totals.entry(v.clone()).or_insert(0) += 1;
            }
            collect_atoms(root, Prunable::All, &totals, &mut atoms);
        }

        self.propagate(&atoms, &mut domains);
        if domains.values().any(|d| d.is_empty()) {
            return Vec::new();
        }

        let mandatory: Vec<&Node> = atoms
            .iter()
            .filter(|(_, p)| matches!(p, Prunable::All))
            .map(|(n, _)| *n)
            .collect();

        let mut solutions = Vec::new();
        let mut current = Solution::new();
        self.enumerate(select, &vars, 0, &domains, &mandatory, &mut current, &mut solutions);
        solutions.sort();
        solutions.dedup();
        solutions
    }

    fn initial_domains(&self, select: &Select, vars: &[String]) -> BTreeMap<String, BTreeSet<String>> {
        let entity_types: BTreeSet<String> = self.schema.entity_types().into_iter().collect();
        let mut objects = BTreeSet::new();
        if let Some(root) = &select.restriction {
            collect_object_vars(root, &mut objects);
        }
        vars.iter()
            .map(|v| {
                let mut domain = entity_types.clone();
                if objects.contains(v) {
                    domain.extend(FINAL_TYPES.iter().map(|t| t.to_string()));
                }
                (v.clone(), domain)
            })
            .collect()
    }

    fn propagate(&self, atoms: &[(&Node, Prunable)], domains: &mut BTreeMap<String, BTreeSet<String>>) {
        loop {
            let mut changed = false;
            for (atom, prunable) in atoms {
                match atom {
                    Node::IsType { var, etypes } => {
                        if prunable.allows(var) {
                            changed |= retain(domains, var, |t| etypes.iter().any(|e| e == t));
                        }
                    }
                    Node::Relation(rel) if rel.rtype == EID_RTYPE => {
                        if prunable.allows(&rel.subject) {
                            let etype = self.term_etype(&rel.object);
                            changed |= retain(domains, &rel.subject, |t| etype.as_deref() == Some(t));
                        }
                    }
                    Node::Relation(rel) => {
                        changed |= self.propagate_relation(rel, prunable, domains);
                    }
                    _ => {}
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn propagate_relation(
        &self,
        rel: &Relation,
        prunable: &Prunable,
        domains: &mut BTreeMap<String, BTreeSet<String>>,
    ) -> bool {
        let signatures = self.schema.relation_signatures(&rel.rtype);
        let subject_domain = domains.get(&rel.subject).cloned().unwrap_or_default();
        let object_domain = rel.object.as_var().map(|v| domains.get(v).cloned().unwrap_or_default());

        let mut subjects = BTreeSet::new();
        let mut objects = BTreeSet::new();
        for (s, o) in &signatures {
            if !subject_domain.contains(s) {
                continue;
            }
            let object_ok = match &object_domain {
                Some(domain) => domain.contains(o),
                None => self.const_matches(&rel.object, o),
            };
            if object_ok {
                subjects.insert(s.clone());
                objects.insert(o.clone());
            }
        }

        let mut changed = false;
        if prunable.allows(&rel.subject) {
            changed |= retain(domains, &rel.subject, |t| subjects.contains(t));
        }
        if let Some(var) = rel.object.as_var() {
            if prunable.allows(var) {
                changed |= retain(domains, var, |t| objects.contains(t));
            }
        }
        changed
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate(
        &self,
        select: &Select,
        vars: &[String],
        idx: usize,
        domains: &BTreeMap<String, BTreeSet<String>>,
        mandatory: &[&Node],
        current: &mut Solution,
        out: &mut Vec<Solution>,
    ) {
        if idx == vars.len() {
            let holds = match &select.restriction {
                Some(root) => self.holds(root, current),
                None => true,
            };
            if holds {
                out.push(current.clone());
            }
            return;
        }
        let var = &vars[idx];
        let domain = match domains.get(var) {
            Some(d) => d,
            None => return,
        };
        for etype in domain {
            current.insert(var.clone(), etype.clone());
            let consistent = mandatory
                .iter()
                .all(|atom| self.atom_holds_partial(atom, current));
            if consistent {
                self.enumerate(select, vars, idx + 1, domains, mandatory, current, out);
            }
            current.remove(var);
        }
    }

    /// Check an atom once all its variables are assigned
    fn atom_holds_partial(&self, atom: &Node, sol: &Solution) -> bool {
        match atom {
            Node::IsType { var, .. } if !sol.contains_key(var) => true,
            Node::Relation(rel) => {
                let subject_assigned = sol.contains_key(&rel.subject);
                let object_assigned = rel.object.as_var().map_or(true, |v| sol.contains_key(v));
                if subject_assigned && object_assigned {
                    self.holds(atom, sol)
                } else {
                    true
                }
            }
            other => self.holds(other, sol),
        }
    }

    /// Whether the formula is type-consistent under a complete assignment
    pub fn holds(&self, node: &Node, sol: &Solution) -> bool {
        match node {
            Node::IsType { var, etypes } => sol
                .get(var)
                .map_or(false, |t| etypes.iter().any(|e| e == t)),
            Node::Relation(rel) if rel.rtype == EID_RTYPE => {
                let etype = self.term_etype(&rel.object);
                sol.get(&rel.subject).map_or(false, |t| etype.as_deref() == Some(t.as_str()))
            }
            Node::Relation(rel) => {
                let subject = match sol.get(&rel.subject) {
                    Some(t) => t,
                    None => return false,
                };
                self.schema
                    .relation_signatures(&rel.rtype)
                    .iter()
                    .any(|(s, o)| {
                        s == subject
                            && match rel.object.as_var() {
                                Some(v) => sol.get(v).map_or(false, |t| t == o),
                                None => self.const_matches(&rel.object, o),
                            }
                    })
            }
            Node::And(nodes) => nodes.iter().all(|n| self.holds(n, sol)),
            Node::Or(nodes) => nodes.iter().any(|n| self.holds(n, sol)),
            Node::Exists(inner) => self.holds(inner, sol),
            Node::Not(_) => true,
        }
    }

    fn term_etype(&self, term: &Term) -> Option<String> {
        term.value(self.params)
            .and_then(Value::as_eid)
            .and_then(|eid| (self.lookup)(eid))
    }

    fn const_matches(&self, term: &Term, object_type: &str) -> bool {
        let value = match term.value(self.params) {
            Some(v) => v,
            None => return false,
        };
        if FINAL_TYPES.contains(&object_type) {
            value.is_null() || value.type_name() == object_type
        } else {
            value
                .as_eid()
                .and_then(|eid| (self.lookup)(eid))
                .map_or(false, |t| t == object_type)
        }
    }
}

fn retain<F>(domains: &mut BTreeMap<String, BTreeSet<String>>, var: &str, keep: F) -> bool
where
    F: Fn(&str) -> bool,
{
    match domains.get_mut(var) {
        Some(domain) => {
            let before = domain.len();
            domain.retain(|t| keep(t));
            domain.len() != before
        }
        None => false,
    }
}

fn count_occurrences(node: &Node, counts: &mut HashMap<String, usize>) {
    match node {
        Node::Relation(rel) => {
            *counts.entry(rel.subject.clone()).or_insert(0) += 1;
            if let Term::Var(v) = &rel.object {
                *counts.entry(v.clone()).or_insert(0) += 1;
            }
        }
        Node::IsType { var, .. } => {
            *counts.entry(var.clone()).or_insert(0) += 1;
        }
        Node::And(nodes) | Node::Or(nodes) => {
            for n in nodes {
                count_occurrences(n, counts);
            }
        }
        Node::Not(inner) | Node::Exists(inner) => count_occurrences(inner, counts),
    }
}

fn local_vars(node: &Node, totals: &HashMap<String, usize>) -> BTreeSet<String> {
    let mut counts = HashMap::new();
    count_occurrences(node, &mut counts);
    counts
        .into_iter()
        .filter(|(v, c)| totals.get(v) == Some(c))
        .map(|(v, _)| v)
        .collect()
}

fn collect_atoms<'n>(
    node: &'n Node,
    prunable: Prunable,
    totals: &HashMap<String, usize>,
    out: &mut Vec<(&'n Node, Prunable)>,
) {
    match node {
        Node::Relation(_) | Node::IsType { .. } => out.push((node, prunable)),
        Node::And(nodes) => {
            for n in nodes {
                collect_atoms(n, prunable.clone(), totals, out);
            }
        }
        Node::Exists(inner) => collect_atoms(inner, prunable, totals, out),
        Node::Or(branches) => {
            for b in branches {
                let local = local_vars(b, totals);
                collect_atoms(b, prunable.restrict(local), totals, out);
            }
        }
        Node::Not(inner) => {
            let local = local_vars(inner, totals);
            collect_atoms(inner, prunable.restrict(local), totals, out);
        }
    }
}

fn collect_object_vars(node: &Node, out: &mut BTreeSet<String>) {
    match node {
        Node::Relation(rel) => {
            if let Term::Var(v) = &rel.object {
                out.insert(v.clone());
            }
        }
        Node::IsType { .. } => {}
        Node::And(nodes) | Node::Or(nodes) => {
            for n in nodes {
                collect_object_vars(n, out);
            }
        }
        Node::Not(inner) | Node::Exists(inner) => collect_object_vars(inner, out),
    }
}

/// Restrict solutions to the given variables, deduplicated
pub fn project(solutions: &[Solution], vars: &BTreeSet<String>) -> BTreeSet<Solution> {
    solutions
        .iter()
        .map(|s| {
            s.iter()
                .filter(|(k, _)| vars.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .collect()
}

/// Types a variable takes across solutions
pub fn var_types(solutions: &[Solution], var: &str) -> BTreeSet<String> {
    solutions.iter().filter_map(|s| s.get(var).cloned()).collect()
}
