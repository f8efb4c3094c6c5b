//! Rewrite bookkeeping
//!
//! A `RewriteContext` accumulates what the rewriter has inserted so far: the
//! variables it allocated, the `EXISTS` branches per owner and the types each
//! owner is known to be covered for. The rewritten tree is always derived
//! from the original query plus this context, never patched in place, so a
//! failed splice is undone by dropping a cloned context.

use crate::solutions::Solution;
use cairn_core::{Node, Select};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Identifies a variable introduced by a rule snippet
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RewriteKey {
    /// (fragment index, rule index)
    pub rule: (usize, usize),
    /// Query variable (or `#eid`) the rule is about
    pub owner: String,
    /// Variable name inside the rule snippet
    pub snippet_var: String,
    /// Variant number, 0 for the original branch
    pub variant: usize,
}

/// One `EXISTS(...)` clause for an owner
#[derive(Debug, Clone)]
pub struct Branch {
    /// (fragment index, rule index) the branch was built from
    pub rule: (usize, usize),
    /// Conjuncts of the clause
    pub nodes: Vec<Node>,
    /// Snippet variables mapped to fresh query variables
    pub allocated: Vec<(String, String)>,
    /// Snippet variables mapped onto existing query variables
    pub shared: Vec<(String, String)>,
    /// Variant number
    pub variant: usize,
}

impl Branch {
    /// A branch fully absorbed by the query grants access unconditionally
    pub fn is_trivial(&self) -> bool {
        self.nodes.is_empty()
    }

    fn tree(&self) -> Node {
        Node::exists(Node::and(self.nodes.clone()))
    }
}

/// Accumulated state of one rewrite
#[derive(Debug, Clone)]
pub struct RewriteContext {
    taken: BTreeSet<String>,
    next_var: usize,
    variants: usize,
    rewritten: BTreeMap<RewriteKey, String>,
    owners: Vec<(String, Vec<Branch>)>,
    covered: BTreeMap<String, Option<BTreeSet<String>>>,
    /// Solutions of the original query
    pub original: Vec<Solution>,
    /// Solutions of the tree as currently materialized
    pub solutions: Vec<Solution>,
}

impl RewriteContext {
    /// Fresh context for `select`, whose solutions are `solutions`
    pub fn new(select: &Select, solutions: Vec<Solution>) -> Self {
        Self {
            taken: select.variables(),
            next_var: 0,
            variants: 0,
            rewritten: BTreeMap::new(),
            owners: Vec::new(),
            covered: BTreeMap::new(),
            original: solutions.clone(),
            solutions,
        }
    }

    /// Allocate a variable name unused by the query and by earlier inserts
    pub fn fresh_var(&mut self) -> String {
        loop {
            let candidate = format!("S{}", self.next_var);
            self.next_var += 1;
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Record which query variable stands for a snippet variable
    pub fn record(&mut self, key: RewriteKey, var: String) {
        self.rewritten.insert(key, var);
    }

    /// Snippet variable to query variable mapping
    pub fn rewritten(&self) -> &BTreeMap<RewriteKey, String> {
        &self.rewritten
    }

    /// Branches inserted for `owner`
    pub fn branches(&self, owner: &str) -> &[Branch] {
        self.owners
            .iter()
            .find(|(o, _)| o == owner)
            .map(|(_, b)| b.as_slice())
            .unwrap_or(&[])
    }

    /// Add a branch for `owner`, covering `types` of the owner (`None`: all)
    pub fn push_branch(&mut self, owner: &str, branch: Branch, types: Option<BTreeSet<String>>) {
        match self.owners.iter_mut().find(|(o, _)| o == owner) {
            Some((_, branches)) => branches.push(branch),
            None => self.owners.push((owner.to_string(), vec![branch])),
        }
        let entry = self
            .covered
            .entry(owner.to_string())
            .or_insert_with(|| Some(BTreeSet::new()));
        match (entry.as_mut(), types) {
            (Some(existing), Some(types)) => existing.extend(types),
            _ => *entry = None,
        }
    }

    /// Original solutions still expected after the inserted rules
    ///
    /// An owner not covered for its type in a solution legitimately loses it.
    pub fn expected(&self) -> BTreeSet<Solution> {
        self.original
            .iter()
            .filter(|s| {
                self.covered.iter().all(|(owner, covered)| match (s.get(owner), covered) {
                    (Some(etype), Some(types)) => types.contains(etype),
                    _ => true,
                })
            })
            .cloned()
            .collect()
    }

    /// The original query with every owner's branches ORed and ANDed in
    pub fn materialize(&self, original: &Select) -> Select {
        let mut select = original.clone();
        for (_, branches) in &self.owners {
            if branches.iter().any(Branch::is_trivial) {
                continue;
            }
            let clauses: Vec<Node> = branches.iter().map(Branch::tree).collect();
            select.add_restriction(Node::or(clauses));
        }
        select
    }

    /// Split branches whose introduced variables take several types
    ///
    /// Each distinct type combination of the varying variables gets its own
    /// branch carrying explicit `V is T` restrictions; the first reuses the
    /// branch variables, later ones are clones over fresh variables. Returns
    /// whether anything was split.
    pub fn split_variants(&mut self, solutions: &[Solution]) -> bool {
        let mut changed = false;
        let mut owners = std::mem::take(&mut self.owners);
        for (owner, branches) in owners.iter_mut() {
            let mut result = Vec::with_capacity(branches.len());
            for branch in branches.drain(..) {
                let combos = varying_combinations(&branch, solutions);
                if combos.len() < 2 {
                    result.push(branch);
                    continue;
                }
                changed = true;
                for (n, combo) in combos.iter().enumerate() {
                    let mut variant = if n == 0 {
                        branch.clone()
                    } else {
                        self.variants += 1;
                        let number = self.variants;
                        self.clone_branch(owner, &branch, number)
                    };
                    let names: HashMap<&str, &str> = branch
                        .allocated
                        .iter()
                        .zip(variant.allocated.iter())
                        .map(|((_, from), (_, to))| (from.as_str(), to.as_str()))
                        .collect();
                    for (var, etype) in combo {
                        let target = names.get(var.as_str()).copied().unwrap_or(var.as_str());
                        variant.nodes.push(Node::is(target, etype));
                    }
                    result.push(variant);
                }
            }
            *branches = result;
        }
        self.owners = owners;
        changed
    }

    fn clone_branch(&mut self, owner: &str, branch: &Branch, variant: usize) -> Branch {
        let mut mapping = HashMap::new();
        let mut allocated = Vec::with_capacity(branch.allocated.len());
        for (snippet_var, var) in &branch.allocated {
            let fresh = self.fresh_var();
            mapping.insert(var.clone(), fresh.clone());
            self.record(
                RewriteKey {
                    rule: branch.rule,
                    owner: owner.to_string(),
                    snippet_var: snippet_var.clone(),
                    variant,
                },
                fresh.clone(),
            );
            allocated.push((snippet_var.clone(), fresh));
        }
        Branch {
            rule: branch.rule,
            nodes: branch.nodes.iter().map(|n| n.rename(&mapping)).collect(),
            allocated,
            shared: branch.shared.clone(),
            variant,
        }
    }
}

/// Distinct type combinations of a branch's varying, untyped variables
fn varying_combinations(branch: &Branch, solutions: &[Solution]) -> BTreeSet<Vec<(String, String)>> {
    let conjunction = Node::and(branch.nodes.clone());
    let candidates: Vec<&str> = branch
        .allocated
        .iter()
        .map(|(_, v)| v.as_str())
        .filter(|v| !conjunction.has_type_restriction(v))
        .collect();

    let varying: Vec<&str> = candidates
        .into_iter()
        .filter(|v| {
            let types: BTreeSet<&String> = solutions.iter().filter_map(|s| s.get(*v)).collect();
            types.len() > 1
        })
        .collect();
    if varying.is_empty() {
        return BTreeSet::new();
    }

    solutions
        .iter()
        .filter_map(|s| {
            varying
                .iter()
                .map(|v| s.get(*v).map(|t| (v.to_string(), t.clone())))
                .collect::<Option<Vec<_>>>()
        })
        .collect()
}
