//! Security-driven query rewriting
//!
//! Given a query and, per variable (or literal eid), the permission rules a
//! user must satisfy, the rewriter splices each rule into the query as an
//! `EXISTS(...)` clause. Several rules for the same owner are ORed.
//!
//! ## Guarantees
//!
//! - The solutions of the rewritten query project into the original ones
//! - Every original solution whose owner types are covered by an inserted
//!   rule stays derivable; a splice that breaks this is abandoned
//! - Ambiguity introduced by rule variables is resolved into typed variants
//!
//! ## Sharing
//!
//! A rule relation `X r Y` is folded onto an existing query relation
//! `X r Z` when `r` is single-valued on the `X` side for every type pair the
//! query allows. `Y` is then read as `Z` and no duplicate relation is added.
//! When a shared splice does not check out, the rule is retried unshared.

use crate::context::{Branch, RewriteContext, RewriteKey};
use crate::solutions::{project, var_types, EtypeLookup, Solution, SolutionInference};
use cairn_core::{
    CairnError, CairnResult, Eid, Node, Params, Relation, RuleExpression, Schema, Select, Term,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, trace};

/// Bound on variant splitting rounds
const MAX_VARIANT_ROUNDS: usize = 8;

/// What a set of rules is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    /// A query variable
    Var(String),
    /// A literal entity id appearing in the query
    Eid(Eid),
}

impl RuleTarget {
    /// Name under which the target's branches are tracked
    pub fn owner(&self) -> String {
        match self {
            RuleTarget::Var(v) => v.clone(),
            RuleTarget::Eid(eid) => format!("#{}", eid),
        }
    }
}

impl fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleTarget::Var(v) => f.write_str(v),
            RuleTarget::Eid(eid) => write!(f, "entity {}", eid),
        }
    }
}

/// Ordered rules for one target
#[derive(Debug, Clone)]
pub struct RuleFragment {
    /// Variable or eid the rules restrict
    pub target: RuleTarget,
    /// Candidate rules, tried in order
    pub rules: Vec<RuleExpression>,
}

impl RuleFragment {
    /// Rules about a query variable
    pub fn var(var: &str, rules: Vec<RuleExpression>) -> Self {
        Self {
            target: RuleTarget::Var(var.to_string()),
            rules,
        }
    }

    /// Rules about a literal eid
    pub fn eid(eid: Eid, rules: Vec<RuleExpression>) -> Self {
        Self {
            target: RuleTarget::Eid(eid),
            rules,
        }
    }
}

/// Result of a rewrite
#[derive(Debug, Clone)]
pub struct Rewritten {
    /// The query with rules spliced in
    pub select: Select,
    /// Solutions of the rewritten query
    pub solutions: Vec<Solution>,
}

/// Outcome of one splice attempt
#[derive(Debug)]
enum SpliceOutcome {
    Inserted,
    Unsupported(&'static str),
}

/// Rewrites queries against a schema
pub struct SecurityRewriter<'a> {
    schema: &'a dyn Schema,
    lookup: EtypeLookup<'a>,
}

impl<'a> SecurityRewriter<'a> {
    /// Create a rewriter; `lookup` gives the type of literal eids
    pub fn new(schema: &'a dyn Schema, lookup: EtypeLookup<'a>) -> Self {
        Self { schema, lookup }
    }

    /// Type solutions of a query
    pub fn solutions(&self, select: &Select, params: &Params) -> Vec<Solution> {
        SolutionInference::new(self.schema, params, self.lookup).solve(select)
    }

    /// Splice `fragments` into `select`
    ///
    /// `solutions` are the caller's solutions for `select`.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when a target has no rule that applies to its types or
    /// whose insertion keeps the query consistent.
    pub fn rewrite(
        &self,
        select: &Select,
        fragments: &[RuleFragment],
        solutions: &[Solution],
        params: &Params,
    ) -> CairnResult<Rewritten> {
        let mut ctx = RewriteContext::new(select, solutions.to_vec());

        for (fi, fragment) in fragments.iter().enumerate() {
            let owner = fragment.target.owner();
            let owner_types = match &fragment.target {
                RuleTarget::Var(v) => var_types(&ctx.solutions, v),
                RuleTarget::Eid(eid) => (self.lookup)(*eid).into_iter().collect(),
            };

            for (ri, rule) in fragment.rules.iter().enumerate() {
                let rule_types = self.applicable_types(rule, &owner_types, params);
                if rule_types.is_empty() {
                    trace!(target: "cairn::security", owner = %owner, rule = %rule, "Rule does not apply");
                    continue;
                }
                let mut outcome = SpliceOutcome::Unsupported("not attempted");
                for share in [true, false] {
                    let branch = self.build_branch(&mut ctx, (fi, ri), &fragment.target, rule, select, share);
                    let retry = share && !branch.shared.is_empty();
                    outcome = self.try_insert(&mut ctx, select, &owner, branch, &fragment.target, &rule_types, params);
                    if matches!(outcome, SpliceOutcome::Inserted) || !retry {
                        break;
                    }
                }
                match outcome {
                    SpliceOutcome::Inserted => {
                        debug!(target: "cairn::security", owner = %owner, rule = %rule, "Rule inserted")
                    }
                    SpliceOutcome::Unsupported(reason) => {
                        debug!(target: "cairn::security", owner = %owner, rule = %rule, reason, "Rule skipped")
                    }
                }
            }

            if ctx.branches(&owner).is_empty() {
                return Err(CairnError::unauthorized(format!(
                    "no applicable rule for {}",
                    fragment.target
                )));
            }
        }

        let mut current = self.solutions(&ctx.materialize(select), params);
        for _ in 0..MAX_VARIANT_ROUNDS {
            if current.len() <= project(&current, &select.variables()).len() {
                break;
            }
            if !ctx.split_variants(&current) {
                break;
            }
            current = self.solutions(&ctx.materialize(select), params);
        }

        let orig_vars = select.variables();
        let original: BTreeSet<Solution> = ctx.original.iter().cloned().collect();
        current.retain(|s| {
            let projected: Solution = s
                .iter()
                .filter(|(k, _)| orig_vars.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            original.contains(&projected)
        });

        let rewritten = ctx.materialize(select);
        debug!(target: "cairn::security", query = %rewritten, solutions = current.len(), "Query rewritten");
        Ok(Rewritten {
            select: rewritten,
            solutions: current,
        })
    }

    /// Owner types for which the rule is satisfiable
    fn applicable_types(&self, rule: &RuleExpression, owner_types: &BTreeSet<String>, params: &Params) -> BTreeSet<String> {
        owner_types
            .iter()
            .filter(|etype| {
                let probe = Select::any(
                    &[rule.main_var.as_str()],
                    Node::and(vec![Node::is(&rule.main_var, etype), rule.restriction.clone()]),
                );
                !self.solutions(&probe, params).is_empty()
            })
            .cloned()
            .collect()
    }

    fn build_branch(
        &self,
        ctx: &mut RewriteContext,
        rule_idx: (usize, usize),
        target: &RuleTarget,
        rule: &RuleExpression,
        select: &Select,
        share: bool,
    ) -> Branch {
        let owner = target.owner();
        let mut mapping: HashMap<String, String> = HashMap::new();
        let mut nodes = Vec::new();

        let main = match target {
            RuleTarget::Var(v) => v.clone(),
            RuleTarget::Eid(eid) => {
                let v = ctx.fresh_var();
                nodes.push(Node::eid(&v, *eid));
                v
            }
        };
        mapping.insert(rule.main_var.clone(), main.clone());

        let mut kept = Vec::new();
        let mut shared = Vec::new();
        for conjunct in rule.restriction.conjuncts() {
            if let (true, RuleTarget::Var(owner_var), Node::Relation(rel)) = (share, target, conjunct) {
                if let Some((snippet_var, query_var)) =
                    self.shareable(ctx, select, owner_var, &rule.main_var, rel, &mapping)
                {
                    trace!(target: "cairn::security", relation = %rel.rtype, var = %query_var, "Sharing relation");
                    mapping.insert(snippet_var.clone(), query_var.clone());
                    shared.push((snippet_var, query_var));
                    continue;
                }
            }
            kept.push(conjunct.clone());
        }

        let mut allocated = Vec::new();
        for var in rule.restriction.variables() {
            if mapping.contains_key(&var) {
                continue;
            }
            let fresh = ctx.fresh_var();
            ctx.record(
                RewriteKey {
                    rule: rule_idx,
                    owner: owner.clone(),
                    snippet_var: var.clone(),
                    variant: 0,
                },
                fresh.clone(),
            );
            mapping.insert(var.clone(), fresh.clone());
            allocated.push((var, fresh));
        }
        for (snippet_var, query_var) in &shared {
            ctx.record(
                RewriteKey {
                    rule: rule_idx,
                    owner: owner.clone(),
                    snippet_var: snippet_var.clone(),
                    variant: 0,
                },
                query_var.clone(),
            );
        }

        nodes.extend(kept.iter().map(|n| n.rename(&mapping)));
        Branch {
            rule: rule_idx,
            nodes,
            allocated,
            shared,
            variant: 0,
        }
    }

    /// Query variable a rule relation can be folded onto
    ///
    /// Returns `(snippet variable, query variable)`.
    fn shareable(
        &self,
        ctx: &RewriteContext,
        select: &Select,
        owner: &str,
        main_var: &str,
        rel: &Relation,
        mapping: &HashMap<String, String>,
    ) -> Option<(String, String)> {
        let restriction = select.restriction.as_ref()?;
        let owner_types = var_types(&ctx.solutions, owner);

        // X r Y in the rule against X r Z in the query
        if rel.subject == main_var {
            let snippet_var = rel.object.as_var()?;
            if snippet_var == main_var || mapping.contains_key(snippet_var) {
                return None;
            }
            for conjunct in restriction.conjuncts() {
                if let Node::Relation(q) = conjunct {
                    if q.subject == owner && q.rtype == rel.rtype {
                        if let Term::Var(z) = &q.object {
                            if self.single_valued(&rel.rtype, &owner_types, &var_types(&ctx.solutions, z), true) {
                                return Some((snippet_var.to_string(), z.clone()));
                            }
                        }
                    }
                }
            }
        }

        // Y r X in the rule against Z r X in the query
        if rel.object.as_var() == Some(main_var) && rel.subject != main_var {
            if mapping.contains_key(&rel.subject) {
                return None;
            }
            for conjunct in restriction.conjuncts() {
                if let Node::Relation(q) = conjunct {
                    if q.object.as_var() == Some(owner) && q.rtype == rel.rtype && q.subject != owner {
                        let z_types = var_types(&ctx.solutions, &q.subject);
                        if self.single_valued(&rel.rtype, &z_types, &owner_types, false) {
                            return Some((rel.subject.clone(), q.subject.clone()));
                        }
                    }
                }
            }
        }
        None
    }

    /// Whether `rtype` is single-valued on one side for every type pair
    ///
    /// With `on_subject`, the subject may have at most one object; otherwise
    /// the object may have at most one subject.
    fn single_valued(
        &self,
        rtype: &str,
        subjects: &BTreeSet<String>,
        objects: &BTreeSet<String>,
        on_subject: bool,
    ) -> bool {
        let mut seen = false;
        for s in subjects {
            for o in objects {
                if let Some(rdef) = self.schema.rdef(rtype, s, o) {
                    seen = true;
                    let card = if on_subject {
                        rdef.subject_cardinality
                    } else {
                        rdef.object_cardinality
                    };
                    if !card.is_single() {
                        return false;
                    }
                }
            }
        }
        seen
    }

    #[allow(clippy::too_many_arguments)]
    fn try_insert(
        &self,
        ctx: &mut RewriteContext,
        select: &Select,
        owner: &str,
        branch: Branch,
        target: &RuleTarget,
        rule_types: &BTreeSet<String>,
        params: &Params,
    ) -> SpliceOutcome {
        let mut candidate = ctx.clone();
        let covered = if branch.is_trivial() {
            None
        } else {
            match target {
                RuleTarget::Var(_) => Some(rule_types.clone()),
                RuleTarget::Eid(_) => None,
            }
        };
        candidate.push_branch(owner, branch, covered);

        let tree = candidate.materialize(select);
        let solutions = self.solutions(&tree, params);
        if solutions.is_empty() {
            return SpliceOutcome::Unsupported("no solution left");
        }

        let orig_vars = select.variables();
        let projected = project(&solutions, &orig_vars);
        let original: BTreeSet<Solution> = candidate.original.iter().cloned().collect();
        if !projected.is_subset(&original) {
            return SpliceOutcome::Unsupported("solutions outside the original query");
        }
        if !candidate.expected().is_subset(&projected) {
            return SpliceOutcome::Unsupported("original solutions no longer derivable");
        }

        candidate.solutions = solutions;
        *ctx = candidate;
        SpliceOutcome::Inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{MemorySchema, Value};

    fn schema() -> MemorySchema {
        MemorySchema::builder()
            .relation("in_folder", "Doc", "Folder", "?*")
            .relation("owned_by", "Doc", "User", "**")
            .relation("owned_by", "Folder", "User", "**")
            .relation("tagged", "Doc", "Tag", "**")
            .build()
    }

    fn lookup(eid: Eid) -> Option<String> {
        match eid.0 {
            1 => Some("User".to_string()),
            5 => Some("Doc".to_string()),
            _ => None,
        }
    }

    fn params() -> Params {
        let mut p = Params::new();
        p.insert("u".to_string(), Value::Eid(Eid(1)));
        p
    }

    fn owned_rule() -> RuleExpression {
        RuleExpression::new(Node::relation("X", "owned_by", Term::Param("u".to_string())))
    }

    #[test]
    fn test_single_rule_becomes_exists() {
        let schema = schema();
        let rw = SecurityRewriter::new(&schema, &lookup);
        let q = Select::any(&["X"], Node::is("X", "Doc"));
        let sols = rw.solutions(&q, &params());
        let out = rw
            .rewrite(&q, &[RuleFragment::var("X", vec![owned_rule()])], &sols, &params())
            .unwrap();
        assert_eq!(out.select.to_string(), "Any X WHERE X is Doc, EXISTS(X owned_by %(u)s)");
        assert_eq!(out.solutions, sols);
    }

    #[test]
    fn test_no_rule_is_unauthorized() {
        let schema = schema();
        let rw = SecurityRewriter::new(&schema, &lookup);
        let q = Select::any(&["X"], Node::is("X", "Doc"));
        let sols = rw.solutions(&q, &params());
        let err = rw
            .rewrite(&q, &[RuleFragment::var("X", vec![])], &sols, &params())
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[test]
    fn test_inapplicable_rule_is_unauthorized() {
        let schema = schema();
        let rw = SecurityRewriter::new(&schema, &lookup);
        let q = Select::any(&["X"], Node::is("X", "Folder"));
        let sols = rw.solutions(&q, &params());
        // Folders are never tagged
        let rule = RuleExpression::new(Node::rel("X", "tagged", "T"));
        let err = rw
            .rewrite(&q, &[RuleFragment::var("X", vec![rule])], &sols, &params())
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[test]
    fn test_two_rules_are_ored() {
        let schema = schema();
        let rw = SecurityRewriter::new(&schema, &lookup);
        let q = Select::any(&["X"], Node::is("X", "Doc"));
        let sols = rw.solutions(&q, &params());
        let rules = vec![owned_rule(), RuleExpression::new(Node::rel("X", "tagged", "T"))];
        let out = rw
            .rewrite(&q, &[RuleFragment::var("X", rules)], &sols, &params())
            .unwrap();
        assert_eq!(
            out.select.to_string(),
            "Any X WHERE X is Doc, (EXISTS(X owned_by %(u)s)) OR (EXISTS(X tagged S0))"
        );
    }

    #[test]
    fn test_single_valued_relation_is_shared() {
        let schema = schema();
        let rw = SecurityRewriter::new(&schema, &lookup);
        let q = Select::any(&["X", "F"], Node::rel("X", "in_folder", "F"));
        let sols = rw.solutions(&q, &params());
        let rule = RuleExpression::new(Node::and(vec![
            Node::rel("X", "in_folder", "P"),
            Node::relation("P", "owned_by", Term::Param("u".to_string())),
        ]));
        let out = rw
            .rewrite(&q, &[RuleFragment::var("X", vec![rule])], &sols, &params())
            .unwrap();
        assert_eq!(
            out.select.to_string(),
            "Any X, F WHERE X in_folder F, EXISTS(F owned_by %(u)s)"
        );
    }

    #[test]
    fn test_multi_valued_relation_is_not_shared() {
        let schema = schema();
        let rw = SecurityRewriter::new(&schema, &lookup);
        let q = Select::any(&["X", "T"], Node::rel("X", "tagged", "T"));
        let sols = rw.solutions(&q, &params());
        let rule = RuleExpression::new(Node::rel("X", "tagged", "P"));
        let out = rw
            .rewrite(&q, &[RuleFragment::var("X", vec![rule])], &sols, &params())
            .unwrap();
        assert_eq!(
            out.select.to_string(),
            "Any X, T WHERE X tagged T, EXISTS(X tagged S0)"
        );
    }

    #[test]
    fn test_eid_target_anchors_branch() {
        let schema = schema();
        let rw = SecurityRewriter::new(&schema, &lookup);
        let q = Select::any(
            &["U"],
            Node::and(vec![Node::rel("X", "owned_by", "U"), Node::eid("X", Eid(5))]),
        );
        let sols = rw.solutions(&q, &params());
        let out = rw
            .rewrite(&q, &[RuleFragment::eid(Eid(5), vec![owned_rule()])], &sols, &params())
            .unwrap();
        assert!(out.select.to_string().contains("EXISTS(S0 eid 5, S0 owned_by %(u)s)"));
        let projected = project(&out.solutions, &q.variables());
        assert_eq!(projected, sols.into_iter().collect());
    }
}
