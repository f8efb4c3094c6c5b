//! Read access rules for a query
//!
//! For every variable outside negations, each of its possible entity types
//! is either granted to one of the user's groups, guarded by rule
//! expressions, or denied. Denied types are pruned from the solutions; the
//! other two become rules handed to the rewriter:
//!
//! - granted types: `X is IN(T1, T2)`
//! - guarded types: each expression, prefixed with `X is T` when the
//!   variable can have several types

use cairn_core::{Action, CairnError, CairnResult, Node, Params, RuleExpression, Schema, Select, FINAL_TYPES};
use cairn_security::{var_types, RuleFragment, SecurityRewriter, Solution};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Variables whose read access is checked
pub fn checked_variables(select: &Select) -> BTreeSet<String> {
    let mut out: BTreeSet<String> = select.selection.iter().cloned().collect();
    if let Some(node) = &select.restriction {
        collect_positive(node, &mut out);
    }
    out
}

fn collect_positive(node: &Node, out: &mut BTreeSet<String>) {
    match node {
        Node::Not(_) => {}
        Node::And(nodes) | Node::Or(nodes) => nodes.iter().for_each(|n| collect_positive(n, out)),
        Node::Exists(inner) => collect_positive(inner, out),
        other => other.collect_variables(out),
    }
}

/// Rule fragments and pruned solutions for a user
#[derive(Debug, Clone)]
pub struct ReadRules {
    /// One fragment per variable needing a check
    pub fragments: Vec<RuleFragment>,
    /// Solutions left after removing denied types
    pub solutions: Vec<Solution>,
}

/// Select the read rules of `select` for a user in `groups`
///
/// # Errors
///
/// `Unauthorized` when every solution is denied.
pub fn read_rules(
    schema: &dyn Schema,
    groups: &BTreeSet<String>,
    select: &Select,
    solutions: &[Solution],
) -> CairnResult<ReadRules> {
    let mut kept = solutions.to_vec();
    let mut fragments = Vec::new();

    for var in checked_variables(select) {
        let types: Vec<String> = var_types(&kept, &var)
            .into_iter()
            .filter(|t| !FINAL_TYPES.contains(&t.as_str()))
            .collect();
        if types.is_empty() {
            continue;
        }

        let mut granted: Vec<String> = Vec::new();
        let mut guarded: Vec<(String, Vec<RuleExpression>)> = Vec::new();
        let mut denied: BTreeSet<String> = BTreeSet::new();
        for etype in types {
            match schema.permissions(&etype, Action::Read) {
                Some(perms) if perms.grants_group(groups) => granted.push(etype),
                Some(perms) if !perms.expressions.is_empty() => guarded.push((etype, perms.expressions)),
                _ => {
                    denied.insert(etype);
                }
            }
        }

        if !denied.is_empty() {
            trace!(target: "cairn::security", var = %var, denied = ?denied, "Pruning denied types");
            kept.retain(|s| s.get(&var).map_or(true, |t| !denied.contains(t)));
            if kept.is_empty() {
                return Err(CairnError::unauthorized(format!("read access to {} is denied", var)));
            }
        }
        if guarded.is_empty() && denied.is_empty() {
            continue;
        }

        let ambiguous = granted.len() + guarded.len() > 1;
        let mut rules = Vec::new();
        if !granted.is_empty() {
            rules.push(RuleExpression::new(Node::is_in("X", &granted)));
        }
        for (etype, expressions) in guarded {
            for expr in expressions {
                let restriction = if ambiguous {
                    Node::and(vec![Node::is(&expr.main_var, &etype), expr.restriction])
                } else {
                    expr.restriction
                };
                rules.push(RuleExpression {
                    main_var: expr.main_var,
                    restriction,
                });
            }
        }
        fragments.push(RuleFragment::var(&var, rules));
    }

    Ok(ReadRules {
        fragments,
        solutions: kept,
    })
}

/// Rewrite `select` so it only returns what a user in `groups` may read
pub fn rewrite_for_read(
    rewriter: &SecurityRewriter<'_>,
    schema: &dyn Schema,
    groups: &BTreeSet<String>,
    select: &Select,
    params: &Params,
    solutions: &[Solution],
) -> CairnResult<Select> {
    let rules = read_rules(schema, groups, select, solutions)?;
    if rules.fragments.is_empty() {
        return Ok(select.clone());
    }
    let out = rewriter.rewrite(select, &rules.fragments, &rules.solutions, params)?;
    debug!(target: "cairn::security", query = %out.select, fragments = rules.fragments.len(), "Query rewritten for read");
    Ok(out.select)
}
