//! Access control for Cairn
//!
//! This crate provides:
//! - [`SolutionInference`]: type-solution inference over query trees
//! - [`SecurityRewriter`]: splices permission rules into queries
//! - [`SecurityFlag`] / [`SecurityFrame`]: the nested read/write switches
//!   transactions use to turn checks off for internal work

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod rewriter;
pub mod solutions;
pub mod toggle;

pub use context::{Branch, RewriteContext, RewriteKey};
pub use rewriter::{Rewritten, RuleFragment, RuleTarget, SecurityRewriter};
pub use solutions::{project, var_types, EtypeLookup, Solution, SolutionInference};
pub use toggle::{AccessKind, SecurityFlag, SecurityFrame};
