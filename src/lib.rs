//! Cairn - transactional core of a multi-source relation query engine
//!
//! Cairn sits in front of one or more storage backends ("sources") and gives
//! client code a single entity/relation graph with:
//! - a bounded pool of storage slots shared fairly by concurrent sessions
//! - transactions with pre/post-commit operations and hook gating
//! - read access control by query rewriting
//! - a cache of entity identities across sources
//!
//! # Quick Start
//!
//! ```ignore
//! use cairndb::{Credentials, MemorySchema, Node, Params, Repository, Select};
//! use std::sync::Arc;
//!
//! let schema = MemorySchema::builder()
//!     .attribute("Doc", "title", "String", true)
//!     .build();
//! let repo = Repository::builder(Arc::new(schema)).open()?;
//! let session = repo.connect("admin", &Credentials::Password("secret".into()))?;
//!
//! let docs = Select::any(&["X"], Node::is("X", "Doc"));
//! let rows = session.execute(&docs, &Params::new())?;
//! ```
//!
//! # Architecture
//!
//! - `cairn-core`: identifiers, values, query tree, schema and source traits
//! - `cairn-concurrency`: slot pool and slot tracker
//! - `cairn-security`: the query rewriter
//! - `cairn-engine`: repository, sessions and transactions

pub use cairn_concurrency::{PoolStats, Slot, SlotConnection, SlotId, SlotPool, SlotTracker};
pub use cairn_core::*;
pub use cairn_engine::*;
pub use cairn_security::{AccessKind, RewriteContext, Rewritten, RuleFragment, RuleTarget, SecurityFlag, SecurityRewriter};
