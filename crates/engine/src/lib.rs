//! Transactional engine for Cairn
//!
//! This crate ties the lower layers together:
//! - Repository: sources, slot pool, identity cache, hooks and sessions
//! - Session: authenticated handle with shared data and a default transaction
//! - Transaction: commit/rollback state machine, operations, hook gating,
//!   security switches and entity mutations
//! - Access: read-rule selection feeding the security rewriter
//! - Sweeper: background closing of idle sessions
//!
//! The engine is the only component that knows about:
//! - Routing queries and mutations to sources
//! - Which slot a transaction holds and how to take it back

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod config;
pub mod hooks;
pub mod identity;
pub mod repository;
pub mod session;
pub mod source;
pub mod sweeper;
pub mod transaction;

pub use config::{RepositoryConfig, CONFIG_FILE_NAME};
pub use hooks::{Hook, HookCallback, HookContext, HookEvent, HookRegistry};
pub use identity::{Allocation, EntityIndex, IdentityRegistry, SourceIndex};
pub use repository::{Repository, RepositoryBuilder, ShutdownReport};
pub use session::{Session, SessionInfo, UserIdentity};
pub use source::{ConnectionSet, MemoryConnection, MemorySource, SourceDef, SourceKind, SourceRegistry};
pub use sweeper::SessionSweeper;
pub use transaction::{
    CheckEntityPermissionOp, CommitState, DataOperation, ForgetNewEntitiesOp, HooksGuard, HooksMode, Operation,
    SecurityGuard, SlotCell, Transaction, TxnMode,
};
