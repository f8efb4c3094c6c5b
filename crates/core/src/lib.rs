//! Core types and traits for Cairn
//!
//! This crate defines the foundational types used throughout the system:
//! - Identifiers: `Eid`, `TxnId`, `SessionId`, `SourceUri`, `ExtId`
//! - Value: attribute and result values
//! - Syntax: the query tree handed over by the parser library
//! - Schema: relation cardinalities and permission rules
//! - Traits: `Source`, `SourceConnection`, `QueryParser`
//! - Error: the error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod schema;
pub mod syntax;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{CairnError, CairnResult};
pub use schema::{
    Action, AttributeDef, Cardinality, CompositeRole, MemorySchema, Permissions, RelationDef,
    RuleExpression, Schema, SchemaBuilder, FINAL_TYPES,
};
pub use syntax::{Node, Params, Relation, Select, Term, EID_RTYPE};
pub use traits::{Attributes, Credentials, QueryParser, Row, Source, SourceConnection};
pub use types::{Eid, EntityInfo, ExtId, SessionId, SourceUri, TxnId, SYSTEM_SOURCE};
pub use value::Value;
