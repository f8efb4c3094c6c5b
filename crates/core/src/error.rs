//! Error types for Cairn
//!
//! This module defines the error taxonomy shared by every layer of the
//! transactional core. We use `thiserror` for automatic `Display` and
//! `Error` trait implementations.
//!
//! ## Propagation
//!
//! - Resource, authentication, validation and authorization errors are
//!   always surfaced to the caller synchronously.
//! - Operation callback failures during rollback or postcommit are logged by
//!   the engine and never reach this type.
//! - Rewrite infeasibility stays inside `cairn-security` and is not an error.

use crate::types::{Eid, SourceUri, TxnId};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Cairn operations
pub type CairnResult<T> = std::result::Result<T, CairnError>;

/// Error types for the Cairn core
#[derive(Debug, Error)]
pub enum CairnError {
    /// No storage slot became free before the timeout elapsed.
    ///
    /// Transient: the caller may retry or back off. Pool state is intact.
    #[error("No storage slot available within {timeout:?}")]
    SlotUnavailable {
        /// How long the caller waited
        timeout: Duration,
    },

    /// Credentials rejected by every enabled source
    #[error("Authentication failed for {login:?}")]
    Authentication {
        /// Login that was rejected
        login: String,
    },

    /// Data failed schema-level constraints
    #[error("Validation failed{}: {}", eid_suffix(.eid), format_errors(.errors))]
    Validation {
        /// Entity being validated, when it already has an id
        eid: Option<Eid>,
        /// Attribute name -> message
        errors: BTreeMap<String, String>,
    },

    /// No applicable permission rule for the current user
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// What was refused
        message: String,
    },

    /// Lookup of a nonexistent or stale entity id
    #[error("Unknown entity id {0}")]
    UnknownId(Eid),

    /// Operation attempted on an already-closed transaction
    #[error("Transaction {0} is closed")]
    ClosedTransaction(TxnId),

    /// Caller misuse of the API
    #[error("Programming error: {0}")]
    Programming(String),

    /// Query-level refusal, e.g. commit of an uncommitable transaction
    #[error("Query error: {0}")]
    Query(String),

    /// No source registered under this uri
    #[error("Unknown source {0}")]
    UnknownSource(SourceUri),

    /// A source backend reported a failure
    #[error("Source {uri} failed: {message}")]
    Source {
        /// Source that failed
        uri: SourceUri,
        /// Backend message
        message: String,
    },

    /// An operation callback failed during precommit
    #[error("Operation {name} failed: {message}")]
    Operation {
        /// Operation name
        name: String,
        /// Failure description
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The repository is shutting down
    #[error("Repository is shutting down")]
    Shutdown,

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

fn eid_suffix(eid: &Option<Eid>) -> String {
    match eid {
        Some(eid) => format!(" for {}", eid),
        None => String::new(),
    }
}

fn format_errors(errors: &BTreeMap<String, String>) -> String {
    errors
        .iter()
        .map(|(attr, msg)| format!("{}: {}", attr, msg))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CairnError {
    /// Build a validation error for a single attribute
    pub fn validation(eid: Option<Eid>, attr: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(attr.into(), message.into());
        CairnError::Validation { eid, errors }
    }

    /// Build an authorization error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        CairnError::Unauthorized {
            message: message.into(),
        }
    }

    /// Build a programming error
    pub fn programming(message: impl Into<String>) -> Self {
        CairnError::Programming(message.into())
    }

    /// Build a source failure
    pub fn source(uri: &SourceUri, message: impl Into<String>) -> Self {
        CairnError::Source {
            uri: uri.clone(),
            message: message.into(),
        }
    }

    /// Build an invalid operation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        CairnError::InvalidOperation(message.into())
    }

    /// Whether the caller may simply retry later
    pub fn is_transient(&self) -> bool {
        matches!(self, CairnError::SlotUnavailable { .. })
    }

    /// Whether this is an authorization refusal
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CairnError::Unauthorized { .. })
    }

    /// Whether this is a schema validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, CairnError::Validation { .. })
    }

    /// Whether the error signals caller misuse
    pub fn is_programming(&self) -> bool {
        matches!(
            self,
            CairnError::ClosedTransaction(_) | CairnError::Programming(_)
        )
    }
}
