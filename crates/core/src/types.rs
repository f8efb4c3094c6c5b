//! Identifier types
//!
//! - `Eid`: global entity identifier, unique across all sources
//! - `TxnId`: transaction identifier, unique per repository process
//! - `SessionId`: random session token
//! - `SourceUri`: name under which a source is registered
//! - `ExtId`: identifier of an entity inside its source

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Global entity identifier
///
/// Negative values are reserved: an extid mapped to a negative eid marks an
/// entity that moved to another source and must be treated as handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Eid(pub i64);

impl Eid {
    /// Whether this id follows the "moved to another source" convention
    pub fn is_moved(&self) -> bool {
        self.0 < 0
    }

    /// The id as registered before the move, for negative ids
    pub fn unmoved(&self) -> Eid {
        Eid(self.0.abs())
    }

    /// Mark this id as moved away
    pub fn moved(&self) -> Eid {
        Eid(-self.0.abs())
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Eid {
    fn from(v: i64) -> Self {
        Eid(v)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session id
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    /// Parse from the hyphenated string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(SessionId)
    }

    /// Underlying uuid
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name under which a source is registered
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceUri(String);

/// Uri of the system source, always present
pub const SYSTEM_SOURCE: &str = "system";

impl SourceUri {
    /// Create a source uri
    pub fn new(uri: impl Into<String>) -> Self {
        SourceUri(uri.into())
    }

    /// The distinguished system source
    pub fn system() -> Self {
        SourceUri(SYSTEM_SOURCE.to_string())
    }

    /// Whether this is the system source
    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_SOURCE
    }

    /// String form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceUri {
    fn from(s: &str) -> Self {
        SourceUri::new(s)
    }
}

/// Identifier of an entity inside its own source
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtId(pub String);

impl ExtId {
    /// Create an external id
    pub fn new(id: impl Into<String>) -> Self {
        ExtId(id.into())
    }

    /// String form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an entity lives: its type, its source and its id inside that source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    /// Entity type name
    pub etype: String,
    /// Source-local identifier, `None` for entities native to the system source
    pub extid: Option<ExtId>,
    /// Source holding the entity
    pub source: SourceUri,
}

impl EntityInfo {
    /// Entity stored in the system source
    pub fn system(etype: impl Into<String>) -> Self {
        Self {
            etype: etype.into(),
            extid: None,
            source: SourceUri::system(),
        }
    }
}
