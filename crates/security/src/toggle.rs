//! Read/write security switches
//!
//! Each transaction carries a stack of `SecurityFrame`s. A frame holds one
//! three-valued flag per access kind; `Default` means "never touched" and is
//! effective as on.

use serde::{Deserialize, Serialize};

/// Which security check a flag controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    /// Query rewriting on reads
    Read,
    /// Permission checks on mutations
    Write,
}

/// Three-valued security flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityFlag {
    /// Explicitly enabled
    On,
    /// Explicitly disabled
    Off,
    /// Never touched; behaves as enabled
    #[default]
    Default,
}

impl SecurityFlag {
    /// Effective value
    pub fn is_enabled(self) -> bool {
        !matches!(self, SecurityFlag::Off)
    }

    /// Flag for an explicit boolean
    pub fn from_bool(enabled: bool) -> Self {
        if enabled {
            SecurityFlag::On
        } else {
            SecurityFlag::Off
        }
    }
}

/// One level of the security stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityFrame {
    /// Read flag
    pub read: SecurityFlag,
    /// Write flag
    pub write: SecurityFlag,
    /// Read was switched away from `Default` by this frame
    pub read_from_default: bool,
    /// Write was switched away from `Default` by this frame
    pub write_from_default: bool,
}

impl SecurityFrame {
    /// Frame derived from `self` with the given overrides; `None` keeps a flag
    pub fn child(&self, read: Option<bool>, write: Option<bool>) -> Self {
        let mut next = SecurityFrame {
            read: self.read,
            write: self.write,
            read_from_default: self.read_from_default,
            write_from_default: self.write_from_default,
        };
        if let Some(enabled) = read {
            next.read_from_default = self.read == SecurityFlag::Default;
            next.read = SecurityFlag::from_bool(enabled);
        }
        if let Some(enabled) = write {
            next.write_from_default = self.write == SecurityFlag::Default;
            next.write = SecurityFlag::from_bool(enabled);
        }
        next
    }

    /// Flag for `kind`
    pub fn flag(&self, kind: AccessKind) -> SecurityFlag {
        match kind {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
        }
    }

    /// Whether `kind` left `Default` somewhere up the stack
    pub fn from_default(&self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => self.read_from_default,
            AccessKind::Write => self.write_from_default,
        }
    }
}
