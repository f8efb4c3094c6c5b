//! Storage slots
//!
//! A `Slot` wraps one physical storage connection. Slots are created by the
//! pool at startup and are move-only: whoever holds the `Slot` value owns the
//! connection, so a slot can never be held by two transactions at once and
//! returning it to the pool consumes it.

use cairn_core::CairnResult;
use std::fmt;

/// Identifier of a slot inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Physical connection carried by a slot
pub trait SlotConnection: Send {
    /// Make the current unit of work durable
    fn commit(&mut self) -> CairnResult<()>;

    /// Discard the current unit of work
    fn rollback(&mut self) -> CairnResult<()>;

    /// Hard reset, used when the slot is reclaimed from its owner
    fn reset(&mut self) -> CairnResult<()>;
}

/// Pooled handle to one physical storage connection
pub struct Slot<C> {
    id: SlotId,
    conn: C,
}

impl<C> Slot<C> {
    pub(crate) fn new(id: SlotId, conn: C) -> Self {
        Self { id, conn }
    }

    /// Identifier of this slot
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Borrow the connection
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Mutably borrow the connection
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: SlotConnection> Slot<C> {
    /// Commit the work accumulated on this slot
    pub fn commit(&mut self) -> CairnResult<()> {
        self.conn.commit()
    }

    /// Roll back the work accumulated on this slot
    pub fn rollback(&mut self) -> CairnResult<()> {
        self.conn.rollback()
    }

    /// Hard reset of the underlying connection
    pub fn reset(&mut self) -> CairnResult<()> {
        self.conn.reset()
    }
}

impl<C> fmt::Debug for Slot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("id", &self.id).finish()
    }
}
