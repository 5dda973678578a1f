//! Core identifiers and lock-level types shared across the manager.
//!
//! `LockId` names a cluster-wide lock; `HolderId` names one logical
//! execution context competing for locks on this node; `SessionId` is the
//! connection generation used to fence protocol messages addressed to a
//! superseded session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster-wide name of a lock.
///
/// Opaque, comparable, and stable; typically a string key derived from the
/// shared object the lock guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for LockId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stable identity of one logical execution context.
///
/// Supplied exclusively by the injected [`HolderIdentityResolver`]
/// (`crate::gateway`); never derived from a thread's self-reported
/// identity, which may be overridden or colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HolderId(u64);

impl HolderId {
    /// Reserved identity naming the client process itself. Greedy lease
    /// awards from the server are addressed to this holder.
    pub const LEASE: HolderId = HolderId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::LEASE {
            f.write_str("lease")
        } else {
            write!(f, "holder-{}", self.0)
        }
    }
}

/// Connection generation, incremented on every reconnect handshake.
///
/// Inbound awards and recalls carry the session they were issued under;
/// anything stamped with a superseded session is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lock level as seen by the local API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Shared access; any number of holders may hold it concurrently.
    Read,
    /// Exclusive access; a single holder, never together with readers.
    Write,
    /// Exclusive access plus a mandatory flush-before-release obligation.
    SynchronousWrite,
}

impl LockLevel {
    /// Whether this level takes the exclusive (write) side of the lock.
    pub fn is_write_class(&self) -> bool {
        matches!(self, LockLevel::Write | LockLevel::SynchronousWrite)
    }

    /// The level the remote authority understands. `SynchronousWrite`
    /// degrades to `Write` on the wire; the flush obligation is a purely
    /// local contract.
    pub fn server_level(&self) -> ServerLockLevel {
        match self {
            LockLevel::Read => ServerLockLevel::Read,
            LockLevel::Write | LockLevel::SynchronousWrite => ServerLockLevel::Write,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockLevel::Read => "read",
            LockLevel::Write => "write",
            LockLevel::SynchronousWrite => "synchronous-write",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock level on the wire. The remote authority only distinguishes shared
/// from exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerLockLevel {
    Read,
    Write,
}

impl ServerLockLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerLockLevel::Read => "read",
            ServerLockLevel::Write => "write",
        }
    }
}

impl fmt::Display for ServerLockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a holder plays on a lock, as reported to diagnostics and replayed
/// to the server on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockContextState {
    HolderRead,
    HolderWrite,
    GreedyHolderRead,
    GreedyHolderWrite,
    Waiter,
    PendingRead,
    PendingWrite,
    TryPendingRead,
    TryPendingWrite,
}

/// One (lock, holder, role) record from a lock-state snapshot.
///
/// Used for thread-dump style introspection, for recall commits, and for
/// re-advertising local state during the reconnect handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContextRecord {
    pub lock: LockId,
    pub holder: HolderId,
    pub state: LockContextState,
    /// Patience the operation was issued with: the try timeout for
    /// try-pending records, the wait timeout for waiters. Reported as
    /// issued, not decremented for time already spent parked.
    pub timeout_ms: Option<u64>,
}
