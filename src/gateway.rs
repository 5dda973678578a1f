//! Trait seams for the two external collaborators of the lock manager.
//!
//! The manager never talks to the network or inspects thread identity
//! directly: the transport to the remote lock authority is injected as a
//! [`LockGateway`], and the mapping from the calling execution context to a
//! stable holder identity is injected as a [`HolderIdentityResolver`].
//! Reconnect handling swaps the party behind the gateway without the core
//! noticing; the core replays local intent (holds, pending requests,
//! waiters) rather than a message log.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::{HolderId, LockContextRecord, LockId, ServerLockLevel};

/// Outbound half of the remote lock authority.
///
/// All methods are fire-and-continue from the manager's point of view: the
/// returned future resolves when the message is handed to the transport
/// (for [`flush`](Self::flush), when the authority acknowledges the
/// barrier). Grants come back asynchronously through the manager's inbound
/// callbacks (`award`, `recall`, `notified`, ...), typically on the
/// transport's own tasks.
#[async_trait]
pub trait LockGateway: Send + Sync {
    /// Ask the authority for `lock` at `level` on behalf of `holder`.
    async fn request(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
    ) -> Result<(), GatewayError>;

    /// Like [`request`](Self::request), but the authority may refuse
    /// instead of queueing once `timeout` elapses server-side.
    async fn try_request(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
        timeout: Duration,
    ) -> Result<(), GatewayError>;

    /// Return `holder`'s grant on `lock` to the authority.
    async fn release(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
    ) -> Result<(), GatewayError>;

    /// Durability barrier: resolves once all data guarded by `lock` is
    /// flushed to the cluster. A synchronous-write release is never sent
    /// before its flush resolves.
    async fn flush(&self, lock: &LockId) -> Result<(), GatewayError>;

    /// Release `holder`'s hold on `lock` and park it as a waiter with the
    /// authority. A `notified` callback moves it back to pending.
    async fn wait(
        &self,
        lock: &LockId,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<(), GatewayError>;

    /// Wake one (or all) waiters on `lock`, on behalf of `holder`.
    async fn notify(&self, lock: &LockId, holder: HolderId, all: bool) -> Result<(), GatewayError>;

    /// Return a recalled greedy lease, carrying the aggregate local state
    /// (pending requests and waiters, in arrival order) for the authority
    /// to reinstall.
    async fn recall_commit(
        &self,
        lock: &LockId,
        contexts: Vec<LockContextRecord>,
    ) -> Result<(), GatewayError>;

    /// Re-advertise local state for one lock to a freshly connected
    /// authority: current holds and leases are reported (never
    /// re-requested), pending requests appear in original arrival order.
    async fn reestablish(
        &self,
        lock: &LockId,
        contexts: Vec<LockContextRecord>,
    ) -> Result<(), GatewayError>;
}

/// Maps the calling execution context to its stable [`HolderId`].
///
/// Implementations key off runtime-allocated slots (task-locals, dedicated
/// registries) and never trust a context's self-reported identity, which
/// pathological runtimes can override or collide.
pub trait HolderIdentityResolver: Send + Sync {
    fn current_holder(&self) -> HolderId;
}
