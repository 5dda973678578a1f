//! Deterministic in-memory doubles for the gateway and resolver seams.
//!
//! [`RecordingGateway`] stands in for the remote lock authority: it
//! records every outbound call in order and, depending on its mode,
//! answers requests straight back through the manager's inbound callbacks
//! on the caller's own task. No real authority is involved, so tests are
//! fully deterministic; in [`AuthorityMode::Manual`] the test drives every
//! award, refusal, and recall by hand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::GatewayError;
use crate::gateway::{HolderIdentityResolver, LockGateway};
use crate::manager::LockManager;
use crate::types::{HolderId, LockContextRecord, LockId, ServerLockLevel};

/// One outbound call, as the authority saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Request {
        lock: LockId,
        holder: HolderId,
        level: ServerLockLevel,
    },
    TryRequest {
        lock: LockId,
        holder: HolderId,
        level: ServerLockLevel,
        timeout_ms: u64,
    },
    Release {
        lock: LockId,
        holder: HolderId,
        level: ServerLockLevel,
    },
    Flush {
        lock: LockId,
    },
    Wait {
        lock: LockId,
        holder: HolderId,
    },
    Notify {
        lock: LockId,
        holder: HolderId,
        all: bool,
    },
    RecallCommit {
        lock: LockId,
        contexts: Vec<LockContextRecord>,
    },
    Reestablish {
        lock: LockId,
        contexts: Vec<LockContextRecord>,
    },
}

/// How the double answers lock requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityMode {
    /// Record only; the test drives all inbound callbacks itself.
    Manual,
    /// Award every request to its holder immediately.
    Award,
    /// Answer every request with a greedy lease at the requested level.
    Lease,
    /// Refuse every try request, award plain requests.
    RefuseTries,
}

pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    mode: Mutex<AuthorityMode>,
    manager: Mutex<Option<std::sync::Weak<LockManager>>>,
}

impl RecordingGateway {
    pub fn new(mode: AuthorityMode) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            mode: Mutex::new(mode),
            manager: Mutex::new(None),
        })
    }

    /// Wire the double to the manager whose callbacks it should answer
    /// through. Required for every mode but [`AuthorityMode::Manual`].
    pub fn attach(&self, manager: &Arc<LockManager>) {
        *self.manager.lock() = Some(Arc::downgrade(manager));
    }

    pub fn set_mode(&self, mode: AuthorityMode) {
        *self.mode.lock() = mode;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<GatewayCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn flush_count(&self, lock: &LockId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, GatewayCall::Flush { lock: l } if l == lock))
            .count()
    }

    pub fn release_count(&self, lock: &LockId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, GatewayCall::Release { lock: l, .. } if l == lock))
            .count()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().push(call);
    }

    fn manager(&self) -> Option<Arc<LockManager>> {
        self.manager.lock().as_ref().and_then(|weak| weak.upgrade())
    }

    fn answer_request(&self, lock: &LockId, holder: HolderId, level: ServerLockLevel, is_try: bool) {
        let mode = *self.mode.lock();
        if mode == AuthorityMode::Manual {
            return;
        }
        let Some(manager) = self.manager() else {
            return;
        };
        let session = manager.session();
        match mode {
            AuthorityMode::Award => manager.award(session, lock, holder, level),
            AuthorityMode::Lease => manager.award(session, lock, HolderId::LEASE, level),
            AuthorityMode::RefuseTries if is_try => manager.refuse(session, lock, holder, level),
            AuthorityMode::RefuseTries => manager.award(session, lock, holder, level),
            AuthorityMode::Manual => unreachable!(),
        }
    }
}

#[async_trait]
impl LockGateway for RecordingGateway {
    async fn request(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::Request {
            lock: lock.clone(),
            holder,
            level,
        });
        self.answer_request(lock, holder, level, false);
        Ok(())
    }

    async fn try_request(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::TryRequest {
            lock: lock.clone(),
            holder,
            level,
            timeout_ms: timeout.as_millis() as u64,
        });
        self.answer_request(lock, holder, level, true);
        Ok(())
    }

    async fn release(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::Release {
            lock: lock.clone(),
            holder,
            level,
        });
        Ok(())
    }

    async fn flush(&self, lock: &LockId) -> Result<(), GatewayError> {
        self.record(GatewayCall::Flush { lock: lock.clone() });
        Ok(())
    }

    async fn wait(
        &self,
        lock: &LockId,
        holder: HolderId,
        _timeout: Option<Duration>,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::Wait {
            lock: lock.clone(),
            holder,
        });
        Ok(())
    }

    async fn notify(&self, lock: &LockId, holder: HolderId, all: bool) -> Result<(), GatewayError> {
        self.record(GatewayCall::Notify {
            lock: lock.clone(),
            holder,
            all,
        });
        Ok(())
    }

    async fn recall_commit(
        &self,
        lock: &LockId,
        contexts: Vec<LockContextRecord>,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::RecallCommit {
            lock: lock.clone(),
            contexts,
        });
        Ok(())
    }

    async fn reestablish(
        &self,
        lock: &LockId,
        contexts: Vec<LockContextRecord>,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::Reestablish {
            lock: lock.clone(),
            contexts,
        });
        Ok(())
    }
}

/// Resolver that reports a fixed holder identity, switchable between
/// operations to simulate multiple execution contexts.
pub struct StaticResolver {
    holder: Mutex<HolderId>,
}

impl StaticResolver {
    pub fn new(holder: HolderId) -> Arc<Self> {
        Arc::new(Self {
            holder: Mutex::new(holder),
        })
    }

    pub fn set(&self, holder: HolderId) {
        *self.holder.lock() = holder;
    }
}

impl HolderIdentityResolver for StaticResolver {
    fn current_holder(&self) -> HolderId {
        *self.holder.lock()
    }
}
