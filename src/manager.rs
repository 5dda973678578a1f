//! Client-side lock manager.
//!
//! [`LockManager`] owns the index of [`LockEntry`] state machines and is
//! the only piece that talks to the outside: application calls come in at
//! the top (`lock`, `try_lock`, `unlock`, `wait`, `notify`), the transport
//! feeds protocol messages in at the bottom (`award`, `refuse`, `recall`,
//! `notified`), and every outbound message goes through the injected
//! [`LockGateway`].
//!
//! Application calls gate on the running state: while the connection is
//! paused they simply block, so a reconnect is invisible to callers except
//! as latency. Inbound callbacks are never gated, only fenced by session
//! generation, and systemic conditions (stale messages, reclaimed entries)
//! are resolved internally rather than surfaced as errors.
//!
//! Entry mutexes are never held across an await: each entry transition
//! returns the remote leg to perform and the manager dispatches it after
//! the guard is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LockManagerConfig;
use crate::entry::{
    Acquisition, AwardOutcome, EntryError, LockEntry, PostAction, RemoteAction, WaitAction,
};
use crate::error::{self, LockError};
use crate::gateway::{HolderIdentityResolver, LockGateway};
use crate::types::{HolderId, LockContextRecord, LockId, LockLevel, ServerLockLevel, SessionId};

/// Connection lifecycle of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Reconnect handshake in flight; local state is being re-advertised.
    Starting,
    Running,
    /// Connection to the authority lost; application calls block.
    Paused,
    /// Terminal.
    Shutdown,
}

/// Observes a waiter's lifecycle. The single event fires when the parked
/// hold has been re-awarded, immediately before `wait` returns.
pub trait WaitListener: Send + Sync {
    fn on_reacquire(&self, lock: &LockId, holder: HolderId);
}

/// Listener that ignores the event.
pub struct NoopWaitListener;

impl WaitListener for NoopWaitListener {
    fn on_reacquire(&self, _lock: &LockId, _holder: HolderId) {}
}

pub struct LockManager {
    locks: DashMap<LockId, Arc<LockEntry>>,
    gateway: Arc<dyn LockGateway>,
    resolver: Arc<dyn HolderIdentityResolver>,
    config: LockManagerConfig,
    run_state: watch::Sender<RunState>,
    session: AtomicU64,
    gc_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Build a manager and start its idle-collection task. Must be called
    /// from within a tokio runtime.
    pub fn new(
        gateway: Arc<dyn LockGateway>,
        resolver: Arc<dyn HolderIdentityResolver>,
        config: LockManagerConfig,
    ) -> Arc<Self> {
        let (run_state, _) = watch::channel(RunState::Running);
        let manager = Arc::new(Self {
            locks: DashMap::new(),
            gateway,
            resolver,
            config,
            run_state,
            session: AtomicU64::new(0),
            gc_task: parking_lot::Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let interval = manager.config.gc_interval();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                if *manager.run_state.borrow() != RunState::Running {
                    continue;
                }
                manager.run_lock_gc().await;
            }
        });
        *manager.gc_task.lock() = Some(handle);
        manager
    }

    // ---- application-facing API -------------------------------------

    /// Acquire `lock` at `level` for the calling context, blocking until
    /// granted. Recursion, write-implies-read, and greedy leases are all
    /// satisfied locally without a network round trip.
    pub async fn lock(&self, lock: &LockId, level: LockLevel) -> Result<(), LockError> {
        self.lock_as(lock, self.resolver.current_holder(), level).await
    }

    pub async fn lock_as(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: LockLevel,
    ) -> Result<(), LockError> {
        self.wait_until_running().await?;
        loop {
            let entry = self.live_entry(lock);
            match entry.acquire(holder, level, None) {
                Err(EntryError::Garbage) => {
                    // raced the idle collector; re-fetch a fresh entry
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(err) => return Err(self.entry_error(lock, holder, level, err)),
                Ok(Acquisition::Granted) => return Ok(()),
                Ok(Acquisition::Blocked { rx, action }) => {
                    self.dispatch_acquire_action(&entry, holder, action).await?;
                    return match rx.await {
                        Ok(AwardOutcome::Granted) => Ok(()),
                        Ok(AwardOutcome::Refused) => Err(error::GatewayError::Remote {
                            message: format!("blocking request for {lock} was refused"),
                        }
                        .into()),
                        Err(_) => error::ShutdownSnafu.fail(),
                    };
                }
            }
        }
    }

    /// Attempt `lock` at `level` without queueing: resolves immediately
    /// from cached state, or with the authority's answer for a zero-wait
    /// request. Returns whether the lock was acquired.
    pub async fn try_lock(&self, lock: &LockId, level: LockLevel) -> Result<bool, LockError> {
        self.try_lock_as(lock, self.resolver.current_holder(), level, Duration::ZERO)
            .await
    }

    /// [`try_lock`](Self::try_lock) with server-side patience: the
    /// authority may queue the request for up to `timeout` before
    /// refusing it.
    pub async fn try_lock_timeout(
        &self,
        lock: &LockId,
        level: LockLevel,
        timeout: Duration,
    ) -> Result<bool, LockError> {
        self.try_lock_as(lock, self.resolver.current_holder(), level, timeout)
            .await
    }

    pub async fn try_lock_as(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: LockLevel,
        timeout: Duration,
    ) -> Result<bool, LockError> {
        self.wait_until_running().await?;
        loop {
            let entry = self.live_entry(lock);
            match entry.acquire(holder, level, Some(timeout)) {
                Err(EntryError::Garbage) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(err) => return Err(self.entry_error(lock, holder, level, err)),
                Ok(Acquisition::Granted) => return Ok(true),
                Ok(Acquisition::Blocked { mut rx, action }) => {
                    // When a remote leg exists the authority owns the
                    // timeout and always answers with an award or a
                    // refusal. Only a lease-blocked local registration
                    // needs its own timer.
                    let remote = !matches!(action, RemoteAction::None);
                    self.dispatch_acquire_action(&entry, holder, action).await?;
                    if remote {
                        return match rx.await {
                            Ok(AwardOutcome::Granted) => Ok(true),
                            Ok(AwardOutcome::Refused) => Ok(false),
                            Err(_) => error::ShutdownSnafu.fail(),
                        };
                    }
                    return match tokio::time::timeout(timeout, &mut rx).await {
                        Ok(Ok(AwardOutcome::Granted)) => Ok(true),
                        Ok(Ok(AwardOutcome::Refused)) => Ok(false),
                        Ok(Err(_)) => error::ShutdownSnafu.fail(),
                        Err(_elapsed) => {
                            if entry.withdraw(holder) {
                                Ok(false)
                            } else {
                                // the award won the race; the hold stands
                                match rx.await {
                                    Ok(AwardOutcome::Granted) => Ok(true),
                                    Ok(AwardOutcome::Refused) => Ok(false),
                                    Err(_) => error::ShutdownSnafu.fail(),
                                }
                            }
                        }
                    };
                }
            }
        }
    }

    /// Drop one acquisition of `lock` at `level` for the calling context.
    pub async fn unlock(&self, lock: &LockId, level: LockLevel) -> Result<(), LockError> {
        self.unlock_as(lock, self.resolver.current_holder(), level).await
    }

    pub async fn unlock_as(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: LockLevel,
    ) -> Result<(), LockError> {
        self.wait_until_running().await?;
        let entry = self
            .lookup(lock)
            .ok_or_else(|| self.not_held(lock, holder, level))?;
        let outcome = entry
            .release(holder, level)
            .map_err(|err| self.entry_error(lock, holder, level, err))?;

        match outcome.action {
            PostAction::RecallCommit => {
                // the recall path carries its own flush
                self.commit_recall(&entry).await;
            }
            action => {
                if outcome.flush {
                    self.gateway.flush(lock).await?;
                }
                if let PostAction::Release { level } = action {
                    self.gateway.release(lock, holder, level).await?;
                }
            }
        }
        Ok(())
    }

    /// Park the calling context's write-class hold as a waiter until
    /// notified (or until `timeout`), then reacquire it before returning.
    /// `listener` fires when the re-award arrives, before this returns.
    pub async fn wait(&self, lock: &LockId, timeout: Option<Duration>) -> Result<(), LockError> {
        self.wait_as(lock, self.resolver.current_holder(), timeout, &NoopWaitListener)
            .await
    }

    pub async fn wait_as(
        &self,
        lock: &LockId,
        holder: HolderId,
        timeout: Option<Duration>,
        listener: &dyn WaitListener,
    ) -> Result<(), LockError> {
        self.wait_until_running().await?;
        let entry = self
            .lookup(lock)
            .ok_or_else(|| self.not_held(lock, holder, LockLevel::Write))?;
        let start = entry
            .start_wait(holder, timeout)
            .map_err(|err| self.entry_error(lock, holder, LockLevel::Write, err))?;

        // the hold is released as unlock would release it, flush included
        if start.flush {
            self.gateway.flush(lock).await?;
        }
        match start.action {
            WaitAction::RemoteWait => self.gateway.wait(lock, holder, timeout).await?,
            WaitAction::RecallCommit => self.commit_recall(&entry).await,
            WaitAction::LocalTimer => {
                if let Some(delay) = timeout {
                    let entry = Arc::clone(&entry);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        entry.wait_timeout(holder);
                    });
                }
            }
            WaitAction::LocalNone => {}
        }

        match start.rx.await {
            Ok(AwardOutcome::Granted) => {
                listener.on_reacquire(lock, holder);
                Ok(())
            }
            Ok(AwardOutcome::Refused) => Err(error::GatewayError::Remote {
                message: format!("re-award after wait on {lock} was refused"),
            }
            .into()),
            Err(_) => error::ShutdownSnafu.fail(),
        }
    }

    /// Wake one waiter on `lock`. The calling context must hold write-class.
    pub async fn notify(&self, lock: &LockId) -> Result<(), LockError> {
        self.notify_as(lock, self.resolver.current_holder(), false).await
    }

    /// Wake every waiter on `lock`.
    pub async fn notify_all(&self, lock: &LockId) -> Result<(), LockError> {
        self.notify_as(lock, self.resolver.current_holder(), true).await
    }

    pub async fn notify_as(
        &self,
        lock: &LockId,
        holder: HolderId,
        all: bool,
    ) -> Result<(), LockError> {
        self.wait_until_running().await?;
        let entry = self
            .lookup(lock)
            .ok_or_else(|| self.not_held(lock, holder, LockLevel::Write))?;
        let remote = entry
            .notify(holder, all)
            .map_err(|err| self.entry_error(lock, holder, LockLevel::Write, err))?;
        if remote {
            // remote waiters may exist on other nodes (or, without a
            // lease, even our own waiters are parked with the authority)
            self.gateway.notify(lock, holder, all).await?;
        }
        Ok(())
    }

    // ---- inbound protocol callbacks ---------------------------------

    /// Grant from the authority. Awards addressed to [`HolderId::LEASE`]
    /// install a greedy lease. Awards carrying a superseded session are
    /// dropped; awards nobody is waiting for are returned to the server.
    pub fn award(
        self: &Arc<Self>,
        session: SessionId,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
    ) {
        if self.fenced(session, lock, "award") {
            return;
        }
        let entry = self.lookup(lock);
        let orphaned = match &entry {
            Some(entry) => entry.award(holder, level).is_err(),
            None => true,
        };
        if orphaned {
            warn!(%lock, %holder, %level, "award for an unknown lock; returning the grant");
            let this = Arc::clone(self);
            let lock = lock.clone();
            tokio::spawn(async move {
                if holder == HolderId::LEASE {
                    if let Err(err) = this.gateway.recall_commit(&lock, Vec::new()).await {
                        warn!(%lock, error = %err, "failed to return an orphaned lease");
                    }
                } else if let Err(err) = this.gateway.release(&lock, holder, level).await {
                    warn!(%lock, %holder, error = %err, "failed to return an orphaned grant");
                }
            });
        }
    }

    /// Refusal of a try request.
    pub fn refuse(
        &self,
        session: SessionId,
        lock: &LockId,
        holder: HolderId,
        level: ServerLockLevel,
    ) {
        if self.fenced(session, lock, "refuse") {
            return;
        }
        match self.lookup(lock) {
            Some(entry) => entry.refuse(holder, level),
            None => debug!(%lock, %holder, "refusal for an unknown lock; ignoring"),
        }
    }

    /// Recall of a greedy lease. The lease is returned once every local
    /// hold has drained; parked waiters and pending requests travel with
    /// the commit instead of being revoked.
    pub fn recall(self: &Arc<Self>, session: SessionId, lock: &LockId, level: ServerLockLevel) {
        if self.fenced(session, lock, "recall") {
            return;
        }
        let Some(entry) = self.lookup(lock) else {
            debug!(%lock, "recall for an unknown lock; ignoring");
            return;
        };
        if entry.recall(level) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.commit_recall(&entry).await;
            });
        }
    }

    /// The authority woke one of our parked waiters; its request rejoins
    /// the pending queue and resolves on the matching re-award.
    pub fn notified(&self, session: SessionId, lock: &LockId, holder: HolderId) {
        if self.fenced(session, lock, "notified") {
            return;
        }
        match self.lookup(lock) {
            Some(entry) => entry.notified(holder),
            None => warn!(%lock, %holder, "notification for an unknown lock; ignoring"),
        }
    }

    // ---- session / reconnect ----------------------------------------

    pub fn session(&self) -> SessionId {
        SessionId::new(self.session.load(Ordering::SeqCst))
    }

    /// Connection to the authority lost: block application calls until
    /// the handshake completes. Fenced like any inbound message.
    pub fn pause(&self, session: SessionId) {
        if self.stale(session, "pause") {
            return;
        }
        self.transition(RunState::Paused);
    }

    /// Reconnect handshake: bump the session generation (fencing all
    /// messages from the dead connection) and re-advertise local state to
    /// the fresh authority, one `reestablish` call per live lock. Holds
    /// and leases are reported, never re-requested; pending requests are
    /// replayed in their original arrival order.
    pub async fn initialize_handshake(&self) -> SessionId {
        self.transition(RunState::Starting);
        let session = SessionId::new(self.session.fetch_add(1, Ordering::SeqCst) + 1);
        info!(%session, "re-advertising lock state to the authority");

        let entries: Vec<Arc<LockEntry>> =
            self.locks.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let contexts = entry.lock_contexts();
            if contexts.is_empty() {
                continue;
            }
            if let Err(err) = self.gateway.reestablish(entry.lock_id(), contexts).await {
                warn!(lock = %entry.lock_id(), error = %err, "reestablish failed");
            }
        }
        session
    }

    /// Handshake acknowledged: resume serving application calls. Carries
    /// the session the handshake installed; anything older is dropped.
    pub fn unpause(&self, session: SessionId) {
        if self.stale(session, "unpause") {
            return;
        }
        self.transition(RunState::Running);
    }

    /// Terminal stop: unblocks every parked caller with a shutdown error
    /// and discards all local lock state.
    pub fn shutdown(&self) {
        self.run_state.send_replace(RunState::Shutdown);
        if let Some(handle) = self.gc_task.lock().take() {
            handle.abort();
        }
        for entry in self.locks.iter() {
            entry.value().clear();
        }
        self.locks.clear();
    }

    // ---- idle collection --------------------------------------------

    /// One idle-collection sweep. An entry is reclaimed only when it has
    /// no holds, no pending requests, no waiters, and no recall in flight,
    /// and has sat idle past the configured threshold; a lease it still
    /// carried is returned to the authority, behind any flush the lease
    /// had deferred. Returns the number of entries reclaimed.
    pub async fn run_lock_gc(&self) -> usize {
        let idle = self.config.idle_timeout();
        let candidates: Vec<Arc<LockEntry>> =
            self.locks.iter().map(|e| Arc::clone(e.value())).collect();
        let mut collected = 0;
        for entry in candidates {
            let Some(reclaimed) = entry.try_mark_garbage(idle) else {
                continue;
            };
            self.locks
                .remove_if(entry.lock_id(), |_, current| Arc::ptr_eq(current, &entry));
            collected += 1;
            if reclaimed.flush {
                if let Err(err) = self.gateway.flush(entry.lock_id()).await {
                    warn!(lock = %entry.lock_id(), error = %err, "flush before lease return failed");
                }
            }
            if let Some(level) = reclaimed.lease {
                if let Err(err) = self
                    .gateway
                    .release(entry.lock_id(), HolderId::LEASE, level)
                    .await
                {
                    warn!(lock = %entry.lock_id(), error = %err, "failed to return a collected lease");
                }
            }
        }
        if collected > 0 {
            info!(collected, "reclaimed idle lock entries");
        }
        collected
    }

    // ---- introspection ----------------------------------------------

    pub fn run_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    /// Whether `holder` currently holds `lock` at exactly `level`.
    pub fn is_locked_by(&self, lock: &LockId, holder: HolderId, level: LockLevel) -> bool {
        self.lookup(lock)
            .map(|e| e.is_locked_by(holder, level))
            .unwrap_or(false)
    }

    /// `holder`'s recursion depth on `lock` at `level`.
    pub fn hold_count(&self, lock: &LockId, holder: HolderId, level: LockLevel) -> usize {
        self.lookup(lock).map(|e| e.hold_count(holder, level)).unwrap_or(0)
    }

    pub fn pending_count(&self, lock: &LockId) -> usize {
        self.lookup(lock).map(|e| e.pending_count()).unwrap_or(0)
    }

    pub fn waiting_count(&self, lock: &LockId) -> usize {
        self.lookup(lock).map(|e| e.waiting_count()).unwrap_or(0)
    }

    /// Thread-dump style snapshot of every live lock entry.
    pub fn all_lock_contexts(&self) -> Vec<LockContextRecord> {
        self.locks
            .iter()
            .flat_map(|e| e.value().lock_contexts())
            .collect()
    }

    // ---- internals --------------------------------------------------

    /// Block until the manager is running; a paused connection shows up
    /// to callers only as latency.
    async fn wait_until_running(&self) -> Result<(), LockError> {
        let mut rx = self.run_state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                RunState::Running => return Ok(()),
                RunState::Shutdown => return error::ShutdownSnafu.fail(),
                RunState::Starting | RunState::Paused => {}
            }
            if rx.changed().await.is_err() {
                return error::ShutdownSnafu.fail();
            }
        }
    }

    fn transition(&self, next: RunState) {
        self.run_state.send_if_modified(|state| {
            if *state == RunState::Shutdown || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn stale(&self, session: SessionId, what: &'static str) -> bool {
        let current = self.session.load(Ordering::SeqCst);
        if session.raw() != current {
            warn!(stale = %session, current, "dropping {what} from a superseded session");
            return true;
        }
        false
    }

    fn fenced(&self, session: SessionId, lock: &LockId, what: &'static str) -> bool {
        let current = self.session.load(Ordering::SeqCst);
        if session.raw() != current {
            warn!(%lock, stale = %session, current, "dropping {what} from a superseded session");
            return true;
        }
        false
    }

    fn live_entry(&self, lock: &LockId) -> Arc<LockEntry> {
        Arc::clone(
            &self
                .locks
                .entry(lock.clone())
                .or_insert_with(|| Arc::new(LockEntry::new(lock.clone()))),
        )
    }

    fn lookup(&self, lock: &LockId) -> Option<Arc<LockEntry>> {
        self.locks.get(lock).map(|e| Arc::clone(e.value()))
    }

    /// Perform the remote leg of a blocked acquisition. A gateway failure
    /// withdraws the pending registration so the entry is left clean.
    async fn dispatch_acquire_action(
        &self,
        entry: &Arc<LockEntry>,
        holder: HolderId,
        action: RemoteAction,
    ) -> Result<(), LockError> {
        let result = match action {
            RemoteAction::None => Ok(()),
            RemoteAction::Request { level } => {
                self.gateway.request(entry.lock_id(), holder, level).await
            }
            RemoteAction::TryRequest { level, timeout } => {
                self.gateway
                    .try_request(entry.lock_id(), holder, level, timeout)
                    .await
            }
            RemoteAction::RecallCommit => {
                self.commit_recall(entry).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            entry.withdraw(holder);
            return Err(err.into());
        }
        Ok(())
    }

    /// Return a drained recalled lease: flush (the obligation is always
    /// discharged before the lease leaves this node), then send the commit
    /// carrying the aggregate local state. Failures are logged, not
    /// surfaced: no single caller owns a recall, and a reconnect replays
    /// the state anyway.
    async fn commit_recall(&self, entry: &Arc<LockEntry>) {
        if let Err(err) = self.gateway.flush(entry.lock_id()).await {
            warn!(lock = %entry.lock_id(), error = %err, "flush before recall commit failed");
        }
        let Some(contexts) = entry.finish_recall_commit() else {
            return;
        };
        if let Err(err) = self.gateway.recall_commit(entry.lock_id(), contexts).await {
            warn!(lock = %entry.lock_id(), error = %err, "recall commit failed");
        }
    }

    fn not_held(&self, lock: &LockId, holder: HolderId, level: LockLevel) -> LockError {
        LockError::NotHeld {
            lock: lock.clone(),
            holder,
            level,
        }
    }

    fn entry_error(
        &self,
        lock: &LockId,
        holder: HolderId,
        level: LockLevel,
        err: EntryError,
    ) -> LockError {
        match err {
            // a reclaimed entry by definition holds nothing for anyone
            EntryError::Garbage => self.not_held(lock, holder, level),
            EntryError::NotHeld { level } => self.not_held(lock, holder, level),
            EntryError::UpgradeDenied => LockError::UpgradeDenied {
                lock: lock.clone(),
                holder,
            },
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Some(handle) = self.gc_task.lock().take() {
            handle.abort();
        }
    }
}
