//! Per-lock state machine.
//!
//! A [`LockEntry`] owns everything the client knows about one cluster-wide
//! lock: the holder map (one [`HoldLedger`] per holder), the FIFO queue of
//! pending remote requests, the queue of parked waiters, the greedy-lease
//! state, a last-use stamp for the idle collector, and a garbage marker.
//!
//! All mutation happens under the entry's own mutex, which is never held
//! across an await: every local transition returns the remote action the
//! caller must perform (request, flush, release, recall commit) and the
//! manager dispatches it to the gateway after dropping the guard. Blocked
//! callers park on a oneshot receiver whose sender lives in the pending or
//! waiter record; awards, refusals, and shutdown resolve it.
//!
//! Late and duplicate protocol messages are deliberate no-op branches
//! here, not incidental race outcomes: an award with no matching pending
//! request and a notification with no parked waiter both log and change
//! nothing.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::greedy::Greediness;
use crate::ledger::HoldLedger;
use crate::types::{
    HolderId, LockContextRecord, LockContextState, LockId, LockLevel, ServerLockLevel,
};

/// Resolution delivered to a blocked caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwardOutcome {
    Granted,
    Refused,
}

/// Errors a lock entry reports to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryError {
    /// The entry was reclaimed by the idle collector; re-fetch and retry.
    Garbage,
    /// A read-only holder asked for a write-class level.
    UpgradeDenied,
    /// The operation requires a hold the caller does not have.
    NotHeld { level: LockLevel },
}

/// Remote leg required to complete an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteAction {
    /// Nothing to send: the request waits for local lease arbitration or
    /// rides in an in-flight recall commit.
    None,
    Request {
        level: ServerLockLevel,
    },
    TryRequest {
        level: ServerLockLevel,
        timeout: Duration,
    },
    /// This caller claimed the recall commit; capture and send it.
    RecallCommit,
}

/// Result of a local acquisition attempt.
pub(crate) enum Acquisition {
    /// Satisfied from cached state; no network call.
    Granted,
    /// Registered as pending; block on `rx` after dispatching `action`.
    Blocked {
        rx: oneshot::Receiver<AwardOutcome>,
        action: RemoteAction,
    },
}

/// Remote leg required after a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostAction {
    None,
    Release { level: ServerLockLevel },
    RecallCommit,
}

/// Result of a local release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReleaseOutcome {
    /// A synchronous-write flush obligation came due; flush before any
    /// release is sent.
    pub flush: bool,
    pub action: PostAction,
}

/// What idle collection recovered from an entry it marked garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reclaimed {
    /// Lease still installed at collection time, to hand back.
    pub lease: Option<ServerLockLevel>,
    /// A flush deferred under the lease is still owed; it must land
    /// before the lease is returned.
    pub flush: bool,
}

/// Remote leg required after parking a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitAction {
    /// Release the hold and park with the authority.
    RemoteWait,
    /// This caller claimed the recall commit; the waiter rides in it.
    RecallCommit,
    /// The lease owns the waiter; arm a local timer if a timeout was given.
    LocalTimer,
    /// An in-flight recall commit will carry the waiter.
    LocalNone,
}

/// Result of parking a waiter.
pub(crate) struct WaitStart {
    pub rx: oneshot::Receiver<AwardOutcome>,
    pub flush: bool,
    pub action: WaitAction,
}

struct PendingRequest {
    holder: HolderId,
    level: LockLevel,
    /// `Some` for try requests; the server-side patience they were sent with.
    try_timeout: Option<Duration>,
    tx: Option<oneshot::Sender<AwardOutcome>>,
}

struct Waiter {
    holder: HolderId,
    timeout: Option<Duration>,
    tx: Option<oneshot::Sender<AwardOutcome>>,
}

struct EntryState {
    holds: HashMap<HolderId, HoldLedger>,
    pending: VecDeque<PendingRequest>,
    waiters: VecDeque<Waiter>,
    greedy: Greediness,
    /// A synchronous-write flush came due while the lease was live and
    /// was deferred; owed the moment the lease leaves this node.
    flush_deferred: bool,
    last_used: Instant,
    garbage: bool,
}

pub(crate) struct LockEntry {
    id: LockId,
    state: Mutex<EntryState>,
}

impl EntryState {
    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Greedy-grant compatibility: a write grant needs a write lease and
    /// no current holder; a read grant needs a read lease, or a write
    /// lease with no write-class holder.
    fn can_award_greedily_now(&self, level: LockLevel) -> bool {
        if !self.greedy.is_greedy() {
            return false;
        }
        if level.is_write_class() {
            self.greedy.is_write() && !self.holds.values().any(|l| l.is_holding())
        } else {
            self.greedy.is_read_only()
                || (self.greedy.is_write() && !self.holds.values().any(|l| l.holds_write_class()))
        }
    }

    /// Install a grant without touching the network: fresh ledger, one
    /// more recursion count, or resumption of a parked ledger.
    fn grant_local(&mut self, holder: HolderId, level: LockLevel) {
        match self.holds.get_mut(&holder) {
            Some(ledger) if ledger.is_holding() => ledger.grant(level),
            Some(ledger) => {
                // re-award after wait: counts were retained across the park
                ledger.resume_holding();
            }
            None => {
                self.holds.insert(holder, HoldLedger::new(level, level.server_level()));
            }
        }
    }

    /// Award every pending request the lease can satisfy, in arrival
    /// order. Pure local: fires the blocked callers' channels directly.
    fn award_locks_greedily(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            let (holder, level) = {
                let req = &self.pending[i];
                (req.holder, req.level)
            };
            if self.can_award_greedily_now(level) {
                let mut req = self.pending.remove(i).expect("index in bounds");
                self.grant_local(holder, level);
                if let Some(tx) = req.tx.take() {
                    let _ = tx.send(AwardOutcome::Granted);
                }
            } else {
                i += 1;
            }
        }
    }

    /// A recalled lease may be returned once no holder is actually
    /// holding. Parked waiters and pending requests travel with the
    /// commit; active holds are never revoked.
    fn can_proceed_with_recall(&self) -> bool {
        self.greedy.is_recalled() && !self.holds.values().any(|l| l.is_holding())
    }

    /// Move a parked waiter back into the pending queue (keeps its
    /// blocked-caller channel). The waiter's ledger retained its counts,
    /// so the eventual award resumes it rather than granting fresh.
    fn move_waiter_to_pending(&mut self, idx: usize, id: &LockId) {
        let mut waiter = self.waiters.remove(idx).expect("index in bounds");
        match self.holds.get_mut(&waiter.holder) {
            Some(ledger) => {
                if !ledger.note_pending() {
                    warn!(lock = %id, holder = %waiter.holder,
                          "waiter ledger was not parked; keeping pending registration anyway");
                }
            }
            None => {
                warn!(lock = %id, holder = %waiter.holder, "waiter has no ledger; dropping");
                return;
            }
        }
        self.pending.push_back(PendingRequest {
            holder: waiter.holder,
            level: LockLevel::Write,
            try_timeout: None,
            tx: waiter.tx.take(),
        });
    }

    /// Snapshot of this entry as context records: the lease (if live),
    /// then current holds, pending requests in arrival order, and waiters.
    fn lock_contexts(&self, id: &LockId) -> Vec<LockContextRecord> {
        let mut contexts = Vec::new();
        if let Some(level) = self.greedy.leased_level() {
            contexts.push(LockContextRecord {
                lock: id.clone(),
                holder: HolderId::LEASE,
                state: match level {
                    ServerLockLevel::Read => LockContextState::GreedyHolderRead,
                    ServerLockLevel::Write => LockContextState::GreedyHolderWrite,
                },
                timeout_ms: None,
            });
        }
        for (holder, ledger) in &self.holds {
            if !ledger.is_holding() {
                continue; // parked and pending holders appear in the queues
            }
            contexts.push(LockContextRecord {
                lock: id.clone(),
                holder: *holder,
                state: match ledger.server_level() {
                    ServerLockLevel::Read => LockContextState::HolderRead,
                    ServerLockLevel::Write => LockContextState::HolderWrite,
                },
                timeout_ms: None,
            });
        }
        for req in &self.pending {
            let state = match (req.try_timeout.is_some(), req.level.server_level()) {
                (false, ServerLockLevel::Read) => LockContextState::PendingRead,
                (false, ServerLockLevel::Write) => LockContextState::PendingWrite,
                (true, ServerLockLevel::Read) => LockContextState::TryPendingRead,
                (true, ServerLockLevel::Write) => LockContextState::TryPendingWrite,
            };
            contexts.push(LockContextRecord {
                lock: id.clone(),
                holder: req.holder,
                state,
                timeout_ms: req.try_timeout.map(|t| t.as_millis() as u64),
            });
        }
        for waiter in &self.waiters {
            contexts.push(LockContextRecord {
                lock: id.clone(),
                holder: waiter.holder,
                state: LockContextState::Waiter,
                timeout_ms: waiter.timeout.map(|t| t.as_millis() as u64),
            });
        }
        contexts
    }
}

impl LockEntry {
    pub fn new(id: LockId) -> Self {
        Self {
            id,
            state: Mutex::new(EntryState {
                holds: HashMap::new(),
                pending: VecDeque::new(),
                waiters: VecDeque::new(),
                greedy: Greediness::new(),
                flush_deferred: false,
                last_used: Instant::now(),
                garbage: false,
            }),
        }
    }

    pub fn lock_id(&self) -> &LockId {
        &self.id
    }

    /// Try to satisfy an acquisition from cached state; otherwise register
    /// it as pending and report which remote leg the caller must perform.
    /// `try_timeout` distinguishes try-lock requests.
    pub fn acquire(
        &self,
        holder: HolderId,
        level: LockLevel,
        try_timeout: Option<Duration>,
    ) -> Result<Acquisition, EntryError> {
        let mut state = self.state.lock();
        if state.garbage {
            return Err(EntryError::Garbage);
        }
        state.touch();

        if let Some(ledger) = state.holds.get_mut(&holder) {
            if ledger.is_holding() {
                if ledger.holds_write_class() {
                    // write dominates everything, including a nested
                    // synchronous write attaching its flush obligation
                    ledger.grant(level);
                    return Ok(Acquisition::Granted);
                }
                if level == LockLevel::Read {
                    ledger.grant(level);
                    return Ok(Acquisition::Granted);
                }
                return Err(EntryError::UpgradeDenied);
            }
            debug_assert!(false, "holder {holder} re-entered while parked");
        }

        if state.can_award_greedily_now(level) {
            state.grant_local(holder, level);
            return Ok(Acquisition::Granted);
        }

        let (tx, rx) = oneshot::channel();
        state.pending.push_back(PendingRequest {
            holder,
            level,
            try_timeout,
            tx: Some(tx),
        });

        let action = if state.greedy.is_not_greedy() {
            match try_timeout {
                Some(timeout) => RemoteAction::TryRequest {
                    level: level.server_level(),
                    timeout,
                },
                None => RemoteAction::Request {
                    level: level.server_level(),
                },
            }
        } else {
            if level.is_write_class() && state.greedy.is_greedy() && state.greedy.is_read_only() {
                // a write request can never become compatible with a
                // read-only lease locally; hand the lease back so the
                // server can arbitrate
                debug!(lock = %self.id, %holder, "write request under read lease; recalling locally");
                state.greedy.recall();
            }
            if state.can_proceed_with_recall() && state.greedy.start_recall_commit() {
                RemoteAction::RecallCommit
            } else {
                RemoteAction::None
            }
        };
        Ok(Acquisition::Blocked { rx, action })
    }

    /// Withdraw a timed-out try request. Returns false when the award won
    /// the race, in which case the hold exists and the caller keeps it.
    pub fn withdraw(&self, holder: HolderId) -> bool {
        let mut state = self.state.lock();
        state.touch();
        if let Some(idx) = state.pending.iter().position(|p| p.holder == holder) {
            state.pending.remove(idx);
            true
        } else {
            false
        }
    }

    /// Drop one acquisition and report the remote leg: nothing while
    /// recursion or the lease covers it, a release when the last hold of a
    /// non-greedy entry falls, a recall commit when this release drains a
    /// recalled lease.
    pub fn release(&self, holder: HolderId, level: LockLevel) -> Result<ReleaseOutcome, EntryError> {
        let mut state = self.state.lock();
        if state.garbage {
            return Err(EntryError::Garbage);
        }
        state.touch();

        let (server_level, effect) = {
            let ledger = state
                .holds
                .get_mut(&holder)
                .filter(|l| l.is_holding())
                .ok_or(EntryError::NotHeld { level })?;
            let server_level = ledger.server_level();
            let effect = ledger.release(level).ok_or(EntryError::NotHeld { level })?;
            (server_level, effect)
        };
        if effect.fully_released {
            state.holds.remove(&holder);
        }

        let action = if state.greedy.is_not_greedy() {
            if effect.fully_released {
                PostAction::Release { level: server_level }
            } else {
                PostAction::None
            }
        } else {
            if state.greedy.is_greedy() {
                state.award_locks_greedily();
            }
            if state.can_proceed_with_recall() && state.greedy.start_recall_commit() {
                PostAction::RecallCommit
            } else {
                PostAction::None
            }
        };

        // While the lease is plainly greedy no traffic leaves this node;
        // the obligation is remembered and discharged when the lease
        // leaves, whether by recall commit or by idle collection.
        let flush = effect.flush_due && !state.greedy.is_greedy();
        if effect.flush_due && !flush {
            state.flush_deferred = true;
        }
        Ok(ReleaseOutcome { flush, action })
    }

    /// Park the caller's hold as a waiter: the hold is released exactly as
    /// unlock would release it (flush obligation included), the ledger
    /// retains its counts for the re-award, and a waiter record carrying
    /// the blocked caller's channel joins the queue.
    pub fn start_wait(
        &self,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<WaitStart, EntryError> {
        let mut state = self.state.lock();
        if state.garbage {
            return Err(EntryError::Garbage);
        }
        state.touch();

        let flush_owed = {
            let ledger = state
                .holds
                .get_mut(&holder)
                .filter(|l| l.holds_write_class())
                .ok_or(EntryError::NotHeld {
                    level: LockLevel::Write,
                })?;
            let flush_owed = ledger.flush_owed();
            ledger.park_for_wait();
            flush_owed
        };

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            holder,
            timeout,
            tx: Some(tx),
        });

        let action = if state.greedy.is_not_greedy() {
            WaitAction::RemoteWait
        } else if state.greedy.is_greedy() {
            state.award_locks_greedily();
            WaitAction::LocalTimer
        } else if state.can_proceed_with_recall() && state.greedy.start_recall_commit() {
            WaitAction::RecallCommit
        } else {
            WaitAction::LocalNone
        };
        let flush = flush_owed && !state.greedy.is_greedy();
        if flush_owed && !flush {
            state.flush_deferred = true;
        }
        Ok(WaitStart { rx, flush, action })
    }

    /// Local wait timeout under a write lease: self-notify the waiter and
    /// re-award locally. Anything else is stale and ignored.
    pub fn wait_timeout(&self, holder: HolderId) {
        let mut state = self.state.lock();
        if state.garbage {
            return;
        }
        if state.greedy.is_greedy() && state.greedy.is_write() {
            if let Some(idx) = state.waiters.iter().position(|w| w.holder == holder) {
                state.touch();
                state.move_waiter_to_pending(idx, &self.id);
                state.award_locks_greedily();
                return;
            }
        }
        debug!(lock = %self.id, %holder, "ignoring stale wait timeout");
    }

    /// Wake waiters on behalf of `holder`, which must hold write-class.
    /// Under a live lease waiters are notified locally; returns whether a
    /// remote notify is still required.
    pub fn notify(&self, holder: HolderId, all: bool) -> Result<bool, EntryError> {
        let mut state = self.state.lock();
        if state.garbage {
            return Err(EntryError::Garbage);
        }
        state.touch();

        let holds_write = state
            .holds
            .get(&holder)
            .map(|l| l.holds_write_class())
            .unwrap_or(false);
        if !holds_write {
            return Err(EntryError::NotHeld {
                level: LockLevel::Write,
            });
        }

        if state.greedy.is_not_greedy() {
            return Ok(true);
        }

        let mut moved = 0;
        while !state.waiters.is_empty() {
            state.move_waiter_to_pending(0, &self.id);
            moved += 1;
            if !all {
                break;
            }
        }
        // the notifier still holds write, so nothing is grantable yet; the
        // awards flow on its unlock
        Ok(all || moved == 0)
    }

    /// Remote notification: convert the parked waiter into a pending
    /// request at its original level. Unknown waiters are absorbed.
    pub fn notified(&self, holder: HolderId) {
        let mut state = self.state.lock();
        if state.garbage {
            return;
        }
        state.touch();
        if let Some(idx) = state.waiters.iter().position(|w| w.holder == holder) {
            state.move_waiter_to_pending(idx, &self.id);
        } else {
            warn!(lock = %self.id, %holder, "notification for a holder that is not waiting; ignoring");
        }
    }

    /// Inbound award. A lease award (addressed to [`HolderId::LEASE`])
    /// installs the greedy lease and locally awards everything now
    /// compatible. A holder award resolves its pending request; with no
    /// matching pending request it is a well-defined no-op.
    pub fn award(&self, holder: HolderId, level: ServerLockLevel) -> Result<(), EntryError> {
        let mut state = self.state.lock();
        if state.garbage {
            return Err(EntryError::Garbage);
        }
        state.touch();

        if holder == HolderId::LEASE {
            state.greedy.add(level);
            state.award_locks_greedily();
            return Ok(());
        }

        let Some(idx) = state.pending.iter().position(|p| p.holder == holder) else {
            warn!(lock = %self.id, %holder, %level, "award with no pending request; absorbing");
            return Ok(());
        };
        let mut req = state.pending.remove(idx).expect("index in bounds");
        match state.holds.get_mut(&holder) {
            Some(ledger) => {
                // re-award after wait: restore the parked recursion depth
                if !ledger.resume_holding() {
                    warn!(lock = %self.id, %holder, "award found ledger in unexpected state");
                }
            }
            None => {
                state.holds.insert(holder, HoldLedger::new(req.level, level));
            }
        }
        if let Some(tx) = req.tx.take() {
            let _ = tx.send(AwardOutcome::Granted);
        }
        Ok(())
    }

    /// Inbound refusal of a try request: unblock the caller with "not
    /// acquired". Unknown refusals are absorbed.
    pub fn refuse(&self, holder: HolderId, level: ServerLockLevel) {
        let mut state = self.state.lock();
        if state.garbage {
            return;
        }
        state.touch();
        let Some(idx) = state.pending.iter().position(|p| p.holder == holder) else {
            warn!(lock = %self.id, %holder, %level, "refusal with no pending request; absorbing");
            return;
        };
        let mut req = state.pending.remove(idx).expect("index in bounds");
        if let Some(tx) = req.tx.take() {
            let _ = tx.send(AwardOutcome::Refused);
        }
    }

    /// Inbound recall of the greedy lease. Returns true when this call
    /// claimed the recall commit (the lease already drained); otherwise
    /// the commit fires from the release or wait that drains it.
    pub fn recall(&self, level: ServerLockLevel) -> bool {
        let mut state = self.state.lock();
        if state.garbage {
            return false;
        }
        state.touch();
        if state.greedy.is_greedy() {
            state.greedy.recall();
            if state.can_proceed_with_recall() && state.greedy.start_recall_commit() {
                return true;
            }
        } else {
            debug!(lock = %self.id, %level, "recall without a live lease; ignoring");
        }
        false
    }

    /// Capture the recall commit: clears the lease and returns the
    /// aggregate state (pending requests in arrival order, waiters) for
    /// the authority to reinstall. `None` when no recall is in progress.
    pub fn finish_recall_commit(&self) -> Option<Vec<LockContextRecord>> {
        let mut state = self.state.lock();
        if !state.greedy.is_recall_in_progress() {
            debug!(lock = %self.id, "recall commit skipped; none in progress");
            return None;
        }
        state.greedy.recall_complete();
        // the commit path flushes before it sends; the deferral is spent
        state.flush_deferred = false;
        Some(state.lock_contexts(&self.id))
    }

    /// Diagnostic/handshake snapshot of this entry.
    pub fn lock_contexts(&self) -> Vec<LockContextRecord> {
        self.state.lock().lock_contexts(&self.id)
    }

    /// Idle collection check: an entry qualifies only when it has no
    /// holds, no pending requests, no waiters, no recall in flight, and
    /// has been idle past the threshold. On success the entry is marked
    /// garbage and the lease it still carried (if any) is returned for the
    /// caller to hand back to the authority, together with any flush the
    /// lease had deferred.
    pub fn try_mark_garbage(&self, idle_timeout: Duration) -> Option<Reclaimed> {
        let mut state = self.state.lock();
        if state.garbage {
            return None;
        }
        let quiesced = state.greedy.is_greedy() || state.greedy.is_not_greedy();
        if quiesced
            && state.holds.is_empty()
            && state.pending.is_empty()
            && state.waiters.is_empty()
            && state.last_used.elapsed() >= idle_timeout
        {
            state.garbage = true;
            let lease = state.greedy.leased_level();
            state.greedy.lose();
            let flush = state.flush_deferred;
            state.flush_deferred = false;
            Some(Reclaimed { lease, flush })
        } else {
            None
        }
    }

    /// Tear the entry down: drops every blocked caller's channel so the
    /// callers resolve with a shutdown error.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.garbage = true;
        state.holds.clear();
        state.pending.clear();
        state.waiters.clear();
        state.greedy.lose();
    }

    pub fn is_locked_by(&self, holder: HolderId, level: LockLevel) -> bool {
        let state = self.state.lock();
        state
            .holds
            .get(&holder)
            .map(|l| l.is_holding() && l.count(level) > 0)
            .unwrap_or(false)
    }

    pub fn hold_count(&self, holder: HolderId, level: LockLevel) -> usize {
        let state = self.state.lock();
        state
            .holds
            .get(&holder)
            .filter(|l| l.is_holding())
            .map(|l| l.count(level) as usize)
            .unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LockEntry {
        LockEntry::new(LockId::from("L"))
    }

    const H1: HolderId = HolderId::new(1);
    const H2: HolderId = HolderId::new(2);

    #[test]
    fn stray_award_changes_nothing() {
        let entry = entry();
        entry.award(H1, ServerLockLevel::Write).unwrap();
        assert!(!entry.is_locked_by(H1, LockLevel::Write));
        assert_eq!(entry.pending_count(), 0);
    }

    #[test]
    fn award_resolves_pending_in_place() {
        let entry = entry();
        let Acquisition::Blocked { mut rx, action } =
            entry.acquire(H1, LockLevel::Write, None).unwrap()
        else {
            panic!("fresh write acquisition must go remote");
        };
        assert_eq!(
            action,
            RemoteAction::Request {
                level: ServerLockLevel::Write
            }
        );
        entry.award(H1, ServerLockLevel::Write).unwrap();
        assert_eq!(rx.try_recv().unwrap(), AwardOutcome::Granted);
        assert!(entry.is_locked_by(H1, LockLevel::Write));
    }

    #[test]
    fn greedy_write_lease_arbitrates_locally() {
        let entry = entry();
        entry.award(HolderId::LEASE, ServerLockLevel::Write).unwrap();

        // reads share under the write lease
        assert!(matches!(
            entry.acquire(H1, LockLevel::Read, None).unwrap(),
            Acquisition::Granted
        ));
        assert!(matches!(
            entry.acquire(H2, LockLevel::Read, None).unwrap(),
            Acquisition::Granted
        ));

        // a write blocks locally behind the readers, with no remote leg
        let Acquisition::Blocked { mut rx, action } =
            entry.acquire(HolderId::new(3), LockLevel::Write, None).unwrap()
        else {
            panic!("write must queue behind readers");
        };
        assert_eq!(action, RemoteAction::None);

        let out = entry.release(H1, LockLevel::Read).unwrap();
        assert_eq!(out.action, PostAction::None);
        assert!(rx.try_recv().is_err(), "one reader still holds");

        entry.release(H2, LockLevel::Read).unwrap();
        assert_eq!(rx.try_recv().unwrap(), AwardOutcome::Granted);
        assert!(entry.is_locked_by(HolderId::new(3), LockLevel::Write));
    }

    #[test]
    fn recall_waits_for_drain_then_claims_commit() {
        let entry = entry();
        entry.award(HolderId::LEASE, ServerLockLevel::Read).unwrap();
        assert!(matches!(
            entry.acquire(H1, LockLevel::Read, None).unwrap(),
            Acquisition::Granted
        ));

        assert!(!entry.recall(ServerLockLevel::Write), "holder still active");

        let out = entry.release(H1, LockLevel::Read).unwrap();
        assert_eq!(out.action, PostAction::RecallCommit);
        let contexts = entry.finish_recall_commit().expect("commit claimed once");
        assert!(contexts.is_empty(), "drained lease commits empty state");
        assert!(entry.finish_recall_commit().is_none());
    }

    #[test]
    fn idle_collection_spares_busy_entries() {
        let entry = entry();
        assert!(matches!(
            entry.acquire(H1, LockLevel::Read, None).unwrap(),
            Acquisition::Blocked { .. }
        ));
        assert!(entry.try_mark_garbage(Duration::ZERO).is_none());

        entry.award(H1, ServerLockLevel::Read).unwrap();
        assert!(entry.try_mark_garbage(Duration::ZERO).is_none());

        entry.release(H1, LockLevel::Read).unwrap();
        assert_eq!(
            entry.try_mark_garbage(Duration::ZERO),
            Some(Reclaimed {
                lease: None,
                flush: false,
            })
        );
        assert!(
            matches!(entry.acquire(H1, LockLevel::Read, None), Err(EntryError::Garbage)),
            "collected entries force a re-fetch"
        );
    }

    #[test]
    fn collected_lease_is_surfaced_for_return() {
        let entry = entry();
        entry.award(HolderId::LEASE, ServerLockLevel::Write).unwrap();
        assert_eq!(
            entry.try_mark_garbage(Duration::ZERO),
            Some(Reclaimed {
                lease: Some(ServerLockLevel::Write),
                flush: false,
            })
        );
    }

    #[test]
    fn deferred_flush_travels_with_the_collected_lease() {
        let entry = entry();
        entry.award(HolderId::LEASE, ServerLockLevel::Write).unwrap();
        assert!(matches!(
            entry.acquire(H1, LockLevel::SynchronousWrite, None).unwrap(),
            Acquisition::Granted
        ));
        let out = entry.release(H1, LockLevel::SynchronousWrite).unwrap();
        assert!(!out.flush, "the lease defers the obligation");
        assert_eq!(
            entry.try_mark_garbage(Duration::ZERO),
            Some(Reclaimed {
                lease: Some(ServerLockLevel::Write),
                flush: true,
            })
        );
    }

    #[test]
    fn snapshot_reports_the_issued_wait_timeout() {
        let entry = entry();
        entry.award(HolderId::LEASE, ServerLockLevel::Write).unwrap();
        assert!(matches!(
            entry.acquire(H1, LockLevel::Write, None).unwrap(),
            Acquisition::Granted
        ));
        entry.start_wait(H1, Some(Duration::from_millis(250))).unwrap();
        let waiter = entry
            .lock_contexts()
            .into_iter()
            .find(|c| c.state == LockContextState::Waiter)
            .expect("waiter record in the snapshot");
        assert_eq!(waiter.timeout_ms, Some(250));
    }
}
