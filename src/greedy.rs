//! Greedy-lease state machine.
//!
//! A greedy award makes this client the sole authority for a lock until
//! the server recalls the lease. The lease moves through
//! `NotGreedy → Greedy → Recalled → RecallInProgress → NotGreedy`; a recall
//! never revokes an active hold, it only stops the lease from outliving
//! its last holder.

use crate::types::ServerLockLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GreedyState {
    NotGreedy,
    Greedy,
    Recalled,
    RecallInProgress,
}

#[derive(Debug)]
pub(crate) struct Greediness {
    state: GreedyState,
    level: Option<ServerLockLevel>,
}

impl Greediness {
    pub fn new() -> Self {
        Self {
            state: GreedyState::NotGreedy,
            level: None,
        }
    }

    /// True only in the plain `NotGreedy` state. Note that this is not the
    /// negation of [`is_greedy`](Self::is_greedy): a recalled lease is
    /// neither greedy nor not-greedy.
    pub fn is_not_greedy(&self) -> bool {
        self.state == GreedyState::NotGreedy
    }

    pub fn is_greedy(&self) -> bool {
        self.state == GreedyState::Greedy
    }

    pub fn is_recalled(&self) -> bool {
        self.state == GreedyState::Recalled
    }

    pub fn is_recall_in_progress(&self) -> bool {
        self.state == GreedyState::RecallInProgress
    }

    /// The level the lease covers, while any lease state is live.
    pub fn leased_level(&self) -> Option<ServerLockLevel> {
        self.level
    }

    pub fn is_write(&self) -> bool {
        self.level == Some(ServerLockLevel::Write)
    }

    pub fn is_read_only(&self) -> bool {
        self.level == Some(ServerLockLevel::Read)
    }

    /// Install or extend the lease. Write dominates read.
    pub fn add(&mut self, level: ServerLockLevel) {
        self.level = match (self.level, level) {
            (Some(ServerLockLevel::Write), _) | (_, ServerLockLevel::Write) => {
                Some(ServerLockLevel::Write)
            }
            _ => Some(ServerLockLevel::Read),
        };
        self.state = GreedyState::Greedy;
    }

    /// Mark the lease recalled; no new local grants from here.
    pub fn recall(&mut self) {
        debug_assert!(self.is_greedy());
        self.state = GreedyState::Recalled;
    }

    /// Claim the recall commit. Only one caller wins this transition, so
    /// the commit is sent exactly once per recall.
    pub fn start_recall_commit(&mut self) -> bool {
        if self.state == GreedyState::Recalled {
            self.state = GreedyState::RecallInProgress;
            true
        } else {
            false
        }
    }

    /// The commit was captured for sending; the lease is gone.
    pub fn recall_complete(&mut self) {
        debug_assert!(self.is_recall_in_progress());
        self.lose();
    }

    /// Drop all lease state unconditionally.
    pub fn lose(&mut self) {
        self.state = GreedyState::NotGreedy;
        self.level = None;
    }
}
