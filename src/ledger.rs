//! Per-(lock, holder) hold accounting.
//!
//! A [`HoldLedger`] tracks one holder's recursion counts by level on one
//! lock, the server-side level obtained for the hold series, and the
//! flush obligation attached by synchronous writes. It also carries the
//! holder's sub-state across the wait/notify bridge: a ledger is `Holding`
//! while usable, `Waiting` while parked in a wait, and `Pending` between a
//! notification and the re-award. Counts survive the park so the re-award
//! restores the exact recursion depth.
//!
//! The ledger is what decides whether a local call needs to touch the
//! network at all: recursion and write-implies-read are answered purely
//! from these counters.

use crate::types::{LockLevel, ServerLockLevel};

/// Sub-state of a holder's ledger on one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HoldState {
    /// The holder owns the lock and may use or recursively re-acquire it.
    Holding,
    /// The holder released into a wait and is parked as a waiter.
    Waiting,
    /// The holder was notified and re-requested; the award is outstanding.
    Pending,
}

/// Effect of decrementing one level from a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReleaseEffect {
    /// A flush obligation came due: the last write-class count was dropped
    /// while a synchronous write was owed.
    pub flush_due: bool,
    /// No counts remain; the hold is gone and the ledger can be removed.
    pub fully_released: bool,
}

#[derive(Debug)]
pub(crate) struct HoldLedger {
    read: u32,
    write: u32,
    sync_write: u32,
    /// Level the remote authority granted (or the lease covered) for this
    /// hold series. Fixed at creation: upgrades are forbidden, so the
    /// server-visible level never changes while the ledger lives.
    server_level: ServerLockLevel,
    flush_owed: bool,
    state: HoldState,
}

impl HoldLedger {
    pub fn new(level: LockLevel, server_level: ServerLockLevel) -> Self {
        let mut ledger = Self {
            read: 0,
            write: 0,
            sync_write: 0,
            server_level,
            flush_owed: false,
            state: HoldState::Holding,
        };
        ledger.grant(level);
        ledger
    }

    pub fn state(&self) -> HoldState {
        self.state
    }

    pub fn is_holding(&self) -> bool {
        self.state == HoldState::Holding
    }

    pub fn server_level(&self) -> ServerLockLevel {
        self.server_level
    }

    pub fn count(&self, level: LockLevel) -> u32 {
        match level {
            LockLevel::Read => self.read,
            LockLevel::Write => self.write,
            LockLevel::SynchronousWrite => self.sync_write,
        }
    }

    pub fn total(&self) -> u32 {
        self.read + self.write + self.sync_write
    }

    fn write_class(&self) -> u32 {
        self.write + self.sync_write
    }

    /// Whether this ledger currently takes the exclusive side of the lock.
    pub fn holds_write_class(&self) -> bool {
        self.is_holding() && self.write_class() > 0
    }

    /// Whether this ledger holds anything at all right now.
    pub fn holds_any(&self) -> bool {
        self.is_holding() && self.total() > 0
    }

    /// Record one more acquisition at `level`. A synchronous write
    /// attaches the flush obligation; if a write-class count already
    /// exists this never re-contacts the server.
    pub fn grant(&mut self, level: LockLevel) {
        match level {
            LockLevel::Read => self.read += 1,
            LockLevel::Write => self.write += 1,
            LockLevel::SynchronousWrite => {
                self.sync_write += 1;
                self.flush_owed = true;
            }
        }
    }

    /// Drop one acquisition at `level`. Returns `None` when no such count
    /// is held (an unlock of something never locked).
    pub fn release(&mut self, level: LockLevel) -> Option<ReleaseEffect> {
        let count = match level {
            LockLevel::Read => &mut self.read,
            LockLevel::Write => &mut self.write,
            LockLevel::SynchronousWrite => &mut self.sync_write,
        };
        if *count == 0 {
            return None;
        }
        *count -= 1;

        let flush_due = self.flush_owed && self.write_class() == 0;
        if flush_due {
            self.flush_owed = false;
        }
        Some(ReleaseEffect {
            flush_due,
            fully_released: self.total() == 0,
        })
    }

    /// Park the hold for a wait. Counts are retained so the re-award can
    /// restore the same recursion depth. Returns the server level the
    /// waiter will re-request when notified.
    pub fn park_for_wait(&mut self) -> ServerLockLevel {
        debug_assert!(self.holds_write_class());
        self.state = HoldState::Waiting;
        self.server_level
    }

    /// A notification arrived: move the parked ledger to pending. Returns
    /// false when the ledger was not waiting (a stale or duplicate
    /// notification), in which case nothing changes.
    pub fn note_pending(&mut self) -> bool {
        if self.state == HoldState::Waiting {
            self.state = HoldState::Pending;
            true
        } else {
            false
        }
    }

    /// The re-award after a wait arrived: restore the hold. Returns false
    /// when the ledger was not pending.
    pub fn resume_holding(&mut self) -> bool {
        if self.state == HoldState::Pending {
            self.state = HoldState::Holding;
            true
        } else {
            false
        }
    }

    /// Whether a flush is still owed by this ledger.
    pub fn flush_owed(&self) -> bool {
        self.flush_owed
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn recursion_counts_by_level() {
        let mut ledger = HoldLedger::new(LockLevel::Write, ServerLockLevel::Write);
        ledger.grant(LockLevel::Write);
        ledger.grant(LockLevel::Read); // write implies read, counted separately
        assert_eq!(ledger.count(LockLevel::Write), 2);
        assert_eq!(ledger.count(LockLevel::Read), 1);
        assert!(ledger.holds_write_class());

        let effect = ledger.release(LockLevel::Read).unwrap();
        assert!(!effect.fully_released);
        let effect = ledger.release(LockLevel::Write).unwrap();
        assert!(!effect.fully_released);
        let effect = ledger.release(LockLevel::Write).unwrap();
        assert!(effect.fully_released);
    }

    #[test]
    fn releasing_an_unheld_level_is_rejected() {
        let mut ledger = HoldLedger::new(LockLevel::Read, ServerLockLevel::Read);
        assert!(ledger.release(LockLevel::Write).is_none());
        assert!(ledger.release(LockLevel::Read).is_some());
        assert!(ledger.release(LockLevel::Read).is_none());
    }

    #[test]
    fn flush_comes_due_when_the_last_write_class_count_drops() {
        let mut ledger = HoldLedger::new(LockLevel::SynchronousWrite, ServerLockLevel::Write);
        ledger.grant(LockLevel::Read);

        let effect = ledger.release(LockLevel::SynchronousWrite).unwrap();
        assert!(effect.flush_due, "flush precedes the hold being fully dropped");
        assert!(!effect.fully_released, "read count still held");

        let effect = ledger.release(LockLevel::Read).unwrap();
        assert!(!effect.flush_due, "flush is discharged exactly once");
        assert!(effect.fully_released);
    }

    #[test]
    fn nested_synchronous_writes_flush_once() {
        let mut ledger = HoldLedger::new(LockLevel::SynchronousWrite, ServerLockLevel::Write);
        ledger.grant(LockLevel::SynchronousWrite);
        assert!(!ledger.release(LockLevel::SynchronousWrite).unwrap().flush_due);
        let effect = ledger.release(LockLevel::SynchronousWrite).unwrap();
        assert!(effect.flush_due);
        assert!(effect.fully_released);
    }

    #[test]
    fn wait_bridge_retains_counts() {
        let mut ledger = HoldLedger::new(LockLevel::Write, ServerLockLevel::Write);
        ledger.grant(LockLevel::Write);

        assert_eq!(ledger.park_for_wait(), ServerLockLevel::Write);
        assert!(!ledger.holds_any());
        assert!(!ledger.resume_holding(), "cannot resume without a notification");
        assert!(ledger.note_pending());
        assert!(!ledger.note_pending(), "duplicate notification is absorbed");
        assert!(ledger.resume_holding());
        assert_eq!(ledger.count(LockLevel::Write), 2, "recursion depth restored");
    }

    fn levels_after(first: LockLevel) -> impl Strategy<Value = LockLevel> {
        // A read-only holder can never add write-class counts (upgrades
        // are rejected before the ledger is touched).
        if first == LockLevel::Read {
            Just(LockLevel::Read).boxed()
        } else {
            prop_oneof![
                Just(LockLevel::Read),
                Just(LockLevel::Write),
                Just(LockLevel::SynchronousWrite),
            ]
            .boxed()
        }
    }

    fn grant_sequences() -> impl Strategy<Value = Vec<LockLevel>> {
        prop_oneof![
            Just(LockLevel::Read),
            Just(LockLevel::Write),
            Just(LockLevel::SynchronousWrite),
        ]
        .prop_flat_map(|first| {
            proptest::collection::vec(levels_after(first), 0..8)
                .prop_map(move |rest| {
                    let mut seq = vec![first];
                    seq.extend(rest);
                    seq
                })
        })
    }

    proptest! {
        #[test]
        fn lifo_release_flushes_once_and_frees_last(seq in grant_sequences()) {
            let first = seq[0];
            let mut ledger = HoldLedger::new(first, first.server_level());
            for level in &seq[1..] {
                ledger.grant(*level);
            }

            let any_sync = seq.contains(&LockLevel::SynchronousWrite);
            let mut flushes = 0;
            for (i, level) in seq.iter().enumerate().rev() {
                let effect = ledger.release(*level).expect("granted level releases");
                if effect.flush_due {
                    flushes += 1;
                }
                prop_assert_eq!(effect.fully_released, i == 0);
            }
            prop_assert_eq!(flushes, usize::from(any_sync));
            prop_assert!(!ledger.flush_owed());
        }
    }
}
