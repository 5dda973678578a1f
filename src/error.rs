//! Error types for the lock manager and its gateway seam.

use snafu::Snafu;

use crate::types::{HolderId, LockId, LockLevel};

/// Errors surfaced to a single caller of the lock manager.
///
/// Systemic conditions (a paused connection, stale protocol messages) are
/// handled inside the manager and never appear here; see the module docs on
/// [`crate::manager`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    /// A holder that only holds `Read` asked for a write-class level on
    /// the same lock. Raised synchronously; no state is mutated and no
    /// network call is made.
    #[snafu(display("lock upgrade denied: {holder} holds only READ on {lock}"))]
    UpgradeDenied { lock: LockId, holder: HolderId },

    /// The operation requires a hold the caller does not have, e.g.
    /// unlocking a level that was never acquired, or waiting/notifying
    /// without a write-class hold.
    #[snafu(display("{holder} does not hold {lock} at {level}"))]
    NotHeld {
        lock: LockId,
        holder: HolderId,
        level: LockLevel,
    },

    /// The manager has been shut down; no further operations are served.
    #[snafu(display("lock manager is shut down"))]
    Shutdown,

    /// The remote authority failed the request. Propagated only to the
    /// caller whose request was affected; the lock entry stays usable for
    /// other holders.
    #[snafu(display("lock authority gateway failure: {source}"))]
    Gateway { source: GatewayError },
}

/// Errors reported by a [`crate::gateway::LockGateway`] implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GatewayError {
    #[snafu(display("disconnected from the lock authority"))]
    Disconnected,

    #[snafu(display("remote authority error: {message}"))]
    Remote { message: String },
}

impl From<GatewayError> for LockError {
    fn from(source: GatewayError) -> Self {
        Self::Gateway { source }
    }
}
