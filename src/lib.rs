//! meshlock: client-side lock manager for a clustered object-sharing
//! runtime.
//!
//! One remote authority arbitrates the cluster-wide serialization order
//! per lock; this crate is the node-local half that makes that affordable.
//! It caches every ownership decision the authority has already made —
//! recursion on a held lock, write-implies-read, and greedy leases that
//! let this node arbitrate a whole lock locally — so that repeated
//! acquisitions resolve without a network round trip, and it cooperates
//! with the authority's recall protocol when another node needs the lock
//! back.
//!
//! The public surface is [`LockManager`]. Its two external collaborators
//! are injected as traits: the transport to the authority as a
//! [`LockGateway`], and the mapping from the calling execution context to
//! a stable [`HolderId`] as a [`HolderIdentityResolver`]. The [`testing`]
//! module ships deterministic in-memory doubles for both.
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshlock::{
//!     HolderId, LockId, LockLevel, LockManager, LockManagerConfig,
//!     testing::{AuthorityMode, RecordingGateway, StaticResolver},
//! };
//!
//! # async fn demo() -> Result<(), meshlock::LockError> {
//! let gateway = RecordingGateway::new(AuthorityMode::Award);
//! let resolver = StaticResolver::new(HolderId::new(1));
//! let manager = LockManager::new(gateway.clone(), resolver, LockManagerConfig::default());
//! gateway.attach(&manager);
//!
//! let lock = LockId::from("orders");
//! manager.lock(&lock, LockLevel::Write).await?;
//! manager.unlock(&lock, LockLevel::Write).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod entry;
pub mod error;
pub mod gateway;
mod greedy;
mod ledger;
pub mod manager;
pub mod testing;
pub mod types;

pub use config::LockManagerConfig;
pub use error::{GatewayError, LockError};
pub use gateway::{HolderIdentityResolver, LockGateway};
pub use manager::{LockManager, NoopWaitListener, RunState, WaitListener};
pub use types::{
    HolderId, LockContextRecord, LockContextState, LockId, LockLevel, ServerLockLevel, SessionId,
};
