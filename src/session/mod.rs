//! Persistent page sessions.
//!
//! - [`page_id`]: canonical page identifiers
//! - [`lock`]: bounded cross-process lock over the state file
//! - [`store`]: durable page metadata
//! - [`registry`]: live handles, id allocation, per-id serialization
//! - [`manager`]: the [`SessionManager`] tying them together

pub mod lock;
pub mod manager;
pub mod page_id;
pub mod registry;
pub mod store;

pub use lock::{LockOutcome, StateLock};
pub use manager::{PageInfo, PageLease, PageOrigin, SessionManager};
pub use page_id::{PageId, PageIdInput};
pub use store::{PageMetadata, PersistedState, StateStore};
