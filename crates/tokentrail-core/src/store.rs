//! Persistence gateway consumed by [`BoundedTokenQueue`].
//!
//! The queue persists its full contents after every mutation, best-effort:
//! save failures are logged by the queue and never surface through `admit`
//! or `evict`. Load failures propagate to the caller performing startup
//! hydration, since an unreadable store at startup is the owner's decision
//! point, not the core's.
//!
//! [`BoundedTokenQueue`]: crate::queue::BoundedTokenQueue

use crate::error::Result;
use crate::record::TokenRecord;

/// Durable storage for one queue's contents.
///
/// Implementations own the wire format and any cross-process locking; the
/// queue hands them typed records oldest-first and expects them back the
/// same way. Implementations must be internally synchronized: the queue
/// serializes saves per instance but owner threads and the sweep timer may
/// both reach `save`.
pub trait TokenStore: Send + Sync {
    /// Persist the full current contents, oldest-first.
    fn save(&self, records: &[TokenRecord]) -> Result<()>;

    /// Read previously persisted contents, oldest-first.
    fn load(&self) -> Result<Vec<TokenRecord>>;

    /// Whether persisted contents exist.
    fn exists(&self) -> bool;

    /// Remove persisted contents. Returns `true` if something was removed.
    fn delete(&self) -> Result<bool>;
}
