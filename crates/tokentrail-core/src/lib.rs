//! Bounded, cooldown-gated token history with shared background
//! reclamation.
//!
//! The crate has three moving parts:
//!
//! - [`BoundedTokenQueue`]: a per-owner FIFO of [`TokenRecord`]s bounded by
//!   capacity, gated on admission by a cool-down against the newest record,
//!   and trimmed by a ttl that never cuts below a configured tail.
//! - [`SweepScheduler`]: a shared registry of weakly held queues plus one
//!   lazily started, self-stopping timer that drives periodic eviction.
//! - [`TokenStore`]: the persistence seam. Queues save through it after
//!   every successful mutation, best-effort; loads at startup propagate
//!   errors to the owner. A filesystem implementation lives in the
//!   companion store crate.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokentrail_core::{BoundedTokenQueue, HistoryConfig, SweepScheduler};
//!
//! # fn main() -> tokentrail_core::Result<()> {
//! let config = HistoryConfig::new(16, Duration::from_secs(30), 1, Duration::from_secs(3600))?;
//! let queue = BoundedTokenQueue::new(config, SweepScheduler::shared())?;
//! if queue.admit("tok_9f2c") {
//!     // issued: record retained until capacity or ttl reclaims it
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod lock_order;
pub mod queue;
pub mod record;
pub mod registry;
pub mod store;

pub use config::{HistoryConfig, SweepConfig};
pub use error::{Error, Result};
pub use queue::BoundedTokenQueue;
pub use record::{TokenRecord, now_millis};
pub use registry::{RegistrationId, SweepOutcome, SweepScheduler, SweepStatsSnapshot, Sweepable};
pub use store::TokenStore;
