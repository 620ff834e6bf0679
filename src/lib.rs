//! Best-effort diagnostic event tracing for no-std and hosted targets.
//!
//! # Highlights
//! - Lock-free multi-writer ring: writers never block, never retry, and never allocate once
//!   the ring is built.
//! - Single destructive reader: a drain walks entries oldest-first and empties the ring.
//! - Fixed-width records with a truncating, zero-padded message payload.
//!
//! # Quick start
//! ```
//! use ph_eventtrace::RingBuffer;
//!
//! let ring = RingBuffer::new(4);
//! for v in 1..=6u32 {
//!     ring.push(v);
//! }
//! assert_eq!(ring.drain(), [3, 4, 5, 6]);
//! assert!(ring.drain().is_empty());
//! ```
//!
//! For timestamped text events use [`EventLog`], configured from a [`TraceConfig`].
//!
//! # No-std
//! The crate is `#![no_std]` and needs `alloc`. The `std` feature adds `MonotonicClock`,
//! `ThreadIdentity` and `TraceConfig::from_env`. Tests require `std`.
//!
//! # Semantics
//! - Reservation ids are monotonically increasing `u64` values starting at `1` in each epoch;
//!   a drain ends the epoch.
//! - The ring keeps the `capacity` most recent entries.
//! - Writes that race with a drain, or with another writer on the same slot, are dropped and
//!   reported via [`DrainStats`].
//! - A drain that finds another drain in progress returns nothing.
//! - Capacity `0` builds a disabled ring (and a non-positive configured capacity a disabled
//!   log) on which every call is a no-op.
#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod event_log;
pub mod record;
pub mod ring;
pub mod source;

pub use config::{ConfigError, TraceConfig};
pub use event_log::EventLog;
pub use record::{MAX_MESSAGE_LEN, Payload, TraceRecord};
pub use ring::{DrainStats, RingBuffer, SlotWriter};
pub use source::{Clock, IdentitySource, Producer};

#[cfg(feature = "std")]
pub use source::{MonotonicClock, ThreadIdentity, set_current_task};
