//! The event trace: a prefilled ring of [`TraceRecord`]s stamped by a clock and an identity
//! source.
//!
//! ```
//! use ph_eventtrace::{EventLog, Producer, TraceConfig};
//!
//! let log = EventLog::new(
//!     &TraceConfig::with_capacity(4),
//!     || 1_000i64,
//!     || Producer { task: 1, worker: 0 },
//! );
//! log.record("start");
//!
//! let mut out = String::new();
//! let stats = log.drain_and_emit(&mut out).unwrap();
//! assert_eq!(stats.read, 1);
//! assert_eq!(out, "eventtrace: t=1000, g=1 m=0, start\n");
//! ```

use core::fmt;

use crate::config::TraceConfig;
use crate::record::TraceRecord;
use crate::ring::{DrainStats, RingBuffer};
use crate::source::{Clock, IdentitySource};

/// Best-effort diagnostic event log.
///
/// Recording never blocks and never allocates: events are written in place into preallocated
/// records, and an event that races with a drain is dropped. A log built from a disabled
/// config allocates nothing and ignores every call.
pub struct EventLog<C, I> {
    ring: RingBuffer<TraceRecord>,
    clock: C,
    identity: I,
}

impl<C: Clock, I: IdentitySource> EventLog<C, I> {
    pub fn new(config: &TraceConfig, clock: C, identity: I) -> Self {
        let ring = if config.is_enabled() {
            RingBuffer::with_factory(config.slots(), TraceRecord::new)
        } else {
            RingBuffer::disabled()
        };
        if ring.is_enabled() {
            log::debug!("event trace enabled, capacity {}", ring.capacity());
        } else {
            log::debug!("event trace disabled");
        }
        Self {
            ring,
            clock,
            identity,
        }
    }

    pub fn with_capacity(capacity: i64, clock: C, identity: I) -> Self {
        Self::new(&TraceConfig::with_capacity(capacity), clock, identity)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.ring.is_enabled()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Append `message`, truncated to the record payload width.
    pub fn record(&self, message: &str) {
        let Some(mut slot) = self.ring.reserve_slot() else {
            return;
        };
        let who = self.identity.current();
        slot.time = self.clock.now_nanos();
        slot.task = who.task;
        slot.worker = who.worker;
        slot.set_message(message);
    }

    /// Drain every record oldest-first into `hook`.
    pub fn drain_records(&self, hook: impl FnMut(&TraceRecord)) -> DrainStats {
        self.ring.for_each(hook)
    }

    /// Drain the log, writing one line per record to `sink`.
    ///
    /// The log is emptied even if `sink` fails; the first write error is returned.
    pub fn drain_and_emit<W: fmt::Write>(&self, sink: &mut W) -> Result<DrainStats, fmt::Error> {
        if !self.is_enabled() {
            return Ok(DrainStats::default());
        }

        let mut result = Ok(());
        let stats = self.ring.for_each(|record| {
            if result.is_ok() {
                result = writeln!(sink, "{record}");
            }
        });

        if result.is_err() {
            log::warn!("event trace sink failed, {} records drained", stats.read);
        } else {
            log::debug!(
                "event trace drained {} records, {} dropped",
                stats.read,
                stats.dropped
            );
        }
        result.map(|()| stats)
    }
}

impl<C, I> fmt::Debug for EventLog<C, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog").field("ring", &self.ring).finish_non_exhaustive()
    }
}
