//! Lock-free multi-writer trace ring with a single destructive reader.
//!
//! # Overview
//! - Any number of writers, at most one drain in flight.
//! - Writers never wait; a write either lands or is dropped and counted.
//! - Every write takes the next reservation id. Id `k` lives at index `(k - 1) % capacity`,
//!   so once the ring wraps the newest entries overwrite the oldest.
//! - A drain delivers the live window, the `capacity` ids ending at the newest resident one,
//!   oldest-first starting at the head. It then empties the ring and begins a new epoch: the id
//!   counter restarts and the next write gets id `1` again.
//! - A ring built with capacity `0` is disabled. Every operation on it is a no-op.
//!
//! # Slot state
//! Each slot carries one atomic word, `id << 2 | ORPHANED | CLAIMED`.
//! - `0`: empty.
//! - `id`: resident, readable.
//! - `id | CLAIMED`: a writer (or the reader) holds the slot; the writer's id is stamped when it
//!   claims, so an in-flight slot never looks empty.
//! - `id | ORPHANED`: the reader gave up on an in-flight writer. The writer may still be touching
//!   the value; when it finishes, its publish fails, the event is counted as dropped and the slot
//!   goes back to empty.
//!
//! Slots inside the window that do not hold their expected id (empty, in flight, orphaned, or a
//! stale entry whose replacement was dropped) are skipped, never treated as the end of the ring.
//!
//! # Memory ordering
//! Writers claim a slot and then re-check the gate. The reader closes the gate and then
//! inspects slots. Both sides use `SeqCst` so at least one of them observes the other. Slot
//! values are only touched under a claim, which is acquired by the claiming CAS and released by
//! the store that gives it up.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroU64;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

#[cfg(not(feature = "portable-atomic"))]
use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "portable-atomic")]
use portable_atomic::{AtomicU64, Ordering};

const CLAIMED: u64 = 0b01;
const ORPHANED: u64 = 0b10;
const HELD: u64 = CLAIMED | ORPHANED;
const ID_SHIFT: u32 = 2;

/// Low bit of the gate word. The remaining bits count finished drains.
const READING: u64 = 1;

#[inline(always)]
const fn id_of(state: u64) -> u64 {
    state >> ID_SHIFT
}

/// The state the reader leaves behind for a writer it stopped waiting for.
#[inline(always)]
const fn orphaned(state: u64) -> u64 {
    (state & !CLAIMED) | ORPHANED
}

#[must_use]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Entries handed to the reader.
    pub read: usize,
    /// Writes dropped since the previous drain.
    pub dropped: u64,
    /// Ids reserved during the epoch the drain closed.
    pub reserved: u64,
}

struct Slot<T> {
    state: AtomicU64,
    value: UnsafeCell<Option<T>>,
}

impl<T> Slot<T> {
    fn new(value: Option<T>) -> Self {
        Self {
            state: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Id of a published, unclaimed entry.
    #[inline]
    fn resident_id(&self) -> Option<NonZeroU64> {
        let state = self.state.load(Ordering::Acquire);
        if state & HELD != 0 {
            return None;
        }
        NonZeroU64::new(id_of(state))
    }

    /// Turn any writer claim into an orphan. Returns once the slot is not writer-claimed.
    fn orphan_writer(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        while current & CLAIMED != 0 {
            match self.state.compare_exchange_weak(
                current,
                orphaned(current),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

/// A write in progress: the slot holds `id | CLAIMED` and held `prior` before the claim.
struct Claim {
    idx: usize,
    id: u64,
    prior: u64,
}

/// Fixed-capacity trace ring. Writers never wait; one reader drains at a time.
pub struct RingBuffer<T> {
    next_id: AtomicU64,
    gate: AtomicU64,
    dropped: AtomicU64,
    slots: Box<[Slot<T>]>,
}

// SAFETY: a slot value is only accessed by whoever holds that slot's claim (or, for an orphaned
// slot, by the writer that was holding it), so the ring hands each `T` to one thread at a time,
// the same contract as `Mutex<T>`.
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring with `capacity` empty slots. Capacity `0` yields the disabled ring.
    pub fn new(capacity: usize) -> Self {
        Self::from_slots((0..capacity).map(|_| Slot::new(None)).collect())
    }

    /// Create a ring whose slots all start with storage built by `factory`.
    ///
    /// Pair this with [`reserve_slot`](Self::reserve_slot) to fill records in place so the
    /// write path never allocates.
    pub fn with_factory(capacity: usize, mut factory: impl FnMut() -> T) -> Self {
        Self::from_slots((0..capacity).map(|_| Slot::new(Some(factory()))).collect())
    }

    /// The disabled ring. Nothing is allocated and every operation is a no-op.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    fn from_slots(slots: Box<[Slot<T>]>) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            gate: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slots,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.slots.is_empty()
    }

    /// True while a drain holds the read gate.
    #[inline]
    pub fn is_draining(&self) -> bool {
        self.gate.load(Ordering::Acquire) & READING != 0
    }

    #[inline(always)]
    fn idx_for(&self, id: u64) -> usize {
        (id.wrapping_sub(1) % self.slots.len() as u64) as usize
    }

    /// Take the next reservation id. Ids start at `1` in every epoch and are never reused
    /// within one. Returns `0` on a disabled ring.
    ///
    /// An id taken here without a matching write still occupies its position in the window:
    /// the drain skips it, and the slot it maps to keeps whatever older entry it held, which
    /// is then stale and skipped too. Writers normally get ids through
    /// [`reserve_slot`](Self::reserve_slot) or [`push`](Self::push) instead.
    #[inline]
    pub fn reserve_id(&self) -> u64 {
        if self.slots.is_empty() {
            return 0;
        }
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Reserve the next slot and hand out its value storage for in-place writes.
    ///
    /// Returns `None` if a drain is running, or if the target slot is held by another writer
    /// or already holds a newer entry. The entry is published when the returned guard drops.
    /// A slot that has no storage yet is filled with `T::default()` first.
    pub fn reserve_slot(&self) -> Option<SlotWriter<'_, T>>
    where
        T: Default,
    {
        let claim = self.begin_write()?;
        // SAFETY: the claim gives this writer exclusive access to the slot value until the
        // `SlotWriter` releases it.
        let storage = unsafe { &mut *self.slots[claim.idx].value.get() };
        let value = NonNull::from(storage.get_or_insert_with(T::default));
        Some(SlotWriter {
            ring: self,
            claim,
            value,
            _marker: PhantomData,
        })
    }

    /// Overwrite the next slot with `value`. Returns `false` if the write was dropped.
    pub fn push(&self, value: T) -> bool {
        let Some(claim) = self.begin_write() else {
            return false;
        };
        // SAFETY: exclusive access under the claim, released by `finish` below.
        unsafe { *self.slots[claim.idx].value.get() = Some(value) };
        self.finish(&claim)
    }

    fn begin_write(&self) -> Option<Claim> {
        if self.slots.is_empty() {
            return None;
        }
        let generation = self.gate.load(Ordering::SeqCst);
        let claim = if generation & READING != 0 {
            None
        } else {
            self.claim(generation, self.reserve_id())
        };
        if claim.is_none() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        claim
    }

    fn claim(&self, generation: u64, id: u64) -> Option<Claim> {
        let idx = self.idx_for(id);
        let state = &self.slots[idx].state;

        let prior = state.load(Ordering::Relaxed);
        if prior & HELD != 0 || id_of(prior) >= id {
            return None;
        }
        state
            .compare_exchange(
                prior,
                id << ID_SHIFT | CLAIMED,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .ok()?;

        let claim = Claim { idx, id, prior };
        // A drain started (or finished) since the gate check: back out.
        if self.gate.load(Ordering::SeqCst) != generation {
            self.release(&claim, prior);
            return None;
        }
        Some(claim)
    }

    /// Give up a claim, leaving `state` behind. Fails if the reader orphaned the slot
    /// meanwhile; the orphan belongs to this writer alone, so it is reset to empty.
    fn release(&self, claim: &Claim, state: u64) -> bool {
        let slot_state = &self.slots[claim.idx].state;
        let ok = slot_state
            .compare_exchange(
                claim.id << ID_SHIFT | CLAIMED,
                state,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok();
        if !ok {
            slot_state.store(0, Ordering::Release);
        }
        ok
    }

    fn finish(&self, claim: &Claim) -> bool {
        let published = self.release(claim, claim.id << ID_SHIFT);
        if !published {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        published
    }

    fn open_read(&self) -> Option<ReadGate<'_, T>> {
        let generation = self.gate.load(Ordering::Relaxed);
        if generation & READING != 0 {
            return None;
        }
        self.gate
            .compare_exchange(
                generation,
                generation | READING,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .ok()?;
        Some(ReadGate {
            ring: self,
            generation,
        })
    }

    /// Oldest id of the live window: the `capacity` ids ending at the newest resident entry.
    fn oldest_live_id(&self) -> Option<u64> {
        let newest = self
            .slots
            .iter()
            .filter_map(Slot::resident_id)
            .map(NonZeroU64::get)
            .max()?;
        Some(newest.saturating_sub(self.slots.len() as u64 - 1).max(1))
    }

    /// Index of the oldest resident entry, where a drain starts.
    ///
    /// With `n` sequential writes into a fresh ring this is `0` until the ring wraps and
    /// `n % capacity` afterwards. An empty ring reports `0`.
    pub fn find_head(&self) -> usize {
        self.oldest_live_id().map_or(0, |id| self.idx_for(id))
    }

    /// Drain every resident entry oldest-first into `hook` and start a new epoch.
    ///
    /// Returns immediately with empty stats if another drain holds the gate. Writers still in
    /// flight when the drain starts are orphaned and their events dropped. The epoch ends and
    /// the gate is released on every exit path; if `hook` panics, entries it has not seen yet
    /// are discarded.
    pub fn for_each(&self, mut hook: impl FnMut(&T)) -> DrainStats {
        if self.slots.is_empty() {
            return DrainStats::default();
        }
        let Some(_gate) = self.open_read() else {
            return DrainStats::default();
        };

        // Nothing is published during the walk once every in-flight writer is orphaned.
        for slot in self.slots.iter() {
            slot.orphan_writer();
        }

        let mut read = 0usize;
        if let Some(oldest) = self.oldest_live_id() {
            let capacity = self.slots.len();
            let head = self.idx_for(oldest);
            for offset in 0..capacity {
                let idx = (head + offset) % capacity;
                let Some(vacate) = self.claim_for_read(idx, oldest + offset as u64) else {
                    continue;
                };
                // SAFETY: the reader holds the slot claim until `vacate` drops.
                if let Some(value) = unsafe { (*self.slots[idx].value.get()).as_ref() } {
                    hook(value);
                    read += 1;
                }
                drop(vacate);
            }
        }

        let reserved = self.next_id.swap(0, Ordering::Relaxed);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        DrainStats {
            read,
            dropped,
            reserved,
        }
    }

    /// Drain every resident entry oldest-first. Empty if another drain is running.
    pub fn drain(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut out = Vec::new();
        let _ = self.for_each(|value| out.push(value.clone()));
        out
    }

    /// Claim slot `idx` for reading if it holds exactly `expected`.
    fn claim_for_read(&self, idx: usize, expected: u64) -> Option<Vacate<'_>> {
        let state = &self.slots[idx].state;
        let mut current = state.load(Ordering::SeqCst);
        loop {
            if current & HELD != 0 || id_of(current) != expected {
                return None;
            }
            match state.compare_exchange_weak(
                current,
                current | CLAIMED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(Vacate(state)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Empty every slot the walk left behind and orphan any writer still holding one, so
    /// nothing from the closing epoch gets published into the next one.
    fn sweep(&self) {
        for slot in self.slots.iter() {
            let mut current = slot.state.load(Ordering::SeqCst);
            loop {
                let next = match current {
                    0 => break,
                    s if s & ORPHANED != 0 => break,
                    s if s & CLAIMED != 0 => orphaned(s),
                    _ => 0,
                };
                match slot.state.compare_exchange_weak(
                    current,
                    next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::disabled()
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

/// Reader claim on a resident slot; leaves the slot empty when dropped.
struct Vacate<'a>(&'a AtomicU64);

impl Drop for Vacate<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Held for the duration of a drain. Dropping it closes the epoch and reopens the ring.
struct ReadGate<'a, T> {
    ring: &'a RingBuffer<T>,
    generation: u64,
}

impl<T> Drop for ReadGate<'_, T> {
    fn drop(&mut self) {
        self.ring.sweep();
        self.ring.next_id.store(0, Ordering::Relaxed);
        self.ring
            .gate
            .store(self.generation.wrapping_add(2), Ordering::Release);
    }
}

/// Exclusive access to a reserved slot's value. The entry is published on drop.
pub struct SlotWriter<'a, T> {
    ring: &'a RingBuffer<T>,
    claim: Claim,
    value: NonNull<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<T> SlotWriter<'_, T> {
    /// The reservation id this write will publish under.
    #[inline]
    pub fn id(&self) -> u64 {
        self.claim.id
    }
}

impl<T> Deref for SlotWriter<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `value` points into the claimed slot and the claim outlives `self`.
        unsafe { self.value.as_ref() }
    }
}

impl<T> DerefMut for SlotWriter<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` keeps the access unique.
        unsafe { self.value.as_mut() }
    }
}

impl<T> Drop for SlotWriter<'_, T> {
    fn drop(&mut self) {
        self.ring.finish(&self.claim);
    }
}

impl<T: fmt::Debug> fmt::Debug for SlotWriter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotWriter")
            .field("id", &self.claim.id)
            .field("value", &**self)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{DrainStats, RingBuffer};
    use std::vec;
    use std::vec::Vec;

    #[test]
    fn drains_in_push_order() {
        let ring = RingBuffer::new(8);
        for v in [10u32, 11, 12] {
            assert!(ring.push(v));
        }

        assert_eq!(ring.drain(), vec![10, 11, 12]);
    }

    #[test]
    fn keeps_most_recent_after_wrap() {
        let ring = RingBuffer::new(5);
        for v in 42u32..=46 {
            ring.push(v);
        }
        assert_eq!(ring.drain(), vec![42, 43, 44, 45, 46]);
        assert!(ring.drain().is_empty());

        for v in 42u32..=52 {
            ring.push(v);
        }
        assert_eq!(ring.drain(), vec![48, 49, 50, 51, 52]);
    }

    #[test]
    fn empty_drain_is_repeatable() {
        let ring = RingBuffer::<u32>::new(4);
        assert!(ring.drain().is_empty());
        assert!(ring.drain().is_empty());
    }

    #[test]
    fn head_follows_the_oldest_entry() {
        let ring = RingBuffer::new(10);
        for v in 0u32..5 {
            ring.push(v);
        }
        assert_eq!(ring.find_head(), 0);

        for v in 5u32..12 {
            ring.push(v);
        }
        assert_eq!(ring.find_head(), 2);

        ring.push(12);
        assert_eq!(ring.find_head(), 3);
    }

    #[test]
    fn drain_starts_a_new_epoch() {
        let ring = RingBuffer::new(3);
        ring.push(1u32);
        ring.push(2);

        let stats = ring.for_each(|_| {});
        assert_eq!(stats.read, 2);
        assert_eq!(stats.reserved, 2);
        assert_eq!(stats.dropped, 0);

        assert_eq!(ring.reserve_id(), 1);
        assert_eq!(ring.find_head(), 0);
    }

    #[test]
    fn disabled_ring_is_a_no_op() {
        let ring = RingBuffer::<u32>::disabled();
        assert!(!ring.is_enabled());
        assert_eq!(ring.reserve_id(), 0);
        assert!(!ring.push(1));
        assert!(ring.reserve_slot().is_none());
        assert!(ring.drain().is_empty());
        assert_eq!(
            ring.for_each(|_| panic!("disabled ring yielded")),
            DrainStats::default()
        );
    }

    #[test]
    fn reserved_slot_reuses_prefilled_storage() {
        let ring = RingBuffer::with_factory(2, || Vec::<u8>::with_capacity(32));
        {
            let mut slot = ring.reserve_slot().expect("slot");
            assert_eq!(slot.id(), 1);
            slot.clear();
            slot.extend_from_slice(b"abc");
        }
        assert_eq!(ring.drain(), vec![b"abc".to_vec()]);

        let slot = ring.reserve_slot().expect("slot");
        assert_eq!(slot.id(), 1);
        assert_eq!(&slot[..], b"abc");
        assert!(slot.capacity() >= 32);
    }

    #[test]
    fn nested_drain_is_rejected() {
        let ring = RingBuffer::new(4);
        ring.push(1u32);
        ring.push(2);

        let mut outer = Vec::new();
        let mut inner = Vec::new();
        let stats = ring.for_each(|v| {
            outer.push(*v);
            inner.extend(ring.drain());
            assert!(ring.is_draining());
        });

        assert_eq!(stats.read, 2);
        assert_eq!(outer, vec![1, 2]);
        assert!(inner.is_empty());
        assert!(!ring.is_draining());
    }

    #[test]
    fn writes_during_drain_are_dropped() {
        let ring = RingBuffer::new(4);
        ring.push(1u32);

        let stats = ring.for_each(|_| assert!(!ring.push(99)));
        assert_eq!(stats.read, 1);
        assert_eq!(stats.dropped, 1);
        assert!(ring.drain().is_empty());
    }

    #[test]
    fn in_flight_write_is_dropped_by_drain() {
        let ring = RingBuffer::new(4);
        ring.push(1u32);

        let mut writer = ring.reserve_slot().expect("slot");
        *writer = 2;
        assert_eq!(ring.drain(), vec![1]);
        drop(writer);

        let stats = ring.for_each(|_| panic!("cleared slot was published"));
        assert_eq!(stats.read, 0);
        assert_eq!(stats.dropped, 1);

        ring.push(3);
        assert_eq!(ring.drain(), vec![3]);
    }

    #[test]
    fn claimed_slot_rejects_second_writer() {
        let ring = RingBuffer::new(2);
        let mut first = ring.reserve_slot().expect("slot");
        *first = 1u32;

        assert!(ring.push(2));
        // id 3 maps onto the slot `first` still holds.
        assert!(!ring.push(3));
        drop(first);

        assert_eq!(ring.drain(), vec![1, 2]);
    }

    #[test]
    fn stale_writer_never_replaces_newer_entry() {
        let ring = RingBuffer::new(2);
        let generation = ring.gate.load(super::Ordering::SeqCst);
        let stale = ring.reserve_id();

        for v in [20u32, 30] {
            ring.push(v);
        }
        assert!(ring.claim(generation, stale).is_none());
        assert_eq!(ring.drain(), vec![20, 30]);
    }

    #[test]
    fn panicking_hook_releases_the_gate() {
        let ring = RingBuffer::new(4);
        ring.push(1u32);
        ring.push(2);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = ring.for_each(|_| panic!("hook failed"));
        }));
        assert!(result.is_err());
        assert!(!ring.is_draining());
        assert!(ring.drain().is_empty());

        ring.push(3);
        assert_eq!(ring.drain(), vec![3]);
    }

    #[test]
    fn in_flight_first_write_does_not_hide_later_entries() {
        let ring = RingBuffer::new(4);
        let mut writer = ring.reserve_slot().expect("slot");
        *writer = 10u32;
        assert!(ring.push(11));
        assert!(ring.push(12));

        let mut seen = Vec::new();
        let stats = ring.for_each(|v| seen.push(*v));
        assert_eq!(seen, vec![11, 12]);
        assert_eq!(
            stats,
            DrainStats {
                read: 2,
                dropped: 0,
                reserved: 3
            }
        );

        drop(writer);
        let stats = ring.for_each(|_| panic!("orphaned write was published"));
        assert_eq!(stats.read, 0);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn orphaned_writer_does_not_blank_the_next_epoch() {
        let ring = RingBuffer::new(4);
        let writer = ring.reserve_slot().expect("slot");
        assert!(ring.drain().is_empty());

        // id 1 maps onto the slot the orphaned writer is still touching.
        assert!(!ring.push(10u32));
        assert!(ring.push(11));
        assert!(ring.push(12));
        drop(writer);

        let mut seen = Vec::new();
        let stats = ring.for_each(|v| seen.push(*v));
        assert_eq!(seen, vec![11, 12]);
        assert_eq!(
            stats,
            DrainStats {
                read: 2,
                dropped: 2,
                reserved: 3
            }
        );

        // The orphan is gone: its slot takes writes again.
        assert!(ring.push(20));
        assert_eq!(ring.drain(), vec![20]);
    }

    #[test]
    fn unused_reserved_id_leaves_a_gap_not_a_cutoff() {
        let ring = RingBuffer::new(4);
        ring.push(1u32);
        assert_eq!(ring.reserve_id(), 2);
        ring.push(3);
        ring.push(4);

        assert_eq!(ring.find_head(), 0);
        assert_eq!(ring.drain(), vec![1, 3, 4]);
    }

    #[test]
    fn stale_entry_behind_the_window_is_skipped() {
        let ring = RingBuffer::new(2);
        let mut slow = ring.reserve_slot().expect("slot");
        *slow = 1u32;

        assert!(ring.push(2));
        // id 3 targets the slot `slow` holds.
        assert!(!ring.push(3));
        assert!(ring.push(4));
        drop(slow);

        // The window is ids 3..=4; id 1 is older than anything it covers.
        assert_eq!(ring.find_head(), 0);
        let mut seen = Vec::new();
        let stats = ring.for_each(|v| seen.push(*v));
        assert_eq!(seen, vec![4]);
        assert_eq!(stats.dropped, 1);
    }
}
