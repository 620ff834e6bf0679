//! Services an [`EventLog`](crate::EventLog) consumes: a monotonic clock and the identity of the
//! recording task.
//!
//! Both traits are implemented for plain closures, which is usually all a test or an embedded
//! target needs. With the `std` feature, [`MonotonicClock`] and [`ThreadIdentity`] cover hosted
//! programs.

/// Monotonic nanosecond clock.
pub trait Clock {
    fn now_nanos(&self) -> i64;
}

impl<F: Fn() -> i64> Clock for F {
    #[inline]
    fn now_nanos(&self) -> i64 {
        self()
    }
}

/// The task that is recording and the worker it runs on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Producer {
    pub task: u64,
    pub worker: i64,
}

/// Reports who is calling.
pub trait IdentitySource {
    fn current(&self) -> Producer;
}

impl<F: Fn() -> Producer> IdentitySource for F {
    #[inline]
    fn current(&self) -> Producer {
        self()
    }
}

#[cfg(feature = "std")]
pub use hosted::{MonotonicClock, ThreadIdentity, set_current_task};

#[cfg(feature = "std")]
mod hosted {
    use super::{Clock, IdentitySource, Producer};
    use core::cell::Cell;
    use core::sync::atomic::{AtomicI64, Ordering};
    use std::time::Instant;

    /// Nanoseconds elapsed since the clock was created.
    #[derive(Copy, Clone, Debug)]
    pub struct MonotonicClock {
        origin: Instant,
    }

    impl MonotonicClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
            }
        }
    }

    impl Default for MonotonicClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for MonotonicClock {
        fn now_nanos(&self) -> i64 {
            i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
        }
    }

    static NEXT_WORKER: AtomicI64 = AtomicI64::new(1);

    std::thread_local! {
        static WORKER: i64 = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
        static TASK: Cell<u64> = const { Cell::new(0) };
    }

    /// Tag the calling thread with the task it is currently running. `0` means none.
    ///
    /// Executors that multiplex tasks over threads call this as they switch tasks.
    pub fn set_current_task(task: u64) {
        TASK.with(|t| t.set(task));
    }

    /// Identity from thread-local state.
    ///
    /// Workers are numbered from `1` in the order threads first record; the task id is whatever
    /// [`set_current_task`] last stored on the thread.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct ThreadIdentity;

    impl IdentitySource for ThreadIdentity {
        fn current(&self) -> Producer {
            Producer {
                task: TASK.with(Cell::get),
                worker: WORKER.with(|w| *w),
            }
        }
    }

}
