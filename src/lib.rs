//! Deadlocks happen when concurrent code acquires the same locks in inconsistent orders. This
//! crate detects that at runtime: it provides drop-in mutex and rwlock wrappers that record, for
//! every acquisition, which locks the acquiring context already held. From those records it builds
//! per-context lock trees and searches them for cycles, the structural signature of a deadlock.
//!
//! Two detection modes are available and can be combined:
//!
//! - **Comprehensive detection** runs after the interesting part of the program has finished
//!   (call [`find_potential_deadlocks`] at the end of `main` or from a test). It enumerates every
//!   cycle in the recorded dependencies and reports *potential* deadlocks, meaning lock-order
//!   inversions that could deadlock under a different schedule, even if the observed run
//!   completed fine.
//!
//! - **Periodic detection** runs on a background timer while the program is live (see
//!   [`start_periodic`]). It examines only the most recent dependency of each context, so it can
//!   catch a *partial* deadlock in which some contexts are stuck while the rest of the program
//!   keeps running. A candidate cycle is confirmed by checking that none of the involved contexts
//!   has made progress; on confirmation the deadlock is reported, the comprehensive pass runs for
//!   extra diagnostics, and the process exits with status 2.
//!
//! ```
//! use std::thread;
//!
//! use lockdep::stdsync::Mutex;
//!
//! let a = Mutex::new(());
//! let b = Mutex::new(());
//!
//! thread::scope(|s| {
//!     s.spawn(|| {
//!         let _a = a.lock().unwrap();
//!         let _b = b.lock().unwrap();
//!     })
//!     .join()
//!     .unwrap();
//!
//!     s.spawn(|| {
//!         let _b = b.lock().unwrap();
//!         let _a = a.lock().unwrap();
//!     })
//!     .join()
//!     .unwrap();
//! });
//!
//! // The two threads never overlapped, but both orders were observed: the
//! // post-mortem pass reports the inversion.
//! let reports = lockdep::find_potential_deadlocks();
//! assert_eq!(reports.len(), 1);
//! assert!(!reports[0].confirmed);
//! ```
//!
//! # What gets detected
//!
//! The detector reasons about lock *order*, not about time. A reported cycle means the recorded
//! acquisition orders permit a schedule that deadlocks; other synchronization the detector cannot
//! see (channels, condition variables, join handles) may rule that schedule out in practice.
//! Conversely, only the instrumented lock types are observed; blocking on anything else is
//! invisible. Read acquisitions on rwlocks are tracked with their mode, and cycles that can only
//! close through two read-side holds of the same rwlock are filtered out, since readers do not
//! block each other.
//!
//! # Panics
//!
//! Misuse of the instrumented locks is a programmer error and panics immediately: releasing a
//! lock the context does not hold, re-acquiring a held lock while
//! [`Options::check_double_locking`] is set, or exceeding [`Options::max_contexts`] distinct
//! contexts.
//!
//! # Structure
//!
//! [`stdsync`] wraps the `std::sync` primitives with identical APIs. With the `lock_api` feature,
//! [`lockapi`] provides a wrapper for any raw lock implementing the `lock_api` traits, and with
//! `parking_lot`, [`parkinglot`] plugs the parking_lot primitives into it.
//!
//! # Feature flags
//!
//! - `backtraces`: capture a backtrace for every recorded dependency so reports show where each
//!   acquisition happened. Enabled by default; disable it if the capture overhead distorts the
//!   program under test.
//!
//! - `lock_api`: enables the wrapper for [`lock_api`][lock_api] locks.
//!
//! - `parking_lot`: enables detecting variants of the [`parking_lot`][parking_lot] primitives.
//!
//! # Performance considerations
//!
//! Every acquisition appends a dependency record (a copy of the context's held-lock list) and
//! every release pops one entry; both briefly lock the owning context's slot, which is contended
//! only while a detector pass is snapshotting it. Recorded dependencies are kept for the lifetime
//! of the process; that history is what the post-mortem analysis consumes. The periodic pass
//! does work proportional to the number of contexts unless the lock landscape changed since the
//! previous tick.
//!
//! [lock_api]: https://docs.rs/lock_api/0.4/lock_api/index.html
//! [parking_lot]: https://docs.rs/parking_lot/0.12/parking_lot/
#![cfg_attr(docsrs, feature(doc_cfg))]
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::Location;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

mod detect;
mod detector;
#[cfg(feature = "lock_api")]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub mod lockapi;
#[cfg(feature = "parking_lot")]
#[cfg_attr(docsrs, doc(cfg(feature = "parking_lot")))]
pub mod parkinglot;
mod registry;
mod reporting;
pub mod stdsync;

pub use detector::Options;
pub use detector::find_potential_deadlocks;
pub use detector::init;
pub use detector::start_periodic;
pub use detector::stop_periodic;
pub use reporting::CycleEntry;
pub use reporting::DeadlockReport;

thread_local! {
    /// Registry slot of the current thread, allocated on its first lock event.
    static ROUTINE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Registry index of the calling thread, allocating a slot on first use.
///
/// Slots are never reused; a thread keeps its index for the life of the process.
fn current_routine() -> usize {
    ROUTINE.with(|slot| match slot.get() {
        Some(index) => index,
        None => {
            let index = detector::detector().registry().register();
            slot.set(Some(index));
            index
        }
    })
}

/// Dedicated identity type for instrumented locks.
///
/// The identity is what dependency records and reports refer to. It is unique for the runtime of
/// the program and never reused, so snapshots taken while the lock was alive stay unambiguous
/// after the lock is gone.
struct LockId(usize);

impl LockId {
    /// Get a new, unique, lock ID.
    ///
    /// # Panics
    ///
    /// This function may panic when there are no more lock IDs available. The number of lock ids
    /// is `usize::MAX - 1` which should be plenty for most practical applications.
    pub fn new() -> Self {
        // Counter for lock IDs. Atomic avoids the need for locking.
        static ID_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

        ID_SEQUENCE
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map(Self)
            .expect("Lock ID wraparound happened, results unreliable")
    }

    pub fn value(&self) -> usize {
        self.0
    }

    /// Record an acquisition of this lock and return a guard that records the release.
    ///
    /// This must be called *before* blocking on the underlying primitive: a context stuck in a
    /// lock call has to already show the awaited lock at the top of its held list, or the
    /// periodic detector could not see what it is waiting for.
    #[track_caller]
    pub fn acquire(&self, is_read: bool) -> HeldLock<'_> {
        self.acquire_at(is_read, Location::caller())
    }

    /// [`LockId::acquire`] with an explicit acquisition site, for callers that capture the caller
    /// location before running an underlying `try_lock`.
    pub fn acquire_at(
        &self,
        is_read: bool,
        acquired_at: &'static Location<'static>,
    ) -> HeldLock<'_> {
        self.mark_acquired_at(is_read, acquired_at);
        HeldLock {
            id: self,
            _not_send: PhantomData,
        }
    }

    /// Record an acquisition without constructing a release guard.
    pub fn mark_acquired_at(&self, is_read: bool, acquired_at: &'static Location<'static>) {
        let detector = detector::detector();
        if !detector.options().record_events() {
            return;
        }

        detector.on_lock(current_routine(), self.value(), is_read, acquired_at);
    }

    /// Record the release of this lock.
    ///
    /// # Safety
    ///
    /// This function should only be called when the lock has been previously acquired by this
    /// thread.
    pub unsafe fn mark_released(&self) {
        let detector = detector::detector();
        if !detector.options().record_events() {
            return;
        }

        detector.on_unlock(current_routine(), self.value());
    }

    /// Execute the given closure while the lock counts as held.
    #[track_caller]
    pub fn with_held<T>(&self, f: impl FnOnce() -> T) -> T {
        // Note: we MUST construct the RAII guard, we cannot simply mark held + mark released, as
        // f() may panic and corrupt our state.
        let _guard = self.acquire(false);
        f()
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockId({:?})", self.0)
    }
}

/// `const`-compatible version of [`LockId`].
///
/// This struct can be used similarly to the normal lock ID, but to be const-compatible its ID is
/// generated on first use. This allows it to be used as the identity for locks with a `const`
/// constructor.
struct LazyLockId {
    inner: OnceLock<LockId>,
}

impl LazyLockId {
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }
}

impl fmt::Debug for LazyLockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.deref())
    }
}

impl Default for LazyLockId {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for LazyLockId {
    type Target = LockId;

    fn deref(&self) -> &Self::Target {
        self.inner.get_or_init(LockId::new)
    }
}

/// Held lock, registered in the owning context's holding-set.
///
/// This type should be used as part of a lock guard wrapper. It can be acquired through
/// [`LockId::acquire`] and will record the release when it is dropped.
///
/// This type intentionally is [`!Send`](std::marker::Send) because the holding-set it pops on
/// drop belongs to the thread that acquired the lock.
#[derive(Debug)]
struct HeldLock<'a> {
    /// Reference to the lock we were acquired from
    id: &'a LockId,
    /// This value serves no purpose but to make the type [`!Send`](std::marker::Send)
    _not_send: PhantomData<MutexGuard<'static, ()>>,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        // Safety: the only way to get a HeldLock is by acquiring the lock.
        unsafe { self.id.mark_released() };
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rand::seq::SliceRandom;
    use rand::thread_rng;

    use super::*;
    use crate::stdsync::Mutex;

    #[test]
    fn test_next_lock_id() {
        let initial = LockId::new();
        let next = LockId::new();

        // Can't assert N + 1 because multiple threads running tests
        assert!(initial.0 < next.0);
    }

    #[test]
    fn test_lazy_lock_id() {
        let a = LazyLockId::new();
        let b = LazyLockId::new();

        // IDs materialize on first use and stay stable.
        let first = a.value();
        assert_eq!(first, a.value());
        assert_ne!(a.value(), b.value());
    }

    /// Fuzz the detector by acquiring lots of mutexes in a globally consistent order.
    ///
    /// Threads pick random subsets of a 30-lock array but always lock in ascending index order,
    /// so no cycle through these locks can exist. The post-mortem pass must not implicate them,
    /// no matter what other tests have recorded in the shared registry.
    #[test]
    fn fuzz_ordered_acquisitions() {
        const NUM_LOCKS: usize = 30;

        let locks: Vec<Mutex<()>> = (0..NUM_LOCKS).map(|_| Mutex::new(())).collect();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut rng = thread_rng();

                    for _ in 0..50 {
                        let mut picks: Vec<usize> = (0..NUM_LOCKS).collect();
                        picks.shuffle(&mut rng);
                        picks.truncate(4);
                        picks.sort_unstable();

                        let _guards: Vec<_> =
                            picks.iter().map(|&i| locks[i].lock().unwrap()).collect();
                    }
                });
            }
        });

        let ids: Vec<usize> = locks.iter().map(|lock| lock.id()).collect();
        for report in find_potential_deadlocks() {
            assert!(
                !report.cycle.iter().all(|entry| ids.contains(&entry.lock)),
                "ordered locks were reported as a cycle: {report}"
            );
        }
    }
}
