//! Wrapper implementation for LazyLock
//!
//! Lives in its own module because `std::sync::LazyLock` is newer than the crate MSRV; the build
//! script enables this only when the toolchain has it.
use std::fmt;
use std::fmt::Debug;
use std::ops::Deref;

use crate::LazyLockId;

/// Wrapper for [`std::sync::LazyLock`].
///
/// Every access counts as acquiring and releasing the lazy value, and the one-time initializer
/// runs while it is held. Locks taken inside the initializer are therefore recorded with this
/// value in their holding-set, so an initialization order that inverts against lock usage
/// elsewhere in the program surfaces in
/// [`find_potential_deadlocks`][crate::find_potential_deadlocks] like any other inversion, even
/// when every access in the observed run completed fine.
///
/// # Examples
///
/// ```
/// use lockdep::stdsync::LazyLock;
///
/// static LIMITS: LazyLock<Vec<u32>> = LazyLock::new(|| vec![16, 64, 256]);
///
/// // First access runs the initializer, later ones reuse the value.
/// assert_eq!(LIMITS.len(), 3);
/// assert_eq!(LIMITS[0], 16);
/// ```
pub struct LazyLock<T, F = fn() -> T> {
    inner: std::sync::LazyLock<T, F>,
    id: LazyLockId,
}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new lazy value with the given initializing function.
    pub const fn new(f: F) -> LazyLock<T, F> {
        Self {
            id: LazyLockId::new(),
            inner: std::sync::LazyLock::new(f),
        }
    }

    /// Force this lazy lock to be evaluated.
    ///
    /// This is equivalent to dereferencing, but is more explicit.
    pub fn force(this: &LazyLock<T, F>) -> &T {
        &*this
    }

    /// Identity under which this value appears in [`DeadlockReport`][crate::DeadlockReport]
    /// cycles.
    ///
    /// An associated function rather than a method, so it cannot shadow an `id` method on the
    /// wrapped value.
    pub fn id(this: &LazyLock<T, F>) -> usize {
        this.id.value()
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.id.with_held(|| &*self.inner)
    }
}

impl<T: Default> Default for LazyLock<T> {
    /// Return a `LazyLock` that is initialized through [`Default`].
    fn default() -> Self {
        Self::new(Default::default)
    }
}

impl<T: Debug, F> Debug for LazyLock<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::thread;

    use super::*;
    use crate::stdsync::Mutex;

    #[test]
    fn initializer_runs_once() {
        let runs = Cell::new(0);

        let lazy = LazyLock::new(|| {
            runs.set(runs.get() + 1);
            "ready"
        });

        assert_eq!(*lazy, "ready");
        assert_eq!(*LazyLock::force(&lazy), "ready");
        assert_eq!(runs.get(), 1);
    }

    /// An initializer that takes a mutex, inverted against a thread that touches the lazy while
    /// holding that mutex, must show up as a potential deadlock between exactly those two
    /// identities.
    #[test]
    fn initializer_acquisitions_are_reported() {
        let source = Mutex::new(7);
        let cached = LazyLock::new(|| *source.lock().unwrap());

        thread::scope(|s| {
            // Initializes the lazy: the mutex is acquired with the lazy in the holding-set.
            s.spawn(|| {
                assert_eq!(*LazyLock::force(&cached), 7);
            })
            .join()
            .unwrap();

            // Reads the already-initialized lazy while holding the mutex: the opposite order.
            s.spawn(|| {
                let _guard = source.lock().unwrap();
                assert_eq!(*cached, 7);
            })
            .join()
            .unwrap();
        });

        let ids = [LazyLock::id(&cached), source.id()];
        let reports = crate::find_potential_deadlocks();

        assert!(
            reports.iter().any(|report| {
                report.cycle.len() == 2
                    && report.cycle.iter().all(|entry| ids.contains(&entry.lock))
            }),
            "initializer inversion of {ids:?} was not reported"
        );
    }
}
