//! Deadlock-detecting wrappers for types found in `std::sync`.
//!
//! This module provides wrappers for `std::sync` primitives with exactly the same API and
//! functionality as their counterparts, with the exception that every acquisition and release is
//! reported to the deadlock detector.
//!
//! ```rust
//! # use lockdep::stdsync::Mutex;
//! # use lockdep::stdsync::RwLock;
//! let mutex = Mutex::new(());
//! mutex.lock().unwrap();
//!
//! let rwlock = RwLock::new(());
//! rwlock.read().unwrap();
//! ```
use std::fmt;
use std::panic::Location;
use std::sync::LockResult;
use std::sync::PoisonError;
use std::sync::TryLockError;
use std::sync::TryLockResult;

use crate::HeldLock;
use crate::LazyLockId;

#[cfg(has_std__sync__LazyLock)]
mod lazy_lock;

#[cfg(has_std__sync__LazyLock)]
pub use lazy_lock::LazyLock;

/// Wrapper for `std::sync::Mutex`.
///
/// The bookkeeping event fires *before* the underlying `lock` call: if this mutex is part of an
/// actual deadlock the thread blocks inside `lock()` with the acquisition already on record,
/// which is what allows the periodic detector to see the stuck cycle.
#[derive(Debug)]
pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
    id: LazyLockId,
}

/// Wrapper for `std::sync::MutexGuard`.
#[derive(Debug)]
pub struct MutexGuard<'a, T> {
    inner: std::sync::MutexGuard<'a, T>,
    _held: HeldLock<'a>,
}

fn map_lockresult<T, I, F>(result: LockResult<I>, mapper: F) -> LockResult<T>
where
    F: FnOnce(I) -> T,
{
    match result {
        Ok(inner) => Ok(mapper(inner)),
        Err(poisoned) => Err(PoisonError::new(mapper(poisoned.into_inner()))),
    }
}

fn map_trylockresult<T, I, F>(result: TryLockResult<I>, mapper: F) -> TryLockResult<T>
where
    F: FnOnce(I) -> T,
{
    match result {
        Ok(inner) => Ok(mapper(inner)),
        Err(TryLockError::WouldBlock) => Err(TryLockError::WouldBlock),
        Err(TryLockError::Poisoned(poisoned)) => {
            Err(PoisonError::new(mapper(poisoned.into_inner())).into())
        }
    }
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(t),
            id: LazyLockId::new(),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> LockResult<MutexGuard<'_, T>> {
        let held = self.id.acquire(false);
        let result = self.inner.lock();

        map_lockresult(result, |inner| MutexGuard {
            inner,
            _held: held,
        })
    }

    /// Attempt to acquire the mutex without blocking.
    ///
    /// A failed attempt is not an acquisition and records nothing.
    #[track_caller]
    pub fn try_lock(&self) -> TryLockResult<MutexGuard<'_, T>> {
        let acquired_at = Location::caller();
        let result = self.inner.try_lock();

        map_trylockresult(result, |inner| MutexGuard {
            inner,
            _held: self.id.acquire_at(false, acquired_at),
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.is_poisoned()
    }

    pub fn get_mut(&mut self) -> LockResult<&mut T> {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> LockResult<T> {
        self.inner.into_inner()
    }

    /// Identity under which this mutex appears in [`DeadlockReport`][crate::DeadlockReport]
    /// cycles.
    pub fn id(&self) -> usize {
        self.id.value()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(t: T) -> Self {
        Self::new(t)
    }
}

impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<'a, T: fmt::Display> fmt::Display for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// Wrapper for `std::sync::RwLock`.
///
/// Read acquisitions are recorded with their mode, so cycles that can only close through two
/// read-side holds of this lock are not reported. Note that with
/// [`Options::check_double_locking`][crate::Options::check_double_locking] set, recursive read
/// acquisition from one thread is reported as a double-lock.
#[derive(Debug)]
pub struct RwLock<T> {
    inner: std::sync::RwLock<T>,
    id: LazyLockId,
}

/// Hybrid wrapper for both `std::sync::RwLockReadGuard` and `std::sync::RwLockWriteGuard`.
///
/// Please refer to [`RwLockReadGuard`] and [`RwLockWriteGuard`] for usable types.
#[derive(Debug)]
pub struct RwLockGuard<'a, L> {
    inner: L,
    _held: HeldLock<'a>,
}

/// Wrapper around `std::sync::RwLockReadGuard`.
pub type RwLockReadGuard<'a, T> = RwLockGuard<'a, std::sync::RwLockReadGuard<'a, T>>;
/// Wrapper around `std::sync::RwLockWriteGuard`.
pub type RwLockWriteGuard<'a, T> = RwLockGuard<'a, std::sync::RwLockWriteGuard<'a, T>>;

impl<T> RwLock<T> {
    pub const fn new(t: T) -> Self {
        Self {
            inner: std::sync::RwLock::new(t),
            id: LazyLockId::new(),
        }
    }

    #[track_caller]
    pub fn read(&self) -> LockResult<RwLockReadGuard<'_, T>> {
        let held = self.id.acquire(true);
        let result = self.inner.read();

        map_lockresult(result, |inner| RwLockGuard {
            inner,
            _held: held,
        })
    }

    #[track_caller]
    pub fn write(&self) -> LockResult<RwLockWriteGuard<'_, T>> {
        let held = self.id.acquire(false);
        let result = self.inner.write();

        map_lockresult(result, |inner| RwLockGuard {
            inner,
            _held: held,
        })
    }

    #[track_caller]
    pub fn try_read(&self) -> TryLockResult<RwLockReadGuard<'_, T>> {
        let acquired_at = Location::caller();
        let result = self.inner.try_read();

        map_trylockresult(result, |inner| RwLockGuard {
            inner,
            _held: self.id.acquire_at(true, acquired_at),
        })
    }

    #[track_caller]
    pub fn try_write(&self) -> TryLockResult<RwLockWriteGuard<'_, T>> {
        let acquired_at = Location::caller();
        let result = self.inner.try_write();

        map_trylockresult(result, |inner| RwLockGuard {
            inner,
            _held: self.id.acquire_at(false, acquired_at),
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.is_poisoned()
    }

    pub fn get_mut(&mut self) -> LockResult<&mut T> {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> LockResult<T> {
        self.inner.into_inner()
    }

    /// Identity under which this rwlock appears in [`DeadlockReport`][crate::DeadlockReport]
    /// cycles.
    pub fn id(&self) -> usize {
        self.id.value()
    }
}

impl<T> Default for RwLock<T>
where
    T: Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for RwLock<T> {
    fn from(t: T) -> Self {
        Self::new(t)
    }
}

impl<'a, L, T> std::ops::Deref for RwLockGuard<'a, L>
where
    L: std::ops::Deref<Target = T>,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl<'a, L, T> std::ops::DerefMut for RwLockGuard<'a, L>
where
    L: std::ops::Deref<Target = T> + std::ops::DerefMut,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.deref_mut()
    }
}

/// Wrapper for [`std::sync::Once`].
///
/// The one-time initialization counts as holding a lock, so locks acquired inside the initializer
/// are recorded with this `Once` in their holding-set.
#[derive(Debug)]
pub struct Once {
    inner: std::sync::Once,
    id: LazyLockId,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl Once {
    pub const fn new() -> Self {
        Self {
            inner: std::sync::Once::new(),
            id: LazyLockId::new(),
        }
    }

    /// This call is considered as "locking this `Once`" and it participates in dependency
    /// recording as such.
    #[track_caller]
    pub fn call_once(&self, f: impl FnOnce()) {
        self.id.with_held(|| self.inner.call_once(f));
    }

    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_mutex_usage() {
        let mutex = Arc::new(Mutex::new(0));
        let mutex_clone = mutex.clone();

        *mutex.lock().unwrap() += 1;

        let _guard = mutex.lock().unwrap();

        // Now try to cause a blocking exception in another thread
        let handle = thread::spawn(move || {
            let result = mutex_clone.try_lock().unwrap_err();

            assert!(matches!(result, TryLockError::WouldBlock));
        });

        handle.join().unwrap();

        assert_eq!(*_guard, 1);
    }

    #[test]
    fn test_rwlock_usage() {
        let rwlock = Arc::new(RwLock::new(()));
        let rwlock_clone = rwlock.clone();

        let _read_lock = rwlock.read().unwrap();

        // Now try to cause a blocking exception in another thread
        let handle = thread::spawn(move || {
            let write_result = rwlock_clone.try_write().unwrap_err();

            assert!(matches!(write_result, TryLockError::WouldBlock));

            // Should be able to get a read lock just fine.
            let _read_lock = rwlock_clone.read().unwrap();
        });

        handle.join().unwrap();
    }

    #[test]
    fn test_once_usage() {
        let once = Once::new();
        let mut calls = 0;

        once.call_once(|| calls += 1);
        once.call_once(|| calls += 1);

        assert!(once.is_completed());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_into_inner() {
        let mutex = Mutex::new(42);
        mutex.lock().unwrap();

        assert_eq!(mutex.into_inner().unwrap(), 42);
    }

    /// Both acquisition orders of the same pair, each from its own thread, must show up as one
    /// potential deadlock involving exactly these two locks.
    #[test]
    fn lock_order_inversion_is_reported() {
        let a = Mutex::new(());
        let b = Mutex::new(());

        thread::scope(|s| {
            s.spawn(|| {
                let _a = a.lock().unwrap();
                let _b = b.lock().unwrap();
            })
            .join()
            .unwrap();

            s.spawn(|| {
                let _b = b.lock().unwrap();
                let _a = a.lock().unwrap();
            })
            .join()
            .unwrap();
        });

        let ids = [a.id(), b.id()];
        let reports = crate::find_potential_deadlocks();

        assert!(
            reports.iter().any(|report| {
                report.cycle.len() == 2
                    && report.cycle.iter().all(|entry| ids.contains(&entry.lock))
            }),
            "inversion of locks {ids:?} was not reported"
        );
    }

    /// The same inversion through an rwlock held read-side on both sides is harmless and must
    /// not be reported.
    #[test]
    fn read_read_inversion_is_not_reported() {
        let r = RwLock::new(());
        let b = Mutex::new(());

        thread::scope(|s| {
            s.spawn(|| {
                let _r = r.read().unwrap();
                let _b = b.lock().unwrap();
            })
            .join()
            .unwrap();

            s.spawn(|| {
                let _b = b.lock().unwrap();
                let _r = r.read().unwrap();
            })
            .join()
            .unwrap();
        });

        let ids = [r.id(), b.id()];
        let reports = crate::find_potential_deadlocks();

        assert!(
            !reports.iter().any(|report| {
                report.cycle.iter().all(|entry| ids.contains(&entry.lock))
            }),
            "read-read inversion of {ids:?} was wrongly reported"
        );
    }
}
