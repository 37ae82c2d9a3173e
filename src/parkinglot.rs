//! Wrapper types and type aliases for detecting deadlocks between [`parking_lot`] mutexes.
//!
//! This module provides type aliases that use the [`lockapi`][crate::lockapi] module to provide
//! deadlock-detecting variants of the `parking_lot` primitives. The [`detecting`] module contains
//! type aliases that report to the detector, while the plain `parking_lot` primitives are
//! reexported as [`raw`].
//!
//! This main module imports from [`detecting`] when `debug_assertions` are enabled, and from
//! [`raw`] when they're not, so detection is active exactly where its overhead is acceptable.
//!
//! # Usage
//!
//! ```
//! # use std::sync::Arc;
//! # use std::thread;
//! use lockdep::parkinglot::Mutex;
//! let mutex = Arc::new(Mutex::new(0));
//!
//! let handles: Vec<_> = (0..10).map(|_| {
//!    let mutex = Arc::clone(&mutex);
//!    thread::spawn(move || *mutex.lock() += 1)
//! }).collect();
//!
//! handles.into_iter().for_each(|handle| handle.join().unwrap());
//!
//! // All threads completed so the value should be 10.
//! assert_eq!(10, *mutex.lock());
//! ```
//!
//! # Limitations
//!
//! The mutex guards returned by the detecting wrappers are `!Send`, regardless of whether
//! `parking_lot` is configured to have `Send` mutex guards: releases are recorded against the
//! holding-set of the thread that acquired.
//!
//! `ReentrantMutex` has no detecting alias. Re-acquiring a held lock is exactly what the
//! detector's double-lock check exists to reject, so a reentrant primitive cannot be tracked
//! under this model.

pub use parking_lot as raw;

#[cfg(debug_assertions)]
pub use detecting::{
    FairMutex, FairMutexGuard, MappedFairMutexGuard, MappedMutexGuard, MappedRwLockReadGuard,
    MappedRwLockWriteGuard, Mutex, MutexGuard, Once, OnceState, RwLock, RwLockReadGuard,
    RwLockUpgradableReadGuard, RwLockWriteGuard,
};

#[cfg(not(debug_assertions))]
pub use parking_lot::{
    FairMutex, FairMutexGuard, MappedFairMutexGuard, MappedMutexGuard, MappedRwLockReadGuard,
    MappedRwLockWriteGuard, Mutex, MutexGuard, Once, OnceState, RwLock, RwLockReadGuard,
    RwLockUpgradableReadGuard, RwLockWriteGuard,
};

/// Deadlock-detecting wrappers for [`parking_lot`].
pub mod detecting {
    pub use parking_lot::OnceState;

    use crate::LazyLockId;
    use crate::lockapi::DetectWrapper;

    type RawFairMutex = DetectWrapper<parking_lot::RawFairMutex>;
    type RawMutex = DetectWrapper<parking_lot::RawMutex>;
    type RawRwLock = DetectWrapper<parking_lot::RawRwLock>;

    /// Deadlock-detecting fair mutex. See: [`parking_lot::FairMutex`].
    pub type FairMutex<T> = lock_api::Mutex<RawFairMutex, T>;
    /// Mutex guard for [`FairMutex`].
    pub type FairMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawFairMutex, T>;
    /// RAII guard for [`FairMutexGuard::map`].
    pub type MappedFairMutexGuard<'a, T> = lock_api::MappedMutexGuard<'a, RawFairMutex, T>;

    /// Deadlock-detecting mutex. See: [`parking_lot::Mutex`].
    pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
    /// Mutex guard for [`Mutex`].
    pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
    /// RAII guard for [`MutexGuard::map`].
    pub type MappedMutexGuard<'a, T> = lock_api::MappedMutexGuard<'a, RawMutex, T>;

    /// Deadlock-detecting RwLock. See: [`parking_lot::RwLock`].
    pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;
    /// Read guard for [`RwLock`].
    pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;
    /// Upgradable Read guard for [`RwLock`].
    pub type RwLockUpgradableReadGuard<'a, T> =
        lock_api::RwLockUpgradableReadGuard<'a, RawRwLock, T>;
    /// Write guard for [`RwLock`].
    pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;
    /// RAII guard for `RwLockReadGuard::map`.
    pub type MappedRwLockReadGuard<'a, T> = lock_api::MappedRwLockReadGuard<'a, RawRwLock, T>;
    /// RAII guard for `RwLockWriteGuard::map`.
    pub type MappedRwLockWriteGuard<'a, T> = lock_api::MappedRwLockWriteGuard<'a, RawRwLock, T>;

    /// A deadlock-detecting wrapper for [`parking_lot::Once`].
    ///
    /// The one-time initialization counts as holding a lock, so locks acquired inside the
    /// initializer are recorded with the `Once` in their holding-set.
    #[derive(Debug, Default)]
    pub struct Once {
        inner: parking_lot::Once,
        id: LazyLockId,
    }

    impl Once {
        /// Create a new `Once` value.
        pub const fn new() -> Self {
            Self {
                inner: parking_lot::Once::new(),
                id: LazyLockId::new(),
            }
        }

        /// Returns the current state of this `Once`.
        pub fn state(&self) -> OnceState {
            self.inner.state()
        }

        /// This call is considered as "locking this `Once`" and it participates in dependency
        /// recording as such.
        ///
        /// # Panics
        ///
        /// This method will panic if `f` panics, poisoning this `Once`.
        pub fn call_once(&self, f: impl FnOnce()) {
            self.id.with_held(|| self.inner.call_once(f));
        }

        /// Performs the given initialization routine once and only once.
        ///
        /// This method is identical to [`Once::call_once`] except it ignores poisoning.
        pub fn call_once_force(&self, f: impl FnOnce(OnceState)) {
            self.id.with_held(|| self.inner.call_once_force(f));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::detecting;

    #[test]
    fn test_mutex_usage() {
        let mutex = Arc::new(detecting::Mutex::new(()));
        let local_lock = mutex.lock();
        drop(local_lock);

        thread::spawn(move || {
            let _remote_lock = mutex.lock();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_rwlock_usage() {
        let lock = Arc::new(detecting::RwLock::new(()));
        let lock2 = Arc::clone(&lock);

        let _read_lock = lock.read();

        // Should be able to acquire lock in the background
        thread::spawn(move || {
            let _read_lock = lock2.read();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_rwlock_upgradable_read_usage() {
        let lock = detecting::RwLock::new(());

        // Should be able to acquire an upgradable read lock.
        let upgradable_guard: detecting::RwLockUpgradableReadGuard<'_, _> = lock.upgradable_read();

        // Should be able to upgrade the guard.
        let _write_guard: detecting::RwLockWriteGuard<'_, _> =
            detecting::RwLockUpgradableReadGuard::upgrade(upgradable_guard);
    }

    #[test]
    fn test_once_usage() {
        let once = Arc::new(detecting::Once::new());
        let once_clone = once.clone();

        assert!(!once_clone.state().done());

        let handle = thread::spawn(move || {
            assert!(!once_clone.state().done());

            once_clone.call_once(|| {});

            assert!(once_clone.state().done());
        });

        handle.join().unwrap();

        assert!(once.state().done());
    }
}
