//! Wrapper implementations for [`lock_api`].
use std::panic::Location;

use lock_api::GuardNoSend;
use lock_api::RawMutex;
use lock_api::RawMutexFair;
use lock_api::RawMutexTimed;
use lock_api::RawRwLock;
use lock_api::RawRwLockDowngrade;
use lock_api::RawRwLockUpgrade;

use crate::LazyLockId;

/// Deadlock-detecting wrapper for all [`lock_api`] traits.
///
/// This wrapper implements any of the locking traits available, given that the wrapped type
/// implements them. As such, this wrapper can be used both for normal mutexes and rwlocks.
/// Shared (read) acquisitions are recorded with their mode so the detector can apply its
/// read-side relaxations; upgradable reads exclude writers and other upgradable readers, so they
/// are recorded as exclusive.
#[derive(Debug, Default)]
pub struct DetectWrapper<T> {
    inner: T,
    id: LazyLockId,
}

impl<T> DetectWrapper<T> {
    /// Record an acquisition of this lock.
    #[track_caller]
    fn mark_acquired(&self, is_read: bool) {
        self.id.mark_acquired_at(is_read, Location::caller());
    }

    /// Record the release of this lock.
    ///
    /// # Safety
    ///
    /// This function should only be called when the lock has been previously acquired by this
    /// thread.
    unsafe fn mark_released(&self) {
        self.id.mark_released();
    }

    /// Conditionally acquire the lock.
    ///
    /// Runs the provided acquisition attempt and records the acquisition only if it reports
    /// success. A failed try is not an acquisition and must leave no record.
    #[track_caller]
    fn conditionally_lock(&self, is_read: bool, f: impl FnOnce() -> bool) -> bool {
        if f() {
            self.mark_acquired(is_read);
            true
        } else {
            false
        }
    }
}

unsafe impl<T> RawMutex for DetectWrapper<T>
where
    T: RawMutex,
{
    const INIT: Self = Self {
        inner: T::INIT,
        id: LazyLockId::new(),
    };

    /// Always equal to [`GuardNoSend`]: the release is recorded against the holding-set of the
    /// thread that acquired, so guards must not migrate.
    type GuardMarker = GuardNoSend;

    #[track_caller]
    fn lock(&self) {
        self.mark_acquired(false);
        self.inner.lock();
    }

    #[track_caller]
    fn try_lock(&self) -> bool {
        self.conditionally_lock(false, || self.inner.try_lock())
    }

    unsafe fn unlock(&self) {
        self.inner.unlock();
        self.mark_released();
    }

    fn is_locked(&self) -> bool {
        // Can't use the default implementation as the inner type might've overwritten it.
        self.inner.is_locked()
    }
}

unsafe impl<T> RawMutexFair for DetectWrapper<T>
where
    T: RawMutexFair,
{
    unsafe fn unlock_fair(&self) {
        self.inner.unlock_fair();
        self.mark_released();
    }

    unsafe fn bump(&self) {
        // Bumping effectively doesn't change which locks are held, so we don't need to manage the
        // lock state.
        self.inner.bump();
    }
}

unsafe impl<T> RawMutexTimed for DetectWrapper<T>
where
    T: RawMutexTimed,
{
    type Duration = T::Duration;

    type Instant = T::Instant;

    #[track_caller]
    fn try_lock_for(&self, timeout: Self::Duration) -> bool {
        self.conditionally_lock(false, || self.inner.try_lock_for(timeout))
    }

    #[track_caller]
    fn try_lock_until(&self, timeout: Self::Instant) -> bool {
        self.conditionally_lock(false, || self.inner.try_lock_until(timeout))
    }
}

unsafe impl<T> RawRwLock for DetectWrapper<T>
where
    T: RawRwLock,
{
    const INIT: Self = Self {
        inner: T::INIT,
        id: LazyLockId::new(),
    };

    type GuardMarker = GuardNoSend;

    #[track_caller]
    fn lock_shared(&self) {
        self.mark_acquired(true);
        self.inner.lock_shared();
    }

    #[track_caller]
    fn try_lock_shared(&self) -> bool {
        self.conditionally_lock(true, || self.inner.try_lock_shared())
    }

    unsafe fn unlock_shared(&self) {
        self.inner.unlock_shared();
        self.mark_released();
    }

    #[track_caller]
    fn lock_exclusive(&self) {
        self.mark_acquired(false);
        self.inner.lock_exclusive();
    }

    #[track_caller]
    fn try_lock_exclusive(&self) -> bool {
        self.conditionally_lock(false, || self.inner.try_lock_exclusive())
    }

    unsafe fn unlock_exclusive(&self) {
        self.inner.unlock_exclusive();
        self.mark_released();
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

unsafe impl<T> RawRwLockUpgrade for DetectWrapper<T>
where
    T: RawRwLockUpgrade,
{
    #[track_caller]
    fn lock_upgradable(&self) {
        // Upgradable reads block writers and each other; record as exclusive.
        self.mark_acquired(false);
        self.inner.lock_upgradable();
    }

    #[track_caller]
    fn try_lock_upgradable(&self) -> bool {
        self.conditionally_lock(false, || self.inner.try_lock_upgradable())
    }

    unsafe fn unlock_upgradable(&self) {
        self.inner.unlock_upgradable();
        self.mark_released();
    }

    unsafe fn upgrade(&self) {
        // Same hold, same identity: nothing to re-record.
        self.inner.upgrade();
    }

    unsafe fn try_upgrade(&self) -> bool {
        self.inner.try_upgrade()
    }
}

unsafe impl<T> RawRwLockDowngrade for DetectWrapper<T>
where
    T: RawRwLockDowngrade,
{
    unsafe fn downgrade(&self) {
        // The mode was captured at acquisition; the hold itself continues.
        self.inner.downgrade();
    }
}
