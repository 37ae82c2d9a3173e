//! Per-context lock bookkeeping.
//!
//! Every execution context that takes an instrumented lock owns a slot in the [`Registry`]: its
//! current holding-set, the append-only list of [`Dependency`] records it has produced, and a
//! pointer to the most recent one. The wrappers report events into the owning slot; the detector
//! passes read the slots through short snapshot accessors.
use std::panic::Location;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use smallvec::SmallVec;

use crate::reporting::Captured;
use crate::reporting::Trace;

/// Identity and acquisition mode of a lock, captured at acquisition time.
///
/// The mode is a snapshot: analysis never consults the live lock, so a rwlock that is later
/// re-acquired in the other mode does not rewrite history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LockSnap {
    pub id: usize,
    pub is_read: bool,
}

/// A lock paired with the locks that were held when it was acquired.
///
/// The holding-set is copied at creation and never mutated afterwards, which is what allows
/// detector passes to hold on to dependencies without freezing the contexts that produced them.
#[derive(Debug)]
pub(crate) struct Dependency {
    /// Registry index of the context that recorded this dependency.
    pub routine: usize,
    /// The acquired lock.
    pub lock: LockSnap,
    /// Locks held at the moment of acquisition, in acquisition order. Never contains `lock`.
    pub holding: Box<[LockSnap]>,
    /// Source location of the acquisition.
    pub acquired_at: &'static Location<'static>,
    /// Optional backtrace of the acquisition.
    pub trace: Trace,
}

impl Dependency {
    /// Identity sequence of this dependency: the acquired lock followed by the held locks.
    ///
    /// Two dependencies with equal fingerprints describe the same acquisition pattern, which is
    /// the deduplication unit for both the precondition count and reports.
    pub fn fingerprint(&self) -> Vec<usize> {
        let mut key = Vec::with_capacity(self.holding.len() + 1);
        key.push(self.lock.id);
        key.extend(self.holding.iter().map(|held| held.id));
        key
    }
}

/// Locks currently held by one context, in acquisition order.
///
/// Sized for typical nesting depth; deeper programs spill to the heap.
type HoldingSet = SmallVec<[LockSnap; 8]>;

#[derive(Default)]
struct RoutineState {
    holding: HoldingSet,
    /// Append-only; entries are never mutated or removed.
    deps: Vec<Arc<Dependency>>,
    /// Last element of `deps` while any lock is held, `None` once the holding-set empties.
    cur_dep: Option<Arc<Dependency>>,
}

/// Everything the periodic pass needs to know about one context, read in a single visit.
pub(crate) struct RoutineObservation {
    /// Identity of the most recently acquired held lock.
    pub top: Option<usize>,
    /// Number of locks currently held.
    pub held: usize,
    /// The context's current dependency.
    pub cur_dep: Option<Arc<Dependency>>,
}

/// Dense, index-addressed table of execution contexts.
///
/// Slots are allocated on a context's first lock event and never reclaimed; the table itself is
/// sized once, at detector initialization, so that slot addresses stay stable without a lock
/// around the table.
pub(crate) struct Registry {
    routines: Box<[Mutex<RoutineState>]>,
    count: AtomicUsize,
}

impl Registry {
    pub fn new(max_contexts: usize) -> Self {
        let routines = (0..max_contexts)
            .map(|_| Mutex::new(RoutineState::default()))
            .collect();

        Self {
            routines,
            count: AtomicUsize::new(0),
        }
    }

    /// Allocate a slot for a new execution context.
    ///
    /// # Panics
    ///
    /// Panics when the table is full; the detector cannot function with a truncated context
    /// table.
    pub fn register(&self) -> usize {
        let index = self.count.fetch_add(1, Ordering::SeqCst);
        if index >= self.routines.len() {
            panic!(
                "More than {} contexts took instrumented locks; raise Options::max_contexts",
                self.routines.len()
            );
        }
        index
    }

    /// Number of contexts that have ever taken an instrumented lock.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst).min(self.routines.len())
    }

    fn state(&self, routine: usize) -> MutexGuard<'_, RoutineState> {
        self.routines[routine]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a lock acquisition by `routine`.
    ///
    /// If the context already holds locks, a [`Dependency`] is appended and becomes the current
    /// dependency; the acquired lock is then pushed onto the holding-set. Successful try-locks
    /// are recorded through the same path.
    pub fn on_lock(
        &self,
        routine: usize,
        lock: LockSnap,
        check_double_locking: bool,
        acquired_at: &'static Location<'static>,
    ) {
        let mut state = self.state(routine);

        if check_double_locking && state.holding.iter().any(|held| held.id == lock.id) {
            panic!(
                "Lock {} was acquired twice by the same context without a release in between",
                lock.id
            );
        }

        if !state.holding.is_empty() {
            let dep = Arc::new(Dependency {
                routine,
                lock,
                holding: state.holding.iter().copied().collect(),
                acquired_at,
                trace: Trace::capture(),
            });
            state.deps.push(Arc::clone(&dep));
            state.cur_dep = Some(dep);
        }

        state.holding.push(lock);
    }

    /// Remove `id` from the context's holding-set.
    ///
    /// The dependency list is untouched; once the holding-set empties the current dependency is
    /// cleared.
    ///
    /// # Panics
    ///
    /// Panics when the context does not hold the lock.
    pub fn on_unlock(&self, routine: usize, id: usize) {
        let mut state = self.state(routine);

        match state.holding.iter().rposition(|held| held.id == id) {
            Some(position) => {
                state.holding.remove(position);
            }
            None => panic!("Tried to release lock {id} which the context does not hold"),
        }

        if state.holding.is_empty() {
            state.cur_dep = None;
        }
    }

    /// Snapshot of every context's dependency list, the comprehensive pass input.
    pub fn dependencies(&self) -> Vec<Vec<Arc<Dependency>>> {
        (0..self.count())
            .map(|routine| self.state(routine).deps.clone())
            .collect()
    }

    /// Single-visit snapshot of one context for the periodic pass.
    pub fn observe(&self, routine: usize) -> RoutineObservation {
        let state = self.state(routine);

        RoutineObservation {
            top: state.holding.last().map(|held| held.id),
            held: state.holding.len(),
            cur_dep: state.cur_dep.clone(),
        }
    }

    /// Live top-of-holding of one context, re-read by the periodic confirmation step.
    pub fn top_of_holding(&self, routine: usize) -> Option<usize> {
        self.state(routine).holding.last().map(|held| held.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(id: usize) -> LockSnap {
        LockSnap { id, is_read: false }
    }

    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn dependency_created_only_under_held_locks() {
        let registry = Registry::new(4);
        let routine = registry.register();

        registry.on_lock(routine, write(1), true, here());
        assert!(registry.observe(routine).cur_dep.is_none());

        registry.on_lock(routine, write(2), true, here());
        let dep = registry.observe(routine).cur_dep.expect("dependency");
        assert_eq!(dep.lock.id, 2);
        assert_eq!(dep.fingerprint(), vec![2, 1]);
        // The acquired lock never appears in its own holding-set.
        assert!(dep.holding.iter().all(|held| held.id != 2));
    }

    #[test]
    fn current_dependency_cleared_when_holding_set_empties() {
        let registry = Registry::new(4);
        let routine = registry.register();

        registry.on_lock(routine, write(1), true, here());
        registry.on_lock(routine, write(2), true, here());
        registry.on_unlock(routine, 2);
        // Still holding lock 1, the dependency stays current.
        assert!(registry.observe(routine).cur_dep.is_some());

        registry.on_unlock(routine, 1);
        assert!(registry.observe(routine).cur_dep.is_none());
        assert_eq!(registry.top_of_holding(routine), None);
    }

    #[test]
    fn dependency_snapshots_are_immutable() {
        let registry = Registry::new(4);
        let routine = registry.register();

        registry.on_lock(routine, write(1), true, here());
        registry.on_lock(routine, write(2), true, here());
        let dep = registry.observe(routine).cur_dep.expect("dependency");

        // Releasing everything must not disturb the recorded snapshot.
        registry.on_unlock(routine, 2);
        registry.on_unlock(routine, 1);
        assert_eq!(dep.holding.len(), 1);
        assert_eq!(dep.holding[0].id, 1);
    }

    #[test]
    fn dependency_lists_are_append_only() {
        let registry = Registry::new(4);
        let routine = registry.register();
        let mut previous = 0;

        for round in 0..3 {
            registry.on_lock(routine, write(10), true, here());
            registry.on_lock(routine, write(20 + round), true, here());
            registry.on_unlock(routine, 20 + round);
            registry.on_unlock(routine, 10);

            let current = registry.dependencies()[routine].len();
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    #[should_panic(expected = "acquired twice")]
    fn double_lock_panics() {
        let registry = Registry::new(4);
        let routine = registry.register();

        registry.on_lock(routine, write(1), true, here());
        registry.on_lock(routine, write(1), true, here());
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn unlock_of_unheld_lock_panics() {
        let registry = Registry::new(4);
        let routine = registry.register();

        registry.on_unlock(routine, 7);
    }

    #[test]
    #[should_panic(expected = "max_contexts")]
    fn register_beyond_capacity_panics() {
        let registry = Registry::new(1);
        registry.register();
        registry.register();
    }
}
