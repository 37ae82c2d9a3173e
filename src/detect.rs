//! Cycle search over recorded lock dependencies.
//!
//! A *path* is a stack of dependencies from pairwise-distinct contexts, chained by the rule that
//! each dependency's acquired lock appears in the next one's holding-set. A path that closes back
//! into the holding-set of its first element is a cycle: each involved context waits for a lock
//! the next one holds, which is the structural form of a deadlock.
//!
//! Two searches share the predicates. The comprehensive search enumerates every simple cycle over
//! every recorded dependency; starting contexts are visited in index order and the inner search
//! only looks at higher indices, so each cycle is found exactly once up to rotation. The periodic
//! search restricts candidates to each context's *current* dependency and re-checks that the
//! involved contexts have not moved before confirming, because it runs against a live program.
use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::registry::Dependency;
use crate::registry::Registry;

/// Can `dep` extend the path without invalidating it?
///
/// The path may not already contain `dep` or another acquisition of the same lock, no lock may
/// appear in two holding-sets along the path (it would act as a gate serializing the cycle,
/// unless both holds are read-side and exclude nobody), and `dep`'s holding-set must contain the
/// lock most recently acquired by the path.
fn is_chain(path: &[Arc<Dependency>], dep: &Arc<Dependency>) -> bool {
    for entry in path {
        if Arc::ptr_eq(entry, dep) {
            return false;
        }

        if entry.lock.id == dep.lock.id {
            return false;
        }

        for held in entry.holding.iter() {
            for other in dep.holding.iter() {
                if held.id == other.id && !(held.is_read && other.is_read) {
                    return false;
                }
            }
        }
    }

    match path.last() {
        Some(tail) => dep.holding.iter().any(|held| held.id == tail.lock.id),
        None => true,
    }
}

/// Does appending `dep` close the path into a deadlock-indicating cycle?
///
/// Assumes `is_chain(path, dep)` already holds. The back-edge exists when the lock acquired by
/// `dep` is one the path's first context was already holding; the candidate then still has to
/// survive the read-write filter.
fn is_cycle(path: &[Arc<Dependency>], dep: &Arc<Dependency>) -> bool {
    let first = match path.first() {
        Some(first) => first,
        None => return false,
    };

    if !first.holding.iter().any(|held| held.id == dep.lock.id) {
        return false;
    }

    check_rw_cycle(path, dep)
}

/// Reject candidate cycles that cannot block because of read-side rwlock holds.
///
/// For each of the two closing elements of the cycle: if its lock was acquired in read mode, and
/// the matching hold in the successor's holding-set (wrapping past the end to the first element)
/// is also read-side, two readers share the rwlock and the edge cannot block.
fn check_rw_cycle(path: &[Arc<Dependency>], dep: &Arc<Dependency>) -> bool {
    let len = path.len() + 1;
    let at = |index: usize| -> &Arc<Dependency> {
        if index == len - 1 { dep } else { &path[index] }
    };

    for index in [len - 2, len - 1] {
        let current = at(index);
        if !current.lock.is_read {
            continue;
        }

        let next = at((index + 1) % len);
        if let Some(held) = next.holding.iter().find(|held| held.id == current.lock.id) {
            if held.is_read {
                return false;
            }
        }
    }

    true
}

/// True when at least two distinct dependency fingerprints exist across all contexts.
///
/// A single acquisition pattern can never form a cycle, so the comprehensive search is not worth
/// starting below this threshold. Counting stops as soon as the second pattern is seen.
pub(crate) fn has_two_unique_dependencies(all: &[Vec<Arc<Dependency>>]) -> bool {
    let mut seen = HashSet::new();

    for deps in all {
        for dep in deps {
            seen.insert(dep.fingerprint());
            if seen.len() == 2 {
                return true;
            }
        }
    }

    false
}

/// Enumerate all simple cycles over all recorded dependencies.
///
/// `all` is indexed by context; each cycle is returned in path order and is discovered exactly
/// once up to rotation, because context `i` only starts paths that stay within indices `> i`.
pub(crate) fn find_cycles(all: &[Vec<Arc<Dependency>>]) -> Vec<Vec<Arc<Dependency>>> {
    let mut cycles = Vec::new();
    let mut traversed = vec![false; all.len()];
    let mut path = Vec::new();

    for visiting in 0..all.len() {
        // Everything reachable from earlier contexts has been explored; their dependencies can
        // stay excluded for the rest of the search.
        traversed[visiting] = true;

        for dep in &all[visiting] {
            path.push(Arc::clone(dep));
            dfs(all, visiting, &mut path, &mut traversed, &mut cycles);
            path.pop();
        }
    }

    cycles
}

fn dfs(
    all: &[Vec<Arc<Dependency>>],
    visiting: usize,
    path: &mut Vec<Arc<Dependency>>,
    traversed: &mut [bool],
    cycles: &mut Vec<Vec<Arc<Dependency>>>,
) {
    for routine in visiting + 1..all.len() {
        if traversed[routine] {
            continue;
        }

        for dep in &all[routine] {
            if !is_chain(path, dep) {
                continue;
            }

            if is_cycle(path, dep) {
                let mut cycle = path.clone();
                cycle.push(Arc::clone(dep));
                cycles.push(cycle);
                // The closing edge is not recursed through; other extensions of the same path
                // are still explored.
            } else {
                path.push(Arc::clone(dep));
                traversed[routine] = true;

                dfs(all, visiting, path, traversed, cycles);

                path.pop();
                traversed[routine] = false;
            }
        }
    }
}

/// Top-of-holding snapshot from the previous periodic pass, indexed by context.
pub(crate) struct PeriodicState {
    last_top: Box<[Option<usize>]>,
}

impl PeriodicState {
    pub fn new(max_contexts: usize) -> Self {
        Self {
            last_top: vec![None; max_contexts].into_boxed_slice(),
        }
    }
}

/// One pass of the on-line detector.
///
/// Walks the registry once to refresh the previous-pass snapshot, then searches the current
/// dependencies for a cycle whose contexts are verifiably still stuck. Returns the confirmed
/// cycle, or `None` when preconditions fail, no cycle exists, or every candidate turned out to
/// be stale.
pub(crate) fn periodic_pass(
    registry: &Registry,
    state: &mut PeriodicState,
) -> Option<Vec<Arc<Dependency>>> {
    let count = registry.count();
    let mut changed = false;
    let mut loaded = 0;
    let mut candidates = Vec::with_capacity(count);

    for routine in 0..count {
        let observation = registry.observe(routine);

        if observation.top != state.last_top[routine] {
            state.last_top[routine] = observation.top;
            changed = true;
        }
        if observation.held >= 2 {
            loaded += 1;
        }

        candidates.push(observation.cur_dep);
    }

    if !changed || loaded < 2 {
        trace!(changed, loaded, "periodic pass skipped");
        return None;
    }

    let mut traversed = vec![false; count];
    let mut path = Vec::new();

    for visiting in 0..count {
        // Taking the candidate out consumes it: each context's current dependency is considered
        // at most once per pass.
        let dep = match candidates[visiting].take() {
            Some(dep) => dep,
            None => continue,
        };

        traversed[visiting] = true;
        path.push(dep);

        let confirmed = dfs_periodic(registry, &candidates, visiting, &mut path, &mut traversed, state);
        if confirmed.is_some() {
            return confirmed;
        }

        path.pop();
    }

    None
}

fn dfs_periodic(
    registry: &Registry,
    candidates: &[Option<Arc<Dependency>>],
    visiting: usize,
    path: &mut Vec<Arc<Dependency>>,
    traversed: &mut [bool],
    state: &PeriodicState,
) -> Option<Vec<Arc<Dependency>>> {
    for routine in visiting + 1..candidates.len() {
        if traversed[routine] {
            continue;
        }

        let dep = match &candidates[routine] {
            Some(dep) => dep,
            None => continue,
        };

        if !is_chain(path, dep) {
            continue;
        }

        if is_cycle(path, dep) {
            path.push(Arc::clone(dep));

            // The program is live: any involved context that moved since the snapshot at the top
            // of this pass makes the candidate a false alarm.
            let stuck = path
                .iter()
                .all(|entry| registry.top_of_holding(entry.routine) == state.last_top[entry.routine]);

            if stuck {
                return Some(path.clone());
            }

            path.pop();
        } else {
            path.push(Arc::clone(dep));
            traversed[routine] = true;

            let confirmed = dfs_periodic(registry, candidates, visiting, path, traversed, state);
            if confirmed.is_some() {
                return confirmed;
            }

            path.pop();
            traversed[routine] = false;
        }
    }

    None
}
