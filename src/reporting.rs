//! Deadlock report primitives.
//!
//! This module exposes [`DeadlockReport`], the value both detection passes emit, and the internal
//! [`Trace`] type, which resolves to either a captured backtrace or to nothing depending on the
//! `backtraces` feature. It should only be assumed to implement the [`Captured`] trait.
#[cfg(feature = "backtraces")]
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::registry::Dependency;

#[cfg(feature = "backtraces")]
pub(crate) type Trace = DepTrace<Arc<Backtrace>>;
#[cfg(not(feature = "backtraces"))]
pub(crate) type Trace = DepTrace<()>;

pub(crate) trait Captured: Clone {
    /// Capture the current state
    fn capture() -> Self;

    /// Render the captured state for human readable consumption.
    fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

#[derive(Clone, Debug)]
pub(crate) struct DepTrace<T>(T);

/// Use a unit as tracing data: no tracing.
///
/// This has no runtime overhead for capturing traces and is therefore cheap enough for most
/// purposes.
impl Captured for DepTrace<()> {
    fn capture() -> Self {
        Self(())
    }

    fn render(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

/// Use a full backtrace as tracing data
///
/// Capture the entire backtrace which may be expensive. This implementation does not force
/// capture in the event that backtraces are disabled at runtime, so the exact overhead can still
/// be controlled a little.
///
/// N.B. the [`Backtrace`] needs to be wrapped in an Arc as backtraces are not [`Clone`].
#[cfg(feature = "backtraces")]
impl Captured for DepTrace<Arc<Backtrace>> {
    fn capture() -> Self {
        Self(Arc::new(Backtrace::capture()))
    }

    fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.0)
    }
}

/// One step of a reported cycle: a single recorded acquisition.
#[derive(Clone, Debug)]
pub struct CycleEntry {
    /// Index of the context that performed the acquisition.
    pub routine: usize,
    /// Identity of the acquired lock.
    pub lock: usize,
    /// Whether the acquisition was read-side.
    pub read: bool,
    /// Identities of the locks held at the acquisition, in acquisition order.
    pub holding: Vec<usize>,
    /// Source location of the acquisition.
    pub acquired_at: &'static Location<'static>,
    /// Backtrace of the acquisition when the `backtraces` feature is enabled; rendered through
    /// [`fmt::Display`].
    trace: Trace,
}

/// A deadlock-indicating cycle through the recorded dependencies.
///
/// Entries are in cycle order: each entry's acquired lock is held by the next entry's context,
/// wrapping around at the end. The [`fmt::Display`] implementation renders a multi-line
/// human-readable report.
#[derive(Clone, Debug)]
pub struct DeadlockReport {
    /// True for on-line reports whose contexts were verified to still be stuck; false for
    /// post-mortem reports of schedules that did not necessarily happen.
    pub confirmed: bool,
    /// The offending acquisitions, in cycle order.
    pub cycle: Vec<CycleEntry>,
}

impl DeadlockReport {
    pub(crate) fn from_cycle(cycle: &[Arc<Dependency>], confirmed: bool) -> Self {
        let cycle = cycle
            .iter()
            .map(|dep| CycleEntry {
                routine: dep.routine,
                lock: dep.lock.id,
                read: dep.lock.is_read,
                holding: dep.holding.iter().map(|held| held.id).collect(),
                acquired_at: dep.acquired_at,
                trace: dep.trace.clone(),
            })
            .collect();

        Self { confirmed, cycle }
    }

    /// Key under which textually identical cycles collapse.
    ///
    /// Re-recorded acquisition patterns produce distinct dependency records with equal
    /// fingerprints; a report is worth emitting once per pattern sequence.
    pub(crate) fn dedup_key(&self) -> Vec<Vec<usize>> {
        self.cycle
            .iter()
            .map(|entry| {
                let mut key = Vec::with_capacity(entry.holding.len() + 1);
                key.push(entry.lock);
                key.extend_from_slice(&entry.holding);
                key
            })
            .collect()
    }
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.confirmed {
            writeln!(f, "Deadlock confirmed between {} contexts:", self.cycle.len())?;
        } else {
            writeln!(
                f,
                "Potential deadlock involving {} contexts:",
                self.cycle.len()
            )?;
        }

        for entry in &self.cycle {
            let mode = if entry.read { "read lock" } else { "lock" };
            write!(
                f,
                "  context {} acquired {} {} at {} while holding [",
                entry.routine, mode, entry.lock, entry.acquired_at
            )?;

            for (index, held) in entry.holding.iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{held}")?;
            }
            writeln!(f, "]")?;

            entry.trace.render(f)?;
        }

        Ok(())
    }
}
