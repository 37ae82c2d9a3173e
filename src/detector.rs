//! Process-wide detector state and control surface.
//!
//! The detector is initialized once, explicitly through [`init`], or implicitly with
//! environment defaults on the first lock event, and lives for the rest of the process. Options
//! are read at initialization; there is no live reconfiguration.
use std::collections::HashSet;
use std::env;
use std::panic::Location;
use std::process;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::detect;
use crate::detect::PeriodicState;
use crate::registry::LockSnap;
use crate::registry::Registry;
use crate::reporting::DeadlockReport;

/// Runtime configuration of the detector.
///
/// Read once at initialization. Every field can also be set through an environment variable
/// (`LOCKDEP_RUN_DETECTION`, `LOCKDEP_PERIODIC_DETECTION`, `LOCKDEP_COMPREHENSIVE_DETECTION`,
/// `LOCKDEP_CHECK_DOUBLE_LOCKING`, `LOCKDEP_MAX_CONTEXTS`, `LOCKDEP_PERIODIC_INTERVAL_MS`), which
/// applies when the detector self-initializes on the first lock event.
#[derive(Clone, Debug)]
pub struct Options {
    /// Master switch. When false no events are recorded and both detection modes are inert.
    pub run_detection: bool,
    /// Allow the on-line detector ([`crate::start_periodic`]).
    pub periodic_detection: bool,
    /// Allow the post-mortem pass ([`crate::find_potential_deadlocks`]).
    pub comprehensive_detection: bool,
    /// Panic when a context re-acquires a lock it already holds, instead of silently
    /// self-deadlocking in the underlying primitive.
    pub check_double_locking: bool,
    /// Capacity of the context table. Contexts beyond this abort the program.
    pub max_contexts: usize,
    /// Suggested tick interval for the on-line detector. Hosts typically pass this straight to
    /// [`crate::start_periodic`], which keeps the cadence environment-tunable.
    pub periodic_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            run_detection: true,
            periodic_detection: true,
            comprehensive_detection: true,
            check_double_locking: true,
            max_contexts: 1024,
            periodic_interval: Duration::from_secs(2),
        }
    }
}

impl Options {
    /// Defaults with `LOCKDEP_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Some(enabled) = env_flag("LOCKDEP_RUN_DETECTION") {
            options.run_detection = enabled;
        }
        if let Some(enabled) = env_flag("LOCKDEP_PERIODIC_DETECTION") {
            options.periodic_detection = enabled;
        }
        if let Some(enabled) = env_flag("LOCKDEP_COMPREHENSIVE_DETECTION") {
            options.comprehensive_detection = enabled;
        }
        if let Some(enabled) = env_flag("LOCKDEP_CHECK_DOUBLE_LOCKING") {
            options.check_double_locking = enabled;
        }
        if let Some(value) = env_number("LOCKDEP_MAX_CONTEXTS") {
            options.max_contexts = value;
        }
        if let Some(value) = env_number("LOCKDEP_PERIODIC_INTERVAL_MS") {
            options.periodic_interval = Duration::from_millis(value as u64);
        }

        options
    }

    /// Whether lock events are worth recording at all.
    pub(crate) fn record_events(&self) -> bool {
        self.run_detection && (self.periodic_detection || self.comprehensive_detection)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name).ok()?.as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn env_number(name: &str) -> Option<usize> {
    env::var(name).ok()?.parse().ok()
}

pub(crate) struct Detector {
    options: Options,
    registry: Registry,
    periodic: Mutex<Option<PeriodicRunner>>,
}

struct PeriodicRunner {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

static DETECTOR: OnceLock<Detector> = OnceLock::new();

/// Initialize the global detector with the given options.
///
/// Initialization happens at most once per process; the first lock event self-initializes with
/// [`Options::from_env`] if this was never called. Returns whether this call performed the
/// initialization; when it returns false the passed options were discarded in favor of the
/// already-active ones.
pub fn init(options: Options) -> bool {
    let mut installed = false;

    DETECTOR.get_or_init(|| {
        installed = true;
        Detector::new(options)
    });

    installed
}

pub(crate) fn detector() -> &'static Detector {
    DETECTOR.get_or_init(|| Detector::new(Options::from_env()))
}

/// Run the comprehensive post-mortem analysis and return every potential deadlock found.
///
/// Intended to be called once user code is done, such as the end of `main`, or the end of a test. The
/// pass is idempotent: absent new lock events, running it again returns the same reports. Each
/// report is also logged at error level. The process is never terminated by this pass.
pub fn find_potential_deadlocks() -> Vec<DeadlockReport> {
    detector().find_potential_deadlocks()
}

/// Start the on-line detector, checking for stuck cycles every `interval`.
///
/// No-op when periodic detection is disabled or the timer is already running. On a confirmed
/// deadlock the timer thread reports it, runs the comprehensive pass for additional context, and
/// exits the process with status 2.
pub fn start_periodic(interval: Duration) {
    detector().start_periodic(interval)
}

/// Stop the on-line detector, waiting for a pass in flight to finish.
pub fn stop_periodic() {
    detector().stop_periodic()
}

impl Detector {
    fn new(options: Options) -> Self {
        debug!(?options, "deadlock detector initialized");
        let registry = Registry::new(options.max_contexts);

        Self {
            options,
            registry,
            periodic: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn on_lock(
        &self,
        routine: usize,
        id: usize,
        is_read: bool,
        acquired_at: &'static Location<'static>,
    ) {
        self.registry.on_lock(
            routine,
            LockSnap { id, is_read },
            self.options.check_double_locking,
            acquired_at,
        );
    }

    pub fn on_unlock(&self, routine: usize, id: usize) {
        self.registry.on_unlock(routine, id);
    }

    pub fn find_potential_deadlocks(&self) -> Vec<DeadlockReport> {
        if !self.options.run_detection || !self.options.comprehensive_detection {
            return Vec::new();
        }

        // A cycle needs at least two contexts and two distinct acquisition patterns; anything
        // less is not worth snapshotting for.
        if self.registry.count() < 2 {
            trace!("comprehensive pass skipped: fewer than two contexts");
            return Vec::new();
        }

        let snapshot = self.registry.dependencies();
        if !detect::has_two_unique_dependencies(&snapshot) {
            trace!("comprehensive pass skipped: fewer than two unique dependencies");
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut reports = Vec::new();

        for cycle in detect::find_cycles(&snapshot) {
            let report = DeadlockReport::from_cycle(&cycle, false);
            if seen.insert(report.dedup_key()) {
                error!(%report, "potential deadlock");
                reports.push(report);
            }
        }

        reports
    }

    /// One periodic pass over the registry; `Some` when a deadlock was confirmed.
    fn periodic_pass(&self, state: &mut PeriodicState) -> Option<DeadlockReport> {
        detect::periodic_pass(&self.registry, state)
            .map(|cycle| DeadlockReport::from_cycle(&cycle, true))
    }

    fn start_periodic(&'static self, interval: Duration) {
        if !self.options.run_detection || !self.options.periodic_detection {
            debug!("periodic detection disabled, timer not started");
            return;
        }

        let mut slot = self.periodic.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("lockdep-periodic".into())
            .spawn(move || self.run_periodic(interval, thread_stop))
            .expect("Failed to spawn the periodic deadlock detection thread");

        *slot = Some(PeriodicRunner { stop, handle });
    }

    fn stop_periodic(&self) {
        let runner = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(runner) = runner {
            runner.stop.store(true, Ordering::Relaxed);
            runner.handle.thread().unpark();
            let _ = runner.handle.join();
        }
    }

    fn run_periodic(&self, interval: Duration, stop: Arc<AtomicBool>) {
        let mut state = PeriodicState::new(self.options.max_contexts);

        loop {
            // park_timeout rather than sleep so stop_periodic can interrupt a long interval.
            thread::park_timeout(interval);
            if stop.load(Ordering::Relaxed) {
                return;
            }

            if let Some(report) = self.periodic_pass(&mut state) {
                error!(%report, "confirmed deadlock");
                eprintln!("{report}");

                // The full history may show further inversions; print those before giving up.
                for report in self.find_potential_deadlocks() {
                    eprintln!("{report}");
                }

                process::exit(2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::Location;

    use super::*;

    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    fn inversion(detector: &Detector) {
        let first = detector.registry().register();
        let second = detector.registry().register();

        detector.on_lock(first, 1, false, here());
        detector.on_lock(first, 2, false, here());
        detector.on_lock(second, 2, false, here());
        detector.on_lock(second, 1, false, here());
    }

    #[test]
    fn comprehensive_reports_inversion_once() {
        let detector = Detector::new(Options::default());
        inversion(&detector);

        let reports = detector.find_potential_deadlocks();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].confirmed);
        assert_eq!(reports[0].cycle.len(), 2);
    }

    #[test]
    fn repeated_patterns_are_deduplicated() {
        let detector = Detector::new(Options::default());
        inversion(&detector);

        // Record the same inversion again from the same contexts.
        for routine in [0, 1] {
            detector.on_unlock(routine, 1);
            detector.on_unlock(routine, 2);
        }
        detector.on_lock(0, 1, false, here());
        detector.on_lock(0, 2, false, here());
        detector.on_lock(1, 2, false, here());
        detector.on_lock(1, 1, false, here());

        let reports = detector.find_potential_deadlocks();
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn disabled_comprehensive_detection_reports_nothing() {
        let detector = Detector::new(Options {
            comprehensive_detection: false,
            ..Options::default()
        });
        inversion(&detector);

        assert!(detector.find_potential_deadlocks().is_empty());
    }

    #[test]
    fn master_switch_disables_reporting() {
        let detector = Detector::new(Options {
            run_detection: false,
            ..Options::default()
        });
        inversion(&detector);

        assert!(detector.find_potential_deadlocks().is_empty());
    }

    #[test]
    fn single_context_is_below_threshold() {
        let detector = Detector::new(Options::default());
        let routine = detector.registry().register();

        detector.on_lock(routine, 1, false, here());
        detector.on_lock(routine, 2, false, here());

        assert!(detector.find_potential_deadlocks().is_empty());
    }
}
