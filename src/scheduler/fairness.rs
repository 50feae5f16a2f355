//! Weighted fair scheduling across the four priority queues.
//!
//! Each worker asks which priority to serve next. The scheduler tracks
//! how many tasks each priority has received in the current window and
//! returns the most urgent priority still running below its target share.
//! Counters reset by task count or by wall clock, whichever comes first,
//! so a quiet period does not starve low priorities forever.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::task::Priority;

/// Counter window: reset after this many served tasks.
const DEFAULT_RESET_INTERVAL: u64 = 100;

/// Counter window: reset after this much wall clock regardless of volume.
const RESET_AFTER: Duration = Duration::from_secs(60);

// ---

#[derive(Debug)]
struct Window {
    served: [u64; 4],
    total: u64,
    started: Instant,
}

/// Tracks served-task ratios against target weights.
#[derive(Debug)]
pub struct FairTaskScheduler {
    weights: [f64; 4],
    reset_interval: u64,
    window: Mutex<Window>,
}

impl FairTaskScheduler {
    pub fn new(weights: [f64; 4]) -> Self {
        // ---
        Self {
            weights,
            reset_interval: DEFAULT_RESET_INTERVAL,
            window: Mutex::new(Window {
                served: [0; 4],
                total: 0,
                started: Instant::now(),
            }),
        }
    }

    /// The priority a worker should serve next: the lowest-numbered
    /// priority whose share of the current window is below its target
    /// weight. Falls back to CRITICAL when every queue has had its share.
    pub fn next_priority(&self) -> Priority {
        // ---
        let mut w = self.lock();
        self.maybe_reset(&mut w);

        if w.total == 0 {
            return Priority::Critical;
        }
        for p in Priority::ALL {
            let ratio = w.served[p.index()] as f64 / w.total as f64;
            if ratio < self.weights[p.index()] {
                return p;
            }
        }
        Priority::Critical
    }

    /// Record that a worker served one task at `priority`.
    pub fn record_served(&self, priority: Priority) {
        // ---
        let mut w = self.lock();
        self.maybe_reset(&mut w);
        w.served[priority.index()] += 1;
        w.total += 1;
    }

    /// Served counts for the current window, for the health surface.
    pub fn window_snapshot(&self) -> ([u64; 4], u64) {
        // ---
        let w = self.lock();
        (w.served, w.total)
    }

    fn maybe_reset(&self, w: &mut Window) {
        // ---
        if w.total >= self.reset_interval || w.started.elapsed() >= RESET_AFTER {
            w.served = [0; 4];
            w.total = 0;
            w.started = Instant::now();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        // ---
        match self.window.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
