//! Priority task scheduler.
//!
//! Four bounded FIFO queues, one per priority, drained by a small pool of
//! long-lived workers plus one cleanup worker. Admission is drop-on-full
//! (with one exception: a CRITICAL enqueue may evict a LOW task), dispatch
//! is weighted-fair, every task runs under a class-derived deadline, and
//! the whole thing degrades gracefully by exposing a coarse load label
//! that ingestion handlers use to demote lower-value work.

mod fairness;
mod task;

pub use fairness::FairTaskScheduler;
pub use task::{effective_timeout, Priority, Task, TaskClass, TASK_TIMEOUT_CAP};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pressure::PressureLevel;

/// Retries permitted after a timeout (CRITICAL/HIGH only).
const MAX_RETRIES: u32 = 1;

/// Cleanup pass drops tasks that have been requeued this many times.
const CLEANUP_RETRY_LIMIT: u32 = 5;

/// How often the cleanup worker walks the queues.
const QUEUE_CLEANUP_INTERVAL: Duration = Duration::from_secs(20);

/// How long an idle worker waits before re-checking for shutdown.
const IDLE_POLL: Duration = Duration::from_millis(200);

// ---

/// Scheduler tunables, extracted from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_capacities: [usize; 4],
    pub queue_weights: [f64; 4],
    pub worker_count: usize,
    pub task_age_limit: Duration,
}

/// Monotonic counters, exported on the health surface.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timeouts: AtomicU64,
    /// Enqueue refusals. Exactly one increment per `enqueue` returning false.
    pub dropped: AtomicU64,
    /// LOW tasks evicted to admit a CRITICAL one.
    pub evicted: AtomicU64,
    /// Tasks discarded for exceeding the age limit.
    pub expired: AtomicU64,
    pub retried: AtomicU64,
    pub starvation_prevented: AtomicU64,
}

/// Serializable snapshot for the health endpoint.
#[derive(Debug, Serialize)]
pub struct SchedulerSnapshot {
    pub queued: [usize; 4],
    pub queue_pressure: f64,
    pub degradation_mode: &'static str,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub expired: u64,
    pub retried: u64,
    pub starvation_prevented: u64,
}

/// The process-wide scheduler. Constructed once at startup and shared.
pub struct PriorityTaskManager {
    queues: Mutex<[VecDeque<Task>; 4]>,
    capacities: [usize; 4],
    fairness: FairTaskScheduler,
    stats: SchedulerStats,
    task_age_limit: Duration,
    notify: Notify,
    shutting_down: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityTaskManager {
    /// Construct the manager and spawn its workers.
    pub fn start(cfg: SchedulerConfig) -> Arc<Self> {
        // ---
        let manager = Arc::new(Self {
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            capacities: cfg.queue_capacities,
            fairness: FairTaskScheduler::new(cfg.queue_weights),
            stats: SchedulerStats::default(),
            task_age_limit: cfg.task_age_limit,
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(cfg.worker_count + 1);
        for worker_id in 0..cfg.worker_count {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { m.worker_loop(worker_id).await }));
        }
        {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { m.cleanup_loop().await }));
        }
        *lock(&manager.workers) = handles;

        info!(
            "scheduler started: {} workers, capacities {:?}",
            cfg.worker_count, manager.capacities
        );
        manager
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Admit a task. Returns false (and counts a drop) when the target
    /// queue is full, except that a CRITICAL task may evict one LOW task
    /// to make room.
    pub fn enqueue(&self, task: Task) -> bool {
        // ---
        if self.shutting_down.load(Ordering::Relaxed) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut queues = lock(&self.queues);
        let idx = task.priority.index();

        if queues[idx].len() >= self.capacities[idx] {
            if task.priority == Priority::Critical
                && queues[Priority::Low.index()].pop_front().is_some()
            {
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                debug!("evicted one low task to admit {}", task.task_id);
                queues[idx].push_back(task);
                drop(queues);
                self.notify.notify_one();
                return true;
            }
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "queue {} full, dropping {}",
                task.priority.as_str(),
                task.task_id
            );
            return false;
        }

        queues[idx].push_back(task);
        drop(queues);
        self.notify.notify_one();
        true
    }

    /// Queued items over total capacity, in `0.0..=1.0`.
    pub fn queue_pressure(&self) -> f64 {
        // ---
        let queues = lock(&self.queues);
        let queued: usize = queues.iter().map(VecDeque::len).sum();
        let capacity: usize = self.capacities.iter().sum();
        queued as f64 / capacity.max(1) as f64
    }

    /// Coarse load label from queue pressure alone.
    pub fn degradation_mode(&self) -> PressureLevel {
        // ---
        let p = self.queue_pressure();
        if p > 0.85 {
            PressureLevel::Critical
        } else if p > 0.70 {
            PressureLevel::High
        } else if p > 0.50 {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }

    /// Load label combining queue pressure with the memory pressure the
    /// batch subsystem observes; the worse of the two wins.
    pub fn degradation_mode_with(&self, memory: PressureLevel) -> PressureLevel {
        // ---
        self.degradation_mode().max(memory)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        // ---
        let queued = {
            let queues = lock(&self.queues);
            [
                queues[0].len(),
                queues[1].len(),
                queues[2].len(),
                queues[3].len(),
            ]
        };
        SchedulerSnapshot {
            queued,
            queue_pressure: self.queue_pressure(),
            degradation_mode: self.degradation_mode().as_str(),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            starvation_prevented: self.stats.starvation_prevented.load(Ordering::Relaxed),
        }
    }

    /// Signal workers to stop and wait for in-flight tasks to finish.
    pub async fn shutdown(&self) {
        // ---
        self.shutting_down.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        let handles = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("scheduler worker ended abnormally: {e}");
            }
        }
        info!("scheduler shut down");
    }

    // ---

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        // ---
        debug!("worker {worker_id} started");
        loop {
            if self.shutting_down.load(Ordering::Relaxed) {
                break;
            }
            match self.pop_next() {
                Some(task) => {
                    let priority = task.priority;
                    self.execute(task).await;
                    self.fairness.record_served(priority);
                }
                None => {
                    let _ = tokio::time::timeout(IDLE_POLL, self.notify.notified()).await;
                }
            }
        }
        debug!("worker {worker_id} stopped");
    }

    /// Pop the next task: ask the fair scheduler for a priority, fall
    /// back to a walk in numeric order, and count a starvation
    /// prevention when the walk served a different priority than asked.
    fn pop_next(&self) -> Option<Task> {
        // ---
        let suggested = self.fairness.next_priority();
        let mut queues = lock(&self.queues);

        if let Some(task) = queues[suggested.index()].pop_front() {
            return Some(task);
        }
        for p in Priority::ALL {
            if let Some(task) = queues[p.index()].pop_front() {
                if p != suggested {
                    self.stats.starvation_prevented.fetch_add(1, Ordering::Relaxed);
                }
                return Some(task);
            }
        }
        None
    }

    async fn execute(&self, task: Task) {
        // ---
        if task.age() > self.task_age_limit {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            debug!("task {} expired at age {:?}", task.task_id, task.age());
            return;
        }

        let deadline = effective_timeout(&task.task_id, task.priority);
        match tokio::time::timeout(deadline, (task.work)()).await {
            Ok(Ok(())) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("task {} failed: {e:#}", task.task_id);
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("task {} timed out after {deadline:?}", task.task_id);
                let retryable = task.retries < MAX_RETRIES
                    && matches!(task.priority, Priority::Critical | Priority::High);
                if retryable {
                    let retry = task.retry_incarnation();
                    if self.enqueue(retry) {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Periodic queue sweep: reinstate only tasks still young enough and
    /// not stuck in a retry loop.
    async fn cleanup_loop(self: Arc<Self>) {
        // ---
        let mut interval = tokio::time::interval(QUEUE_CLEANUP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.shutting_down.load(Ordering::Relaxed) {
                break;
            }
            let mut removed = 0u64;
            {
                let mut queues = lock(&self.queues);
                for queue in queues.iter_mut() {
                    let before = queue.len();
                    queue.retain(|t| {
                        t.age() <= self.task_age_limit && t.retries < CLEANUP_RETRY_LIMIT
                    });
                    removed += (before - queue.len()) as u64;
                }
            }
            if removed > 0 {
                self.stats.expired.fetch_add(removed, Ordering::Relaxed);
                info!("queue cleanup removed {removed} stale tasks");
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(workers: usize) -> SchedulerConfig {
        // ---
        SchedulerConfig {
            queue_capacities: [15, 12, 8, 5],
            queue_weights: [0.60, 0.25, 0.10, 0.05],
            worker_count: workers,
            task_age_limit: Duration::from_secs(45),
        }
    }

    fn noop_task(id: &str, priority: Priority) -> Task {
        Task::new(id, priority, || async { Ok(()) })
    }

    #[tokio::test]
    async fn dropped_counter_matches_refusals() {
        // ---
        // No workers: queues only fill.
        let m = PriorityTaskManager::start(test_config(0));
        let mut refusals = 0u64;
        for i in 0..20 {
            if !m.enqueue(noop_task(&format!("state_{i}"), Priority::Normal)) {
                refusals += 1;
            }
        }
        assert_eq!(refusals, 12); // capacity 8 of 20
        assert_eq!(m.stats().dropped.load(Ordering::Relaxed), refusals);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn critical_evicts_low_when_full() {
        // ---
        let m = PriorityTaskManager::start(test_config(0));
        for i in 0..5 {
            assert!(m.enqueue(noop_task(&format!("low_{i}"), Priority::Low)));
        }
        for i in 0..15 {
            assert!(m.enqueue(noop_task(&format!("storage_{i}"), Priority::Critical)));
        }
        // Queue full; the 16th critical evicts one low task.
        assert!(m.enqueue(noop_task("storage_extra", Priority::Critical)));
        assert_eq!(m.stats().evicted.load(Ordering::Relaxed), 1);
        let snap = m.snapshot();
        assert_eq!(snap.queued[Priority::Low.index()], 4);
        assert_eq!(snap.queued[Priority::Critical.index()], 16);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn degradation_thresholds() {
        // ---
        let m = PriorityTaskManager::start(test_config(0));
        assert_eq!(m.degradation_mode(), PressureLevel::Low);

        // 40 total capacity; 21 queued is pressure 0.525.
        for i in 0..15 {
            m.enqueue(noop_task(&format!("storage_{i}"), Priority::Critical));
        }
        for i in 0..6 {
            m.enqueue(noop_task(&format!("state_{i}"), Priority::High));
        }
        assert_eq!(m.degradation_mode(), PressureLevel::Medium);

        for i in 0..6 {
            m.enqueue(noop_task(&format!("state2_{i}"), Priority::High));
        }
        for i in 0..8 {
            m.enqueue(noop_task(&format!("norm_{i}"), Priority::Normal));
        }
        // 35/40 = 0.875 queued.
        assert_eq!(m.degradation_mode(), PressureLevel::Critical);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn workers_drain_and_count_completions() {
        // ---
        let m = PriorityTaskManager::start(test_config(2));
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let ran = Arc::clone(&ran);
            assert!(m.enqueue(Task::new(
                format!("storage_{i}"),
                Priority::Critical,
                move || {
                    let ran = Arc::clone(&ran);
                    async move {
                        ran.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                }
            )));
        }
        // Wait for the pool to drain.
        for _ in 0..100 {
            if ran.load(Ordering::Relaxed) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ran.load(Ordering::Relaxed), 10);
        assert_eq!(m.stats().completed.load(Ordering::Relaxed), 10);
        m.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_retries_critical_once() {
        // ---
        let m = PriorityTaskManager::start(test_config(1));
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        m.enqueue(Task::new("weather_slow", Priority::Critical, move || {
            let a = Arc::clone(&a);
            async move {
                a.fetch_add(1, Ordering::Relaxed);
                // Far beyond the 12s (8 * 1.5) class deadline.
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(())
            }
        }));

        // Paused clock: sleeps auto-advance, both incarnations time out.
        for _ in 0..400 {
            tokio::task::yield_now().await;
            if m.stats().timeouts.load(Ordering::Relaxed) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert_eq!(m.stats().retried.load(Ordering::Relaxed), 1);
        assert_eq!(m.stats().timeouts.load(Ordering::Relaxed), 2);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn failures_do_not_retry() {
        // ---
        let m = PriorityTaskManager::start(test_config(1));
        m.enqueue(Task::new("storage_bad", Priority::Critical, || async {
            anyhow::bail!("boom")
        }));
        for _ in 0..100 {
            if m.stats().failed.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(m.stats().failed.load(Ordering::Relaxed), 1);
        assert_eq!(m.stats().retried.load(Ordering::Relaxed), 0);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn expired_tasks_are_not_run() {
        // ---
        let m = PriorityTaskManager::start(test_config(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let mut task = Task::new("state_old", Priority::Normal, move || {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
        task.created_at = tokio::time::Instant::now() - Duration::from_secs(46);
        m.enqueue(task);

        // Run one worker pass by hand.
        let task = m.pop_next().unwrap();
        m.execute(task).await;
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert_eq!(m.stats().expired.load(Ordering::Relaxed), 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn starvation_prevention_counts_substitutions() {
        // ---
        let m = PriorityTaskManager::start(test_config(0));
        // Make the fairness window point at HIGH by saturating critical.
        for _ in 0..10 {
            m.fairness.record_served(Priority::Critical);
        }
        assert_eq!(m.fairness.next_priority(), Priority::High);

        // Only a NORMAL task is queued; the walk serves it instead.
        m.enqueue(noop_task("state_x", Priority::Normal));
        let task = m.pop_next().unwrap();
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(m.stats().starvation_prevented.load(Ordering::Relaxed), 1);
        m.shutdown().await;
    }
}
