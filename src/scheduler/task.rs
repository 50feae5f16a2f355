//! Task model for the priority scheduler.
//!
//! A task is deferred work carrying its priority, age, and retry count.
//! The payload is a factory closure rather than a future so a timed-out
//! task can be recreated for its one retry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

// ---

/// Scheduling priorities, ordered highest first. The numeric value
/// indexes queues, weights, and capacities throughout the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Timeout scaling: urgent work gets more patience, background work less.
    pub fn timeout_modifier(self) -> f64 {
        // ---
        match self {
            Priority::Critical => 1.5,
            Priority::High => 1.2,
            Priority::Normal => 1.0,
            Priority::Low => 0.8,
        }
    }
}

/// Task classes derived from the task id prefix. Each class has its own
/// base timeout reflecting what the work actually touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    DatabaseWrite,
    StateUpdate,
    WeatherEnrichment,
    BatchProcessing,
    Default,
}

impl TaskClass {
    /// Classify a task by its id prefix.
    pub fn from_task_id(task_id: &str) -> Self {
        // ---
        if task_id.starts_with("storage_") {
            TaskClass::DatabaseWrite
        } else if task_id.starts_with("state_") {
            TaskClass::StateUpdate
        } else if task_id.starts_with("weather_") {
            TaskClass::WeatherEnrichment
        } else if task_id.starts_with("batch_") {
            TaskClass::BatchProcessing
        } else {
            TaskClass::Default
        }
    }

    pub fn base_timeout(self) -> Duration {
        // ---
        match self {
            TaskClass::DatabaseWrite => Duration::from_secs(25),
            TaskClass::StateUpdate => Duration::from_secs(15),
            TaskClass::WeatherEnrichment => Duration::from_secs(8),
            TaskClass::BatchProcessing => Duration::from_secs(30),
            TaskClass::Default => Duration::from_secs(12),
        }
    }
}

/// Overall cap on any single task's execution window.
pub const TASK_TIMEOUT_CAP: Duration = Duration::from_secs(45);

/// Maximum task id length in bytes.
const TASK_ID_CAP: usize = 50;

/// Cap a task id at [`TASK_ID_CAP`] bytes without splitting a character.
/// Ids embed device ids, which may be multibyte.
fn cap_task_id(mut id: String) -> String {
    // ---
    if id.len() > TASK_ID_CAP {
        let mut cut = TASK_ID_CAP;
        while !id.is_char_boundary(cut) {
            cut -= 1;
        }
        id.truncate(cut);
    }
    id
}

/// Effective execution timeout for a task: class base scaled by priority,
/// capped at [`TASK_TIMEOUT_CAP`].
pub fn effective_timeout(task_id: &str, priority: Priority) -> Duration {
    // ---
    TaskClass::from_task_id(task_id)
        .base_timeout()
        .mul_f64(priority.timeout_modifier())
        .min(TASK_TIMEOUT_CAP)
}

// ---

/// Boxed future produced by a task factory.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Recreatable task payload.
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// One unit of deferred work.
#[derive(Clone)]
pub struct Task {
    pub task_id: String,
    pub priority: Priority,
    pub created_at: Instant,
    pub retries: u32,
    pub work: TaskFn,
}

impl Task {
    /// Build a task. Ids are capped at 50 bytes.
    pub fn new<F, Fut>(task_id: impl Into<String>, priority: Priority, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // ---
        Self {
            task_id: cap_task_id(task_id.into()),
            priority,
            created_at: Instant::now(),
            retries: 0,
            work: Arc::new(move || Box::pin(work()) as TaskFuture),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Clone into the retry incarnation: same work, `_rN` suffix, fresh
    /// creation time so the retry is not instantly expired.
    pub fn retry_incarnation(&self) -> Self {
        // ---
        let retries = self.retries + 1;
        Self {
            task_id: cap_task_id(format!("{}_r{retries}", self.task_id)),
            priority: self.priority,
            created_at: Instant::now(),
            retries,
            work: Arc::clone(&self.work),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("priority", &self.priority)
            .field("retries", &self.retries)
            .field("age", &self.age())
            .finish()
    }
}
