//! Tick scheduler behind the `delay` and `timer` rules
//!
//! Time is counted in ticks. The hosting server (or [`TickScheduler::drive`])
//! advances the clock one tick at a time on its primary thread; tasks that
//! are due run in `(due tick, id)` order. Synchronous tasks run inline on
//! the ticking thread, asynchronous ones are handed to a tokio runtime.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::describe_panic;

/// Default tick length (50ms = 20Hz)
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Unique identifier for a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Where a task runs once it is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// On the thread that advances the ticks
    Sync,
    /// On the async runtime, off the ticking thread
    Async,
}

impl ExecMode {
    pub fn from_async_flag(is_async: bool) -> Self {
        if is_async {
            ExecMode::Async
        } else {
            ExecMode::Sync
        }
    }
}

pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;
pub type RepeatingTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Deferred execution used by compiled rules
pub trait Scheduler: Send + Sync {
    /// The tick the scheduler is currently at
    fn current_tick(&self) -> u64;

    /// Run `task` once, `delay` ticks from now
    fn schedule(&self, delay: u64, mode: ExecMode, task: OnceTask) -> TaskId;

    /// Run `task` first after `initial_delay` ticks, then every `period`
    /// ticks until cancelled
    fn schedule_repeating(
        &self,
        initial_delay: u64,
        period: u64,
        mode: ExecMode,
        task: RepeatingTask,
    ) -> TaskId;

    /// Stop a task. A firing already in progress completes, no further
    /// firing happens.
    fn cancel(&self, id: TaskId) -> bool;
}

enum TaskKind {
    Once(OnceTask),
    Repeating { period: u64, task: RepeatingTask },
}

struct Entry {
    mode: ExecMode,
    kind: TaskKind,
}

#[derive(Default)]
struct QueueState {
    current: u64,
    next_id: u64,
    queue: BTreeMap<(u64, TaskId), Entry>,
    due_of: HashMap<TaskId, u64>,
    /// Repeating tasks popped from the queue and currently firing
    running: HashSet<TaskId>,
    /// Cancellations requested while the task was running
    cancelled: HashSet<TaskId>,
}

impl QueueState {
    fn push(&mut self, id: TaskId, due: u64, entry: Entry) {
        self.queue.insert((due, id), entry);
        self.due_of.insert(id, due);
    }

    fn allocate(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Deterministic tick-driven scheduler
pub struct TickScheduler {
    state: Mutex<QueueState>,
    runtime: Option<Handle>,
}

impl TickScheduler {
    /// Create a scheduler that runs every task inline on the ticking thread
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            runtime: None,
        }
    }

    /// Create a scheduler that hands async tasks to a tokio runtime
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            runtime: Some(runtime),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of tasks waiting in the queue
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether a task is still queued
    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.lock().due_of.contains_key(&id)
    }

    /// Advance one tick and run everything that became due.
    ///
    /// Returns the number of task firings. Tasks run without the queue
    /// lock held, so they may schedule or cancel other tasks; a task
    /// scheduled with zero delay from inside a firing runs in this same
    /// tick.
    pub fn tick(&self) -> usize {
        let now = {
            let mut state = self.lock();
            state.current += 1;
            state.current
        };

        let mut fired = 0;

        loop {
            let (id, entry) = {
                let mut state = self.lock();
                let is_due = state
                    .queue
                    .first_key_value()
                    .map(|(&(due, _), _)| due <= now)
                    .unwrap_or(false);
                if !is_due {
                    break;
                }
                let Some(((_, id), entry)) = state.queue.pop_first() else {
                    break;
                };
                state.due_of.remove(&id);
                if matches!(entry.kind, TaskKind::Repeating { .. }) {
                    state.running.insert(id);
                }
                (id, entry)
            };

            fired += 1;

            match entry.kind {
                TaskKind::Once(task) => self.dispatch(id, entry.mode, task),
                TaskKind::Repeating { period, task } => {
                    let firing = task.clone();
                    self.dispatch(id, entry.mode, Box::new(move || firing()));

                    let mut state = self.lock();
                    state.running.remove(&id);
                    if state.cancelled.remove(&id) {
                        debug!(target: "scheduler", "Task {:?} cancelled while firing", id);
                    } else {
                        state.push(
                            id,
                            now + period,
                            Entry {
                                mode: entry.mode,
                                kind: TaskKind::Repeating { period, task },
                            },
                        );
                    }
                }
            }
        }

        fired
    }

    /// Advance `ticks` ticks, returning the total number of firings
    pub fn advance(&self, ticks: u64) -> usize {
        (0..ticks).map(|_| self.tick()).sum()
    }

    fn dispatch(&self, id: TaskId, mode: ExecMode, task: OnceTask) {
        match (mode, &self.runtime) {
            (ExecMode::Async, Some(runtime)) => {
                runtime.spawn_blocking(move || {
                    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
                        error!(
                            target: "scheduler",
                            "Async task {:?} panicked: {}",
                            id,
                            describe_panic(panic.as_ref())
                        );
                    }
                });
            }
            _ => {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
                    error!(
                        target: "scheduler",
                        "Task {:?} panicked: {}",
                        id,
                        describe_panic(panic.as_ref())
                    );
                }
            }
        }
    }

    /// Tick this scheduler from a tokio task at a fixed rate
    pub fn drive(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TickScheduler {
    fn current_tick(&self) -> u64 {
        self.lock().current
    }

    fn schedule(&self, delay: u64, mode: ExecMode, task: OnceTask) -> TaskId {
        let mut state = self.lock();
        let id = state.allocate();
        let due = state.current + delay;
        state.push(
            id,
            due,
            Entry {
                mode,
                kind: TaskKind::Once(task),
            },
        );
        id
    }

    fn schedule_repeating(
        &self,
        initial_delay: u64,
        period: u64,
        mode: ExecMode,
        task: RepeatingTask,
    ) -> TaskId {
        let mut state = self.lock();
        let id = state.allocate();
        let due = state.current + initial_delay;
        state.push(
            id,
            due,
            Entry {
                mode,
                kind: TaskKind::Repeating {
                    period: period.max(1),
                    task,
                },
            },
        );
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.lock();
        if let Some(due) = state.due_of.remove(&id) {
            state.queue.remove(&(due, id));
            return true;
        }
        if state.running.contains(&id) {
            state.cancelled.insert(id);
            return true;
        }
        false
    }
}
