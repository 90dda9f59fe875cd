//! Reconciliation scheduler.
//!
//! A fixed set of workers consumes a priority queue of reconciliations. At most one
//! reconciliation per target runs at any time: requests arriving while the target is
//! executing are deferred and resubmitted once the running one completes, so a change
//! observed during an execution always triggers exactly one follow-up run.
use futures::{future::BoxFuture, FutureExt};
use serde::Serialize;
use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, trace, warn, Level};

/// The body of a scheduled reconciliation
pub type Reconciliation = BoxFuture<'static, ()>;

/// A unit of scheduled work.
///
/// Equality only looks at the target and the priority, two requests for the same
/// target with different bodies are the same queue entry.
pub struct ReconciliationTask {
    pub target_id: String,
    pub priority: bool,
    pub enqueued_at: Instant,
    reconciliation: Reconciliation,
}

impl ReconciliationTask {
    fn new(target_id: String, reconciliation: Reconciliation, priority: bool) -> Self {
        Self {
            target_id,
            priority,
            enqueued_at: Instant::now(),
            reconciliation,
        }
    }
}

impl PartialEq for ReconciliationTask {
    fn eq(&self, other: &Self) -> bool {
        self.target_id == other.target_id && self.priority == other.priority
    }
}

impl Eq for ReconciliationTask {}

impl fmt::Debug for ReconciliationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationTask")
            .field("target_id", &self.target_id)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub target_id: String,
    pub priority: bool,
    pub started_at: Instant,
}

/// Two FIFO tiers, high priority entries are always taken first
#[derive(Default)]
struct ReconciliationQueue {
    high: VecDeque<ReconciliationTask>,
    low: VecDeque<ReconciliationTask>,
}

impl ReconciliationQueue {
    fn tier(&self, priority: bool) -> &VecDeque<ReconciliationTask> {
        if priority {
            &self.high
        } else {
            &self.low
        }
    }

    fn tier_mut(&mut self, priority: bool) -> &mut VecDeque<ReconciliationTask> {
        if priority {
            &mut self.high
        } else {
            &mut self.low
        }
    }

    fn contains(&self, target_id: &str, priority: bool) -> bool {
        self.tier(priority).iter().any(|t| t.target_id == target_id)
    }

    fn remove(&mut self, target_id: &str, priority: bool) -> bool {
        let tier = self.tier_mut(priority);
        let before = tier.len();
        tier.retain(|t| t.target_id != target_id);
        tier.len() != before
    }

    /// Enqueue a task, an equal entry already queued keeps its position and takes the new body
    fn push(&mut self, task: ReconciliationTask) {
        let tier = self.tier_mut(task.priority);
        match tier.iter_mut().find(|queued| **queued == task) {
            Some(queued) => queued.reconciliation = task.reconciliation,
            None => tier.push_back(task),
        }
    }

    fn pop(&mut self) -> Option<ReconciliationTask> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    fn iter(&self) -> impl Iterator<Item = &ReconciliationTask> {
        self.high.iter().chain(self.low.iter())
    }
}

#[derive(Default)]
struct PoolState {
    queue: ReconciliationQueue,
    executing: HashMap<String, ExecutionRecord>,
    deferred: HashMap<String, ReconciliationTask>,
    shutdown: bool,
}

impl PoolState {
    /// Keep a single follow-up run per target, high priority wins and newer bodies replace older ones
    fn defer(&mut self, task: ReconciliationTask) {
        match self.deferred.get(&task.target_id) {
            Some(deferred) if deferred.priority && !task.priority => {
                trace!(
                    "{} with high priority is already waiting for the current execution",
                    task.target_id
                );
            }
            _ => {
                self.deferred.insert(task.target_id.clone(), task);
            }
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        let queued = self
            .queue
            .iter()
            .map(|task| QueuedEntry {
                target_id: task.target_id.clone(),
                priority: task.priority,
                waiting_ms: task.enqueued_at.elapsed().as_millis(),
            })
            .collect();
        let mut executing: Vec<ExecutingEntry> = self
            .executing
            .values()
            .map(|record| ExecutingEntry {
                target_id: record.target_id.clone(),
                priority: record.priority,
                running_ms: record.started_at.elapsed().as_millis(),
            })
            .collect();
        executing.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        let mut deferred: Vec<String> = self.deferred.keys().cloned().collect();
        deferred.sort();
        PoolSnapshot {
            queued,
            executing,
            deferred,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueuedEntry {
    pub target_id: String,
    pub priority: bool,
    pub waiting_ms: u128,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutingEntry {
    pub target_id: String,
    pub priority: bool,
    pub running_ms: u128,
}

/// Point in time view of the pool, queued entries are in execution order
#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolSnapshot {
    pub queued: Vec<QueuedEntry>,
    pub executing: Vec<ExecutingEntry>,
    pub deferred: Vec<String>,
}

impl PoolSnapshot {
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.executing.is_empty() && self.deferred.is_empty()
    }
}

const MAX_LISTED_PER_PRIORITY: usize = 10;

impl fmt::Display for PoolSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "queue:")?;
        for priority in [true, false] {
            let group: Vec<&QueuedEntry> =
                self.queued.iter().filter(|e| e.priority == priority).collect();
            for entry in group.iter().take(MAX_LISTED_PER_PRIORITY) {
                let marker = if entry.priority { "* " } else { "  " };
                writeln!(f, "{marker}{} {}ms", entry.target_id, entry.waiting_ms)?;
            }
            if group.len() > MAX_LISTED_PER_PRIORITY {
                writeln!(
                    f,
                    "...and other {} priority found: {} (max {}ms)",
                    if priority { "high" } else { "low" },
                    group.len(),
                    group.iter().map(|e| e.waiting_ms).max().unwrap_or(0)
                )?;
            }
        }
        writeln!(f, "executing:")?;
        for entry in &self.executing {
            writeln!(f, "{} {}ms", entry.target_id, entry.running_ms)?;
        }
        Ok(())
    }
}

struct Shared {
    state: Mutex<PoolState>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the next task and mark its target as executing, atomically
    fn next_task(&self) -> Option<ReconciliationTask> {
        let mut state = self.state();
        let task = state.queue.pop()?;
        debug_assert!(!state.executing.contains_key(&task.target_id));
        state.executing.insert(
            task.target_id.clone(),
            ExecutionRecord {
                target_id: task.target_id.clone(),
                priority: task.priority,
                started_at: Instant::now(),
            },
        );
        Some(task)
    }

    async fn execute(&self, task: ReconciliationTask) {
        let ReconciliationTask {
            target_id,
            priority,
            reconciliation,
            ..
        } = task;
        let marker = if priority { "* " } else { "  " };
        trace!("{marker}{target_id} started executing");
        let started_at = Instant::now();
        if let Err(panic) = AssertUnwindSafe(reconciliation).catch_unwind().await {
            error!(
                "Reconciliation of {target_id} panicked: {}",
                panic_message(panic.as_ref())
            );
        }
        trace!(
            "{marker}{target_id} finished executing after {}ms",
            started_at.elapsed().as_millis()
        );
        self.complete(&target_id);
    }

    fn complete(&self, target_id: &str) {
        let mut state = self.state();
        state.executing.remove(target_id);
        let deferred = state.deferred.remove(target_id);
        if state.shutdown {
            if deferred.is_some() {
                debug!("{target_id} will not be reconciled again, the pool is shutting down");
            }
            return;
        }
        if let Some(task) = deferred {
            trace!("{target_id} has been scheduled to be reconciled");
            state.queue.push(task);
            drop(state);
            self.notify.notify_one();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

async fn work(shared: Arc<Shared>, index: usize) {
    debug!("ReconciliationWorker-{index} started");
    loop {
        let notified = shared.notify.notified();
        match shared.next_task() {
            Some(task) => shared.execute(task).await,
            None if shared.state().shutdown => break,
            None => notified.await,
        }
    }
    debug!("ReconciliationWorker-{index} stopped");
}

/// Bounded pool of reconciliation workers with per-target single flight
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkerPool {
    /// Start `threads` workers on the current tokio runtime
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
        });
        let workers = (0..threads.max(1))
            .map(|index| tokio::spawn(work(shared.clone(), index)))
            .collect();
        Self {
            shared,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Schedule a reconciliation of `target_id`.
    ///
    /// A high priority request removes a queued low priority one for the same target,
    /// a low priority request is dropped when a high priority one is already queued.
    /// Requests for a target that is executing run right after the current execution.
    pub fn schedule_reconciliation<F>(&self, target_id: impl Into<String>, reconciliation: F, priority: bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = ReconciliationTask::new(target_id.into(), reconciliation.boxed(), priority);
        let mut state = self.shared.state();
        if state.shutdown {
            warn!(
                "{} will not be scheduled, the reconciliation pool is shutting down",
                task.target_id
            );
            return;
        }
        if tracing::enabled!(Level::TRACE) {
            trace!(
                "{} will be scheduled, current state of the pool:\n\n{}",
                task.target_id,
                state.snapshot()
            );
        }
        if priority {
            if state.queue.remove(&task.target_id, false) {
                trace!(
                    "{} with low priority has been removed from the reconciliation queue",
                    task.target_id
                );
            }
        } else if state.queue.contains(&task.target_id, true) {
            trace!(
                "{} with high priority is already present in the reconciliation queue",
                task.target_id
            );
            return;
        }
        if state.executing.contains_key(&task.target_id) {
            trace!(
                "{} is already executing, will be scheduled to be reconciled when current one finishes",
                task.target_id
            );
            state.defer(task);
        } else {
            trace!("{} has been scheduled to be reconciled", task.target_id);
            state.queue.push(task);
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    pub fn is_executing(&self, target_id: &str) -> bool {
        self.shared.state().executing.contains_key(target_id)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.shared.state().snapshot()
    }

    /// Stop accepting work, let queued and running reconciliations finish and wait for the workers
    pub async fn shutdown(&self) {
        self.shared.state().shutdown = true;
        self.shared.notify.notify_waiters();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Reconciliation worker did not stop cleanly: {e}");
            }
        }
    }
}
