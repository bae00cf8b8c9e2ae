use super::{
    errors::ConfigError,
    handle::Task,
    model::SchedulerMetrics,
    worker::{self, Gate},
};
use crossbeam::{
    atomic::AtomicCell,
    deque::{Stealer, Worker},
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker pool configuration. Read once, when the scheduler is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub num_threads: usize,
    /// Processors the workers are pinned to, `ids[worker % ids.len()]`.
    pub processor_affinity: Option<Vec<usize>>,
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            processor_affinity: None,
            thread_name_prefix: "parallel-worker".to_string(),
        }
    }
}

impl Config {
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Default::default()
        }
    }

    /// One worker per physical core; leaves SMT siblings to the threads that submit work.
    pub fn cpu_bound() -> Self {
        Self::with_threads(num_cpus::get_physical())
    }

    pub fn with_processor_affinity(mut self, ids: Vec<usize>) -> Result<Self, ConfigError> {
        validate_affinity(&ids)?;
        self.processor_affinity = Some(ids);
        Ok(self)
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if let Some(ids) = &self.processor_affinity {
            validate_affinity(ids)?;
        }
        Ok(())
    }
}

fn validate_affinity(ids: &[usize]) -> Result<(), ConfigError> {
    if ids.is_empty() {
        return Err(ConfigError::EmptyAffinity);
    }
    let available = num_cpus::get();
    match ids.iter().find(|&&id| id >= available) {
        Some(&id) => Err(ConfigError::InvalidProcessor { id, available }),
        None => Ok(()),
    }
}

/// State shared by the scheduler handle and every worker thread.
pub(crate) struct Shared {
    global: Mutex<VecDeque<Task>>,
    // Written under the `global` lock, read without it as a hint only.
    global_len: AtomicUsize,
    replicable: AtomicCell<Option<Task>>,
    pub(crate) stealers: Vec<Stealer<Task>>,
    pub(crate) gates: Vec<Gate>,
    shutdown: CancellationToken,
    pub(crate) idle_workers: AtomicUsize,
    pub(crate) executed: AtomicUsize,
    pub(crate) stolen: AtomicUsize,
    pub(crate) joined: AtomicUsize,
}

impl Shared {
    #[inline]
    fn push_global(&self, task: Task) {
        let mut queue = self.global.lock();
        queue.push_back(task);
        self.global_len.store(queue.len(), Ordering::Release);
    }

    /// Pops the oldest task of the shared queue without blocking on an empty queue.
    #[inline]
    pub(crate) fn try_take_global(&self) -> Option<Task> {
        let mut queue = self.global.lock();
        let task = queue.pop_front();
        self.global_len.store(queue.len(), Ordering::Release);
        task
    }

    #[inline]
    pub(crate) fn has_global_hint(&self) -> bool {
        self.global_len.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub(crate) fn published_replicable(&self) -> Option<Task> {
        self.replicable.load()
    }

    /// Clears the replicable slot if it still offers `task` and `task` has finished.
    pub(crate) fn retire_replicable(&self, task: Task) {
        if self.replicable.load() == Some(task) && task.is_complete() {
            let _ = self.replicable.compare_exchange(Some(task), None);
        }
    }

    pub(crate) fn wake_all(&self) {
        for gate in &self.gates {
            gate.set();
        }
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub type Scheduler = Arc<WorkStealingScheduler>;

/// Fixed pool of worker threads that share a FIFO queue and steal from each other's
/// local queues.
pub struct WorkStealingScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: Config,
}

impl WorkStealingScheduler {
    pub fn new(num_threads: usize) -> Result<Scheduler, ConfigError> {
        Self::with_config(Config::with_threads(num_threads))
    }

    pub fn with_config(config: Config) -> Result<Scheduler, ConfigError> {
        config.validate()?;
        let num_threads = config.num_threads;

        let mut locals = Vec::with_capacity(num_threads);
        let mut stealers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let local = Worker::new_lifo();
            stealers.push(local.stealer());
            locals.push(local);
        }

        let shared = Arc::new(Shared {
            global: Mutex::new(VecDeque::new()),
            global_len: AtomicUsize::new(0),
            replicable: AtomicCell::new(None),
            stealers,
            gates: (0..num_threads).map(|_| Gate::new()).collect(),
            shutdown: CancellationToken::new(),
            idle_workers: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
            stolen: AtomicUsize::new(0),
            joined: AtomicUsize::new(0),
        });

        let scheduler = WorkStealingScheduler {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(num_threads)),
            config,
        };

        for (index, local) in locals.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let processor = scheduler
                .config
                .processor_affinity
                .as_ref()
                .map(|ids| ids[index % ids.len()]);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", scheduler.config.thread_name_prefix, index))
                .spawn(move || worker::run(index, local, shared, processor))
                .map_err(|e| ConfigError::WorkerSpawn(e.to_string()))?;
            scheduler.threads.lock().push(handle);
        }

        info!(workers = num_threads, "work-stealing scheduler started");
        Ok(Arc::new(scheduler))
    }

    /// Queues `task` and wakes the workers.
    ///
    /// From a worker of this scheduler, non-FIFO work goes to that worker's local queue;
    /// everything else goes to the shared queue. Replicable work is also published so
    /// idle workers can join it.
    pub fn schedule(&self, task: Task) {
        let Some(options) = task.options() else {
            return;
        };

        if self.shared.is_shutdown() {
            warn!(?task, "scheduler is shut down, running task on the caller");
            task.execute();
            return;
        }

        if options.queue_fifo || !worker::push_local(&self.shared, task) {
            self.shared.push_global(task);
        }
        if options.is_replicable() {
            self.shared.replicable.store(Some(task));
        }
        self.shared.wake_all();
    }

    pub fn num_workers(&self) -> usize {
        self.shared.gates.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            workers: self.num_workers(),
            idle_workers: self.shared.idle_workers.load(Ordering::Relaxed),
            queued_tasks: self.shared.global_len.load(Ordering::Relaxed),
            executed_tasks: self.shared.executed.load(Ordering::Relaxed),
            stolen_tasks: self.shared.stolen.load(Ordering::Relaxed),
            replicated_joins: self.shared.joined.load(Ordering::Relaxed),
        }
    }

    /// Stops the workers once they have drained all queued work.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.wake_all();

        let current = thread::current().id();
        let threads = mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            // A worker may end up dropping the last reference to its own scheduler.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        debug!("work-stealing scheduler stopped");
    }
}

impl Drop for WorkStealingScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
