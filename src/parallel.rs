//! Public entry points: fire-and-forget submission, futures, fork-join, parallel loops and
//! the completion-callback drain.
//!
//! Everything is available on a [`Parallel`] instance bound to a scheduler, and as free
//! functions over a process-wide instance that is built on first use from the
//! configuration passed to [`configure`].

use super::{
    background::BackgroundSlot,
    errors::{CallbackError, ConfigError, ParallelError, TaskError, WorkFailure},
    future::Future,
    handle::Task,
    item::{arena, Callback, CurrentTask},
    loops::{ForEachLoopWork, ForLoopWork, DEFAULT_STRIDE},
    object_pool::Pool,
    pool::{Config, Scheduler, WorkStealingScheduler},
    result::SpawnResult,
    work::{DelegateWork, FutureWork, Work, WorkOptions},
};
use parking_lot::Mutex;
use std::{
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};
use tracing::{error, info};

pub type Action = Box<dyn Fn() + Send + Sync + 'static>;

enum Launch {
    Pool,
    Background(BackgroundSlot),
}

pub struct Parallel {
    scheduler: Scheduler,
}

static GLOBAL: OnceLock<Parallel> = OnceLock::new();
static PENDING_CONFIG: Mutex<Option<Config>> = parking_lot::const_mutex(None);

/// Sets the configuration of the process-wide runtime. Must run before first use.
pub fn configure(config: Config) -> Result<(), ConfigError> {
    config.validate()?;
    let mut pending = PENDING_CONFIG.lock();
    if GLOBAL.get().is_some() {
        return Err(ConfigError::AlreadyStarted);
    }
    *pending = Some(config);
    Ok(())
}

impl Parallel {
    pub fn new(num_threads: usize) -> Result<Self, ConfigError> {
        Self::with_config(Config::with_threads(num_threads))
    }

    pub fn with_config(config: Config) -> Result<Self, ConfigError> {
        Ok(Self::with_scheduler(WorkStealingScheduler::with_config(config)?))
    }

    pub fn with_scheduler(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// The process-wide runtime.
    ///
    /// # Panics
    ///
    /// If its worker threads cannot be spawned.
    pub fn global() -> &'static Parallel {
        GLOBAL.get_or_init(|| {
            let config = PENDING_CONFIG.lock().take().unwrap_or_default();
            info!(workers = config.num_threads, "starting process-wide runtime");
            match Parallel::with_config(config) {
                Ok(parallel) => parallel,
                Err(e) => panic!("failed to start the process-wide runtime: {e}"),
            }
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn submit(&self, work: Arc<dyn Work>, on_complete: Option<Callback>, launch: Launch) -> Task {
        let options = work.options();
        let task = arena().acquire(work, on_complete);
        if !options.detach_from_parent {
            if let Some(parent) = CurrentTask::get() {
                parent.add_child(task);
            }
        }
        match launch {
            Launch::Pool => self.scheduler.schedule(task),
            Launch::Background(slot) => slot.start(task),
        }
        task
    }

    /// Schedules `work` on the pool.
    pub fn start_work(
        &self,
        work: Arc<dyn Work>,
        on_complete: Option<Callback>,
    ) -> SpawnResult<Task> {
        work.options().validate()?;
        Ok(self.submit(work, on_complete, Launch::Pool))
    }

    /// Runs `work` on a dedicated thread instead of the pool.
    pub fn start_background_work(
        &self,
        work: Arc<dyn Work>,
        on_complete: Option<Callback>,
    ) -> SpawnResult<Task> {
        work.options().validate()?;
        let slot = BackgroundSlot::launch()?;
        Ok(self.submit(work, on_complete, Launch::Background(slot)))
    }

    pub fn start<F>(&self, action: F) -> SpawnResult<Task>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.start_with_options(WorkOptions::default(), action)
    }

    /// With `max_threads > 1`, every participating worker calls `action`.
    pub fn start_with_options<F>(&self, options: WorkOptions, action: F) -> SpawnResult<Task>
    where
        F: Fn() + Send + Sync + 'static,
    {
        options.validate()?;
        Ok(self.submit(DelegateWork::get(action, options), None, Launch::Pool))
    }

    /// `on_complete` runs in [`run_callbacks`] once the action has finished.
    pub fn start_with_callback<F, C>(&self, action: F, on_complete: C) -> SpawnResult<Task>
    where
        F: Fn() + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.start_with_options_and_callback(WorkOptions::default(), action, on_complete)
    }

    pub fn start_with_options_and_callback<F, C>(
        &self,
        options: WorkOptions,
        action: F,
        on_complete: C,
    ) -> SpawnResult<Task>
    where
        F: Fn() + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        options.validate()?;
        let work = DelegateWork::get(action, options);
        Ok(self.submit(work, Some(Box::new(on_complete)), Launch::Pool))
    }

    pub fn start_background<F>(&self, action: F) -> SpawnResult<Task>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.spawn_background(action, None)
    }

    pub fn start_background_with_callback<F, C>(
        &self,
        action: F,
        on_complete: C,
    ) -> SpawnResult<Task>
    where
        F: Fn() + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.spawn_background(action, Some(Box::new(on_complete)))
    }

    fn spawn_background<F>(&self, action: F, on_complete: Option<Callback>) -> SpawnResult<Task>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let slot = BackgroundSlot::launch()?;
        let work = DelegateWork::get(action, WorkOptions::default());
        Ok(self.submit(work, on_complete, Launch::Background(slot)))
    }

    pub fn start_future<T, F>(&self, function: F) -> SpawnResult<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawn_future(WorkOptions::default(), function, None)
    }

    /// Only queuing and parent tracking apply: the closure runs once whatever `max_threads` is.
    pub fn start_future_with_options<T, F>(
        &self,
        options: WorkOptions,
        function: F,
    ) -> SpawnResult<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawn_future(options, function, None)
    }

    pub fn start_future_with_callback<T, F, C>(
        &self,
        function: F,
        on_complete: C,
    ) -> SpawnResult<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.spawn_future(WorkOptions::default(), function, Some(Box::new(on_complete)))
    }

    pub fn start_future_with_options_and_callback<T, F, C>(
        &self,
        options: WorkOptions,
        function: F,
        on_complete: C,
    ) -> SpawnResult<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.spawn_future(options, function, Some(Box::new(on_complete)))
    }

    fn spawn_future<T, F>(
        &self,
        options: WorkOptions,
        function: F,
        on_complete: Option<Callback>,
    ) -> SpawnResult<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        options.validate()?;
        let work = FutureWork::get(function, options);
        let task = self.submit(Arc::clone(&work) as Arc<dyn Work>, on_complete, Launch::Pool);
        Ok(Future::new(task, work))
    }

    /// Runs `a` on the calling thread while `b` may run on the pool; returns once both
    /// have finished, with the failures of either.
    pub fn join<A, B>(&self, a: A, b: B) -> Result<(), ParallelError>
    where
        A: FnOnce(),
        B: Fn() + Send + Sync + 'static,
    {
        let task = self.start(b)?;
        let inline = panic::catch_unwind(AssertUnwindSafe(a));
        merge_outcomes(inline, task.wait())
    }

    /// Like [`Parallel::join`] for arbitrary work: `a` runs inline, `b` is scheduled.
    pub fn join_work(&self, a: &dyn Work, b: Arc<dyn Work>) -> Result<(), ParallelError> {
        let task = self.start_work(b, None)?;
        let inline = panic::catch_unwind(AssertUnwindSafe(|| a.do_work()));
        merge_outcomes(inline, task.wait())
    }

    /// Runs the first action inline and the rest on the pool; blocks until all are done.
    pub fn join_all(&self, actions: Vec<Action>) -> Result<(), ParallelError> {
        let mut actions = actions.into_iter();
        let Some(first) = actions.next() else {
            return Ok(());
        };

        let mut tasks = Pool::<Vec<Task>>::instance().acquire();
        let submitted = actions.try_for_each(|action| {
            tasks.push(self.start(action)?);
            Ok::<_, ParallelError>(())
        });

        let inline = panic::catch_unwind(AssertUnwindSafe(|| first()));
        let result = wait_all(inline, &tasks);
        Pool::<Vec<Task>>::instance().release(tasks);
        submitted.and(result)
    }

    /// Schedules every work object and blocks until all of them are done.
    pub fn join_all_work(&self, works: &[Arc<dyn Work>]) -> Result<(), ParallelError> {
        let mut tasks = Pool::<Vec<Task>>::instance().acquire();
        let submitted = works.iter().try_for_each(|work| {
            tasks.push(self.start_work(Arc::clone(work), None)?);
            Ok::<_, ParallelError>(())
        });

        let result = wait_all(Ok(()), &tasks);
        Pool::<Vec<Task>>::instance().release(tasks);
        submitted.and(result)
    }

    /// Calls `body(i)` exactly once for every `i` in `start..end`, in parallel.
    pub fn for_range<F>(&self, start: usize, end: usize, body: F) -> Result<(), ParallelError>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let stride = NonZeroUsize::new(DEFAULT_STRIDE).unwrap_or(NonZeroUsize::MIN);
        self.for_range_with_stride(start, end, stride, body)
    }

    /// `stride` is the number of consecutive indices a worker claims at a time.
    pub fn for_range_with_stride<F>(
        &self,
        start: usize,
        end: usize,
        stride: NonZeroUsize,
        body: F,
    ) -> Result<(), ParallelError>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let mut work = Pool::<ForLoopWork>::instance().acquire();
        work.prepare(start, end, stride.get(), body);
        let work = Arc::new(work);

        let task = self.start_work(Arc::clone(&work) as Arc<dyn Work>, None)?;
        let result = task.wait();
        if let Ok(work) = Arc::try_unwrap(work) {
            Pool::<ForLoopWork>::instance().release(work);
        }
        Ok(result?)
    }

    /// Calls `body` once for every element of `items`, in parallel.
    pub fn for_each<I, T, F>(&self, items: I, body: F) -> Result<(), ParallelError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut work = Pool::<ForEachLoopWork<T>>::instance().acquire();
        work.prepare(items.into_iter(), body);
        let work = Arc::new(work);

        let task = self.start_work(Arc::clone(&work) as Arc<dyn Work>, None)?;
        let result = task.wait();
        if let Ok(work) = Arc::try_unwrap(work) {
            Pool::<ForEachLoopWork<T>>::instance().release(work);
        }
        Ok(result?)
    }

    /// See [`run_callbacks`].
    pub fn run_callbacks(&self) -> Result<usize, CallbackError> {
        run_callbacks()
    }
}

fn merge_outcomes(
    inline: std::thread::Result<()>,
    scheduled: Result<(), TaskError>,
) -> Result<(), ParallelError> {
    let mut failures = Vec::new();
    if let Err(payload) = inline {
        failures.push(WorkFailure::from_panic(payload));
    }
    if let Err(err) = scheduled {
        failures.extend(err.into_failures());
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TaskError::Failed(failures).into())
    }
}

fn wait_all(inline: std::thread::Result<()>, tasks: &[Task]) -> Result<(), ParallelError> {
    let mut failures = Vec::new();
    for task in tasks {
        if let Err(err) = task.wait() {
            failures.extend(err.into_failures());
        }
    }
    let scheduled = if failures.is_empty() {
        Ok(())
    } else {
        Err(TaskError::Failed(failures))
    };
    merge_outcomes(inline, scheduled)
}

/// Invokes the completion callbacks of every finished task, on the calling thread, and
/// returns how many tasks were drained.
///
/// Not re-entrant: call it from one designated thread, e.g. once per tick. A panicking
/// callback is logged and does not stop the others.
pub fn run_callbacks() -> Result<usize, CallbackError> {
    static DRAINING: AtomicBool = AtomicBool::new(false);

    struct Draining;
    impl Drop for Draining {
        fn drop(&mut self) {
            DRAINING.store(false, Ordering::Release);
        }
    }

    if DRAINING.swap(true, Ordering::Acquire) {
        return Err(CallbackError::Reentered);
    }
    let _draining = Draining;

    let arena = arena();
    let mut buffer = Pool::<Vec<Task>>::instance().acquire();
    arena.drain_awaiting_callbacks(&mut buffer);
    let drained = buffer.len();
    for task in buffer.drain(..) {
        if let Some(failure) = arena.dispatch_callback(task) {
            error!(?task, failure = %failure, "completion callback panicked");
        }
    }
    Pool::<Vec<Task>>::instance().release(buffer);
    Ok(drained)
}

pub fn start<F>(action: F) -> SpawnResult<Task>
where
    F: Fn() + Send + Sync + 'static,
{
    Parallel::global().start(action)
}

pub fn start_with_options<F>(options: WorkOptions, action: F) -> SpawnResult<Task>
where
    F: Fn() + Send + Sync + 'static,
{
    Parallel::global().start_with_options(options, action)
}

pub fn start_with_callback<F, C>(action: F, on_complete: C) -> SpawnResult<Task>
where
    F: Fn() + Send + Sync + 'static,
    C: FnOnce() + Send + 'static,
{
    Parallel::global().start_with_callback(action, on_complete)
}

pub fn start_with_options_and_callback<F, C>(
    options: WorkOptions,
    action: F,
    on_complete: C,
) -> SpawnResult<Task>
where
    F: Fn() + Send + Sync + 'static,
    C: FnOnce() + Send + 'static,
{
    Parallel::global().start_with_options_and_callback(options, action, on_complete)
}

pub fn start_work(work: Arc<dyn Work>, on_complete: Option<Callback>) -> SpawnResult<Task> {
    Parallel::global().start_work(work, on_complete)
}

pub fn start_background<F>(action: F) -> SpawnResult<Task>
where
    F: Fn() + Send + Sync + 'static,
{
    Parallel::global().start_background(action)
}

pub fn start_background_with_callback<F, C>(action: F, on_complete: C) -> SpawnResult<Task>
where
    F: Fn() + Send + Sync + 'static,
    C: FnOnce() + Send + 'static,
{
    Parallel::global().start_background_with_callback(action, on_complete)
}

pub fn start_background_work(
    work: Arc<dyn Work>,
    on_complete: Option<Callback>,
) -> SpawnResult<Task> {
    Parallel::global().start_background_work(work, on_complete)
}

pub fn start_future<T, F>(function: F) -> SpawnResult<Future<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Parallel::global().start_future(function)
}

pub fn start_future_with_options<T, F>(options: WorkOptions, function: F) -> SpawnResult<Future<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Parallel::global().start_future_with_options(options, function)
}

pub fn start_future_with_callback<T, F, C>(function: F, on_complete: C) -> SpawnResult<Future<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    Parallel::global().start_future_with_callback(function, on_complete)
}

pub fn start_future_with_options_and_callback<T, F, C>(
    options: WorkOptions,
    function: F,
    on_complete: C,
) -> SpawnResult<Future<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    Parallel::global().start_future_with_options_and_callback(options, function, on_complete)
}

pub fn join<A, B>(a: A, b: B) -> Result<(), ParallelError>
where
    A: FnOnce(),
    B: Fn() + Send + Sync + 'static,
{
    Parallel::global().join(a, b)
}

pub fn join_work(a: &dyn Work, b: Arc<dyn Work>) -> Result<(), ParallelError> {
    Parallel::global().join_work(a, b)
}

pub fn join_all(actions: Vec<Action>) -> Result<(), ParallelError> {
    Parallel::global().join_all(actions)
}

pub fn join_all_work(works: &[Arc<dyn Work>]) -> Result<(), ParallelError> {
    Parallel::global().join_all_work(works)
}

pub fn for_range<F>(start: usize, end: usize, body: F) -> Result<(), ParallelError>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    Parallel::global().for_range(start, end, body)
}

pub fn for_range_with_stride<F>(
    start: usize,
    end: usize,
    stride: NonZeroUsize,
    body: F,
) -> Result<(), ParallelError>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    Parallel::global().for_range_with_stride(start, end, stride, body)
}

pub fn for_each<I, T, F>(items: I, body: F) -> Result<(), ParallelError>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Parallel::global().for_each(items, body)
}
