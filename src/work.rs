//! The unit-of-work capability and the adapters that turn plain closures into work.

use super::{
    errors::{SpawnError, WorkFailure},
    object_pool::{Pool, Recycle},
    result::SpawnResult,
};
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// `max_threads` value that lets every idle worker join.
pub const UNBOUNDED: usize = usize::MAX;

/// How a work object wants to be scheduled. Fixed once the work is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkOptions {
    /// `1` runs the work exactly once; above that, up to this many workers may run
    /// `do_work` on the same instance at the same time.
    pub max_threads: usize,
    /// Always go through the shared FIFO queue, even when submitted from a worker.
    pub queue_fifo: bool,
    /// Do not make the task that is currently executing wait for this one.
    pub detach_from_parent: bool,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self::exclusive()
    }
}

impl WorkOptions {
    pub const fn exclusive() -> Self {
        Self {
            max_threads: 1,
            queue_fifo: false,
            detach_from_parent: false,
        }
    }

    pub const fn replicable(max_threads: usize) -> Self {
        Self {
            max_threads,
            queue_fifo: false,
            detach_from_parent: false,
        }
    }

    pub const fn unbounded() -> Self {
        Self::replicable(UNBOUNDED)
    }

    pub const fn with_queue_fifo(mut self, queue_fifo: bool) -> Self {
        self.queue_fifo = queue_fifo;
        self
    }

    pub const fn with_detach_from_parent(mut self, detach: bool) -> Self {
        self.detach_from_parent = detach;
        self
    }

    #[inline]
    pub const fn is_replicable(&self) -> bool {
        self.max_threads > 1
    }

    pub fn validate(&self) -> SpawnResult<()> {
        if self.max_threads < 1 {
            return Err(SpawnError::InvalidMaxThreads(self.max_threads));
        }
        Ok(())
    }
}

/// A unit of work the scheduler can run.
///
/// When `options().max_threads > 1`, `do_work` is called concurrently on the same instance
/// by every worker that joins. Each call must claim its own share of the remaining work
/// (an atomic cursor, a locked iterator) and return once nothing is left to claim; the task
/// completes when every participant has returned. A panic inside `do_work` is captured
/// and reported through `Task::wait`, it never takes the worker thread down.
pub trait Work: Send + Sync + 'static {
    fn options(&self) -> WorkOptions;

    fn do_work(&self);

    /// Called once, after every participant has returned, with the scheduler's own
    /// reference to the work.
    fn retire(self: Arc<Self>) {}
}

type Action = Box<dyn Fn() + Send + Sync>;

/// Runs a plain closure. Recycled through its pool when the task is done with it.
#[derive(Default)]
pub(crate) struct DelegateWork {
    action: Option<Action>,
    options: WorkOptions,
}

impl DelegateWork {
    pub(crate) fn get<F>(action: F, options: WorkOptions) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut work = Pool::<DelegateWork>::instance().acquire();
        work.action = Some(Box::new(action));
        work.options = options;
        Arc::new(work)
    }
}

impl Recycle for DelegateWork {
    fn reset(&mut self) {
        self.action = None;
        self.options = WorkOptions::default();
    }
}

impl Work for DelegateWork {
    fn options(&self) -> WorkOptions {
        self.options
    }

    fn do_work(&self) {
        if let Some(action) = &self.action {
            action();
        }
    }

    fn retire(self: Arc<Self>) {
        if let Ok(work) = Arc::try_unwrap(self) {
            Pool::<DelegateWork>::instance().release(work);
        }
    }
}

type Function<T> = Box<dyn FnOnce() -> T + Send>;

/// Runs a closure once and keeps its return value, or its failure, for `Future::value`.
pub(crate) struct FutureWork<T> {
    function: Mutex<Option<Function<T>>>,
    result: Mutex<Option<Result<T, WorkFailure>>>,
    options: WorkOptions,
}

impl<T> Default for FutureWork<T> {
    fn default() -> Self {
        Self {
            function: Mutex::new(None),
            result: Mutex::new(None),
            options: WorkOptions::default(),
        }
    }
}

impl<T: Send + 'static> FutureWork<T> {
    pub(crate) fn get<F>(function: F, options: WorkOptions) -> Arc<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut work = Pool::<FutureWork<T>>::instance().acquire();
        *work.function.get_mut() = Some(Box::new(function));
        work.options = options;
        Arc::new(work)
    }

    pub(crate) fn take_result(&self) -> Option<Result<T, WorkFailure>> {
        self.result.lock().take()
    }

    pub(crate) fn recycle(self: Arc<Self>) {
        if let Ok(work) = Arc::try_unwrap(self) {
            Pool::<FutureWork<T>>::instance().release(work);
        }
    }
}

impl<T> Recycle for FutureWork<T> {
    fn reset(&mut self) {
        *self.function.get_mut() = None;
        *self.result.get_mut() = None;
        self.options = WorkOptions::default();
    }
}

impl<T: Send + 'static> Work for FutureWork<T> {
    fn options(&self) -> WorkOptions {
        self.options
    }

    fn do_work(&self) {
        // Only the first participant gets the closure.
        let function = self.function.lock().take();
        let Some(function) = function else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(function)) {
            Ok(value) => *self.result.lock() = Some(Ok(value)),
            Err(payload) => {
                let failure = WorkFailure::from_panic(payload);
                let message = failure.message().to_string();
                *self.result.lock() = Some(Err(failure));
                // The task records the same failure for whoever waits on it.
                panic::resume_unwind(Box::new(message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn options_validation() {
        assert!(WorkOptions::exclusive().validate().is_ok());
        assert!(WorkOptions::unbounded().validate().is_ok());
        assert_eq!(
            WorkOptions::replicable(0).validate(),
            Err(SpawnError::InvalidMaxThreads(0))
        );
        assert!(!WorkOptions::exclusive().is_replicable());
        assert!(WorkOptions::replicable(2).is_replicable());
        let fifo = WorkOptions::exclusive()
            .with_queue_fifo(true)
            .with_detach_from_parent(true);
        assert!(fifo.queue_fifo && fifo.detach_from_parent);
    }

    #[test]
    fn delegate_work_runs_action_each_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let work = DelegateWork::get(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            WorkOptions::replicable(3),
        );
        work.do_work();
        work.do_work();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(work.options().max_threads, 3);
    }

    #[test]
    fn future_work_runs_once_and_keeps_value() {
        let work = FutureWork::get(|| 6 * 7, WorkOptions::exclusive());
        work.do_work();
        work.do_work();
        assert_eq!(work.take_result(), Some(Ok(42)));
        assert_eq!(work.take_result(), None);
    }

    #[test]
    fn future_work_keeps_its_failure() {
        let work = FutureWork::get(|| -> u32 { panic!("no answer") }, WorkOptions::exclusive());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work.do_work()));
        let payload = outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("no answer"));
        assert_eq!(work.take_result(), Some(Err(WorkFailure::new("no answer"))));
    }
}
