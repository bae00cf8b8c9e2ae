use super::{
    errors::{TaskError, WorkFailure},
    handle::Task,
    result::TaskResult,
    work::FutureWork,
};
use std::sync::Arc;

/// Result of a closure running on the pool.
pub struct Future<T: Send + 'static> {
    task: Task,
    work: Arc<FutureWork<T>>,
}

impl<T: Send + 'static> Future<T> {
    pub(crate) fn new(task: Task, work: Arc<FutureWork<T>>) -> Self {
        Self { task, work }
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn is_complete(&self) -> bool {
        self.task.is_complete()
    }

    /// Waits for the closure and returns what it produced, or the failures it raised.
    ///
    /// The closure's own failure is kept here even when a parent task has already
    /// collected the task's failures.
    pub fn value(self) -> TaskResult<T> {
        let waited = self.task.wait();
        let value = self.work.take_result();
        self.work.recycle();
        waited?;
        match value {
            Some(Ok(value)) => Ok(value),
            Some(Err(failure)) => Err(TaskError::Failed(vec![failure])),
            None => Err(TaskError::Failed(vec![WorkFailure::new(
                "future finished without a value",
            )])),
        }
    }
}
