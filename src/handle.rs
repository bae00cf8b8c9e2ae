use super::{
    item::{arena, WorkItem},
    result::TaskResult,
    work::WorkOptions,
    worker,
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Copyable handle to one submission.
///
/// Copies are interchangeable. Failures recorded while the work ran are reported to the
/// first caller that observes completion through `wait` or `completion`; later observers
/// see `Ok(())`. Failures nobody collects are dropped once the backing slot has been reused
/// a few times over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    index: u32,
    generation: u32,
}

impl Task {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub(crate) const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) const fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    fn item(&self) -> Option<Arc<WorkItem>> {
        arena().get(*self)
    }

    pub fn is_complete(&self) -> bool {
        self.item()
            .map_or(true, |item| item.is_complete(self.generation))
    }

    /// Blocks until the task completes.
    ///
    /// On a worker thread this keeps running other queued work in the meantime, so tasks
    /// that wait on their own sub-tasks cannot starve the pool.
    pub fn wait(&self) -> TaskResult<()> {
        let Some(item) = self.item() else {
            return Ok(());
        };
        let generation = self.generation;
        if !item.is_complete(generation) && !worker::help_until_complete(&item, generation) {
            item.block_until_complete(generation);
        }
        item.take_outcome(generation)
    }

    /// Awaitable view of [`Task::wait`] for async callers. Never helps with queued work.
    pub fn completion(&self) -> Completion {
        Completion { task: *self }
    }

    pub(crate) fn options(&self) -> Option<WorkOptions> {
        self.item()?.options(self.generation)
    }

    /// Runs the work as one more participant; see `WorkItem::execute`.
    pub(crate) fn execute(&self) -> bool {
        self.item()
            .map_or(true, |item| item.execute(self.generation))
    }

    pub(crate) fn add_child(&self, child: Task) -> bool {
        self.item()
            .is_some_and(|item| item.add_child(self.generation, child))
    }
}

pub struct Completion {
    task: Task,
}

impl Future for Completion {
    type Output = TaskResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = self.task;
        let Some(item) = task.item() else {
            return Poll::Ready(Ok(()));
        };
        match item.poll_complete(task.generation, cx) {
            Poll::Ready(()) => Poll::Ready(item.take_outcome(task.generation)),
            Poll::Pending => Poll::Pending,
        }
    }
}
