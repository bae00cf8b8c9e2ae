//! Work items: the pooled, mutable records behind every `Task` handle.
//!
//! Items live in a process-wide arena of slots. A `Task` names a slot and the generation the
//! slot had when the task was submitted; recycling a slot bumps its generation, so an old
//! handle can tell that its submission finished and can never observe a newer one.

use super::{
    errors::{TaskError, WorkFailure},
    handle::Task,
    result::TaskResult,
    work::{Work, WorkOptions},
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    cell::Cell,
    collections::HashMap,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    task::{Context, Poll, Waker},
    time::Duration,
};
use tracing::{debug, trace};

/// Number of newer generations a slot may go through before failures nobody collected
/// from an older one are dropped.
pub(crate) const OUTCOME_WINDOW: u32 = 8;

/// Completion callback, invoked by `run_callbacks` on the draining thread.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkItem {
    index: u32,
    state: Mutex<ItemState>,
    done: Condvar,
}

#[derive(Default)]
struct ItemState {
    generation: u32,
    work: Option<Arc<dyn Work>>,
    options: WorkOptions,
    executing: usize,
    finishing: bool,
    complete: bool,
    failures: Vec<WorkFailure>,
    children: Vec<Task>,
    callback: Option<Callback>,
    wakers: Vec<Waker>,
    // Failures of finished generations, kept until the first observer takes them or the
    // slot has moved more than `OUTCOME_WINDOW` generations past them.
    outcomes: HashMap<u32, Vec<WorkFailure>>,
}

impl ItemState {
    #[inline]
    fn is_complete(&self, generation: u32) -> bool {
        self.generation != generation || self.complete
    }

    fn recycle(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.work = None;
        self.options = WorkOptions::default();
        self.executing = 0;
        self.finishing = false;
        self.complete = false;
        self.failures.clear();
        self.children.clear();
        self.callback = None;

        let current = self.generation;
        self.outcomes
            .retain(|&generation, _| current.wrapping_sub(generation) <= OUTCOME_WINDOW);
    }
}

impl WorkItem {
    fn new(index: u32) -> Self {
        Self {
            index,
            state: Mutex::new(ItemState::default()),
            done: Condvar::new(),
        }
    }

    fn prepare(&self, work: Arc<dyn Work>, callback: Option<Callback>) -> Task {
        let mut st = self.state.lock();
        st.options = work.options();
        st.work = Some(work);
        st.callback = callback;
        Task::new(self.index, st.generation)
    }

    pub(crate) fn options(&self, generation: u32) -> Option<WorkOptions> {
        let st = self.state.lock();
        (!st.is_complete(generation)).then_some(st.options)
    }

    pub(crate) fn is_complete(&self, generation: u32) -> bool {
        self.state.lock().is_complete(generation)
    }

    /// Runs the work as one more participant.
    ///
    /// Returns `false` only when the work already has `max_threads` participants, so the
    /// caller should look elsewhere. Finished or stale submissions return `true` at once.
    pub(crate) fn execute(&self, generation: u32) -> bool {
        let work = {
            let mut st = self.state.lock();
            if st.generation != generation || st.finishing || st.complete {
                return true;
            }
            if st.executing >= st.options.max_threads {
                return false;
            }
            let Some(work) = st.work.clone() else {
                return true;
            };
            st.executing += 1;
            work
        };

        let task = Task::new(self.index, generation);
        let outcome = {
            let _current = CurrentTask::enter(task);
            panic::catch_unwind(AssertUnwindSafe(|| work.do_work()))
        };
        drop(work);

        let children = {
            let mut st = self.state.lock();
            if let Err(payload) = outcome {
                let failure = WorkFailure::from_panic(payload);
                debug!(?task, failure = %failure, "work panicked, failure recorded");
                st.failures.push(failure);
            }
            st.executing -= 1;
            if st.executing > 0 {
                return true;
            }
            st.finishing = true;
            mem::take(&mut st.children)
        };

        self.finish(generation, children);
        true
    }

    fn finish(&self, generation: u32, children: Vec<Task>) {
        let mut inherited = Vec::new();
        for child in children {
            if let Err(err) = child.wait() {
                inherited.extend(err.into_failures());
            }
        }

        let work = self.state.lock().work.take();
        if let Some(work) = work {
            work.retire();
        }

        let (recycle, wakers) = {
            let mut st = self.state.lock();
            st.failures.extend(inherited);
            let failures = mem::take(&mut st.failures);
            if !failures.is_empty() {
                st.outcomes.insert(generation, failures);
            }
            st.complete = true;
            let recycle = st.callback.is_none();
            if recycle {
                st.recycle();
            }
            (recycle, mem::take(&mut st.wakers))
        };

        self.done.notify_all();
        for waker in wakers {
            waker.wake();
        }

        let task = Task::new(self.index, generation);
        trace!(?task, recycle, "work item complete");
        if recycle {
            arena().release(self.index);
        } else {
            arena().await_callback(task);
        }
    }

    /// Makes `child` a dependency of this submission. Refused once the submission has
    /// stopped running.
    pub(crate) fn add_child(&self, generation: u32, child: Task) -> bool {
        let mut st = self.state.lock();
        if st.generation != generation || st.finishing || st.complete {
            return false;
        }
        st.children.push(child);
        true
    }

    pub(crate) fn block_until_complete(&self, generation: u32) {
        let mut st = self.state.lock();
        while !st.is_complete(generation) {
            self.done.wait(&mut st);
        }
    }

    pub(crate) fn wait_complete_for(&self, generation: u32, timeout: Duration) -> bool {
        let mut st = self.state.lock();
        if !st.is_complete(generation) {
            self.done.wait_for(&mut st, timeout);
        }
        st.is_complete(generation)
    }

    pub(crate) fn poll_complete(&self, generation: u32, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.state.lock();
        if st.is_complete(generation) {
            return Poll::Ready(());
        }
        if !st.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            st.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Hands the parked failures of `generation` to the caller, once.
    pub(crate) fn take_outcome(&self, generation: u32) -> TaskResult<()> {
        match self.state.lock().outcomes.remove(&generation) {
            Some(failures) => Err(TaskError::Failed(failures)),
            None => Ok(()),
        }
    }

    fn take_callback(&self, generation: u32) -> Option<Callback> {
        let mut st = self.state.lock();
        if st.generation != generation || !st.complete {
            return None;
        }
        st.callback.take()
    }

    fn recycle_after_callback(&self, generation: u32) {
        {
            let mut st = self.state.lock();
            if st.generation != generation || !st.complete {
                return;
            }
            st.recycle();
        }
        arena().release(self.index);
    }
}

pub(crate) struct WorkItemArena {
    slots: RwLock<Vec<Arc<WorkItem>>>,
    free: Mutex<Vec<u32>>,
    awaiting_callbacks: Mutex<Vec<Task>>,
}

pub(crate) fn arena() -> &'static WorkItemArena {
    static ARENA: OnceLock<WorkItemArena> = OnceLock::new();
    ARENA.get_or_init(|| WorkItemArena {
        slots: RwLock::new(Vec::new()),
        free: Mutex::new(Vec::new()),
        awaiting_callbacks: Mutex::new(Vec::new()),
    })
}

impl WorkItemArena {
    /// Binds `work` to an idle slot and returns the handle for this submission.
    pub(crate) fn acquire(&self, work: Arc<dyn Work>, callback: Option<Callback>) -> Task {
        let recycled = self.free.lock().pop();
        let item = match recycled {
            Some(index) => Arc::clone(&self.slots.read()[index as usize]),
            None => {
                let mut slots = self.slots.write();
                let item = Arc::new(WorkItem::new(slots.len() as u32));
                slots.push(Arc::clone(&item));
                item
            }
        };
        item.prepare(work, callback)
    }

    pub(crate) fn get(&self, task: Task) -> Option<Arc<WorkItem>> {
        self.slots.read().get(task.index() as usize).cloned()
    }

    fn release(&self, index: u32) {
        self.free.lock().push(index);
    }

    fn await_callback(&self, task: Task) {
        self.awaiting_callbacks.lock().push(task);
    }

    /// Moves every task awaiting its completion callback into `buffer`.
    pub(crate) fn drain_awaiting_callbacks(&self, buffer: &mut Vec<Task>) {
        buffer.append(&mut self.awaiting_callbacks.lock());
    }

    /// Runs the callback of a drained task and recycles its slot afterwards.
    /// Returns the callback's panic payload, if it panicked.
    pub(crate) fn dispatch_callback(&self, task: Task) -> Option<WorkFailure> {
        let item = self.get(task)?;
        let failure = item.take_callback(task.generation()).and_then(|callback| {
            panic::catch_unwind(AssertUnwindSafe(callback))
                .err()
                .map(WorkFailure::from_panic)
        });
        item.recycle_after_callback(task.generation());
        failure
    }

    /// Slots ever created; stays flat when items are being reused.
    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    #[cfg(test)]
    fn parked_outcomes(&self) -> usize {
        self.slots
            .read()
            .iter()
            .map(|slot| slot.state.lock().outcomes.len())
            .sum()
    }
}

thread_local! {
    static CURRENT_TASK: Cell<Option<Task>> = const { Cell::new(None) };
}

/// The task whose `do_work` is running on this thread, if any.
pub(crate) struct CurrentTask {
    previous: Option<Task>,
}

impl CurrentTask {
    fn enter(task: Task) -> Self {
        Self {
            previous: CURRENT_TASK.with(|current| current.replace(Some(task))),
        }
    }

    pub(crate) fn get() -> Option<Task> {
        CURRENT_TASK.with(Cell::get)
    }
}

impl Drop for CurrentTask {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| current.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The arena is process-wide; these tests follow individual slots through reuse.
    static SERIAL: Mutex<()> = parking_lot::const_mutex(());

    struct Noop;

    impl Work for Noop {
        fn options(&self) -> WorkOptions {
            WorkOptions::default()
        }

        fn do_work(&self) {}
    }

    struct Failing(&'static str);

    impl Work for Failing {
        fn options(&self) -> WorkOptions {
            WorkOptions::default()
        }

        fn do_work(&self) {
            panic!("{}", self.0);
        }
    }

    fn run(work: impl Work) -> Task {
        let task = arena().acquire(Arc::new(work), None);
        task.execute();
        task
    }

    /// Acquires until the arena hands out `index` again; the extra tasks are returned too.
    fn reacquire(index: u32) -> (Task, Vec<Task>) {
        let mut held = Vec::new();
        loop {
            let task = arena().acquire(Arc::new(Noop), None);
            if task.index() == index {
                return (task, held);
            }
            held.push(task);
            assert!(held.len() < 1_000, "slot {index} was never handed out again");
        }
    }

    #[test]
    fn stale_handle_keeps_its_own_outcome() {
        let _serial = SERIAL.lock();
        let stale = run(Failing("stale failure"));
        assert!(stale.is_complete());

        let (reused, held) = reacquire(stale.index());
        assert_ne!(reused.generation(), stale.generation());
        assert!(!reused.is_complete(), "the newer submission has not run yet");
        assert!(stale.is_complete(), "a reused slot never makes an old handle pending");

        let err = stale.wait().unwrap_err();
        assert_eq!(err.failures(), &[WorkFailure::new("stale failure")]);
        assert!(stale.wait().is_ok());

        reused.execute();
        assert!(reused.is_complete());
        assert!(reused.wait().is_ok(), "the newer submission never sees the old failure");
        for task in held {
            task.execute();
        }
    }

    #[test]
    fn slots_are_reused() {
        let _serial = SERIAL.lock();
        run(Noop);
        let before = arena().capacity();
        for _ in 0..1_000 {
            let task = run(Noop);
            assert!(task.is_complete());
        }
        assert!(arena().capacity() <= before + 16);
    }

    #[test]
    fn unobserved_failures_are_dropped_after_the_window() {
        let _serial = SERIAL.lock();
        let forgotten = run(Failing("never observed"));
        for _ in 0..200 {
            run(Failing("fire and forget"));
        }

        let bound = arena().capacity() * (OUTCOME_WINDOW as usize + 1);
        assert!(arena().parked_outcomes() <= bound);

        // Sequential runs keep cycling through the freed slots.
        let mut passed = false;
        for _ in 0..100_000 {
            let task = run(Noop);
            if task.index() == forgotten.index()
                && task.generation().wrapping_sub(forgotten.generation()) > OUTCOME_WINDOW
            {
                passed = true;
                break;
            }
        }
        assert!(passed, "slot {} was not reused", forgotten.index());
        assert!(forgotten.wait().is_ok());
    }
}
