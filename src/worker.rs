use super::{handle::Task, item::WorkItem, pool::Shared};
use crossbeam::{
    deque::{Steal, Worker},
    utils::Backoff,
};
use parking_lot::{Condvar, Mutex};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tracing::{debug, warn};

/// How long a waiting worker parks on the awaited item once it has run out of other work.
const HELP_PARK: Duration = Duration::from_millis(1);

/// Auto-reset event a worker sleeps on while there is nothing to run.
pub(crate) struct Gate {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }
}

/// The worker hosted by the current thread, bound for the duration of its run loop.
pub(crate) struct LocalWorker {
    index: usize,
    shared: Arc<Shared>,
    local: Worker<Task>,
    last_joined: Cell<Option<Task>>,
    rng: Cell<u64>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Rc<LocalWorker>>> = const { RefCell::new(None) };
}

fn current() -> Option<Rc<LocalWorker>> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}

/// Index of the worker running on this thread, `None` outside the pool.
pub fn current_worker_index() -> Option<usize> {
    current().map(|worker| worker.index)
}

/// Pushes onto the calling worker's local queue if it belongs to `shared`.
pub(crate) fn push_local(shared: &Arc<Shared>, task: Task) -> bool {
    match current() {
        Some(worker) if Arc::ptr_eq(&worker.shared, shared) => {
            worker.local.push(task);
            true
        }
        _ => false,
    }
}

/// On a worker thread, runs other work until `item` reaches completion and returns `true`.
/// Returns `false` straight away on any other thread.
pub(crate) fn help_until_complete(item: &WorkItem, generation: u32) -> bool {
    let Some(worker) = current() else {
        return false;
    };
    let backoff = Backoff::new();
    while !item.is_complete(generation) {
        if worker.run_once() {
            backoff.reset();
        } else if backoff.is_completed() {
            item.wait_complete_for(generation, HELP_PARK);
        } else {
            backoff.snooze();
        }
    }
    true
}

pub(crate) fn run(
    index: usize,
    local: Worker<Task>,
    shared: Arc<Shared>,
    processor: Option<usize>,
) {
    if let Some(id) = processor {
        pin_to_processor(index, id);
    }

    let worker = Rc::new(LocalWorker {
        index,
        shared,
        local,
        last_joined: Cell::new(None),
        rng: Cell::new((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
    });
    CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(Rc::clone(&worker)));
    debug!(worker = index, "worker started");

    worker.run_loop();

    CURRENT_WORKER.with(|current| current.borrow_mut().take());
    debug!(worker = index, "worker stopped");
}

fn pin_to_processor(index: usize, id: usize) {
    let core = core_affinity::get_core_ids()
        .and_then(|cores| cores.into_iter().find(|core| core.id == id));
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!(worker = index, processor = id, "worker pinned");
        }
        _ => warn!(worker = index, processor = id, "could not pin worker to processor"),
    }
}

impl LocalWorker {
    fn run_loop(&self) {
        loop {
            if self.run_once() {
                continue;
            }
            if self.shared.is_shutdown() {
                break;
            }
            if self.spin_for_work() {
                continue;
            }

            self.shared.idle_workers.fetch_add(1, Ordering::Release);
            self.shared.gates[self.index].wait();
            self.shared.idle_workers.fetch_sub(1, Ordering::Acquire);
        }
    }

    /// Runs one unit of work from the cheapest source that has any.
    fn run_once(&self) -> bool {
        if let Some(task) = self.local.pop() {
            self.run_task(task);
            return true;
        }

        if let Some(task) = self.joinable() {
            self.shared.joined.fetch_add(1, Ordering::Relaxed);
            self.run_task(task);
            return true;
        }

        if let Some(task) = self.shared.try_take_global() {
            self.run_task(task);
            return true;
        }

        if let Some(task) = self.steal() {
            self.shared.stolen.fetch_add(1, Ordering::Relaxed);
            self.run_task(task);
            return true;
        }

        false
    }

    fn run_task(&self, task: Task) {
        if task.options().is_some_and(|options| options.is_replicable()) {
            self.last_joined.set(Some(task));
        }
        task.execute();
        self.shared.executed.fetch_add(1, Ordering::Relaxed);
        self.shared.retire_replicable(task);
    }

    /// The published replicable task, unless this worker already took its share.
    fn joinable(&self) -> Option<Task> {
        let task = self.shared.published_replicable()?;
        if self.last_joined.get() == Some(task) {
            return None;
        }
        if task.is_complete() {
            self.shared.retire_replicable(task);
            return None;
        }
        Some(task)
    }

    fn steal(&self) -> Option<Task> {
        let stealers = &self.shared.stealers;
        let count = stealers.len();
        if count < 2 {
            return None;
        }

        let start = self.next_random() as usize % count;
        (0..count)
            .map(|offset| (start + offset) % count)
            .filter(|&victim| victim != self.index)
            .find_map(|victim| loop {
                match stealers[victim].steal() {
                    Steal::Success(task) => break Some(task),
                    Steal::Empty => break None,
                    Steal::Retry => continue,
                }
            })
    }

    fn spin_for_work(&self) -> bool {
        for _ in 0..2 {
            if !self.local.is_empty()
                || self.shared.has_global_hint()
                || self.joinable().is_some()
            {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    #[inline]
    fn next_random(&self) -> u64 {
        let mut state = self.rng.get();
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng.set(state);
        state
    }
}
