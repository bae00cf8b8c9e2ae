//! Work-stealing task runtime for short-lived units of work
//!
//! # Features
//! - Fixed pool of worker threads with local queues, a shared FIFO queue and stealing
//! - Replicable work: one task joined by every idle worker, partitioned by the work itself
//! - Parallel `for_range` / `for_each` loops, fork-join and futures
//! - Blocking waits that keep running queued work when called from a worker
//! - Panics captured per participant and reported together on wait
//! - Completion callbacks drained on a thread of your choice
//! - Pooled work items behind generation-checked `Task` handles

mod background;
pub mod errors;
pub mod future;
pub mod handle;
mod item;
mod loops;
pub mod model;
pub mod object_pool;
pub mod parallel;
pub mod pool;
pub mod result;
pub mod work;
mod worker;

pub use errors::{CallbackError, ConfigError, ParallelError, SpawnError, TaskError, WorkFailure};
pub use future::Future;
pub use handle::{Completion, Task};
pub use item::Callback;
pub use loops::DEFAULT_STRIDE;
pub use parallel::{
    configure, for_each, for_range, for_range_with_stride, join, join_all, join_all_work,
    join_work, run_callbacks, start, start_background, start_background_with_callback,
    start_background_work, start_future, start_future_with_callback, start_future_with_options,
    start_future_with_options_and_callback, start_with_callback, start_with_options,
    start_with_options_and_callback, start_work, Action, Parallel,
};
pub use pool::{Config, Scheduler, WorkStealingScheduler};
pub use work::{Work, WorkOptions, UNBOUNDED};
pub use worker::current_worker_index;
