//! One dedicated OS thread per request, for long blocking work that must not occupy a
//! pooled worker.

use super::{errors::SpawnError, handle::Task, result::SpawnResult};
use crossbeam::channel::{self, Sender};
use std::thread;
use tracing::debug;

/// A thread that is already running and will execute the task it is handed.
pub(crate) struct BackgroundSlot {
    sender: Sender<Task>,
}

impl BackgroundSlot {
    /// Starts the thread first, so that a failure leaves no submitted task behind.
    pub(crate) fn launch() -> SpawnResult<Self> {
        let (sender, receiver) = channel::bounded::<Task>(1);
        thread::Builder::new()
            .name("parallel-background".to_string())
            .spawn(move || {
                if let Ok(task) = receiver.recv() {
                    debug!(?task, "background task started");
                    task.execute();
                    debug!(?task, "background task finished");
                }
            })
            .map_err(|e| SpawnError::BackgroundLaunch(e.to_string()))?;
        Ok(Self { sender })
    }

    pub(crate) fn start(self, task: Task) {
        // The receiving thread is alive until it gets a task, so this cannot fail.
        let _ = self.sender.send(task);
    }
}
