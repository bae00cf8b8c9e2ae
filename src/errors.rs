use std::any::Any;
use thiserror::Error;

/// Rejected submission. Nothing has been scheduled when this is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("max_threads must be at least 1, got {0}")]
    InvalidMaxThreads(usize),
    #[error("failed to launch background thread: {0}")]
    BackgroundLaunch(String),
}

/// One failure raised by one participant while executing a work object.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WorkFailure {
    message: String,
}

impl WorkFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_string(),
                Err(_) => "work panicked with a non-string payload".to_string(),
            },
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Aggregate failure surfaced by `Task::wait`, `Future::value` and the blocking combinators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{} failure(s) while executing a task: {}", .0.len(), join_messages(.0))]
    Failed(Vec<WorkFailure>),
}

impl TaskError {
    pub fn failures(&self) -> &[WorkFailure] {
        match self {
            TaskError::Failed(failures) => failures,
        }
    }

    pub fn into_failures(self) -> Vec<WorkFailure> {
        match self {
            TaskError::Failed(failures) => failures,
        }
    }
}

fn join_messages(failures: &[WorkFailure]) -> String {
    failures
        .iter()
        .map(WorkFailure::message)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker pool needs at least one thread")]
    NoThreads,
    #[error("processor affinity must contain at least one value")]
    EmptyAffinity,
    #[error("processor {id} does not exist, only {available} are available")]
    InvalidProcessor { id: usize, available: usize },
    #[error("runtime already started, configuration must be set before first use")]
    AlreadyStarted,
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("run_callbacks is not re-entrant")]
    Reentered,
}

/// Error type of the blocking combinators, which can fail at submission or at completion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParallelError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Task(#[from] TaskError),
}
