use super::errors::{SpawnError, TaskError};

pub type SpawnResult<T> = Result<T, SpawnError>;

pub type TaskResult<T> = Result<T, TaskError>;
