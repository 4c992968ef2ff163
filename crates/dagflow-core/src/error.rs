//! Error types for topology construction, task execution, and scheduling.

use crate::types::{ChunkIndex, DataType};

/// An error raised while constructing a [`crate::Scheduler`] from a set of
/// generators, before any task has run.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("datatype {0:?} is produced by more than one generator")]
    MultipleProducers(DataType),

    #[error("datatype {0:?} is produced but has no registered consumer")]
    DeadOutput(DataType),

    #[error("datatype {0:?} is consumed but produced by no generator")]
    UnregisteredDatatype(DataType),

    #[error("generator consuming {0:?} is parallel but declared staged input delivery")]
    ParallelRequiresInline(DataType),
}

/// An error returned by a task body.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("worker pool shut down before the task completed")]
    WorkerGone,

    #[error("generator violated the task/pool contract: {0}")]
    Contract(String),
}

/// Top-level error surfaced to the caller driving the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task producing {datatype:?}[{chunk_index}] failed: {source}")]
    TaskFailure {
        datatype: DataType,
        chunk_index: ChunkIndex,
        #[source]
        source: TaskError,
    },

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("scheduler invariant violated: {0}")]
    Invariant(String),
}
