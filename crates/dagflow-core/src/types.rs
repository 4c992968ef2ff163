//! Small value types shared across the scheduler.

use std::fmt;
use std::sync::Arc;

/// Name of a datatype flowing through the graph, e.g. `"frames"` or `"running_sum"`.
///
/// Cheap to clone: backed by an `Arc<str>` rather than a `String`.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DataType(Arc<str>);

impl DataType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        DataType(Arc::from(s))
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        DataType(Arc::from(s.as_str()))
    }
}

/// A chunk's payload as handed to a task: a shared, read-only view of the
/// canonical copy the Chunk Store owns.
pub type Chunk<P> = Arc<P>;

/// Index of a chunk within a datatype's stream. Chunk indices are assigned
/// by the producing generator and are not required to be contiguous, though
/// in practice every generator in this crate produces them densely from 0.
pub type ChunkIndex = u64;

/// Declares how a generator is scheduled relative to the sink.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum GeneratorKind {
    /// Has no `consumes`; pulls data from outside the graph (a file, a
    /// socket, a generator function).
    Source,
    /// Consumes one or more datatypes and produces one or more others.
    Transform,
    /// Consumes but does not produce into the Chunk Store; its task runs on
    /// the caller's pool and its output is the value yielded to the caller.
    Sink,
}

/// Which pool a generator's tasks run on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PoolKind {
    /// CPU-bound work, isolated from the scheduler thread by a worker pool
    /// and a panic boundary.
    Cpu,
    /// I/O-bound work, same isolation as `Cpu` but sized and named
    /// independently so blocking I/O can't starve CPU-bound tasks.
    Io,
    /// Runs inline on the scheduler thread; the task's output is yielded
    /// directly to the caller instead of being stored.
    Caller,
}

/// Whether a generator receives its inputs together with the chunk index
/// it is about to produce (`Inline`), or receives them as they arrive and
/// is asked to build a task body later (`Staged`).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum InputDelivery {
    Inline,
    Staged,
}
