//! Chunk-streaming dataflow scheduler.
//!
//! A [`Scheduler`] wires together a set of [`Generator`] implementations
//! into a DAG, admits their tasks onto a CPU pool, an I/O pool, or the
//! caller's own thread, and exposes the whole run as a lazy iterator of
//! results.

mod chunk_store;
mod error;
mod generator;
mod memory;
mod pool;
mod scheduler;
mod types;

pub use error::{SchedulerError, TaskError, TopologyError};
pub use generator::{Generator, GeneratorId, TaskBody, TaskOutput};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerRun};
pub use types::{Chunk, ChunkIndex, DataType, GeneratorKind, InputDelivery, PoolKind};
