//! The generator contract: the trait an implementer fills in to add a node
//! to the dataflow graph.

use rustc_hash::FxHashMap;

use crate::error::{SchedulerError, TaskError};
use crate::types::{Chunk, ChunkIndex, DataType, GeneratorKind, InputDelivery, PoolKind};

/// Index of a generator within a [`crate::Scheduler`]'s flat, owned
/// collection. Assigned at construction in the order generators are handed
/// to `Scheduler::new` and stable for the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct GeneratorId(pub(crate) usize);

/// What a task body hands back to the scheduler on completion.
pub enum TaskOutput<P> {
    /// One payload per produced datatype, to be stored in the Chunk Store.
    Produced(FxHashMap<DataType, P>),
    /// A single payload relayed directly to the caller. Only valid for
    /// tasks whose generator runs on [`PoolKind::Caller`].
    Emitted(P),
}

/// A task body: the unit of work a pool (or the caller, for sink tasks)
/// executes. Built by a generator, run later, possibly on another thread.
pub type TaskBody<P> = Box<dyn FnOnce() -> Result<TaskOutput<P>, TaskError> + Send>;

/// A node in the dataflow graph.
///
/// Implementors own their own progress state (how many chunks they've
/// produced, what they're waiting on next); the scheduler only owns the
/// bookkeeping needed to schedule them fairly — finished/blocked flags,
/// topological depth, and priority.
pub trait Generator: Send {
    /// The payload type flowing through the whole graph this generator is
    /// part of. Every generator wired into the same [`crate::Scheduler`]
    /// shares one `Payload` type.
    type Payload: Send + Sync + 'static;

    /// Datatypes this generator emits into the Chunk Store. Empty for sinks.
    fn produces(&self) -> &[DataType];

    /// Datatypes this generator consumes. Empty for sources.
    fn consumes(&self) -> &[DataType];

    fn kind(&self) -> GeneratorKind;

    /// Whether more than one task for this generator may be in flight at
    /// once. Non-parallel generators are throttled so their Nth task isn't
    /// submitted until the (N-1)th has landed.
    fn parallel(&self) -> bool {
        false
    }

    /// Inline delivery hands inputs to [`Generator::deliver_inline`] at task
    /// construction time; staged delivery hands them to
    /// [`Generator::receive_staged`] as they arrive and defers body
    /// construction to [`Generator::build_staged_body`]. Parallel generators
    /// must use inline delivery.
    fn input_delivery(&self) -> InputDelivery {
        InputDelivery::Inline
    }

    fn pool(&self) -> PoolKind {
        match self.kind() {
            GeneratorKind::Sink => PoolKind::Caller,
            _ => PoolKind::Cpu,
        }
    }

    /// Lower runs first during admission. Defaults to sinks before sources
    /// before transforms, which keeps the caller-facing stream flowing and
    /// lets transforms drain before new source data is admitted.
    fn priority(&self) -> i32 {
        match self.kind() {
            GeneratorKind::Sink => 0,
            GeneratorKind::Source => 1,
            GeneratorKind::Transform => 2,
        }
    }

    /// Whether this generator has a distinct final task, run once all its
    /// inputs are exhausted, in addition to its regular per-chunk tasks
    /// (e.g. to flush a trailing aggregate). Sources never have one.
    fn has_final_task(&self) -> bool {
        false
    }

    /// Index of the next chunk this generator will produce. Implementors
    /// increment their own counter inside `deliver_inline` /
    /// `build_staged_body`; the scheduler only reads this to label a task
    /// before handing inputs over.
    fn next_chunk_index(&self) -> ChunkIndex;

    /// `(datatype, chunk_index)` pairs this generator needs before it can
    /// build its next task. Re-derived by [`Generator::refresh_wants`] after
    /// each task is constructed.
    fn wants(&self) -> &[(DataType, ChunkIndex)];

    /// Sources only: whether the external feed (file, socket, generator
    /// function) has signaled there is nothing left to read, ever.
    fn external_inputs_exhausted(&self) -> bool {
        false
    }

    /// Sources only: whether the external feed currently has data ready
    /// without blocking. Returning `false` tells the scheduler to defer
    /// this source and, if nothing else is runnable, sleep and retry.
    fn external_input_ready(&self) -> bool {
        true
    }

    /// Build the task body for inline delivery. `inputs` is empty for
    /// sources. Must advance this generator's own chunk-index counter.
    fn deliver_inline(
        &mut self,
        chunk_index: ChunkIndex,
        inputs: FxHashMap<DataType, Chunk<Self::Payload>>,
    ) -> TaskBody<Self::Payload>;

    /// Staged delivery only: record inputs for `chunk_index` as they arrive.
    fn receive_staged(
        &mut self,
        chunk_index: ChunkIndex,
        inputs: FxHashMap<DataType, Chunk<Self::Payload>>,
    ) {
        let _ = (chunk_index, inputs);
    }

    /// Staged delivery only: build the task body using previously staged
    /// inputs. Must advance this generator's own chunk-index counter.
    fn build_staged_body(&mut self, chunk_index: ChunkIndex) -> TaskBody<Self::Payload> {
        let _ = chunk_index;
        unimplemented!("generators using staged input delivery must override build_staged_body")
    }

    /// Called once, when every consumed datatype is exhausted, for
    /// generators with [`Generator::has_final_task`] returning `true`.
    fn build_final_body(&mut self) -> TaskBody<Self::Payload> {
        unimplemented!("generators with has_final_task must override build_final_body")
    }

    /// Recompute `wants()` after a task has been built for this generator.
    fn refresh_wants(&mut self);

    /// Notified once, when the scheduler is shutting down due to a failure
    /// anywhere in the graph, before any cleanup runs.
    fn on_exception(&mut self, error: &SchedulerError) {
        let _ = error;
    }
}
