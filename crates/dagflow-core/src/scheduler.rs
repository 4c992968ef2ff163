//! The admission loop: decides, each pass, which generator runs next, and
//! drives task bodies to completion via the CPU and I/O pools.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashMap;

use crate::chunk_store::ChunkStores;
use crate::error::{SchedulerError, TopologyError};
use crate::generator::{Generator, GeneratorId, TaskBody, TaskOutput};
use crate::memory::MemoryProbe;
use crate::pool::{Poll, TaskHandle, ThreadPool, panic_message, wait_any};
use crate::types::{ChunkIndex, DataType, GeneratorKind, InputDelivery, PoolKind};

/// Tuning knobs for a [`Scheduler`]. Mirrors `dagflow_config::SchedulerSettings`
/// field-for-field so a demo binary can build one straight from a loaded config.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker thread count for each of the CPU and I/O pools.
    pub max_workers: usize,
    /// RSS threshold above which source admission is suppressed while any
    /// task is pending.
    pub memory_threshold_mb: u64,
    /// How long `wait_any` blocks on a pending completion before the
    /// admission loop re-checks everything.
    pub completion_timeout: Duration,
    /// How long the scheduler sleeps when only external-wait sources remain
    /// runnable and nothing else is pending.
    pub external_wait_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            memory_threshold_mb: 1000,
            completion_timeout: Duration::from_secs(5),
            external_wait_interval: Duration::from_secs(5),
        }
    }
}

struct GeneratorSlot<P: Send + Sync + 'static> {
    inner: Box<dyn Generator<Payload = P>>,
    produces: Vec<DataType>,
    consumes: Vec<DataType>,
    kind: GeneratorKind,
    parallel: bool,
    input_delivery: InputDelivery,
    priority: i32,
    depth: usize,
    pool: PoolKind,
    has_final_task: bool,
    label: DataType,
    blocked_until_chunk: Option<ChunkIndex>,
    final_dispatched: bool,
    finished: bool,
}

struct PendingTask<P> {
    generator: GeneratorId,
    chunk_index: ChunkIndex,
    is_final: bool,
    label: DataType,
    handle: TaskHandle<P>,
}

enum AdmitOutcome<P> {
    Task(BuiltTask<P>),
    Sleep,
    None,
}

struct BuiltTask<P> {
    generator: GeneratorId,
    chunk_index: ChunkIndex,
    is_final: bool,
    pool: PoolKind,
    label: DataType,
    body: TaskBody<P>,
}

/// Owns the full generator set, the shared chunk cache, and the two worker
/// pools. Construct with [`Scheduler::new`], drive with [`Scheduler::run`].
pub struct Scheduler<P: Send + Sync + 'static> {
    slots: Vec<GeneratorSlot<P>>,
    order: Vec<usize>,
    stores: ChunkStores<P>,
    cpu_pool: ThreadPool<P>,
    io_pool: ThreadPool<P>,
    pending: Vec<PendingTask<P>>,
    config: SchedulerConfig,
    memory: MemoryProbe,
    rng: rand::rngs::ThreadRng,
    shutting_down: bool,
}

impl<P: Send + Sync + 'static> Scheduler<P> {
    pub fn new(
        generators: Vec<Box<dyn Generator<Payload = P>>>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let mut slots: Vec<GeneratorSlot<P>> = generators
            .into_iter()
            .map(|g| {
                let produces = g.produces().to_vec();
                let consumes = g.consumes().to_vec();
                let kind = g.kind();
                let parallel = g.parallel();
                let input_delivery = g.input_delivery();
                let priority = g.priority();
                let pool = g.pool();
                let has_final_task = g.has_final_task();
                let label = produces
                    .first()
                    .or_else(|| consumes.first())
                    .cloned()
                    .unwrap_or_else(|| DataType::from("<generator>"));
                GeneratorSlot {
                    inner: g,
                    produces,
                    consumes,
                    kind,
                    parallel,
                    input_delivery,
                    priority,
                    depth: usize::MAX / 2,
                    pool,
                    has_final_task,
                    label,
                    blocked_until_chunk: None,
                    final_dispatched: false,
                    finished: false,
                }
            })
            .collect();

        for slot in &slots {
            if slot.parallel && slot.input_delivery == InputDelivery::Staged {
                let dtype = slot
                    .consumes
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DataType::from("<unknown>"));
                return Err(SchedulerError::Topology(TopologyError::ParallelRequiresInline(
                    dtype,
                )));
            }
        }

        let stores = ChunkStores::build(slots.iter().enumerate().map(|(i, s)| {
            (GeneratorId(i), s.produces.as_slice(), s.consumes.as_slice())
        }))?;

        compute_depths(&mut slots, &stores);

        let mut order: Vec<usize> = (0..slots.len()).collect();
        order.sort_by_key(|&i| (slots[i].priority, slots[i].depth));

        Ok(Self {
            slots,
            order,
            stores,
            cpu_pool: ThreadPool::new("dagflow-cpu", config.max_workers),
            io_pool: ThreadPool::new("dagflow-io", config.max_workers),
            pending: Vec::new(),
            memory: MemoryProbe::new(),
            rng: rand::rng(),
            shutting_down: false,
            config,
        })
    }

    /// Drives the graph to completion, yielding each payload a sink relays
    /// to the caller in the order it's produced.
    pub fn run(&mut self) -> SchedulerRun<'_, P> {
        SchedulerRun { scheduler: self }
    }

    fn next_item(&mut self) -> Option<Result<P, SchedulerError>> {
        if self.shutting_down {
            return None;
        }

        loop {
            if let Err(e) = self.drain_completions() {
                self.begin_shutdown(&e);
                return Some(Err(e));
            }

            match self.admit_once() {
                Ok(AdmitOutcome::Task(task)) => match self.dispatch(task) {
                    Ok(Some(payload)) => return Some(Ok(payload)),
                    Ok(None) => {
                        if self.pending.len() < self.config.max_workers {
                            continue;
                        }
                    }
                    Err(e) => {
                        self.begin_shutdown(&e);
                        return Some(Err(e));
                    }
                },
                Ok(AdmitOutcome::Sleep) => {
                    std::thread::sleep(self.config.external_wait_interval);
                    continue;
                }
                Ok(AdmitOutcome::None) => {}
                Err(e) => {
                    self.begin_shutdown(&e);
                    return Some(Err(e));
                }
            }

            if self.pending.is_empty() {
                if self.all_exhausted() {
                    self.cpu_pool.shutdown();
                    self.io_pool.shutdown();
                    return None;
                }
                let unfinished: Vec<_> = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.finished)
                    .map(|(i, s)| format!("{}#{i}", s.label))
                    .collect();
                let err = SchedulerError::Invariant(format!(
                    "admission produced nothing, nothing pending, but not exhausted: {unfinished:?}"
                ));
                self.begin_shutdown(&err);
                return Some(Err(err));
            }

            self.wait_for_completion();
        }
    }

    fn begin_shutdown(&mut self, error: &SchedulerError) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        for slot in &mut self.slots {
            if slot.finished {
                continue;
            }
            let inner = &mut slot.inner;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| inner.on_exception(error)));
            if let Err(payload) = outcome {
                tracing::error!(
                    error = %error,
                    panic = %panic_message(payload),
                    "generator panicked in on_exception, cleanup swallowed"
                );
            }
        }
        tracing::error!(error = %error, "scheduler shutting down on failure");
        self.cpu_pool.shutdown();
        self.io_pool.shutdown();
    }

    fn all_exhausted(&self) -> bool {
        self.slots.iter().all(|s| s.finished) && self.stores.all_drained()
    }

    fn wait_for_completion(&mut self) {
        let handles: Vec<&TaskHandle<P>> = self.pending.iter().map(|p| &p.handle).collect();
        wait_any(&handles, self.config.completion_timeout);
    }

    fn drain_completions(&mut self) -> Result<(), SchedulerError> {
        let pending = std::mem::take(&mut self.pending);
        let mut still_pending = Vec::with_capacity(pending.len());
        let mut error = None;

        for pt in pending {
            if error.is_some() {
                still_pending.push(pt);
                continue;
            }
            match pt.handle.poll() {
                Poll::Pending => still_pending.push(pt),
                Poll::Ready(result) => {
                    if pt.is_final {
                        self.slots[pt.generator.0].finished = true;
                        for dtype in self.slots[pt.generator.0].produces.clone() {
                            self.stores.set_source_exhausted(&dtype);
                        }
                    }
                    match result {
                        Err(e) => {
                            error = Some(SchedulerError::TaskFailure {
                                datatype: pt.label.clone(),
                                chunk_index: pt.chunk_index,
                                source: e,
                            });
                        }
                        Ok(TaskOutput::Produced(map)) => {
                            for (dtype, payload) in map {
                                self.stores.put(&dtype, pt.chunk_index, Arc::new(payload));
                            }
                            let slot = &mut self.slots[pt.generator.0];
                            if slot.blocked_until_chunk == Some(pt.chunk_index) {
                                slot.blocked_until_chunk = None;
                            }
                        }
                        Ok(TaskOutput::Emitted(_)) => {
                            error = Some(SchedulerError::TaskFailure {
                                datatype: pt.label.clone(),
                                chunk_index: pt.chunk_index,
                                source: crate::error::TaskError::Contract(
                                    "pool-dispatched task emitted a value instead of producing chunks"
                                        .to_string(),
                                ),
                            });
                        }
                    }
                }
            }
        }

        self.pending = still_pending;
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One pass over every generator in schedule order. Returns the first
    /// runnable task, a request to sleep and retry (every runnable
    /// generator is waiting on an external condition and nothing is
    /// pending), or nothing.
    fn admit_once(&mut self) -> Result<AdmitOutcome<P>, SchedulerError> {
        let mut external_waits = Vec::new();
        let mut sources = Vec::new();
        let mut requests_for: FxHashMap<DataType, usize> = FxHashMap::default();

        for &idx in &self.order.clone() {
            let gid = GeneratorId(idx);
            if self.slots[idx].finished {
                continue;
            }

            if !self.slots[idx].inner.external_input_ready() {
                external_waits.push(idx);
                continue;
            }

            if let Some(blocked) = self.slots[idx].blocked_until_chunk {
                let still_blocked = !self.slots[idx]
                    .produces
                    .iter()
                    .all(|dt| self.stores.has(dt, blocked));
                if still_blocked {
                    continue;
                }
            }

            if self.slots[idx].kind == GeneratorKind::Source {
                if self.slots[idx].inner.external_inputs_exhausted() {
                    self.slots[idx].finished = true;
                    for dtype in self.slots[idx].produces.clone() {
                        self.stores.set_source_exhausted(&dtype);
                    }
                    continue;
                }
                sources.push(idx);
                continue;
            }

            let consumes = self.slots[idx].consumes.clone();
            let all_exhausted = consumes
                .iter()
                .all(|dt| self.stores.input_exhausted_for(dt, gid));

            if all_exhausted {
                if self.slots[idx].has_final_task {
                    if self.slots[idx].final_dispatched {
                        continue;
                    }
                    self.slots[idx].final_dispatched = true;
                    return self.build_final_task(gid).map(AdmitOutcome::Task);
                }
                self.slots[idx].finished = true;
                for dtype in self.slots[idx].produces.clone() {
                    self.stores.set_source_exhausted(&dtype);
                }
                continue;
            }

            let wants: Vec<(DataType, ChunkIndex)> = self.slots[idx].inner.wants().to_vec();
            let mut missing = false;
            for (dt, chunk_i) in &wants {
                if !self.stores.has(dt, *chunk_i) {
                    *requests_for.entry(dt.clone()).or_insert(0) += 1;
                    missing = true;
                }
            }
            if missing {
                continue;
            }

            return self.build_consumer_task(gid, &wants).map(AdmitOutcome::Task);
        }

        if !sources.is_empty() {
            let rss = self.memory.rss_bytes();
            let threshold = self.config.memory_threshold_mb * 1_000_000;
            if rss > threshold && !self.pending.is_empty() {
                return Ok(AdmitOutcome::None);
            }

            let mut best: Option<(usize, f64)> = None;
            for idx in sources {
                let score: usize = self.slots[idx]
                    .produces
                    .iter()
                    .map(|dt| requests_for.get(dt).copied().unwrap_or(0))
                    .sum();
                let jitter: f64 = self.rng.random_range(0.0..1.0);
                let weighted = score as f64 + jitter;
                if best.is_none_or(|(_, w)| weighted > w) {
                    best = Some((idx, weighted));
                }
            }
            let idx = best.expect("sources is non-empty").0;
            return self.build_source_task(GeneratorId(idx)).map(AdmitOutcome::Task);
        }

        if !external_waits.is_empty() {
            if !self.pending.is_empty() {
                return Ok(AdmitOutcome::None);
            }
            tracing::info!(waiting = ?external_waits, "waiting on external input readiness");
            return Ok(AdmitOutcome::Sleep);
        }

        Ok(AdmitOutcome::None)
    }

    fn build_source_task(&mut self, gid: GeneratorId) -> Result<BuiltTask<P>, SchedulerError> {
        let slot = &mut self.slots[gid.0];
        let chunk_index = slot.inner.next_chunk_index();
        let body = slot.inner.deliver_inline(chunk_index, FxHashMap::default());
        slot.inner.refresh_wants();
        Ok(BuiltTask {
            generator: gid,
            chunk_index,
            is_final: false,
            pool: slot.pool,
            label: slot.label.clone(),
            body,
        })
    }

    fn build_consumer_task(
        &mut self,
        gid: GeneratorId,
        wants: &[(DataType, ChunkIndex)],
    ) -> Result<BuiltTask<P>, SchedulerError> {
        let mut inputs = FxHashMap::default();
        for (dtype, chunk_i) in wants {
            let chunk = self
                .stores
                .get(dtype, *chunk_i)
                .expect("admitted wants must already be present in the store");
            inputs.insert(dtype.clone(), chunk);
            self.stores.mark_seen(dtype, gid, *chunk_i);
        }
        for (dtype, _) in wants {
            self.stores.gc(dtype);
        }

        let slot = &mut self.slots[gid.0];
        let chunk_index = slot.inner.next_chunk_index();
        let body = match slot.input_delivery {
            InputDelivery::Inline => slot.inner.deliver_inline(chunk_index, inputs),
            InputDelivery::Staged => {
                slot.inner.receive_staged(chunk_index, inputs);
                slot.inner.build_staged_body(chunk_index)
            }
        };
        slot.inner.refresh_wants();

        Ok(BuiltTask {
            generator: gid,
            chunk_index,
            is_final: false,
            pool: slot.pool,
            label: slot.label.clone(),
            body,
        })
    }

    fn build_final_task(&mut self, gid: GeneratorId) -> Result<BuiltTask<P>, SchedulerError> {
        let slot = &mut self.slots[gid.0];
        let chunk_index = slot.inner.next_chunk_index();
        let body = slot.inner.build_final_body();
        Ok(BuiltTask {
            generator: gid,
            chunk_index,
            is_final: true,
            pool: slot.pool,
            label: slot.label.clone(),
            body,
        })
    }

    fn dispatch(&mut self, task: BuiltTask<P>) -> Result<Option<P>, SchedulerError> {
        let BuiltTask {
            generator,
            chunk_index,
            is_final,
            pool,
            label,
            body,
        } = task;

        if matches!(pool, PoolKind::Caller) {
            let result = body();
            if is_final {
                self.slots[generator.0].finished = true;
                for dtype in self.slots[generator.0].produces.clone() {
                    self.stores.set_source_exhausted(&dtype);
                }
            }
            return match result {
                Ok(TaskOutput::Emitted(payload)) => Ok(Some(payload)),
                Ok(TaskOutput::Produced(map)) => {
                    for (dtype, payload) in map {
                        self.stores.put(&dtype, chunk_index, Arc::new(payload));
                    }
                    Ok(None)
                }
                Err(e) => Err(SchedulerError::TaskFailure {
                    datatype: label,
                    chunk_index,
                    source: e,
                }),
            };
        }

        let handle = match pool {
            PoolKind::Cpu => self.cpu_pool.submit(body),
            PoolKind::Io => self.io_pool.submit(body),
            PoolKind::Caller => unreachable!("handled above"),
        };

        if !self.slots[generator.0].parallel {
            self.slots[generator.0].blocked_until_chunk = Some(chunk_index);
        }

        self.pending.push(PendingTask {
            generator,
            chunk_index,
            is_final,
            label,
            handle,
        });
        Ok(None)
    }
}

fn compute_depths<P: Send + Sync + 'static>(
    slots: &mut [GeneratorSlot<P>],
    stores: &ChunkStores<P>,
) {
    let mut depth = vec![None; slots.len()];
    let mut queue = VecDeque::new();

    for (i, slot) in slots.iter().enumerate() {
        if slot.kind == GeneratorKind::Sink {
            depth[i] = Some(0);
            queue.push_back(i);
        }
    }

    while let Some(gid) = queue.pop_front() {
        let d = depth[gid].expect("queued nodes always have a depth");
        let consumes = slots[gid].consumes.clone();
        for dtype in consumes {
            if let Some(producer) = stores.producer_of(&dtype) {
                let p = producer.0;
                if depth[p].is_none_or(|existing| existing > d + 1) {
                    depth[p] = Some(d + 1);
                    queue.push_back(p);
                }
            }
        }
    }

    for (slot, d) in slots.iter_mut().zip(depth) {
        if let Some(d) = d {
            slot.depth = d;
        }
    }
}

/// Iterator returned by [`Scheduler::run`].
pub struct SchedulerRun<'a, P: Send + Sync + 'static> {
    scheduler: &'a mut Scheduler<P>,
}

impl<'a, P: Send + Sync + 'static> Iterator for SchedulerRun<'a, P> {
    type Item = Result<P, SchedulerError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.scheduler.next_item()
    }
}
