//! Shared cache of produced chunks, one per datatype, with per-consumer
//! frontiers and reference-counted garbage collection.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::TopologyError;
use crate::generator::GeneratorId;
use crate::types::{Chunk, ChunkIndex, DataType};

/// Per-datatype storage: the chunks a producer has emitted, which consumers
/// have seen which indices, and whether the producer will ever emit more.
struct Store<P> {
    produced: FxHashMap<ChunkIndex, Chunk<P>>,
    /// Highest index `n` such that every index `0..=n` has been produced.
    /// `-1` means nothing has been produced yet.
    contiguous_frontier: i64,
    consumers: FxHashSet<GeneratorId>,
    seen_by: FxHashMap<GeneratorId, i64>,
    source_exhausted: bool,
}

impl<P> Store<P> {
    fn new() -> Self {
        Self {
            produced: FxHashMap::default(),
            contiguous_frontier: -1,
            consumers: FxHashSet::default(),
            seen_by: FxHashMap::default(),
            source_exhausted: false,
        }
    }

    fn put(&mut self, index: ChunkIndex, chunk: Chunk<P>) {
        self.produced.insert(index, chunk);
        let mut next = self.contiguous_frontier + 1;
        while self.produced.contains_key(&(next as u64)) {
            self.contiguous_frontier = next;
            next += 1;
        }
    }

    fn gc(&mut self) {
        let min_seen = self
            .consumers
            .iter()
            .map(|c| *self.seen_by.get(c).unwrap_or(&-1))
            .min()
            .unwrap_or(-1);
        self.produced.retain(|&idx, _| idx as i64 > min_seen);
    }
}

/// Owns every datatype's [`Store`] and the producer/consumer graph derived
/// from the generator set at construction time.
pub struct ChunkStores<P> {
    stores: FxHashMap<DataType, Store<P>>,
    producer_of: FxHashMap<DataType, GeneratorId>,
}

impl<P> ChunkStores<P> {
    /// Builds the full set of per-datatype stores from a topology description:
    /// for each generator, the datatypes it produces and the datatypes it
    /// consumes. Validates that every produced datatype has exactly one
    /// producer, that every consumed datatype is produced by someone, and
    /// that every produced datatype has at least one consumer.
    pub fn build<'a>(
        generators: impl Iterator<Item = (GeneratorId, &'a [DataType], &'a [DataType])>,
    ) -> Result<Self, TopologyError> {
        let mut stores: FxHashMap<DataType, Store<P>> = FxHashMap::default();
        let mut producer_of: FxHashMap<DataType, GeneratorId> = FxHashMap::default();
        let mut consumers_by_dtype: Vec<(GeneratorId, DataType)> = Vec::new();

        let generators: Vec<_> = generators.collect();

        for &(gid, produces, _) in &generators {
            for dtype in produces {
                if producer_of.insert(dtype.clone(), gid).is_some() {
                    return Err(TopologyError::MultipleProducers(dtype.clone()));
                }
                stores.entry(dtype.clone()).or_insert_with(Store::new);
            }
        }

        for &(gid, _, consumes) in &generators {
            for dtype in consumes {
                if !producer_of.contains_key(dtype) {
                    return Err(TopologyError::UnregisteredDatatype(dtype.clone()));
                }
                consumers_by_dtype.push((gid, dtype.clone()));
            }
        }

        for (gid, dtype) in consumers_by_dtype {
            let store = stores.get_mut(&dtype).expect("registered above");
            store.consumers.insert(gid);
            store.seen_by.insert(gid, -1);
        }

        for dtype in stores.keys() {
            let store = &stores[dtype];
            if store.consumers.is_empty() {
                return Err(TopologyError::DeadOutput(dtype.clone()));
            }
        }

        Ok(Self {
            stores,
            producer_of,
        })
    }

    pub fn put(&mut self, dtype: &DataType, index: ChunkIndex, chunk: Chunk<P>) {
        self.stores
            .get_mut(dtype)
            .expect("put for a datatype with no registered store")
            .put(index, chunk);
    }

    pub fn get(&self, dtype: &DataType, index: ChunkIndex) -> Option<Chunk<P>> {
        self.stores.get(dtype)?.produced.get(&index).cloned()
    }

    pub fn has(&self, dtype: &DataType, index: ChunkIndex) -> bool {
        self.stores
            .get(dtype)
            .is_some_and(|s| s.produced.contains_key(&index))
    }

    pub fn contiguous(&self, dtype: &DataType) -> i64 {
        self.stores.get(dtype).map_or(-1, |s| s.contiguous_frontier)
    }

    pub fn mark_seen(&mut self, dtype: &DataType, consumer: GeneratorId, index: ChunkIndex) {
        let store = self
            .stores
            .get_mut(dtype)
            .expect("mark_seen for a datatype with no registered store");
        let slot = store.seen_by.entry(consumer).or_insert(-1);
        *slot = (*slot).max(index as i64);
    }

    pub fn source_exhausted(&self, dtype: &DataType) -> bool {
        self.stores.get(dtype).is_some_and(|s| s.source_exhausted)
    }

    pub fn set_source_exhausted(&mut self, dtype: &DataType) {
        if let Some(s) = self.stores.get_mut(dtype) {
            s.source_exhausted = true;
        }
    }

    /// True if `consumer` has already seen everything `dtype`'s producer
    /// will ever emit: the producer has declared exhaustion, and the
    /// consumer's own seen-frontier has caught up with the contiguous
    /// frontier (nothing produced is still waiting for this consumer).
    pub fn input_exhausted_for(&self, dtype: &DataType, consumer: GeneratorId) -> bool {
        let Some(store) = self.stores.get(dtype) else {
            return true;
        };
        if !store.source_exhausted {
            return false;
        }
        let seen = *store.seen_by.get(&consumer).unwrap_or(&-1);
        seen >= store.contiguous_frontier
    }

    pub fn gc(&mut self, dtype: &DataType) {
        if let Some(store) = self.stores.get_mut(dtype) {
            store.gc();
        }
    }

    pub fn gc_all(&mut self) {
        for store in self.stores.values_mut() {
            store.gc();
        }
    }

    pub fn all_drained(&self) -> bool {
        self.stores.values().all(|s| s.produced.is_empty())
    }

    pub fn producer_of(&self, dtype: &DataType) -> Option<GeneratorId> {
        self.producer_of.get(dtype).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> Vec<(GeneratorId, Vec<DataType>, Vec<DataType>)> {
        // 0: source producing "raw"; 1: transform "raw" -> "doubled"; 2: sink consuming "doubled"
        vec![
            (GeneratorId(0), vec![DataType::from("raw")], vec![]),
            (
                GeneratorId(1),
                vec![DataType::from("doubled")],
                vec![DataType::from("raw")],
            ),
            (GeneratorId(2), vec![], vec![DataType::from("doubled")]),
        ]
    }

    fn build(topo: &[(GeneratorId, Vec<DataType>, Vec<DataType>)]) -> ChunkStores<u32> {
        ChunkStores::build(
            topo.iter()
                .map(|(g, p, c)| (*g, p.as_slice(), c.as_slice())),
        )
        .unwrap()
    }

    #[test]
    fn put_advances_contiguous_frontier_only_without_gaps() {
        let topo = topology();
        let mut stores: ChunkStores<u32> = build(&topo);
        let raw = DataType::from("raw");

        stores.put(&raw, 0, Arc::new(10));
        assert_eq!(stores.contiguous(&raw), 0);

        stores.put(&raw, 2, Arc::new(12));
        // index 1 missing, frontier doesn't jump
        assert_eq!(stores.contiguous(&raw), 0);

        stores.put(&raw, 1, Arc::new(11));
        assert_eq!(stores.contiguous(&raw), 2);
    }

    #[test]
    fn gc_retains_chunks_until_every_consumer_has_seen_them() {
        let topo = topology();
        let mut stores: ChunkStores<u32> = build(&topo);
        let raw = DataType::from("raw");

        stores.put(&raw, 0, Arc::new(10));
        stores.put(&raw, 1, Arc::new(11));
        stores.mark_seen(&raw, GeneratorId(1), 0);
        stores.gc(&raw);

        assert!(stores.has(&raw, 0), "chunk 0 still needed by no one else, but also not below min_seen");
        assert!(stores.has(&raw, 1));
    }

    #[test]
    fn gc_drops_chunks_once_all_registered_consumers_pass_them() {
        let topo = topology();
        let mut stores: ChunkStores<u32> = build(&topo);
        let raw = DataType::from("raw");

        stores.put(&raw, 0, Arc::new(10));
        stores.mark_seen(&raw, GeneratorId(1), 0);
        stores.gc(&raw);

        assert!(!stores.has(&raw, 0));
    }

    #[test]
    fn multiple_producers_for_same_datatype_is_a_topology_error() {
        let topo = vec![
            (GeneratorId(0), vec![DataType::from("x")], vec![]),
            (GeneratorId(1), vec![DataType::from("x")], vec![]),
        ];
        let result: Result<ChunkStores<u32>, _> = ChunkStores::build(
            topo.iter().map(|(g, p, c)| (*g, p.as_slice(), c.as_slice())),
        );
        assert!(matches!(result, Err(TopologyError::MultipleProducers(_))));
    }

    #[test]
    fn consuming_an_unproduced_datatype_is_a_topology_error() {
        let topo = vec![(GeneratorId(0), vec![], vec![DataType::from("ghost")])];
        let result: Result<ChunkStores<u32>, _> = ChunkStores::build(
            topo.iter().map(|(g, p, c)| (*g, p.as_slice(), c.as_slice())),
        );
        assert!(matches!(result, Err(TopologyError::UnregisteredDatatype(_))));
    }

    #[test]
    fn producing_with_no_consumer_is_a_topology_error() {
        let topo = vec![(GeneratorId(0), vec![DataType::from("orphan")], vec![])];
        let result: Result<ChunkStores<u32>, _> = ChunkStores::build(
            topo.iter().map(|(g, p, c)| (*g, p.as_slice(), c.as_slice())),
        );
        assert!(matches!(result, Err(TopologyError::DeadOutput(_))));
    }

    #[test]
    fn input_exhausted_requires_both_source_exhaustion_and_full_consumption() {
        let topo = topology();
        let mut stores: ChunkStores<u32> = build(&topo);
        let raw = DataType::from("raw");

        assert!(!stores.input_exhausted_for(&raw, GeneratorId(1)));

        stores.put(&raw, 0, Arc::new(10));
        stores.set_source_exhausted(&raw);
        // produced up through 0, but consumer hasn't seen it yet
        assert!(!stores.input_exhausted_for(&raw, GeneratorId(1)));

        stores.mark_seen(&raw, GeneratorId(1), 0);
        assert!(stores.input_exhausted_for(&raw, GeneratorId(1)));
    }
}
