//! A three-stage demo pipeline: read lines from a file, count words per
//! line, print `"{line_number}: {word_count}"` for each.

use std::fs;
use std::path::Path;

use dagflow_core::{Chunk, ChunkIndex, DataType, Generator, GeneratorKind, TaskBody, TaskOutput};
use rustc_hash::FxHashMap;

pub const LINES: &str = "lines";
pub const WORD_COUNTS: &str = "word_counts";

/// Reads every line of a file up front and hands them out one chunk at a
/// time. Runs on the I/O pool: a larger input would stream from the file
/// handle instead of loading it all into memory, but the admission
/// contract is the same either way.
pub struct LineSource {
    dtype: DataType,
    lines: Vec<String>,
    next: usize,
}

impl LineSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(Self {
            dtype: DataType::from(LINES),
            lines: contents.lines().map(str::to_string).collect(),
            next: 0,
        })
    }
}

impl Generator for LineSource {
    type Payload = String;

    fn produces(&self) -> &[DataType] {
        std::slice::from_ref(&self.dtype)
    }

    fn consumes(&self) -> &[DataType] {
        &[]
    }

    fn kind(&self) -> GeneratorKind {
        GeneratorKind::Source
    }

    fn pool(&self) -> dagflow_core::PoolKind {
        dagflow_core::PoolKind::Io
    }

    fn next_chunk_index(&self) -> ChunkIndex {
        self.next as ChunkIndex
    }

    fn wants(&self) -> &[(DataType, ChunkIndex)] {
        &[]
    }

    fn external_inputs_exhausted(&self) -> bool {
        self.next >= self.lines.len()
    }

    fn deliver_inline(
        &mut self,
        _chunk_index: ChunkIndex,
        _inputs: FxHashMap<DataType, Chunk<String>>,
    ) -> TaskBody<String> {
        let dtype = self.dtype.clone();
        let line = self.lines[self.next].clone();
        self.next += 1;
        Box::new(move || {
            let mut out = FxHashMap::default();
            out.insert(dtype, line);
            Ok(TaskOutput::Produced(out))
        })
    }

    fn refresh_wants(&mut self) {}
}

/// Counts whitespace-separated words in each line.
pub struct WordCount {
    input: DataType,
    output: DataType,
    next: ChunkIndex,
    wants: Vec<(DataType, ChunkIndex)>,
}

impl WordCount {
    pub fn new() -> Self {
        let input = DataType::from(LINES);
        Self {
            wants: vec![(input.clone(), 0)],
            input,
            output: DataType::from(WORD_COUNTS),
            next: 0,
        }
    }
}

impl Generator for WordCount {
    type Payload = String;

    fn produces(&self) -> &[DataType] {
        std::slice::from_ref(&self.output)
    }

    fn consumes(&self) -> &[DataType] {
        std::slice::from_ref(&self.input)
    }

    fn kind(&self) -> GeneratorKind {
        GeneratorKind::Transform
    }

    fn parallel(&self) -> bool {
        true
    }

    fn next_chunk_index(&self) -> ChunkIndex {
        self.next
    }

    fn wants(&self) -> &[(DataType, ChunkIndex)] {
        &self.wants
    }

    fn deliver_inline(
        &mut self,
        _chunk_index: ChunkIndex,
        inputs: FxHashMap<DataType, Chunk<String>>,
    ) -> TaskBody<String> {
        let line = inputs
            .get(&self.input)
            .expect("admitted input must be present")
            .clone();
        let output = self.output.clone();
        self.next += 1;
        Box::new(move || {
            let count = line.split_whitespace().count();
            let mut out = FxHashMap::default();
            out.insert(output, count.to_string());
            Ok(TaskOutput::Produced(out))
        })
    }

    fn refresh_wants(&mut self) {
        self.wants = vec![(self.input.clone(), self.next)];
    }
}

impl Default for WordCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Relays each `"{line_number}: {word_count}"` string to the caller.
pub struct Printer {
    input: DataType,
    next: ChunkIndex,
    wants: Vec<(DataType, ChunkIndex)>,
}

impl Printer {
    pub fn new() -> Self {
        let input = DataType::from(WORD_COUNTS);
        Self {
            wants: vec![(input.clone(), 0)],
            input,
            next: 0,
        }
    }
}

impl Generator for Printer {
    type Payload = String;

    fn produces(&self) -> &[DataType] {
        &[]
    }

    fn consumes(&self) -> &[DataType] {
        std::slice::from_ref(&self.input)
    }

    fn kind(&self) -> GeneratorKind {
        GeneratorKind::Sink
    }

    fn next_chunk_index(&self) -> ChunkIndex {
        self.next
    }

    fn wants(&self) -> &[(DataType, ChunkIndex)] {
        &self.wants
    }

    fn deliver_inline(
        &mut self,
        chunk_index: ChunkIndex,
        inputs: FxHashMap<DataType, Chunk<String>>,
    ) -> TaskBody<String> {
        let count = inputs
            .get(&self.input)
            .expect("admitted input must be present")
            .clone();
        self.next += 1;
        Box::new(move || Ok(TaskOutput::Emitted(format!("{chunk_index}: {count}"))))
    }

    fn refresh_wants(&mut self) {
        self.wants = vec![(self.input.clone(), self.next)];
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}
