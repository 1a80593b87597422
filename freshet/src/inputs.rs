//! Source contracts and the testing adapters built on them.
//!
//! A partitioned source builds one partition per worker and reports an
//! opaque resume token alongside each record; the engine logs the most
//! recent token at every epoch boundary and hands it back on restart. A
//! dynamic source builds stateless partitions with no tokens, so replay
//! depends on the external system.
//!
//! Partitions are polled cooperatively: a partition may report a record, an
//! epoch advance, that nothing is ready, or end-of-stream.

use crate::recovery::ResumeToken;
use crate::value::Value;

/// One poll of a source partition.
pub enum Poll {
    /// A record, with the partition's position after it.
    Item {
        /// Position to resume from if this record's epoch commits.
        token: Option<ResumeToken>,
        /// The record payload.
        value: Value,
    },
    /// Close the current epoch before producing more records.
    AdvanceEpoch,
    /// Nothing ready; poll again later.
    Pending,
    /// The partition is exhausted.
    Eof,
}

/// A worker's live handle on its slice of the input.
pub trait SourcePartition {
    /// Produces the next poll outcome. Errors are fatal to the run.
    fn next(&mut self) -> Result<Poll, String>;

    /// Called once the epoch that produced `token` is durable, permitting
    /// external offset commits.
    fn commit(&mut self, token: &ResumeToken) {
        let _ = token;
    }
}

/// A statically partitioned source with durable resume positions.
pub trait Source: Send {
    /// Builds this worker's partition, resuming from `resume` if the
    /// engine recovered one.
    fn build(
        &self,
        worker_index: usize,
        worker_count: usize,
        resume: Option<ResumeToken>,
    ) -> Result<Box<dyn SourcePartition>, String>;
}

/// A source without resume support; at-least-once only if the external
/// system is replayable.
pub trait DynamicSource: Send {
    /// Builds this worker's stateless partition.
    fn build(
        &self,
        worker_index: usize,
        worker_count: usize,
    ) -> Result<Box<dyn SourcePartition>, String>;
}

/// How a dataflow's input step obtains partitions.
pub enum InputConfig {
    /// Partitioned with resume tokens.
    Partitioned(Box<dyn Source>),
    /// Stateless.
    Dynamic(Box<dyn DynamicSource>),
}

/// A deterministic in-memory source for tests.
///
/// Items are striped over workers; each item closes its epoch, so every
/// input item lands in its own epoch and stateful progress is snapshotted
/// between items. The resume token is the count of locally emitted items.
#[derive(Clone)]
pub struct TestingSource {
    items: Vec<Value>,
}

impl TestingSource {
    /// A source over the given items.
    pub fn new(items: Vec<Value>) -> TestingSource {
        TestingSource { items }
    }
}

impl Source for TestingSource {
    fn build(
        &self,
        worker_index: usize,
        worker_count: usize,
        resume: Option<ResumeToken>,
    ) -> Result<Box<dyn SourcePartition>, String> {
        let local: Vec<Value> = self
            .items
            .iter()
            .skip(worker_index)
            .step_by(worker_count)
            .cloned()
            .collect();
        let consumed = match resume {
            Some(token) => token.decode::<u64>().map_err(|e| e.to_string())?,
            None => 0,
        };
        Ok(Box::new(TestingPartition { items: local, consumed, advance_due: false }))
    }
}

struct TestingPartition {
    items: Vec<Value>,
    consumed: u64,
    advance_due: bool,
}

impl SourcePartition for TestingPartition {
    fn next(&mut self) -> Result<Poll, String> {
        if self.advance_due {
            self.advance_due = false;
            return Ok(Poll::AdvanceEpoch);
        }
        match self.items.get(self.consumed as usize) {
            Some(value) => {
                let value = value.clone();
                self.consumed += 1;
                self.advance_due = true;
                Ok(Poll::Item { token: Some(ResumeToken::encode(&self.consumed)), value })
            }
            None => Ok(Poll::Eof),
        }
    }
}

/// What a generator-backed partition yields.
pub enum SourceMessage {
    /// A record.
    Item(Value),
    /// Close the current epoch.
    AdvanceEpoch,
}

/// A source built from a generator closure, for tests that interleave
/// records with epoch advances and clock movement.
///
/// The closure is re-run on every build; on resume the partition consumes
/// (and discards) the already-committed prefix of items, replaying any side
/// effects the generator performs between yields, such as advancing a
/// testing clock.
pub struct GeneratorSource<F> {
    build: F,
}

impl<F> GeneratorSource<F>
where
    F: Fn() -> Box<dyn Iterator<Item = SourceMessage>> + Send,
{
    /// A source running `build` once per partition build.
    pub fn new(build: F) -> GeneratorSource<F> {
        GeneratorSource { build }
    }
}

impl<F> Source for GeneratorSource<F>
where
    F: Fn() -> Box<dyn Iterator<Item = SourceMessage>> + Send,
{
    fn build(
        &self,
        _worker_index: usize,
        _worker_count: usize,
        resume: Option<ResumeToken>,
    ) -> Result<Box<dyn SourcePartition>, String> {
        let mut iter = (self.build)();
        let mut consumed = 0u64;
        if let Some(token) = resume {
            let skip = token.decode::<u64>().map_err(|e| e.to_string())?;
            while consumed < skip {
                match iter.next() {
                    Some(SourceMessage::Item(_)) => consumed += 1,
                    Some(SourceMessage::AdvanceEpoch) => {}
                    None => {
                        return Err(format!(
                            "generator ended before its committed position {}",
                            skip
                        ))
                    }
                }
            }
        }
        Ok(Box::new(GeneratorPartition { iter, consumed }))
    }
}

struct GeneratorPartition {
    iter: Box<dyn Iterator<Item = SourceMessage>>,
    consumed: u64,
}

impl SourcePartition for GeneratorPartition {
    fn next(&mut self) -> Result<Poll, String> {
        match self.iter.next() {
            Some(SourceMessage::Item(value)) => {
                self.consumed += 1;
                Ok(Poll::Item { token: Some(ResumeToken::encode(&self.consumed)), value })
            }
            Some(SourceMessage::AdvanceEpoch) => Ok(Poll::AdvanceEpoch),
            None => Ok(Poll::Eof),
        }
    }
}

/// A partitioned source defined by a builder closure, mirroring the manual
/// input configuration: the closure receives the worker's coordinates and
/// recovered token and returns the partition itself.
pub struct ManualSource<F> {
    build: F,
}

impl<F> ManualSource<F>
where
    F: Fn(usize, usize, Option<ResumeToken>) -> Result<Box<dyn SourcePartition>, String> + Send,
{
    /// A source delegating partition construction to `build`.
    pub fn new(build: F) -> ManualSource<F> {
        ManualSource { build }
    }
}

impl<F> Source for ManualSource<F>
where
    F: Fn(usize, usize, Option<ResumeToken>) -> Result<Box<dyn SourcePartition>, String> + Send,
{
    fn build(
        &self,
        worker_index: usize,
        worker_count: usize,
        resume: Option<ResumeToken>,
    ) -> Result<Box<dyn SourcePartition>, String> {
        (self.build)(worker_index, worker_count, resume)
    }
}

/// An iterator adapter partition: each item in its own epoch, no tokens.
pub struct IteratorPartition {
    iter: Box<dyn Iterator<Item = Value>>,
    advance_due: bool,
}

impl IteratorPartition {
    /// Wraps an iterator of records.
    pub fn new(iter: Box<dyn Iterator<Item = Value>>) -> IteratorPartition {
        IteratorPartition { iter, advance_due: false }
    }
}

impl SourcePartition for IteratorPartition {
    fn next(&mut self) -> Result<Poll, String> {
        if self.advance_due {
            self.advance_due = false;
            return Ok(Poll::AdvanceEpoch);
        }
        match self.iter.next() {
            Some(value) => {
                self.advance_due = true;
                Ok(Poll::Item { token: None, value })
            }
            None => Ok(Poll::Eof),
        }
    }
}
