//! Sink contracts and the testing adapters built on them.
//!
//! Sinks are built once per worker and receive every record reaching their
//! capture step on that worker. Sinks may observe duplicates across a
//! recovery boundary; that is the accepted trade-off of at-least-once
//! delivery.

use std::sync::{Arc, Mutex};

use crate::value::Value;

/// A worker's live handle on its slice of the output.
pub trait SinkPartition {
    /// Delivers one record. Errors are fatal to the run.
    fn write(&mut self, value: Value) -> Result<(), String>;

    /// Called once at the end of a successful run.
    fn close(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// Builds one sink partition per worker.
pub trait Sink: Send {
    /// Builds this worker's partition.
    fn build(
        &self,
        worker_index: usize,
        worker_count: usize,
    ) -> Result<Box<dyn SinkPartition>, String>;
}

/// Collects captured records into shared memory, for tests.
#[derive(Clone, Default)]
pub struct TestingSink {
    out: Arc<Mutex<Vec<Value>>>,
}

impl TestingSink {
    /// An empty sink.
    pub fn new() -> TestingSink {
        TestingSink::default()
    }

    /// Everything captured so far, across all workers.
    pub fn items(&self) -> Vec<Value> {
        self.out.lock().expect("poisoned").clone()
    }

    /// Captured items in sorted render order, for order-insensitive
    /// assertions.
    pub fn sorted_items(&self) -> Vec<Value> {
        let mut items = self.items();
        items.sort_by_key(|v| v.to_string());
        items
    }

    /// Forgets everything captured, e.g. between a crash and a resume.
    pub fn clear(&self) {
        self.out.lock().expect("poisoned").clear();
    }
}

impl Sink for TestingSink {
    fn build(
        &self,
        _worker_index: usize,
        _worker_count: usize,
    ) -> Result<Box<dyn SinkPartition>, String> {
        let out = Arc::clone(&self.out);
        Ok(Box::new(TestingSinkPartition { out }))
    }
}

struct TestingSinkPartition {
    out: Arc<Mutex<Vec<Value>>>,
}

impl SinkPartition for TestingSinkPartition {
    fn write(&mut self, value: Value) -> Result<(), String> {
        self.out.lock().expect("poisoned").push(value);
        Ok(())
    }
}

/// Prints each record to stdout.
#[derive(Clone, Copy, Default)]
pub struct StdOutSink;

impl Sink for StdOutSink {
    fn build(
        &self,
        _worker_index: usize,
        _worker_count: usize,
    ) -> Result<Box<dyn SinkPartition>, String> {
        Ok(Box::new(StdOutPartition))
    }
}

struct StdOutPartition;

impl SinkPartition for StdOutPartition {
    fn write(&mut self, value: Value) -> Result<(), String> {
        println!("{}", value);
        Ok(())
    }
}

/// A sink defined by a builder closure receiving the worker's coordinates,
/// mirroring the manual output configuration.
pub struct ManualSink<F> {
    build: F,
}

impl<F> ManualSink<F>
where
    F: Fn(usize, usize) -> Result<Box<dyn SinkPartition>, String> + Send,
{
    /// A sink delegating partition construction to `build`.
    pub fn new(build: F) -> ManualSink<F> {
        ManualSink { build }
    }
}

impl<F> Sink for ManualSink<F>
where
    F: Fn(usize, usize) -> Result<Box<dyn SinkPartition>, String> + Send,
{
    fn build(
        &self,
        worker_index: usize,
        worker_count: usize,
    ) -> Result<Box<dyn SinkPartition>, String> {
        (self.build)(worker_index, worker_count)
    }
}

impl<F> SinkPartition for F
where
    F: FnMut(Value) -> Result<(), String>,
{
    fn write(&mut self, value: Value) -> Result<(), String> {
        self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_sink_is_shared_across_partitions() {
        let sink = TestingSink::new();
        let mut p0 = sink.build(0, 2).unwrap();
        let mut p1 = sink.build(1, 2).unwrap();
        p0.write(Value::Int(1)).unwrap();
        p1.write(Value::Int(2)).unwrap();
        assert_eq!(sink.items(), vec![Value::Int(1), Value::Int(2)]);

        sink.clear();
        assert!(sink.items().is_empty());
    }

    #[test]
    fn closures_are_sink_partitions() {
        let sink = ManualSink::new(|worker_index, _count| {
            assert_eq!(worker_index, 0);
            let mut seen = 0u64;
            Ok(Box::new(move |value: Value| {
                seen += value.as_int().unwrap_or(0) as u64;
                let _ = seen;
                Ok(())
            }) as Box<dyn SinkPartition>)
        });
        let mut partition = sink.build(0, 1).unwrap();
        partition.write(Value::Int(3)).unwrap();
    }
}
