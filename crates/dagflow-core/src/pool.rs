//! Worker pools that run task bodies off the scheduler thread.
//!
//! Two independently sized pools exist — one for CPU-bound work, one for
//! I/O-bound work — so a backlog of blocking I/O can't starve CPU-bound
//! tasks or vice versa. Each pool isolates task panics with `catch_unwind`
//! so one misbehaving generator can't take down the scheduler thread.

use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError, unbounded};

use crate::error::TaskError;
use crate::generator::{TaskBody, TaskOutput};

struct Job<P> {
    body: TaskBody<P>,
    result_tx: Sender<Result<TaskOutput<P>, TaskError>>,
}

/// A handle to a single in-flight task. Polled by the scheduler, never
/// blocked on directly (see [`wait_any`]).
pub struct TaskHandle<P> {
    receiver: Receiver<Result<TaskOutput<P>, TaskError>>,
}

pub enum Poll<P> {
    Pending,
    Ready(Result<TaskOutput<P>, TaskError>),
}

impl<P> TaskHandle<P> {
    pub fn poll(&self) -> Poll<P> {
        match self.receiver.try_recv() {
            Ok(result) => Poll::Ready(result),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Ready(Err(TaskError::WorkerGone)),
        }
    }
}

/// A fixed-size pool of named worker threads pulling from a shared queue.
pub struct ThreadPool<P> {
    name: &'static str,
    sender: Option<Sender<Job<P>>>,
    workers: Vec<JoinHandle<()>>,
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}

impl<P: Send + 'static> ThreadPool<P> {
    /// Spawns `workers` named OS threads (`{name}-0`, `{name}-1`, ...)
    /// pulling from an unbounded task queue. Unbounded because admission
    /// already throttles how many tasks are ever in flight at once; the
    /// queue just smooths out bursts.
    pub fn new(name: &'static str, workers: usize) -> Self {
        let (sender, receiver) = unbounded::<Job<P>>();
        let mut handles = Vec::with_capacity(workers);

        for i in 0..workers {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(job.body))
                            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload))));
                        let _ = job.result_tx.send(outcome);
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            name,
            sender: Some(sender),
            workers: handles,
        }
    }

    pub fn submit(&self, body: TaskBody<P>) -> TaskHandle<P> {
        let (result_tx, result_rx) = unbounded();
        self.sender
            .as_ref()
            .expect("submit after shutdown")
            .send(Job { body, result_tx })
            .expect("worker pool channel closed unexpectedly");
        TaskHandle { receiver: result_rx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Drops the sending half so workers exit their `recv` loop once the
    /// queue drains, then joins every worker thread.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<P> Drop for ThreadPool<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Blocks until at least one of `handles` is ready or `timeout` elapses,
/// returning the indices (into `handles`) that became ready. Used by the
/// scheduler when admission has nothing left to do but wait on pending work.
pub fn wait_any<P>(handles: &[&TaskHandle<P>], timeout: Duration) -> Vec<usize> {
    if handles.is_empty() {
        std::thread::sleep(timeout);
        return Vec::new();
    }

    let mut select = Select::new();
    for handle in handles {
        select.recv(&handle.receiver);
    }

    match select.ready_timeout(timeout) {
        Err(_) => Vec::new(),
        Ok(_) => {
            // At least one receiver is ready; collect every receiver that's
            // currently ready without blocking rather than just the one
            // `Select` woke us for.
            handles
                .iter()
                .enumerate()
                .filter(|(_, h)| !h.receiver.is_empty())
                .map(|(i, _)| i)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn produced(n: u32) -> TaskBody<u32> {
        Box::new(move || {
            let mut map = FxHashMap::default();
            map.insert(crate::types::DataType::from("x"), n);
            Ok(TaskOutput::Produced(map))
        })
    }

    #[test]
    fn submit_and_poll_roundtrips_a_value() {
        let pool: ThreadPool<u32> = ThreadPool::new("test-pool", 2);
        let handle = pool.submit(produced(7));

        let result = loop {
            match handle.poll() {
                Poll::Pending => std::thread::yield_now(),
                Poll::Ready(r) => break r,
            }
        };

        match result.unwrap() {
            TaskOutput::Produced(map) => {
                assert_eq!(map.get(&crate::types::DataType::from("x")), Some(&7))
            }
            TaskOutput::Emitted(_) => panic!("expected Produced"),
        }
    }

    #[test]
    fn panicking_task_is_isolated_as_a_task_error() {
        let pool: ThreadPool<u32> = ThreadPool::new("test-pool", 1);
        let body: TaskBody<u32> = Box::new(|| panic!("boom"));
        let handle = pool.submit(body);

        let result = loop {
            match handle.poll() {
                Poll::Pending => std::thread::yield_now(),
                Poll::Ready(r) => break r,
            }
        };

        assert!(matches!(result, Err(TaskError::Panicked(_))));
    }

    #[test]
    fn pool_keeps_running_after_a_panicked_task() {
        let pool: ThreadPool<u32> = ThreadPool::new("test-pool", 1);
        let panicking: TaskBody<u32> = Box::new(|| panic!("boom"));
        let _ = pool.submit(panicking);

        let handle = pool.submit(produced(42));
        let result = loop {
            match handle.poll() {
                Poll::Pending => std::thread::yield_now(),
                Poll::Ready(r) => break r,
            }
        };
        assert!(result.is_ok());
    }

    #[test]
    fn wait_any_returns_once_a_handle_completes() {
        let pool: ThreadPool<u32> = ThreadPool::new("test-pool", 2);
        let a = pool.submit(produced(1));
        let b = pool.submit(produced(2));

        let ready = wait_any(&[&a, &b], Duration::from_secs(5));
        assert!(!ready.is_empty());
    }

    #[test]
    fn wait_any_times_out_with_no_handles_ready() {
        let pool: ThreadPool<u32> = ThreadPool::new("test-pool", 1);
        let body: TaskBody<u32> = Box::new(|| {
            std::thread::sleep(Duration::from_millis(200));
            let mut map = FxHashMap::default();
            map.insert(crate::types::DataType::from("x"), 0u32);
            Ok(TaskOutput::Produced(map))
        });
        let handle = pool.submit(body);

        let ready = wait_any(&[&handle], Duration::from_millis(20));
        assert!(ready.is_empty());
    }
}
