//! A generic priority task pool backing both the mesh-build workers (C5) and the
//! streaming load/unload workers (C6).
//!
//! Grounded on `bns-workers`' `BinaryHeap` + `parking_lot::Condvar` pool: tasks are
//! submitted with an explicit priority key rather than wrapped in futures, so ordering
//! survives the hop through the queue (spec.md §4.5, §4.6, §9).

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Higher values run first. Loads key on negative Chebyshev distance so the closest
/// chunk sorts highest; unloads use [`Priority::LOWEST`] so loads always preempt them.
pub type Priority = i32;

/// Sentinel priority for unload tasks: lower than any real load priority can reach.
pub const LOWEST_PRIORITY: Priority = i32::MIN;

struct Task<T> {
    priority: Priority,
    /// Submission order, lowest first. Breaks ties within a priority level so the
    /// queue is FIFO among equal-priority tasks (spec.md §4.5/§4.6: "FIFO within a
    /// priority level; strict priority across levels"), which a bare `BinaryHeap` on
    /// `priority` alone does not guarantee.
    sequence: u64,
    payload: T,
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl<T> Eq for Task<T> {}

impl<T> PartialOrd for Task<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Task<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap pops the greatest element first, so an earlier (lower) sequence
        // number must compare as greater once priorities tie.
        self.priority.cmp(&other.priority).then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Implemented by the per-pool worker logic. `run` executes one task's payload; it
/// never panics across the thread boundary for recoverable failures — subsystems that
/// can fail route errors through the shared [`crate::error::ErrorReporter`] instead.
pub trait Worker<T>: Send + 'static {
    fn run(&mut self, payload: T);
}

impl<T, F: FnMut(T) + Send + 'static> Worker<T> for F {
    fn run(&mut self, payload: T) {
        (self)(payload)
    }
}

/// A bounded pool of worker threads draining a shared priority queue.
pub struct PriorityPool<T> {
    queue: Mutex<BinaryHeap<Task<T>>>,
    condvar: Condvar,
    should_stop: AtomicBool,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    next_sequence: AtomicU64,
}

impl<T: Send + 'static> PriorityPool<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            should_stop: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(0),
        })
    }

    /// Spawn `count` worker threads, each running `make_worker()` to build its own
    /// `Worker` instance (workers are typically not `Clone`, e.g. they hold a generator
    /// handle).
    pub fn spawn(self: &Arc<Self>, count: usize, mut make_worker: impl FnMut() -> Box<dyn Worker<T>>) {
        let mut handles = self.handles.lock();
        for _ in 0..count {
            let pool = Arc::clone(self);
            let mut worker = make_worker();
            handles.push(std::thread::spawn(move || {
                while let Some(payload) = pool.fetch() {
                    worker.run(payload);
                }
            }));
        }
    }

    pub fn submit(&self, payload: T, priority: Priority) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(Task { payload, priority, sequence });
        self.condvar.notify_one();
    }

    pub fn submit_batch(&self, items: impl IntoIterator<Item = (T, Priority)>) {
        let mut queue = self.queue.lock();
        queue.extend(items.into_iter().map(|(payload, priority)| {
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            Task { priority, payload, sequence }
        }));
        self.condvar.notify_all();
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn fetch(&self) -> Option<T> {
        if self.should_stop.load(Ordering::Relaxed) {
            return None;
        }
        let mut queue = self.queue.lock();
        loop {
            if let Some(task) = queue.pop() {
                return Some(task.payload);
            }
            if self.should_stop.load(Ordering::Relaxed) {
                return None;
            }
            self.condvar.wait(&mut queue);
        }
    }

    /// Stop accepting further progress from workers and wait up to `timeout` for them
    /// to drain in-flight work, then detach any stragglers (spec.md §4.6 `shutdown()`).
    pub fn shutdown(&self, timeout: std::time::Duration) {
        self.should_stop.store(true, Ordering::Relaxed);
        self.condvar.notify_all();
        let deadline = std::time::Instant::now() + timeout;
        let mut handles = self.handles.lock();
        let drained: Vec<_> = handles.drain(..).collect();
        drop(handles);
        for handle in drained {
            if std::time::Instant::now() >= deadline {
                break;
            }
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn single_worker_drains_in_priority_order() {
        let pool = PriorityPool::<i32>::new();
        let started: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));

        for (value, priority) in [(5, -5), (1, -1), (3, -3), (0, 0), (2, -2)] {
            pool.submit(value, priority);
        }

        let recorder = Arc::clone(&started);
        // One worker only: a second task cannot start before the first finishes, so
        // recorded start order equals distance order (invariant 6, spec.md §8).
        pool.spawn(1, move || {
            let recorder = Arc::clone(&recorder);
            Box::new(move |value: i32| {
                recorder.lock().unwrap().push(value);
            })
        });

        // Give the single worker time to drain all five tasks.
        std::thread::sleep(Duration::from_millis(200));
        pool.shutdown(Duration::from_millis(500));

        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2, 3, 5]);
    }

    #[test]
    fn unload_sentinel_is_lower_than_any_real_priority() {
        assert!(LOWEST_PRIORITY < -1_000_000);
    }

    #[test]
    fn same_priority_tasks_drain_in_submission_order() {
        let pool = PriorityPool::<i32>::new();
        let started: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));

        // All five submitted at the same priority; a bare BinaryHeap on priority alone
        // offers no ordering guarantee among them, but spec.md requires FIFO here.
        for value in 0..5 {
            pool.submit(value, 0);
        }

        let recorder = Arc::clone(&started);
        pool.spawn(1, move || {
            let recorder = Arc::clone(&recorder);
            Box::new(move |value: i32| {
                recorder.lock().unwrap().push(value);
            })
        });

        std::thread::sleep(Duration::from_millis(200));
        pool.shutdown(Duration::from_millis(500));

        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
