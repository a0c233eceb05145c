//! Bounded producer/consumer worker used to decouple I/O threads from processing.

mod priority;

pub use priority::Priority;

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, RingBuffer},
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::thread::{self, JoinHandle};

/// Queue capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 256;

struct Queue<T> {
    items: HeapRb<T>,
    running: bool,
    generation: u64,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    wake: Condvar,
    dropped: AtomicU64,
}

/// A worker thread fed through a fixed-capacity queue.
///
/// Any number of threads may [`push`](Task::push). The worker sleeps while the queue is empty,
/// swaps the whole pending batch out under the lock and hands it to the consumer without holding
/// the lock, so items from one producer arrive in push order.
///
/// When the queue is full the oldest pending item is discarded to make room; see
/// [`dropped`](Task::dropped).
pub struct Task<T: Send + 'static> {
    name: String,
    capacity: usize,
    priority: Priority,
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            priority: Priority::Normal,
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    items: HeapRb::new(capacity),
                    running: false,
                    generation: 0,
                }),
                wake: Condvar::new(),
                dropped: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Priority applied to the worker thread when it starts.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }

    /// Items waiting for the worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().items.occupied_len()
    }

    /// Items discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Spawns the worker, which calls `consumer` once per item.
    ///
    /// Returns `Ok(false)` if the task is already running. The worker inherits the caller's
    /// tracing dispatcher.
    pub fn start<F>(&self, consumer: F) -> Result<bool>
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut worker = self.worker.lock();
        let generation = {
            let mut queue = self.shared.queue.lock();
            if queue.running {
                return Ok(false);
            }
            queue.running = true;
            queue.generation += 1;
            queue.generation
        };

        let shared = Arc::clone(&self.shared);
        let capacity = self.capacity;
        let priority = self.priority;
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    if !priority.apply_current() {
                        tracing::warn!(?priority, "running task at default priority");
                    }
                    worker_loop(&shared, generation, capacity, consumer);
                })
            });

        match spawned {
            Ok(handle) => {
                tracing::debug!(task = %self.name, capacity, "task started");
                *worker = Some(handle);
                Ok(true)
            }
            Err(e) => {
                self.shared.queue.lock().running = false;
                Err(Error::Spawn(e))
            }
        }
    }

    /// Queues `item` for the worker. Never waits on the worker.
    ///
    /// Returns `false`, dropping `item`, once the task is not running.
    pub fn push(&self, item: T) -> bool {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            return false;
        }
        if queue.items.push_overwrite(item).is_some() {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(task = %self.name, dropped, "queue full, oldest item discarded");
        }
        drop(queue);
        self.shared.wake.notify_one();
        true
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// Pending items are delivered first unless `clear` is set. Called from the worker itself,
    /// this only signals; the thread exits once the current batch is done.
    pub fn stop(&self, clear: bool) {
        {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
            if clear {
                let discarded = Consumer::clear(&mut queue.items);
                if discarded > 0 {
                    tracing::debug!(task = %self.name, discarded, "pending items cleared");
                }
            }
        }
        self.shared.wake.notify_all();

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        join_worker(&self.name, handle);
        tracing::debug!(task = %self.name, "task stopped");
    }
}

impl<T: Send + 'static> Drop for Task<T> {
    fn drop(&mut self) {
        self.stop(true);
    }
}

impl<T: Send + 'static> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("priority", &self.priority)
            .field("running", &self.is_running())
            .finish()
    }
}

fn join_worker(name: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::error!(task = %name, "task worker panicked");
    }
}

fn worker_loop<T, F>(shared: &Shared<T>, generation: u64, capacity: usize, mut consumer: F)
where
    F: FnMut(T),
{
    let mut batch = HeapRb::<T>::new(capacity);
    loop {
        {
            let mut queue = shared.queue.lock();
            while queue.generation == generation && queue.running && queue.items.is_empty() {
                shared.wake.wait(&mut queue);
            }
            // A restart after a stop issued from this thread hands the queue to a new worker.
            if queue.generation != generation || queue.items.is_empty() {
                break;
            }
            std::mem::swap(&mut queue.items, &mut batch);
        }
        for item in batch.pop_iter() {
            consumer(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::time::Duration;

    #[test]
    fn delivers_in_push_order() {
        let task = Task::new("order", 16);
        let (tx, rx) = channel::unbounded();
        assert!(task.start(move |v: u32| tx.send(v).unwrap()).unwrap());
        for v in [1, 2, 3] {
            assert!(task.push(v));
        }
        task.stop(false);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn push_after_stop_is_refused() {
        let task = Task::new("refuse", 4);
        let (tx, rx) = channel::unbounded();
        task.start(move |v: u8| tx.send(v).unwrap()).unwrap();
        task.stop(false);
        assert!(!task.is_running());
        assert!(!task.push(7));
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn push_before_start_is_refused() {
        let task = Task::<u8>::new("idle", 4);
        assert!(!task.push(1));
        assert_eq!(task.pending(), 0);
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let task = Task::new("twice", 4);
        assert!(task.start(|_: u8| {}).unwrap());
        assert!(!task.start(|_: u8| {}).unwrap());
        task.stop(false);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let task = Task::new("overflow", 2);
        let (gate_tx, gate_rx) = channel::unbounded::<()>();
        let (tx, rx) = channel::unbounded();
        task.start(move |v: u32| {
            if v == 0 {
                gate_rx.recv().unwrap();
            }
            tx.send(v).unwrap();
        })
        .unwrap();

        assert!(task.push(0));
        // Wait until the worker has taken item 0 and is blocked on the gate.
        while task.pending() > 0 {
            thread::yield_now();
        }
        for v in 1..=4 {
            assert!(task.push(v));
        }
        assert_eq!(task.pending(), 2);
        assert_eq!(task.dropped(), 2);
        gate_tx.send(()).unwrap();
        task.stop(false);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [0, 3, 4]);
    }

    #[test]
    fn stop_with_clear_discards_pending() {
        let task = Task::new("clear", 8);
        let (gate_tx, gate_rx) = channel::unbounded::<()>();
        let (tx, rx) = channel::unbounded();
        task.start(move |v: u32| {
            if v == 0 {
                gate_rx.recv().unwrap();
            }
            tx.send(v).unwrap();
        })
        .unwrap();
        task.push(0);
        while task.pending() > 0 {
            thread::yield_now();
        }
        task.push(1);
        task.push(2);
        let stopper = {
            let gate_tx = gate_tx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gate_tx.send(()).unwrap();
            })
        };
        task.stop(true);
        stopper.join().unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [0]);
    }

    #[test]
    fn restarts_after_stop() {
        let task = Task::new("restart", 4);
        let (tx, rx) = channel::unbounded();
        let tx2 = tx.clone();
        task.start(move |v: u8| tx.send(v).unwrap()).unwrap();
        task.push(1);
        task.stop(false);
        task.start(move |v: u8| tx2.send(v * 10).unwrap()).unwrap();
        task.push(2);
        task.stop(false);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [1, 20]);
    }

    #[test]
    fn stop_from_worker_does_not_deadlock() {
        let task = Arc::new(Task::new("self-stop", 4));
        let (tx, rx) = channel::unbounded();
        let inner = Arc::clone(&task);
        task.start(move |v: u8| {
            inner.stop(false);
            tx.send(v).unwrap();
        })
        .unwrap();
        task.push(5);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(5));
        task.stop(false);
        assert!(!task.is_running());
    }

    #[test]
    fn many_producers() {
        let task = Arc::new(Task::new("fan-in", 1024));
        let (tx, rx) = channel::unbounded();
        task.start(move |v: (u8, u32)| tx.send(v).unwrap()).unwrap();
        let producers: Vec<_> = (0..4u8)
            .map(|p| {
                let task = Arc::clone(&task);
                thread::spawn(move || {
                    for i in 0..100 {
                        assert!(task.push((p, i)));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        task.stop(false);
        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 400);
        for p in 0..4u8 {
            let own: Vec<u32> = received.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(own, (0..100).collect::<Vec<_>>());
        }
    }
}
