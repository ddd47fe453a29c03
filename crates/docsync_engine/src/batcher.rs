//! Size- and time-bounded batching with a sequential consumer.
//!
//! Producers enqueue without blocking into an unbounded channel. A single
//! task forms batches and awaits the processor for each one before forming
//! the next, so a slow processor defers later flush timers instead of
//! blocking producers.

use crate::config::BatcherConfig;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

enum Message<T> {
    Item(T),
    Flush,
}

/// Batches items for a processing callback.
pub struct Batcher<T> {
    tx: mpsc::UnboundedSender<Message<T>>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Spawns the batching task.
    ///
    /// `processor` is called with each batch, at most `config.capacity`
    /// items long. Its future completes before the next batch is formed.
    pub fn new<F, Fut>(config: BatcherConfig, mut processor: F) -> Self
    where
        F: FnMut(Vec<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<T>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();
        let capacity = config.capacity.max(1);
        let delay = config.delay;

        let task = tokio::spawn(async move {
            let mut batch: Vec<T> = Vec::new();
            let mut deadline: Option<Instant> = None;
            let mut flush_requested = false;

            loop {
                if batch.len() >= capacity || (flush_requested && !batch.is_empty()) {
                    let rest = if batch.len() > capacity {
                        batch.split_off(capacity)
                    } else {
                        Vec::new()
                    };
                    let ready = std::mem::replace(&mut batch, rest);
                    let size = ready.len();
                    trace!(size, "flushing batch");
                    processor(ready).await;
                    counter.fetch_sub(size, Ordering::SeqCst);
                    deadline = if batch.is_empty() {
                        None
                    } else {
                        Some(Instant::now() + delay)
                    };
                    if batch.is_empty() {
                        flush_requested = false;
                    }
                    continue;
                }
                flush_requested = false;

                let message = match deadline {
                    Some(at) => tokio::select! {
                        message = rx.recv() => message,
                        _ = sleep_until(at) => {
                            flush_requested = true;
                            continue;
                        }
                    },
                    None => rx.recv().await,
                };

                match message {
                    Some(Message::Item(item)) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + delay);
                        }
                        batch.push(item);
                    }
                    Some(Message::Flush) => flush_requested = true,
                    None => break,
                }
            }
        });

        Self {
            tx,
            pending,
            closed: AtomicBool::new(false),
            task,
        }
    }

    /// Enqueues one item.
    pub fn queue(&self, item: T) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Message::Item(item)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Enqueues several items.
    pub fn queue_all(&self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.queue(item);
        }
    }

    /// Flushes everything enqueued so far without waiting for the timer.
    pub fn flush(&self) {
        let _ = self.tx.send(Message::Flush);
    }

    /// Items enqueued and not yet fully processed.
    pub fn count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Returns true if nothing is queued or being processed.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Stops the batching task, abandoning queued items.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.task.abort();
        self.pending.store(0, Ordering::SeqCst);
    }
}

impl<T> Drop for Batcher<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<(Instant, Vec<u32>)>>>;

    fn recording_batcher(capacity: usize, delay_ms: u64, work_ms: u64) -> (Batcher<u32>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let batcher = Batcher::new(
            BatcherConfig::new(capacity, Duration::from_millis(delay_ms)),
            move |batch: Vec<u32>| {
                let sink = sink.clone();
                async move {
                    sink.lock().push((Instant::now(), batch));
                    if work_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(work_ms)).await;
                    }
                }
            },
        );
        (batcher, log)
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_immediately() {
        let (batcher, log) = recording_batcher(3, 1_000, 0);
        let start = Instant::now();
        batcher.queue_all([1, 2, 3]);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, vec![1, 2, 3]);
        assert!(log[0].0 - start < Duration::from_millis(1_000));
        assert!(batcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_delay() {
        let (batcher, log) = recording_batcher(3, 1_000, 0);
        batcher.queue_all([1, 2]);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(log.lock().is_empty());
        assert_eq!(batcher.count(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(log.lock().len(), 1);
        assert_eq!(log.lock()[0].1, vec![1, 2]);
        assert!(batcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_sequential() {
        let (batcher, log) = recording_batcher(2, 10, 100);
        batcher.queue_all(0..5);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let log = log.lock();
        let batches: Vec<_> = log.iter().map(|(_, b)| b.clone()).collect();
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        // Each batch starts only after the previous one finished its work.
        for pair in log.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flush_skips_the_timer() {
        let (batcher, log) = recording_batcher(10, 60_000, 0);
        batcher.queue(7);
        batcher.flush();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(log.lock().len(), 1);
        assert_eq!(log.lock()[0].1, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_queue() {
        let (batcher, log) = recording_batcher(10, 100, 0);
        batcher.queue_all([1, 2]);
        batcher.shutdown();
        batcher.queue(3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(log.lock().is_empty());
        assert!(batcher.is_empty());
    }
}
