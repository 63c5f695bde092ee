//! Resizable worker pool draining a single task channel.
//!
//! Tasks are opaque boxed futures. Every worker owns its own stop signal,
//! checked only *between* tasks, so a resize or stop never interrupts a
//! task mid-execution. To shrink from `n` to `m`, the pool signals `n - m`
//! workers and waits for them to exit; to grow it spawns the delta.
//!
//! The task channel is multi-producer multi-consumer and bounded; a full
//! channel parks the producer, which is how backpressure reaches the
//! broker's prefetch window.

use async_channel::Receiver;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One unit of work for the pool.
pub type Task = BoxFuture<'static, ()>;

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A set of worker tasks draining one shared task channel.
pub struct WorkerPool {
    tasks: Receiver<Task>,
    workers: Vec<Worker>,
    spawned: usize,
}

impl WorkerPool {
    /// Create an empty pool over the given task channel.
    pub fn new(tasks: Receiver<Task>) -> Self {
        Self {
            tasks,
            workers: Vec::new(),
            spawned: 0,
        }
    }

    /// Spawn `n` workers.
    pub fn start(&mut self, n: usize) {
        for _ in 0..n {
            self.spawn_worker();
        }
        debug!(workers = self.workers.len(), "Worker pool started");
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Adjust the live worker count to `n`.
    ///
    /// Shrinking waits for the surplus workers to finish their current
    /// task and exit; the pool may briefly overshoot or undershoot `n`
    /// during the transition but converges before this returns.
    pub async fn resize(&mut self, n: usize) {
        while self.workers.len() < n {
            self.spawn_worker();
        }

        while self.workers.len() > n {
            let worker = self.workers.pop().expect("len checked above");
            let _ = worker.stop.send(true);
            let _ = worker.handle.await;
        }

        debug!(workers = self.workers.len(), "Worker pool resized");
    }

    /// Signal every worker and wait for all of them to exit.
    ///
    /// Workers mid-task complete that task first. Tasks still queued in
    /// the channel are left there.
    pub async fn stop(&mut self) {
        for worker in &self.workers {
            let _ = worker.stop.send(true);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.handle.await;
        }
        debug!("Worker pool stopped");
    }

    fn spawn_worker(&mut self) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let id = self.spawned;
        self.spawned += 1;

        let handle = tokio::spawn(worker_loop(id, self.tasks.clone(), stop_rx));
        self.workers.push(Worker {
            stop: stop_tx,
            handle,
        });
    }
}

async fn worker_loop(id: usize, tasks: Receiver<Task>, mut stop: watch::Receiver<bool>) {
    trace!(worker = id, "Worker up");
    loop {
        tokio::select! {
            // Stop wins over a ready task, so shrink converges even when
            // the channel never runs dry.
            biased;

            _ = stop.changed() => break,
            task = tasks.recv() => match task {
                Ok(task) => task.await,
                Err(_) => break, // channel closed: no more work will arrive
            },
        }
    }
    trace!(worker = id, "Worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_task(counter: Arc<AtomicUsize>) -> Task {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "counter stuck at {} (expected {})",
            counter.load(Ordering::SeqCst),
            expected
        );
    }

    #[tokio::test]
    async fn test_pool_processes_tasks() {
        let (tx, rx) = async_channel::bounded::<Task>(16);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(rx);
        pool.start(3);
        assert_eq!(pool.len(), 3);

        for _ in 0..10 {
            tx.send(counting_task(counter.clone())).await.unwrap();
        }

        wait_for(&counter, 10).await;
        pool.stop().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_resize_grows_and_shrinks() {
        let (_tx, rx) = async_channel::bounded::<Task>(16);

        let mut pool = WorkerPool::new(rx);
        pool.start(2);

        pool.resize(5).await;
        assert_eq!(pool.len(), 5);

        pool.resize(1).await;
        assert_eq!(pool.len(), 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_shrink_waits_for_in_flight_task() {
        let (tx, rx) = async_channel::bounded::<Task>(16);
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(rx);
        pool.start(2);

        let s = started.clone();
        let f = finished.clone();
        tx.send(Box::pin(async move {
            s.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        wait_for(&started, 1).await;
        pool.resize(0).await;

        // resize returned, so the in-flight task must have completed
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_task() {
        let (tx, rx) = async_channel::bounded::<Task>(16);
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(rx);
        pool.start(1);

        let s = started.clone();
        let f = finished.clone();
        tx.send(Box::pin(async move {
            s.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        wait_for(&started, 1).await;
        pool.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_workers_exit_when_channel_closes() {
        let (tx, rx) = async_channel::bounded::<Task>(16);

        let mut pool = WorkerPool::new(rx);
        pool.start(2);

        tx.close();

        // stop() joins the already-exited workers without hanging
        tokio::time::timeout(Duration::from_secs(1), pool.stop())
            .await
            .expect("stop timed out");
    }
}
