//! Bounded worker pool for connection-handler tasks.
//!
//! A fixed set of workers drains a bounded FIFO of boxed futures. The pool
//! exists to bound task count under load and to give shutdown a well-defined
//! quiescence point: [`WorkerPool::close`] returns only after every
//! submitted task has finished.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use linerpc_common::{Error, Result};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A fixed-size pool of workers draining a bounded task queue.
pub struct WorkerPool {
    workers: usize,
    queue_size: usize,
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool with `workers` workers and a queue of `queue_size`
    /// tasks. Zero workers coerces to one; zero queue size coerces to
    /// `2 × workers`.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let queue_size = if queue_size == 0 {
            workers * 2
        } else {
            queue_size
        };

        let (tx, rx) = mpsc::channel::<Task>(queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    // The receiver lock is held only while waiting for the
                    // next task, never while running one.
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => {
                            if std::panic::AssertUnwindSafe(task)
                                .catch_unwind()
                                .await
                                .is_err()
                            {
                                tracing::error!(worker = id, "task panicked");
                            }
                        }
                        None => break,
                    }
                }
            }));
        }

        Self {
            workers,
            queue_size,
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Enqueue a task, waiting if the queue is full. Fails with
    /// `PoolClosed` once the pool is closed. Submission never waits on task
    /// completion, only on queue capacity.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let tx = {
            let guard = self.tx.lock().expect("sender lock poisoned");
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(Error::PoolClosed);
        };
        tx.send(Box::pin(task))
            .await
            .map_err(|_| Error::PoolClosed)
    }

    /// One-shot close: reject new submissions, let workers drain the queue,
    /// then join every worker. Returns only once all submitted tasks have
    /// completed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender closes the queue; workers exit after
        // finishing whatever is already enqueued.
        self.tx.lock().expect("sender lock poisoned").take();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("handles lock poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submitted_tasks_run() {
        let pool = WorkerPool::new(4, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_zero_workers_coerces_to_one() {
        let pool = WorkerPool::new(0, 0);
        assert_eq!(pool.workers(), 1);
        assert_eq!(pool.queue_size(), 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_tasks() {
        let pool = WorkerPool::new(2, 4);
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();

        pool.close().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let pool = WorkerPool::new(2, 4);
        pool.close().await;
        assert!(pool.is_closed());

        let err = pool.submit(async {}).await.unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = WorkerPool::new(2, 4);
        pool.close().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 4);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(async {
            panic!("intentional");
        })
        .await
        .unwrap();

        // The single worker must survive to run this one.
        let c = Arc::clone(&counter);
        pool.submit(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_backpressure_does_not_lose_tasks() {
        // One slow worker, tiny queue: submits must wait, never drop.
        let pool = WorkerPool::new(1, 1);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
