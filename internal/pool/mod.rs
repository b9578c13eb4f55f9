use crate::error::{Error, Result};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const QUEUE_DEPTH: usize = 256;

type Task = BoxFuture<'static, ()>;

/// Future handed back by [`WorkerPool::submit`].
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Resolve to the task's result. A pool shut down before the task ran
    /// (or killed while it ran) resolves to [`Error::PoolClosed`].
    pub async fn join(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::PoolClosed),
        }
    }
}

/// Bounded FIFO task queue with a fixed set of workers.
///
/// This is the only place the engine parallelizes; completion order across
/// tasks is unspecified and there is no per-task cancellation.
pub struct WorkerPool {
    queue: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let worker_count = workers.max(1);
        let (tx, rx) = mpsc::channel::<Task>(QUEUE_DEPTH);
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..worker_count)
            .map(|index| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let task = { rx.lock().await.recv().await };
                        match task {
                            Some(task) => task.await,
                            None => {
                                tracing::debug!(worker = index, "worker drained, exiting");
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        Self {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Queue a task and get a handle to its eventual result.
    pub async fn submit<T, F>(&self, future: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let sender = {
            let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.clone()
        };
        let Some(sender) = sender else {
            // tx dropped here; join() observes the closed pool.
            return TaskHandle { rx };
        };
        let task: Task = Box::pin(async move {
            let result = future.await;
            let _ = tx.send(result);
        });
        if sender.send(task).await.is_err() {
            tracing::warn!("worker pool queue closed while submitting");
        }
        TaskHandle { rx }
    }

    /// Stop accepting work, drain the queue and join every worker.
    pub async fn shutdown(&self) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.take();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Immediate teardown: queued and running tasks are abandoned.
    pub fn kill(&self) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.take();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }
}
