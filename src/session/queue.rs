//! Serialized reconfiguration queue
//!
//! Every mutation of the session runs as a task on one dedicated worker
//! thread, in submission order, never on the caller's thread. The worker owns
//! the state; tasks borrow it mutably one at a time.

use crate::utils::error::{SessionError, SessionResult};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Awaitable answer to a queued task
///
/// Dropping it is fine: the task still runs, its answer is discarded.
#[derive(Debug)]
pub struct Reply<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Reply<T> {
    fn new(rx: oneshot::Receiver<T>) -> Self {
        Self { rx }
    }

    /// A reply that is already resolved
    pub fn ready(value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }

    /// Wait for the task to run
    pub async fn wait(self) -> SessionResult<T> {
        self.rx.await.map_err(|_| SessionError::QueueClosed)
    }

    /// Block the current thread until the task ran. Not for use on the worker.
    pub fn wait_blocking(self) -> SessionResult<T> {
        self.rx.blocking_recv().map_err(|_| SessionError::QueueClosed)
    }
}

impl<T> Reply<SessionResult<T>> {
    /// Wait and flatten queue and task errors
    pub async fn outcome(self) -> SessionResult<T> {
        self.wait().await?
    }
}

/// Cloneable submission side of a queue
pub struct QueueHandle<S> {
    tx: mpsc::UnboundedSender<Task<S>>,
}

impl<S> Clone for QueueHandle<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S: 'static> QueueHandle<S> {
    /// Enqueue a task behind everything already submitted
    pub fn submit<F>(&self, task: F) -> SessionResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Box::new(task))
            .map_err(|_| SessionError::QueueClosed)
    }

    /// Enqueue a task and get its return value back
    pub fn run<F, R>(&self, task: F) -> Reply<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        // A closed queue drops `tx`, which the reply reports as QueueClosed
        let _ = self.submit(move |state| {
            let _ = tx.send(task(state));
        });
        Reply::new(rx)
    }

    /// Resolves once every task submitted before it has run
    pub fn flush(&self) -> Reply<()> {
        self.run(|_| ())
    }

    /// Handle that does not keep the worker alive
    pub fn downgrade(&self) -> WeakQueueHandle<S> {
        WeakQueueHandle {
            tx: self.tx.downgrade(),
        }
    }
}

/// Non-owning submission side, for state that needs to enqueue follow-up work
pub struct WeakQueueHandle<S> {
    tx: mpsc::WeakUnboundedSender<Task<S>>,
}

impl<S> Clone for WeakQueueHandle<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S> WeakQueueHandle<S> {
    pub fn upgrade(&self) -> Option<QueueHandle<S>> {
        self.tx.upgrade().map(|tx| QueueHandle { tx })
    }
}

/// Single-worker FIFO task queue owning a state value
///
/// A task that panics is logged and skipped. Whatever it changed before the
/// panic stays in the state, and its [`Reply`] resolves to `QueueClosed`.
pub struct ReconfigurationQueue<S> {
    handle: QueueHandle<S>,
    worker: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> ReconfigurationQueue<S> {
    /// Spawn the worker thread with an initial state
    pub fn spawn(name: &str, state: S) -> SessionResult<Self> {
        Self::spawn_with(name, |_| state)
    }

    /// Spawn the worker, building the state from a weak handle to the queue
    pub fn spawn_with<F>(name: &str, init: F) -> SessionResult<Self>
    where
        F: FnOnce(WeakQueueHandle<S>) -> S,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task<S>>();
        let handle = QueueHandle { tx };
        let mut state = init(handle.downgrade());

        let worker_name = name.to_string();
        let worker = thread::Builder::new()
            .name(worker_name.clone())
            .spawn(move || {
                tracing::debug!("Queue worker {} started", worker_name);
                while let Some(task) = rx.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(|| task(&mut state))).is_err() {
                        tracing::error!("Task on {} panicked; continuing", worker_name);
                    }
                }
                tracing::debug!("Queue worker {} stopped", worker_name);
            })?;

        Ok(Self {
            handle,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> QueueHandle<S> {
        self.handle.clone()
    }

    pub fn submit<F>(&self, task: F) -> SessionResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.handle.submit(task)
    }

    pub fn run<F, R>(&self, task: F) -> Reply<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.run(task)
    }

    pub fn flush(&self) -> Reply<()> {
        self.handle.flush()
    }

    /// Stop accepting work from this owner and wait for the worker to drain
    ///
    /// The worker exits once every outstanding handle is dropped. Blocks, so
    /// call it outside async contexts.
    pub fn shutdown(mut self) {
        let worker = self.worker.take();
        drop(self);
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Queue worker exited abnormally");
            }
        }
    }
}
