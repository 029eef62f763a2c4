//! Background tasks that each own one model instance.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tracing::{debug, error};

use crate::communication::{QueueItem, StreamIncrement};
use crate::engine::InferenceEngine;

/// A handle for managing a background worker task.
///
/// Every worker of a dispatcher shares the dispatcher's notifier, but each has its
/// own running flag, so workers can be stopped independently.
///
/// # Example
///
/// ```ignore
/// let notifier = Arc::new(Notify::new());
/// let worker = WorkerHandle::new(notifier.clone(), |running, notifier| {
///     tokio::spawn(async move {
///         while running.load(Ordering::SeqCst) {
///             notifier.notified().await;
///         }
///     })
/// });
///
/// // Worker will be shut down when dropped
/// ```
pub struct WorkerHandle {
    /// Flag indicating whether the background task should continue running
    running: Arc<AtomicBool>,

    /// Handle to the spawned background task, becomes `None` after shutdown is initiated
    handle: Option<JoinHandle<()>>,

    /// Notification mechanism shared with the other workers of the dispatcher
    notifier: Arc<Notify>,
}

impl WorkerHandle {
    /// Creates a new `WorkerHandle` by spawning a background task.
    ///
    /// `task` receives the worker's running flag and the shared notifier and is
    /// responsible for spawning the actual task.
    pub fn new<F>(notifier: Arc<Notify>, task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let handle = task(running.clone(), notifier.clone());

        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Initiates a graceful shutdown of the background task.
    ///
    /// The task finishes the request it is serving, if any, then exits. Every
    /// waiting worker is woken so it observes the cleared flag.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_waiters();

        if let Some(handle) = self.handle.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = handle.await;
                });
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The loop run by every worker: pull the next request off the shared queue,
/// run it to completion, repeat.
pub(crate) async fn serve_queue<E>(
    engine: E,
    worker: usize,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    waiting_requests: Arc<Mutex<VecDeque<QueueItem>>>,
) where
    E: InferenceEngine,
{
    debug!(worker, "thread-pool worker started");
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let next = { waiting_requests.lock().await.pop_front() };
        match next {
            Some(item) => run_item(&engine, worker, item).await,
            None => {
                // No work to do, wait for notification or check periodically
                let _ = timeout_await_notifier(&notifier).await;
            }
        }
    }
    debug!(worker, "thread-pool worker stopped");
}

/// Runs one request and sends every increment, then `End`, to its requester.
///
/// Sends to an abandoned request fail silently; generation still runs to the end.
async fn run_item<E>(engine: &E, worker: usize, item: QueueItem)
where
    E: InferenceEngine,
{
    let request_id = item.id();
    debug!(worker, %request_id, "serving request");

    let generation = async {
        let request = item.request();
        let mut stream = engine
            .generate_stream(&request.prompt, &request.params)
            .await?;
        while let Some(increment) = stream.next().await {
            let _ = item.sender().send(StreamIncrement::Text(increment?));
        }
        Ok::<(), crate::EngineError>(())
    };

    match AssertUnwindSafe(generation).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(worker, %request_id, error = %e, "generation failed");
            let _ = item.sender().send(StreamIncrement::Error(e.to_string()));
        }
        Err(_) => {
            error!(worker, %request_id, "model panicked during generation");
            let _ = item
                .sender()
                .send(StreamIncrement::Error("model panicked during generation".into()));
        }
    }

    if item.is_abandoned() {
        debug!(worker, %request_id, "request was abandoned by its caller");
    }
    let _ = item.sender().send(StreamIncrement::End);
}

#[inline]
async fn timeout_await_notifier(notifier: &Notify) -> Result<(), Elapsed> {
    tokio::time::timeout(Duration::from_millis(100), notifier.notified()).await
}
