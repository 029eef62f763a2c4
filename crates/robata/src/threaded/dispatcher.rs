use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info};

use super::worker::{serve_queue, WorkerHandle};
use crate::communication::{GenerationRequest, IncrementStream, QueueItem};
use crate::engine::{GenerationParams, InferenceEngine, TextStream};
use crate::error::EngineError;

/// # ThreadPoolEngine
///
/// An [`InferenceEngine`] that fans one shared FIFO queue out to a fixed set of
/// in-process model instances, each served by its own background task.
///
/// `generate_stream` enqueues the request together with a private output channel
/// and returns a stream over that channel; it never waits for a worker to free up.
/// Queued requests are picked up in submission order.
///
/// Must be constructed inside a tokio runtime. Dropping the engine shuts it down.
///
/// ```rust
/// use robata::engine::{EchoEngine, GenerationParams, InferenceEngine};
/// use robata::threaded::ThreadPoolEngine;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), robata::EngineError> {
/// let engine = ThreadPoolEngine::new(vec![EchoEngine::new(), EchoEngine::new()]);
/// let params = GenerationParams::default();
///
/// // The echo model streams deltas, so `generate` keeps only the final character
/// assert_eq!(engine.generate("hi", &params).await?, "i");
/// # Ok(())
/// # }
/// ```
pub struct ThreadPoolEngine {
    /// Requests waiting for a free worker, oldest first
    waiting_requests: Arc<Mutex<VecDeque<QueueItem>>>,

    /// Wakes idle workers when a request is enqueued
    work_notifier: Arc<Notify>,

    /// One handle per model instance
    workers: std::sync::Mutex<Vec<WorkerHandle>>,

    /// Number of workers spawned at construction
    size: usize,

    closed: AtomicBool,
}

impl ThreadPoolEngine {
    /// Spawns one worker per engine instance.
    ///
    /// With no engines every request fails with [`EngineError::WorkerUnavailable`].
    pub fn new<E>(engines: Vec<E>) -> Self
    where
        E: InferenceEngine + 'static,
    {
        let waiting_requests = Arc::new(Mutex::new(VecDeque::new()));
        let work_notifier = Arc::new(Notify::new());

        let workers = engines
            .into_iter()
            .enumerate()
            .map(|(index, engine)| {
                let waiting_requests = waiting_requests.clone();
                WorkerHandle::new(work_notifier.clone(), move |running, notifier| {
                    tokio::spawn(serve_queue(engine, index, running, notifier, waiting_requests))
                })
            })
            .collect::<Vec<_>>();
        let size = workers.len();
        info!(workers = size, "thread-pool engine started");

        Self {
            waiting_requests,
            work_notifier,
            workers: std::sync::Mutex::new(workers),
            size,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of requests not yet picked up by a worker.
    pub async fn queued(&self) -> usize {
        self.waiting_requests.lock().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting requests and stops every worker after its current request.
    ///
    /// Requests still waiting in the queue are dropped; their streams end with
    /// [`EngineError::Closed`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        drop(workers);

        match self.waiting_requests.try_lock() {
            Ok(mut queue) => clear_queue(&mut queue),
            Err(_) => {
                // A caller holds the lock right now; clear once it lets go
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let waiting_requests = self.waiting_requests.clone();
                    runtime.spawn(async move {
                        clear_queue(&mut *waiting_requests.lock().await);
                    });
                }
            }
        }
        info!("thread-pool engine shut down");
    }
}

#[async_trait]
impl InferenceEngine for ThreadPoolEngine {
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.size == 0 {
            return Err(EngineError::WorkerUnavailable(
                "thread pool has no workers".into(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let request = GenerationRequest::new(prompt, params.clone());
        debug!(request_id = %request.id, "enqueueing request");
        {
            let mut queue = self.waiting_requests.lock().await;
            // Checked again under the lock so shutdown cannot strand the item
            if self.is_closed() {
                return Err(EngineError::Closed);
            }
            queue.push_back(QueueItem::new(request, tx));
        }
        // Notify a worker that new work is available
        self.work_notifier.notify_one();
        Ok(Box::pin(IncrementStream::new(rx)))
    }
}

fn clear_queue(queue: &mut VecDeque<QueueItem>) {
    let dropped = queue.len();
    queue.clear();
    if dropped > 0 {
        debug!(dropped, "dropped queued requests on shutdown");
    }
}

impl Drop for ThreadPoolEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EchoEngine;
    use futures::stream;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn drain(mut stream: TextStream) -> Vec<String> {
        let mut items = vec![];
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }
        items
    }

    /// Records how many generations run at once.
    struct GaugedEngine {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InferenceEngine for GaugedEngine {
        async fn generate_stream(
            &self,
            prompt: &str,
            _params: &GenerationParams,
        ) -> Result<TextStream, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;

            let active = self.active.clone();
            let finished = self.finished.clone();
            let parts: Vec<String> = prompt.split(' ').map(String::from).collect();
            let stream = stream::iter(parts).then(move |part| {
                let active = active.clone();
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if part == "last" {
                        active.fetch_sub(1, Ordering::SeqCst);
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok::<_, EngineError>(part)
                }
            });
            Ok(Box::pin(stream))
        }
    }

    struct PanickingEngine;

    #[async_trait]
    impl InferenceEngine for PanickingEngine {
        async fn generate_stream(
            &self,
            prompt: &str,
            _params: &GenerationParams,
        ) -> Result<TextStream, EngineError> {
            if prompt == "panic" {
                panic!("model crashed");
            }
            Ok(Box::pin(stream::iter(vec![Ok::<_, EngineError>(prompt.to_string())])))
        }
    }

    #[tokio::test]
    async fn test_single_request_streams_all_increments() {
        let engine = ThreadPoolEngine::new(vec![EchoEngine::new()]);
        let stream = engine
            .generate_stream("hello", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(drain(stream).await.concat(), "hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_do_not_interleave() {
        let engine = Arc::new(ThreadPoolEngine::new(vec![
            EchoEngine::new().with_delay(Duration::from_millis(1)),
            EchoEngine::new().with_delay(Duration::from_millis(1)),
        ]));

        let handles = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let prompt = format!("request-{i}");
                    let stream = engine
                        .generate_stream(&prompt, &GenerationParams::default())
                        .await
                        .unwrap();
                    (prompt, drain(stream).await.concat())
                })
            })
            .collect::<Vec<_>>();

        for handle in futures::future::join_all(handles).await {
            let (prompt, text) = handle.unwrap();
            assert_eq!(prompt, text);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_bound_parallelism() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let engines = (0..2)
            .map(|_| GaugedEngine {
                active: active.clone(),
                peak: peak.clone(),
                finished: finished.clone(),
            })
            .collect();
        let engine = Arc::new(ThreadPoolEngine::new(engines));

        let handles = (0..6)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let stream = engine
                        .generate_stream("a b last", &GenerationParams::default())
                        .await
                        .unwrap();
                    drain(stream).await
                })
            })
            .collect::<Vec<_>>();

        for handle in futures::future::join_all(handles).await {
            assert_eq!(handle.unwrap(), vec!["a", "b", "last"]);
        }
        assert_eq!(finished.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_block_next() {
        let engine =
            ThreadPoolEngine::new(vec![EchoEngine::new().with_delay(Duration::from_millis(2))]);
        let params = GenerationParams::default();

        let mut first = engine.generate_stream("abandoned", &params).await.unwrap();
        assert_eq!(first.next().await.unwrap().unwrap(), "a");
        drop(first);

        let second = engine.generate_stream("next", &params).await.unwrap();
        assert_eq!(drain(second).await.concat(), "next");
    }

    #[tokio::test]
    async fn test_panicking_model_reports_error_and_survives() {
        let engine = ThreadPoolEngine::new(vec![PanickingEngine]);
        let params = GenerationParams::default();

        let mut stream = engine.generate_stream("panic", &params).await.unwrap();
        assert!(matches!(stream.next().await, Some(Err(EngineError::Worker(_)))));
        assert!(stream.next().await.is_none());

        let stream = engine.generate_stream("fine", &params).await.unwrap();
        assert_eq!(drain(stream).await, vec!["fine"]);
    }

    #[tokio::test]
    async fn test_generate_after_shutdown_fails_fast() {
        let engine = ThreadPoolEngine::new(vec![EchoEngine::new()]);
        engine.shutdown();

        let result = engine.generate_stream("late", &GenerationParams::default()).await;
        assert!(matches!(result, Err(EngineError::Closed)));
        assert!(engine.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_requests_and_finishes_in_flight() {
        let engine =
            ThreadPoolEngine::new(vec![EchoEngine::new().with_delay(Duration::from_millis(10))]);
        let params = GenerationParams::default();

        let in_flight = engine.generate_stream("busy", &params).await.unwrap();
        while engine.queued().await > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let mut queued = engine.generate_stream("queued", &params).await.unwrap();
        assert_eq!(engine.queued().await, 1);

        engine.shutdown();
        assert!(matches!(queued.next().await, Some(Err(EngineError::Closed))));
        assert!(queued.next().await.is_none());
        assert_eq!(drain(in_flight).await.concat(), "busy");
    }

    #[tokio::test]
    async fn test_engine_without_workers_fails_fast() {
        let engine = ThreadPoolEngine::new(Vec::<EchoEngine>::new());
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            engine.generate_stream("q", &GenerationParams::default()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(EngineError::WorkerUnavailable(_))));
    }
}
