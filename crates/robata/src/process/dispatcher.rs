use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use tokio::process::Child;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::DispatcherEndpoint;
use super::pool::{AvailabilityPool, Lease};
use super::spawn::{detect_accelerators, WorkerCommand};
use crate::communication::{GenerationRequest, StreamIncrement};
use crate::engine::{GenerationParams, InferenceEngine, TextStream};
use crate::error::EngineError;

/// How long shutdown waits for an idle worker process to exit on its own.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// One worker as seen by the dispatcher: its channel and, for spawned workers,
/// its process.
pub struct WorkerSlot {
    index: usize,
    endpoint: DispatcherEndpoint,
    child: Option<Child>,
}

impl WorkerSlot {
    pub fn new(index: usize, endpoint: DispatcherEndpoint) -> Self {
        Self {
            index,
            endpoint,
            child: None,
        }
    }

    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits for the load-complete acknowledgment.
    async fn await_ready(&mut self) -> Result<(), EngineError> {
        match self.endpoint.recv().await? {
            Some(StreamIncrement::End) => {
                debug!(worker = self.index, "worker ready");
                Ok(())
            }
            Some(StreamIncrement::Error(message)) => Err(EngineError::WorkerUnavailable(format!(
                "worker {} failed to load: {message}",
                self.index
            ))),
            Some(StreamIncrement::Text(_)) => Err(EngineError::Protocol(format!(
                "worker {} sent text before its ready acknowledgment",
                self.index
            ))),
            None => Err(EngineError::WorkerUnavailable(format!(
                "worker {} exited before becoming ready",
                self.index
            ))),
        }
    }

    /// Whether the worker process is known to have exited.
    fn has_exited(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => {
                warn!(worker = self.index, %status, "worker process exited");
                true
            }
            Some(Err(err)) => {
                warn!(worker = self.index, error = %err, "worker process is unreachable");
                true
            }
            Some(Ok(None)) | None => false,
        }
    }

    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }

    async fn close(mut self) {
        if let Err(err) = self.endpoint.close().await {
            debug!(worker = self.index, error = %err, "worker channel already closed");
        }
        if let Some(child) = self.child.as_mut() {
            if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
                warn!(worker = self.index, "worker did not exit, killing it");
                let _ = child.start_kill();
            }
        }
    }
}

/// Options for [`ProcessPoolEngine::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPoolOptions {
    /// Number of worker processes; defaults to the accelerator count
    pub num_workers: Option<usize>,

    /// Block construction until every worker has loaded its model
    pub wait_ready: bool,
}

impl Default for ProcessPoolOptions {
    fn default() -> Self {
        Self {
            num_workers: None,
            wait_ready: true,
        }
    }
}

impl ProcessPoolOptions {
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    pub fn with_wait_ready(mut self, wait_ready: bool) -> Self {
        self.wait_ready = wait_ready;
        self
    }
}

/// # ProcessPoolEngine
///
/// An [`InferenceEngine`] that spreads requests over a fixed set of worker
/// processes, one per accelerator, each holding its own model.
///
/// A request first acquires an idle worker from an [`AvailabilityPool`] of
/// capacity N, so at most N requests are ever assigned at once and further
/// callers wait their turn. The request is then sent over that worker's channel
/// and its increments are relayed until the `End` sentinel.
///
/// The worker goes back to the pool exactly once on every exit path:
///
/// * the stream reached `End`: returned immediately
/// * the caller dropped the stream early: a background task reads the rest of the
///   request off the channel, then returns the worker, so the next request never
///   sees a previous request's increments
/// * the channel broke or the process died: the worker is evicted and its process
///   killed
///
/// After [`shutdown`](ProcessPoolEngine::shutdown) no new work is dispatched and
/// workers still serving a request are discarded when it completes.
pub struct ProcessPoolEngine {
    pool: AvailabilityPool<WorkerSlot>,
}

impl ProcessPoolEngine {
    /// Builds a dispatcher over already connected workers.
    pub fn from_slots(slots: Vec<WorkerSlot>) -> Self {
        info!(workers = slots.len(), "process-pool engine started");
        Self {
            pool: AvailabilityPool::new(slots),
        }
    }

    /// Launches the worker processes, one per device index.
    pub async fn spawn(
        command: &WorkerCommand,
        options: ProcessPoolOptions,
    ) -> Result<Self, EngineError> {
        let num_workers = options.num_workers.unwrap_or_else(detect_accelerators);
        if num_workers == 0 {
            return Err(EngineError::WorkerUnavailable(
                "a process pool needs at least one worker".into(),
            ));
        }

        let mut slots = Vec::with_capacity(num_workers);
        for device in 0..num_workers {
            let (child, endpoint) = command.spawn(device, options.wait_ready)?;
            slots.push(WorkerSlot::new(device, endpoint).with_child(child));
        }

        if options.wait_ready {
            // Any failure drops every slot, which kills the processes
            futures::future::try_join_all(slots.iter_mut().map(|slot| slot.await_ready())).await?;
            info!(workers = num_workers, "all workers ready");
        }
        Ok(Self::from_slots(slots))
    }

    /// Workers not evicted so far.
    pub fn live_workers(&self) -> usize {
        self.pool.live()
    }

    /// Workers waiting for a request.
    pub fn idle_workers(&self) -> usize {
        self.pool.idle()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Stops dispatching and closes every idle worker's channel.
    ///
    /// Workers serving a request are not interrupted; they are discarded instead
    /// of returned once their request completes.
    pub async fn shutdown(&self) {
        self.pool.close();
        let idle = self.pool.drain_idle().await;
        let closing = idle.len();
        futures::future::join_all(idle.into_iter().map(WorkerSlot::close)).await;
        info!(closed = closing, "process-pool engine shut down");
    }

    /// Acquires a worker whose process is still alive.
    async fn checkout(&self) -> Result<Lease<WorkerSlot>, EngineError> {
        loop {
            let mut lease = self.pool.acquire().await?;
            if !lease.has_exited() {
                return Ok(lease);
            }
            evict(lease, "process exited while idle");
        }
    }
}

#[async_trait]
impl InferenceEngine for ProcessPoolEngine {
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError> {
        let request = GenerationRequest::new(prompt, params.clone());
        let mut lease = self.checkout().await?;
        let worker = lease.index;
        debug!(request_id = %request.id, worker, "dispatching request");

        let sent = lease.endpoint.send(&request).await;
        match sent {
            Ok(()) => {}
            Err(err) if err.is_unsent() => {
                // Nothing was written; dropping the lease returns the worker
                debug!(request_id = %request.id, worker, error = %err, "request refused");
                return Err(err);
            }
            Err(err) => {
                evict(lease, "request could not be sent");
                return Err(EngineError::WorkerUnavailable(format!("worker {worker}: {err}")));
            }
        }
        Ok(Box::pin(relay(Checkout::new(lease, request.id))))
    }
}

impl Drop for ProcessPoolEngine {
    fn drop(&mut self) {
        self.pool.close();
    }
}

fn evict(lease: Lease<WorkerSlot>, reason: &str) {
    if let Some(mut slot) = lease.evict() {
        warn!(worker = slot.index, reason, "evicting worker");
        slot.kill();
    }
}

/// Relays one request's increments until `End`.
fn relay(mut checkout: Checkout) -> impl Stream<Item = Result<String, EngineError>> + Send {
    try_stream! {
        loop {
            match checkout.recv().await? {
                StreamIncrement::Text(text) => {
                    yield text;
                }
                StreamIncrement::Error(message) => {
                    checkout.drain().await;
                    Err::<(), _>(EngineError::Worker(message))?;
                }
                StreamIncrement::End => break,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckoutState {
    /// The request is still producing increments
    InFlight,

    /// `End` was received; the channel is clean
    Finished,

    /// The channel failed; the worker cannot be trusted
    Broken,
}

/// A worker assigned to one request.
///
/// Dropping it settles the worker according to how far the request got.
struct Checkout {
    lease: Option<Lease<WorkerSlot>>,
    request_id: Uuid,
    state: CheckoutState,

    /// Set on the background copy that drains an abandoned request
    draining: bool,
}

impl Checkout {
    fn new(lease: Lease<WorkerSlot>, request_id: Uuid) -> Self {
        Self {
            lease: Some(lease),
            request_id,
            state: CheckoutState::InFlight,
            draining: false,
        }
    }

    async fn recv(&mut self) -> Result<StreamIncrement, EngineError> {
        let Some(lease) = self.lease.as_mut() else {
            return Err(EngineError::Closed);
        };
        match lease.endpoint.recv().await {
            Ok(Some(increment)) => {
                if increment.is_end() {
                    self.state = CheckoutState::Finished;
                }
                Ok(increment)
            }
            Ok(None) => {
                self.state = CheckoutState::Broken;
                Err(EngineError::WorkerUnavailable(format!(
                    "worker {} closed its channel mid-request",
                    lease.index
                )))
            }
            Err(err) => {
                self.state = CheckoutState::Broken;
                Err(err)
            }
        }
    }

    /// Reads and discards increments until the request is over.
    async fn drain(&mut self) {
        let mut discarded = 0usize;
        while self.state == CheckoutState::InFlight {
            match self.recv().await {
                Ok(StreamIncrement::End) => {}
                Ok(_) => discarded += 1,
                Err(_) => break,
            }
        }
        debug!(request_id = %self.request_id, discarded, "drained abandoned request");
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        match self.state {
            CheckoutState::Finished => drop(lease),
            CheckoutState::Broken => evict(lease, "channel broke mid-request"),
            CheckoutState::InFlight if self.draining => evict(lease, "drain was interrupted"),
            CheckoutState::InFlight => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let worker = lease.index;
                    debug!(request_id = %self.request_id, worker, "request abandoned, draining");
                    let mut remainder = Checkout {
                        lease: Some(lease),
                        request_id: self.request_id,
                        state: CheckoutState::InFlight,
                        draining: true,
                    };
                    runtime.spawn(async move { remainder.drain().await });
                }
                Err(_) => evict(lease, "request abandoned outside a runtime"),
            },
        }
    }
}
