//! # Availability Pool
//!
//! A bounded set of worker handles used as a counting admission-control
//! primitive. A caller must [`acquire`](AvailabilityPool::acquire) a handle before
//! using its worker; the returned [`Lease`] gives it back when dropped, or removes
//! it for good with [`Lease::evict`].
//!
//! Handles in the pool plus handles checked out always add up to [`live`](AvailabilityPool::live).
//! Eviction is the only thing that lowers that number, and after
//! [`close`](AvailabilityPool::close) returned handles are dropped instead of
//! going back into the pool.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;

struct Shared<T> {
    idle_tx: mpsc::Sender<T>,

    /// Waiters queue on this mutex, which hands it out in FIFO order
    idle_rx: Mutex<mpsc::Receiver<T>>,

    live: AtomicUsize,
    is_closed: AtomicBool,
    closed: CancellationToken,

    /// Cancelled once every handle has been evicted
    exhausted: CancellationToken,
}

impl<T> Shared<T> {
    fn release(&self, item: T) {
        if self.is_closed.load(Ordering::SeqCst) {
            debug!("pool closed, discarding returned handle");
            return;
        }
        // Capacity is the initial handle count and live never grows, so this
        // can only fail once the pool is gone
        if self.idle_tx.try_send(item).is_err() {
            debug!("pool unavailable, discarding returned handle");
        }
    }

    fn evict(&self) {
        let remaining = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(remaining, "evicted handle from pool");
        if remaining == 0 {
            self.exhausted.cancel();
        }
    }
}

/// A fixed-capacity pool of handles, shared by cloning.
pub struct AvailabilityPool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AvailabilityPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for AvailabilityPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvailabilityPool")
            .field("live", &self.live())
            .field("idle", &self.idle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> AvailabilityPool<T> {
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::SeqCst)
    }

    /// Handles that exist, idle or checked out.
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Handles waiting in the pool.
    pub fn idle(&self) -> usize {
        self.shared.idle_tx.max_capacity() - self.shared.idle_tx.capacity()
    }
}

impl<T: Send + 'static> AvailabilityPool<T> {
    /// Creates a pool seeded with every handle in `items`.
    pub fn new(items: Vec<T>) -> Self {
        let capacity = items.len().max(1);
        let (idle_tx, idle_rx) = mpsc::channel(capacity);

        let live = items.len();
        for item in items {
            // Fresh channel with room for every item
            let _ = idle_tx.try_send(item);
        }

        let exhausted = CancellationToken::new();
        if live == 0 {
            exhausted.cancel();
        }

        Self {
            shared: Arc::new(Shared {
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
                live: AtomicUsize::new(live),
                is_closed: AtomicBool::new(false),
                closed: CancellationToken::new(),
                exhausted,
            }),
        }
    }

    /// Waits for an idle handle.
    ///
    /// Callers are served in the order they started waiting. Fails with
    /// [`EngineError::Closed`] once the pool is closed, including for callers
    /// already waiting, and with [`EngineError::WorkerUnavailable`] once every
    /// handle has been evicted.
    pub async fn acquire(&self) -> Result<Lease<T>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }

        let shared = &self.shared;
        let item = tokio::select! {
            biased;

            _ = shared.closed.cancelled() => return Err(EngineError::Closed),
            _ = shared.exhausted.cancelled() => {
                return Err(EngineError::WorkerUnavailable("every worker has been evicted".into()));
            }
            item = async { shared.idle_rx.lock().await.recv().await } => item,
        };

        match item {
            Some(item) => Ok(Lease {
                item: Some(item),
                shared: self.shared.clone(),
            }),
            None => Err(EngineError::Closed),
        }
    }

    /// Stops handing out handles. Waiters fail with [`EngineError::Closed`] and
    /// handles returned from now on are dropped.
    pub fn close(&self) {
        if !self.shared.is_closed.swap(true, Ordering::SeqCst) {
            self.shared.closed.cancel();
        }
    }

    /// Takes every handle currently idle out of a closed pool.
    pub async fn drain_idle(&self) -> Vec<T> {
        let mut idle_rx = self.shared.idle_rx.lock().await;
        let mut drained = vec![];
        while let Ok(item) = idle_rx.try_recv() {
            drained.push(item);
        }
        drained
    }
}

/// A handle checked out of an [`AvailabilityPool`].
///
/// Dropping the lease returns the handle. [`Lease::evict`] removes it instead.
pub struct Lease<T> {
    item: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T> Lease<T> {
    /// Removes the handle from the pool for good and hands it to the caller.
    pub fn evict(mut self) -> Option<T> {
        let item = self.item.take();
        if item.is_some() {
            self.shared.evict();
        }
        item
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("lease holds its handle until dropped or evicted"),
        }
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("lease holds its handle until dropped or evicted"),
        }
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.shared.release(item);
        }
    }
}
