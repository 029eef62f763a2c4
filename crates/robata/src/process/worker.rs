//! # Worker side
//!
//! What runs inside each worker process: load one model pinned to one device,
//! optionally acknowledge readiness, then serve requests one at a time until the
//! dispatcher closes the channel.
//!
//! The model is constructed once by a [`ModelLoader`] and passed down explicitly,
//! so the process holds no global model state.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use robata::engine::EchoEngine;
//! use robata::process::{run_worker, ModelLoader, WorkerEndpoint, WorkerOptions};
//! use robata::EngineError;
//!
//! struct Loader;
//!
//! #[async_trait]
//! impl ModelLoader for Loader {
//!     type Engine = EchoEngine;
//!
//!     async fn load(self, _device: usize) -> Result<EchoEngine, EngineError> {
//!         Ok(EchoEngine::new())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), EngineError> {
//! let options = WorkerOptions::new(0).with_signal_ready(true);
//! run_worker(Loader, options, WorkerEndpoint::stdio()).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::channel::WorkerEndpoint;
use crate::communication::{GenerationRequest, StreamIncrement};
use crate::engine::InferenceEngine;
use crate::error::EngineError;

/// Builds the model a worker serves.
#[async_trait]
pub trait ModelLoader: Send {
    type Engine: InferenceEngine;

    /// Loads the model onto `device`.
    async fn load(self, device: usize) -> Result<Self::Engine, EngineError>;
}

/// Startup options of one worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Accelerator index the model is pinned to
    pub device: usize,

    /// Send an `End` acknowledgment once the model is loaded
    pub signal_ready: bool,

    /// Exit after serving this many requests
    pub max_requests: Option<usize>,
}

impl WorkerOptions {
    pub fn new(device: usize) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    pub fn with_signal_ready(mut self, signal_ready: bool) -> Self {
        self.signal_ready = signal_ready;
        self
    }

    pub fn with_max_requests(mut self, max_requests: Option<usize>) -> Self {
        self.max_requests = max_requests;
        self
    }
}

/// Runs a worker's whole lifecycle and returns how many requests it served.
///
/// If loading fails and readiness was requested, the failure is reported to the
/// dispatcher as an `Error` increment before returning.
pub async fn run_worker<L>(
    loader: L,
    options: WorkerOptions,
    mut endpoint: WorkerEndpoint,
) -> Result<usize, EngineError>
where
    L: ModelLoader,
{
    let device = options.device;
    info!(device, "loading model");
    let engine = match loader.load(device).await {
        Ok(engine) => engine,
        Err(err) => {
            warn!(device, error = %err, "model failed to load");
            if options.signal_ready {
                endpoint.send(&StreamIncrement::Error(err.to_string())).await?;
            }
            return Err(err);
        }
    };

    if options.signal_ready {
        endpoint.send(&StreamIncrement::End).await?;
    }
    info!(device, "worker ready");

    let served = serve(&engine, &mut endpoint, options.max_requests).await?;
    info!(device, served, "worker exiting");
    Ok(served)
}

/// Serves requests one at a time until the dispatcher closes the channel or
/// `max_requests` have been served.
pub async fn serve<E>(
    engine: &E,
    endpoint: &mut WorkerEndpoint,
    max_requests: Option<usize>,
) -> Result<usize, EngineError>
where
    E: InferenceEngine + ?Sized,
{
    let mut served = 0;
    while max_requests.is_none_or(|max| served < max) {
        let Some(request) = endpoint.recv().await? else {
            debug!("dispatcher closed the channel");
            break;
        };
        serve_one(engine, endpoint, request).await?;
        served += 1;
    }
    Ok(served)
}

async fn serve_one<E>(
    engine: &E,
    endpoint: &mut WorkerEndpoint,
    request: GenerationRequest,
) -> Result<(), EngineError>
where
    E: InferenceEngine + ?Sized,
{
    debug!(request_id = %request.id, "serving request");
    match engine.generate_stream(&request.prompt, &request.params).await {
        Ok(mut stream) => {
            while let Some(increment) = stream.next().await {
                match increment {
                    Ok(text) => match endpoint.send(&StreamIncrement::Text(text)).await {
                        Ok(()) => {}
                        Err(err) if err.is_unsent() => {
                            warn!(request_id = %request.id, error = %err, "increment not sent");
                            endpoint.send(&StreamIncrement::Error(err.to_string())).await?;
                            break;
                        }
                        Err(err) => return Err(err),
                    },
                    Err(err) => {
                        warn!(request_id = %request.id, error = %err, "generation failed");
                        endpoint.send(&StreamIncrement::Error(err.to_string())).await?;
                        break;
                    }
                }
            }
        }
        Err(err) => {
            warn!(request_id = %request.id, error = %err, "generation failed to start");
            endpoint.send(&StreamIncrement::Error(err.to_string())).await?;
        }
    }
    endpoint.send(&StreamIncrement::End).await
}
