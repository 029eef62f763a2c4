//! # Process-Pool Dispatcher
//!
//! Parallelizes generation across independent accelerator devices that cannot
//! share one process's memory.
//!
//! ## Module Structure
//!
//! * [`channel`] - the duplex message channel between dispatcher and worker
//! * [`pool`] - [`AvailabilityPool`], admission control over the worker handles
//! * [`spawn`] - [`WorkerCommand`], how worker processes are launched
//! * [`dispatcher`] - [`ProcessPoolEngine`], the [`InferenceEngine`](crate::engine::InferenceEngine) callers talk to
//! * [`worker`] - what runs inside each worker process
//!
//! ## Channel protocol
//!
//! Each message on a channel is either a [`GenerationRequest`](crate::communication::GenerationRequest)
//! sent to the worker or a [`StreamIncrement`](crate::communication::StreamIncrement)
//! sent back. `StreamIncrement::End` is the only sentinel: it ends every request
//! and is also the ready acknowledgment a worker sends after loading its model.

pub mod channel;
pub mod dispatcher;
pub mod pool;
pub mod spawn;
pub mod worker;

pub use channel::{duplex_pair, DispatcherEndpoint, Endpoint, WorkerEndpoint, MAX_FRAME_LENGTH};
pub use dispatcher::{ProcessPoolEngine, ProcessPoolOptions, WorkerSlot};
pub use pool::{AvailabilityPool, Lease};
pub use spawn::{detect_accelerators, WorkerCommand};
pub use worker::{run_worker, serve, ModelLoader, WorkerOptions};
