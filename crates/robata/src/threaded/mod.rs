//! # Thread-Pool Dispatcher
//!
//! Shares one or more in-process model instances among concurrent callers.
//!
//! ## Module Structure
//!
//! * [`dispatcher`] - [`ThreadPoolEngine`], the [`InferenceEngine`](crate::engine::InferenceEngine)
//!   callers talk to. It owns the shared FIFO queue.
//! * [`worker`] - [`WorkerHandle`], one background task per model instance, and the
//!   loop each task runs.
//!
//! Requests are served in submission order per worker. With more than one worker,
//! no global order across workers is guaranteed; only the increments of a single
//! request are strictly ordered.
//!
//! Abandoned requests are not cancelled, only ignored: a worker always runs the
//! generation it picked up to completion before taking the next request.

pub mod dispatcher;
pub mod worker;

pub use dispatcher::ThreadPoolEngine;
pub use worker::WorkerHandle;
