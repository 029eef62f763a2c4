//! # Robata
//!
//! A streaming inference dispatch layer: turns single-request text-generation
//! models into a concurrency-safe service that many callers can stream from at
//! once, without interleaving their output or leaking workers.
//!
//! ## Overview
//!
//! Everything is built around one capability, [`InferenceEngine`](engine::InferenceEngine):
//! given a prompt and [`GenerationParams`](engine::GenerationParams), produce a live
//! stream of text increments. Three interchangeable implementations cover the
//! usual deployment topologies:
//!
//! - [`RemoteClient`](remote::RemoteClient) - a text-generation server reached over
//!   chunked HTTP, with stop-sequence aware trimming
//! - [`ThreadPoolEngine`](threaded::ThreadPoolEngine) - in-process model instances
//!   sharing one FIFO request queue
//! - [`ProcessPoolEngine`](process::ProcessPoolEngine) - one worker process per
//!   accelerator, with pool-based admission control
//!
//! Which one a service uses is decided at startup, typically from an
//! [`EngineConfig`](config::EngineConfig).
//!
//! ## Stream framing
//!
//! Dispatchers move [`GenerationRequest`](communication::GenerationRequest)s to
//! workers and [`StreamIncrement`](communication::StreamIncrement)s back. Every
//! request ends with exactly one `End` increment, always the last one sent.
//!
//! ## Cancellation
//!
//! Dropping a stream stops the caller from reading; it does not stop the model.
//! The worker finishes its current request before taking the next one.
//!
//! ## Features
//!
//! - **remote** - the HTTP client engine
//! - **process** - the process-pool engine and the `robata-worker` binary
//!
//! Both are enabled by default.

pub mod communication;
pub mod config;
pub mod engine;
pub mod qa;
pub mod stop;
pub mod threaded;

mod error;

#[cfg(feature = "remote")]
#[cfg_attr(docsrs, doc(cfg(feature = "remote")))]
pub mod remote;

#[cfg(feature = "process")]
#[cfg_attr(docsrs, doc(cfg(feature = "process")))]
pub mod process;

pub use error::{ConfigError, EngineError};
