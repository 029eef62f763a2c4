//! # Remote Streaming Client
//!
//! An [`InferenceEngine`](crate::engine::InferenceEngine) backed by a text-generation
//! server speaking the vLLM-style `/generate` protocol over chunked HTTP.
//!
//! Every streamed frame carries the *cumulative* text generated so far, so each
//! item yielded by [`RemoteClient`] is the full visible answer at that point rather
//! than a delta. End of stream is the server closing the response.

mod client;
mod wire;

pub use client::RemoteClient;
pub use wire::{frames, GenerateRequest, TextFrame, MAX_RESPONSE_FRAME};
