//! # Inference Engine
//!
//! The capability every backend in this crate implements: given a prompt and
//! [`GenerationParams`], produce a live, one-shot stream of text increments.
//!
//! ## Contract
//!
//! - The stream is finite and cannot be restarted.
//! - Increments within one stream arrive in generation order.
//! - A caller may stop consuming at any point by dropping the stream; no
//!   implementation leaks its worker or channel when that happens. Dropping does
//!   not cancel the underlying compute, it only stops the caller from reading.
//! - [`InferenceEngine::generate`] drains the stream and keeps the last increment,
//!   because some backends yield cumulative text rather than deltas.
//!
//! The remote client, the thread-pool dispatcher and the process-pool dispatcher
//! are interchangeable behind `Arc<dyn InferenceEngine>`.

mod echo;
mod params;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::EngineError;

pub use echo::EchoEngine;
pub use params::{GenerationParams, StopSequences};

/// A live sequence of generated text increments.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// # InferenceEngine
///
/// A streaming text-generation backend.
///
/// ```rust
/// use robata::engine::{EchoEngine, GenerationParams, InferenceEngine};
/// use futures::StreamExt;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), robata::EngineError> {
/// let engine = EchoEngine::new().with_reply("hello");
/// let mut stream = engine.generate_stream("prompt", &GenerationParams::default()).await?;
///
/// let mut text = String::new();
/// while let Some(increment) = stream.next().await {
///     text.push_str(&increment?);
/// }
/// assert_eq!(text, "hello");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Starts generating a continuation of `prompt`.
    ///
    /// The returned stream owns everything it needs; `prompt` and `params` are
    /// only borrowed for the duration of this call.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError>;

    /// Generates to completion and returns the last increment produced.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        let mut stream = self.generate_stream(prompt, params).await?;
        let mut text = String::new();
        while let Some(increment) = stream.next().await {
            text = increment?;
        }
        Ok(text)
    }
}

#[async_trait]
impl<E> InferenceEngine for Arc<E>
where
    E: InferenceEngine + ?Sized,
{
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError> {
        (**self).generate_stream(prompt, params).await
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        (**self).generate(prompt, params).await
    }
}

#[async_trait]
impl<E> InferenceEngine for Box<E>
where
    E: InferenceEngine + ?Sized,
{
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError> {
        (**self).generate_stream(prompt, params).await
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        (**self).generate(prompt, params).await
    }
}
