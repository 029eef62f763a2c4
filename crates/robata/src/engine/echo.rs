use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use super::{GenerationParams, InferenceEngine, TextStream};
use crate::error::EngineError;
use crate::stop::{check_stop, StopMatch};

/// A deterministic in-process model.
///
/// Streams either a fixed reply or the prompt itself back one character at a
/// time, as deltas. `max_new_tokens` caps the number of characters and the
/// reply is cut before the first complete stop sequence. It stands in for a
/// real model wherever one is not wanted: smoke-testing worker processes,
/// exercising dispatchers, local development.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    reply: Option<String>,
    delay: Duration,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `reply` instead of echoing the prompt.
    pub fn with_reply<S: Into<String>>(mut self, reply: S) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Sleep for `delay` before every increment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn completion(&self, prompt: &str, params: &GenerationParams) -> String {
        let text: String = self
            .reply
            .as_deref()
            .unwrap_or(prompt)
            .chars()
            .take(params.max_new_tokens)
            .collect();
        match check_stop(&text, &params.stop) {
            StopMatch::Full(index) => text[..index].to_string(),
            _ => text,
        }
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError> {
        let increments: Vec<String> = self
            .completion(prompt, params)
            .chars()
            .map(String::from)
            .collect();
        let delay = self.delay;

        let stream = stream::unfold(increments.into_iter(), move |mut increments| async move {
            let next = increments.next()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok::<_, EngineError>(next), increments))
        });
        Ok(Box::pin(stream))
    }
}
