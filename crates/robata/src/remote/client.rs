use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use super::wire::{frames, GenerateRequest, TextFrame};
use crate::communication::GenerationRequest;
use crate::engine::{GenerationParams, InferenceEngine, TextStream};
use crate::error::{ConfigError, EngineError};
use crate::stop::{check_stop, trim_echo, StopFilter, StopMatch, Visible};

/// # RemoteClient
///
/// An [`InferenceEngine`] backed by an HTTP text-generation endpoint.
///
/// Every request is a `POST {base_url}/generate`. A streaming response is a
/// sequence of NUL or newline delimited frames, each carrying the cumulative text
/// generated so far. The client trims the echoed prompt from every frame and
/// withholds frames that end in a partial stop sequence, so callers only ever see
/// text that will not be taken back.
///
/// Transport failures are surfaced as-is; nothing is retried.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteClient {
    pub fn new<S: AsRef<str>>(base_url: S) -> Self {
        Self::from_client(reqwest::Client::new(), base_url)
    }

    /// Creates a client that sends `headers` with every request.
    pub fn with_headers<S, I, K, V>(base_url: S, headers: I) -> Result<Self, ConfigError>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_ref().as_bytes())
                .map_err(|e| {
                    ConfigError::Invalid(format!("header name {:?}: {e}", name.as_ref()))
                })?;
            let value = HeaderValue::from_str(value.as_ref())
                .map_err(|e| ConfigError::Invalid(format!("header {name}: {e}")))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self::from_client(client, base_url))
    }

    /// Wraps an already configured [`reqwest::Client`].
    pub fn from_client<S: AsRef<str>>(client: reqwest::Client, base_url: S) -> Self {
        let endpoint = format!("{}/generate", base_url.as_ref().trim_end_matches('/'));
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, EngineError> {
        let body = GenerateRequest {
            prompt: &request.prompt,
            stream,
            max_tokens: request.params.max_new_tokens,
            stop: request.params.stop.as_slice(),
            extra: &request.params.extra,
        };
        debug!(
            request_id = %request.id,
            endpoint = %self.endpoint,
            stream,
            "sending generate request"
        );

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(request_id = %request.id, status = status.as_u16(), "generate request rejected");
            return Err(EngineError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl InferenceEngine for RemoteClient {
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError> {
        let request = GenerationRequest::new(prompt, params.clone());
        let response = self.send(&request, true).await?;

        Ok(Box::pin(visible_frames(response, request)))
    }

    /// Sends a non-streaming request and returns the visible text of its single frame.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        let request = GenerationRequest::new(prompt, params.clone());
        let response = self.send(&request, false).await?;

        // The final frame holds the whole answer, delimited or not
        let mut body = Box::pin(frames(response.bytes_stream()));
        let mut last = None;
        while let Some(frame) = body.next().await {
            last = Some(frame?);
        }
        let frame = last.ok_or_else(|| EngineError::Protocol("empty response body".into()))?;
        let text = TextFrame::decode(&frame)?;

        let visible = trim_echo(&request.prompt, &text, params.echo_prompt);
        let visible = match check_stop(visible, &params.stop) {
            StopMatch::Full(index) => &visible[..index],
            _ => visible,
        };
        Ok(visible.to_string())
    }
}

/// Turns a streaming response body into the caller-visible increments.
fn visible_frames(
    response: reqwest::Response,
    request: GenerationRequest,
) -> impl Stream<Item = Result<String, EngineError>> + Send {
    try_stream! {
        let GenerationRequest { id, prompt, params } = request;
        let mut filter = StopFilter::new(params.stop);
        let mut body = Box::pin(frames(response.bytes_stream()));
        let mut received = 0usize;

        while let Some(frame) = body.next().await {
            received += 1;
            let text = TextFrame::decode(&frame?)?;
            match filter.observe(trim_echo(&prompt, &text, params.echo_prompt)) {
                Visible::Emit(visible) => {
                    yield visible;
                }
                Visible::Withhold => {}
                Visible::Stop(visible) => {
                    if let Some(visible) = visible {
                        yield visible;
                    }
                    break;
                }
            }
        }

        if let Some(visible) = filter.finish() {
            yield visible;
        }
        debug!(request_id = %id, frames = received, "remote stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalizes_trailing_slashes() {
        assert_eq!(RemoteClient::new("http://host:8080").endpoint(), "http://host:8080/generate");
        assert_eq!(RemoteClient::new("http://host:8080//").endpoint(), "http://host:8080/generate");
    }

    #[test]
    fn test_with_headers_rejects_invalid_header() {
        let ok = RemoteClient::with_headers("http://host", [("x-api-key", "secret")]);
        assert!(ok.is_ok());

        let bad_name = RemoteClient::with_headers("http://host", [("bad header", "v")]);
        assert!(matches!(bad_name, Err(ConfigError::Invalid(_))));

        let bad_value = RemoteClient::with_headers("http://host", [("x-key", "line\nbreak")]);
        assert!(matches!(bad_value, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_transport_error() {
        let client = RemoteClient::new("http://127.0.0.1:1");
        let result = client.generate_stream("q", &GenerationParams::default()).await;
        assert!(matches!(result, Err(EngineError::Transport(_))));
    }
}
