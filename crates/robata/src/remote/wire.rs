use std::io;

use bytes::Bytes;
use futures::{future, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;

use crate::error::EngineError;

/// Body of a `POST {base_url}/generate` request.
#[derive(Debug, Serialize)]
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    pub stream: bool,
    pub max_tokens: usize,
    pub stop: &'a [String],
    #[serde(flatten)]
    pub extra: &'a Map<String, Value>,
}

/// One response frame: `{"text": ["<cumulative text>"]}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextFrame {
    pub text: Vec<String>,
}

impl TextFrame {
    /// Parses a frame and returns its first text entry.
    ///
    /// A frame that is not JSON, has no `text` field, or has an empty `text`
    /// list is a protocol error.
    pub fn decode(frame: &[u8]) -> Result<String, EngineError> {
        let parsed: TextFrame = serde_json::from_slice(frame)
            .map_err(|e| EngineError::Protocol(format!("malformed frame: {e}")))?;
        parsed
            .text
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Protocol("frame has an empty text list".into()))
    }
}

/// Longest response frame accepted before the stream is rejected: 16 MiB.
pub const MAX_RESPONSE_FRAME: usize = 16 * 1024 * 1024;

/// Frames are separated by NUL or newline bytes. Neither can appear unescaped
/// inside a JSON document, so either is a safe boundary.
const FRAME_DELIMITERS: &[u8] = b"\0\n";

/// Splits a response body into its frames, however the body was chunked.
///
/// Blank frames are skipped and a trailing frame without a delimiter is still
/// returned.
pub fn frames<S, E>(body: S) -> impl Stream<Item = Result<Bytes, EngineError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    frames_with_limit(body, MAX_RESPONSE_FRAME)
}

fn frames_with_limit<S, E>(
    body: S,
    max_frame_length: usize,
) -> impl Stream<Item = Result<Bytes, EngineError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let codec =
        AnyDelimiterCodec::new_with_max_length(FRAME_DELIMITERS.to_vec(), vec![], max_frame_length);
    FramedRead::new(StreamReader::new(body.map_err(io::Error::other)), codec)
        .map_err(move |err| read_error(err, max_frame_length))
        .try_filter(|frame| future::ready(!is_blank(frame)))
}

fn read_error(err: AnyDelimiterCodecError, max_frame_length: usize) -> EngineError {
    match err {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => {
            EngineError::Protocol(format!("frame longer than {max_frame_length} bytes"))
        }
        AnyDelimiterCodecError::Io(err) => body_error(err),
    }
}

/// Unwraps the transport error a failed body read was carrying.
fn body_error(err: io::Error) -> EngineError {
    if err.get_ref().is_some_and(|inner| inner.is::<reqwest::Error>()) {
        return match err.into_inner().map(|inner| inner.downcast::<reqwest::Error>()) {
            Some(Ok(err)) => EngineError::Transport(*err),
            Some(Err(inner)) => EngineError::Io(io::Error::other(inner)),
            None => EngineError::Protocol("response body failed".into()),
        };
    }
    EngineError::Io(err)
}

fn is_blank(frame: &[u8]) -> bool {
    frame.iter().all(|b| b.is_ascii_whitespace())
}
