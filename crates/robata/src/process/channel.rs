//! # Process channel
//!
//! A duplex message channel between the dispatcher and one worker process.
//!
//! Every message is one length-delimited frame holding a MessagePack document.
//! Frames are capped at [`MAX_FRAME_LENGTH`]; a message that would exceed the cap
//! is refused before any byte is written, so the channel stays usable.
//! Requests flow dispatcher to worker and increments flow back; a worker never
//! speaks first except for its ready acknowledgment.

use std::marker::PhantomData;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::communication::{GenerationRequest, StreamIncrement};
use crate::error::EngineError;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Largest frame either side sends or accepts: 64 MiB, well above any prompt
/// or increment a single model call handles.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One side of a process channel: receives `In` and sends `Out`.
///
/// An endpoint has a single owner and is never shared; use
/// [`DispatcherEndpoint`] or [`WorkerEndpoint`] rather than naming this directly.
pub struct Endpoint<In, Out> {
    reader: FramedRead<BoxedReader, LengthDelimitedCodec>,
    writer: FramedWrite<BoxedWriter, LengthDelimitedCodec>,
    _messages: PhantomData<fn(Out) -> In>,
}

/// The dispatcher's side: sends requests, receives increments.
pub type DispatcherEndpoint = Endpoint<StreamIncrement, GenerationRequest>;

/// The worker's side: receives requests, sends increments.
pub type WorkerEndpoint = Endpoint<GenerationRequest, StreamIncrement>;

impl<In, Out> Endpoint<In, Out>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FramedRead::new(Box::new(reader), codec()),
            writer: FramedWrite::new(Box::new(writer), codec()),
            _messages: PhantomData,
        }
    }

    /// Replaces the frame cap on both halves of this endpoint.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.reader.decoder_mut().set_max_frame_length(max_frame_length);
        self.writer.encoder_mut().set_max_frame_length(max_frame_length);
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.writer.encoder().max_frame_length()
    }

    /// Serializes and flushes one message.
    ///
    /// Fails with [`EngineError::FrameTooLarge`] or [`EngineError::Encode`]
    /// without touching the channel when the message cannot be framed.
    pub async fn send(&mut self, message: &Out) -> Result<(), EngineError> {
        let frame = rmp_serde::to_vec_named(message)?;
        let max = self.max_frame_length();
        if frame.len() > max {
            return Err(EngineError::FrameTooLarge {
                len: frame.len(),
                max,
            });
        }
        self.writer.send(Bytes::from(frame)).await?;
        Ok(())
    }

    /// Waits for the next message. `None` means the peer closed the channel.
    pub async fn recv(&mut self) -> Result<Option<In>, EngineError> {
        match self.reader.next().await {
            Some(frame) => Ok(Some(rmp_serde::from_slice(&frame?)?)),
            None => Ok(None),
        }
    }

    /// Closes the sending half. The peer sees end of input.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        SinkExt::<Bytes>::close(&mut self.writer).await?;
        Ok(())
    }
}

impl WorkerEndpoint {
    /// Binds the worker side to this process's stdin and stdout.
    ///
    /// Nothing else may write to stdout afterwards; log to stderr instead.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Builds both ends of one in-memory channel.
pub fn duplex_pair() -> (DispatcherEndpoint, WorkerEndpoint) {
    let (dispatcher, worker) = tokio::io::duplex(DUPLEX_BUFFER);
    let (dispatcher_read, dispatcher_write) = tokio::io::split(dispatcher);
    let (worker_read, worker_write) = tokio::io::split(worker);
    (
        Endpoint::new(dispatcher_read, dispatcher_write),
        Endpoint::new(worker_read, worker_write),
    )
}
