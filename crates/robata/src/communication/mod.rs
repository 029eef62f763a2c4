//! # Stream framing
//!
//! The request and increment types shared by every dispatcher, and the
//! in-process plumbing that carries them between callers and workers.
//!
//! * [`GenerationRequest`] - one prompt plus its parameters, consumed by exactly one worker
//! * [`StreamIncrement`] - a text fragment, a worker failure, or the `End` sentinel
//! * [`QueueItem`] - a request paired with the caller's private output channel
//! * [`IncrementStream`] - the caller's view of that channel, ending at the sentinel

mod increment;
mod item_stream;
mod queue_item;

pub use increment::{GenerationRequest, StreamIncrement};
pub use item_stream::IncrementStream;
pub(crate) use queue_item::QueueItem;
