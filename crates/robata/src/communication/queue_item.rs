//! # Queue Item
//!
//! A generation request waiting in a dispatcher's shared queue, together with the
//! channel its increments are sent back on.

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::{GenerationRequest, StreamIncrement};

/// A request paired with its caller's private output channel.
///
/// Only the caller that enqueued the item holds the receiving side, so
/// increments of different requests can never interleave.
#[derive(Debug)]
pub struct QueueItem {
    /// The request to run
    request: GenerationRequest,

    /// Channel for sending increments back to the requester
    sender: UnboundedSender<StreamIncrement>,
}

impl QueueItem {
    pub fn new(request: GenerationRequest, sender: UnboundedSender<StreamIncrement>) -> Self {
        Self { request, sender }
    }

    pub fn id(&self) -> Uuid {
        self.request.id
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn sender(&self) -> &UnboundedSender<StreamIncrement> {
        &self.sender
    }

    /// `true` once the requester has dropped its stream.
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }
}

impl AsRef<UnboundedSender<StreamIncrement>> for QueueItem {
    fn as_ref(&self) -> &UnboundedSender<StreamIncrement> {
        &self.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GenerationParams;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::test;

    fn request() -> GenerationRequest {
        GenerationRequest::new("prompt", GenerationParams::default())
    }

    #[test]
    async fn test_queue_item_exposes_request() {
        let (tx, _rx) = unbounded_channel();
        let request = request();
        let id = request.id;
        let item = QueueItem::new(request, tx);

        assert_eq!(item.id(), id);
        assert_eq!(item.request().prompt, "prompt");
    }

    #[test]
    async fn test_sender_reaches_requester() {
        let (tx, mut rx) = unbounded_channel();
        let item = QueueItem::new(request(), tx);

        item.sender().send(StreamIncrement::Text("a".into())).unwrap();
        let sender_ref: &UnboundedSender<StreamIncrement> = item.as_ref();
        sender_ref.send(StreamIncrement::End).unwrap();

        assert_eq!(rx.recv().await, Some(StreamIncrement::Text("a".into())));
        assert_eq!(rx.recv().await, Some(StreamIncrement::End));
    }

    #[test]
    async fn test_abandoned_once_receiver_dropped() {
        let (tx, rx) = unbounded_channel();
        let item = QueueItem::new(request(), tx);
        assert!(!item.is_abandoned());

        drop(rx);
        assert!(item.is_abandoned());
        assert!(item.sender().send(StreamIncrement::End).is_err());
    }
}
