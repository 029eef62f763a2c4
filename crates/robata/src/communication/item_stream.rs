use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::StreamIncrement;
use crate::error::EngineError;

/// # IncrementStream
///
/// The caller's end of a request's private output channel, adapted to the
/// `Stream` trait.
///
/// Text increments are yielded in order. [`StreamIncrement::Error`] surfaces as an
/// [`EngineError::Worker`] item, and [`StreamIncrement::End`] finishes the stream.
/// If the channel closes before the sentinel arrives (the dispatcher shut down
/// with the request still queued), a single [`EngineError::Closed`] is yielded.
///
/// Dropping the stream early does not stop the worker; it keeps generating and
/// its sends to the dropped channel are discarded.
pub struct IncrementStream {
    /// The underlying channel receiver
    receiver: mpsc::UnboundedReceiver<StreamIncrement>,

    /// Set once `End` or a closed channel has been observed
    finished: bool,
}

impl IncrementStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<StreamIncrement>) -> Self {
        Self {
            receiver,
            finished: false,
        }
    }
}

impl Stream for IncrementStream {
    type Item = Result<String, EngineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamIncrement::Text(text))) => Poll::Ready(Some(Ok(text))),
            Poll::Ready(Some(StreamIncrement::Error(message))) => {
                Poll::Ready(Some(Err(EngineError::Worker(message))))
            }
            Poll::Ready(Some(StreamIncrement::End)) => {
                this.finished = true;
                this.receiver.close();
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(EngineError::Closed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_yields_text_until_end() {
        let (tx, rx) = unbounded_channel();
        tx.send(StreamIncrement::Text("a".into())).unwrap();
        tx.send(StreamIncrement::Text("b".into())).unwrap();
        tx.send(StreamIncrement::End).unwrap();
        // Anything after the sentinel belongs to no one
        tx.send(StreamIncrement::Text("late".into())).ok();

        let items: Vec<_> = IncrementStream::new(rx).collect().await;
        let texts: Vec<String> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_worker_error_is_surfaced() {
        let (tx, rx) = unbounded_channel();
        tx.send(StreamIncrement::Error("oom".into())).unwrap();
        tx.send(StreamIncrement::End).unwrap();

        let items: Vec<_> = IncrementStream::new(rx).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(EngineError::Worker(msg)) if msg == "oom"));
    }

    #[tokio::test]
    async fn test_closed_channel_without_end() {
        let (tx, rx) = unbounded_channel::<StreamIncrement>();
        drop(tx);

        let items: Vec<_> = IncrementStream::new(rx).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(EngineError::Closed)));
    }
}
