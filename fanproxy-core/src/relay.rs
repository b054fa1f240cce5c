//! # Stream Relay
//!
//! Copies messages from a source stream into a sink, one at a time, until the source ends.
//!
//! Each message is handed to the sink before the next one is requested, so a slow sink
//! slows the source down instead of buffering without bound.
use std::future::Future;
use tokio::sync::mpsc;
use tonic::{Status, Streaming};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to receive from the upstream stream: {0}")]
    Receive(#[source] Status),
    #[error("The downstream stream was closed")]
    SinkClosed,
}

/// Yields messages until a clean end of stream (`Ok(None)`).
pub trait MessageSource: Send {
    type Item: Send;

    fn recv_message(&mut self) -> impl Future<Output = Result<Option<Self::Item>, Status>> + Send;
}

/// Accepts relayed messages.
pub trait MessageSink: Send {
    type Item: Send;

    fn send_message(&mut self, item: Self::Item) -> impl Future<Output = Result<(), RelayError>> + Send;
}

impl<T: Send + 'static> MessageSource for Streaming<T> {
    type Item = T;

    async fn recv_message(&mut self) -> Result<Option<T>, Status> {
        self.message().await
    }
}

impl<T: Send> MessageSink for mpsc::Sender<T> {
    type Item = T;

    async fn send_message(&mut self, item: T) -> Result<(), RelayError> {
        mpsc::Sender::send(self, item)
            .await
            .map_err(|_| RelayError::SinkClosed)
    }
}

/// Feeds the response stream of a gRPC handler, where every item is a `Result`.
#[derive(Debug, Clone)]
pub struct ResponseSink<T>(pub mpsc::Sender<Result<T, Status>>);

impl<T: Send> ResponseSink<T> {
    /// Ends the response stream with `status`.
    pub async fn fail(&self, status: Status) -> Result<(), RelayError> {
        self.0.send(Err(status)).await.map_err(|_| RelayError::SinkClosed)
    }
}

impl<T: Send> MessageSink for ResponseSink<T> {
    type Item = T;

    async fn send_message(&mut self, item: T) -> Result<(), RelayError> {
        self.0.send(Ok(item)).await.map_err(|_| RelayError::SinkClosed)
    }
}

/// Copies `source` into `sink` until the source ends cleanly.
///
/// Returns the number of relayed messages. Receive and send errors abort the copy and are
/// returned as they are.
pub async fn relay<S, K>(source: &mut S, sink: &mut K) -> Result<usize, RelayError>
where
    S: MessageSource,
    K: MessageSink<Item = S::Item>,
{
    let mut relayed = 0;

    loop {
        match source.recv_message().await {
            Ok(Some(item)) => {
                sink.send_message(item).await?;
                relayed += 1;
            }
            Ok(None) => return Ok(relayed),
            Err(status) => return Err(RelayError::Receive(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio_stream::StreamExt;
    use tokio_stream::wrappers::ReceiverStream;

    struct Scripted(VecDeque<Result<Option<u32>, Status>>);

    impl MessageSource for Scripted {
        type Item = u32;

        async fn recv_message(&mut self) -> Result<Option<u32>, Status> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    fn scripted(items: Vec<Result<Option<u32>, Status>>) -> Scripted {
        Scripted(items.into())
    }

    #[tokio::test]
    async fn relays_in_order_until_end_of_stream() {
        let mut source = scripted(vec![Ok(Some(1)), Ok(Some(2)), Ok(Some(3)), Ok(None)]);
        let (mut tx, rx) = mpsc::channel(8);

        let relayed = relay(&mut source, &mut tx).await.unwrap();
        drop(tx);

        assert_eq!(relayed, 3);
        let received: Vec<u32> = ReceiverStream::new(rx).collect().await;
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn receive_errors_are_returned_unchanged() {
        let mut source = scripted(vec![
            Ok(Some(1)),
            Err(Status::data_loss("node went away")),
            Ok(Some(2)),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let mut sink = ResponseSink(tx);

        let err = relay(&mut source, &mut sink).await.unwrap_err();

        let RelayError::Receive(status) = err else {
            panic!("expected a receive error, got {err:?}");
        };
        assert_eq!(status.code(), tonic::Code::DataLoss);
        assert_eq!(status.message(), "node went away");
        assert_eq!(rx.recv().await.unwrap().unwrap(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_sink_stops_the_relay() {
        let mut source = scripted(vec![Ok(Some(1)), Ok(Some(2))]);
        let (mut tx, rx) = mpsc::channel::<u32>(8);
        drop(rx);

        let err = relay(&mut source, &mut tx).await.unwrap_err();

        assert!(matches!(err, RelayError::SinkClosed));
    }
}
