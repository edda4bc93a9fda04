use async_trait::async_trait;
use conduit_protocol::ProgressEvent;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Ordered events produced by one underlying task.
pub type EventStream = BoxStream<'static, ProgressEvent>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(String),
}

/// The external collaborator behind one operation.
///
/// `open` issues the underlying call and returns its event stream; the
/// source must watch `cancel` and finish with a `cancelled` event (or end the
/// stream) once it has actually stopped. `abort` asks the remote side to stop
/// work that outlives the local stream, such as a background download.
#[async_trait]
pub trait OperationSource: Send + Sync {
    async fn open(&self, cancel: CancellationToken) -> Result<EventStream, SourceError>;

    async fn abort(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Stream over a fixed list of events.
pub fn stream_of(events: Vec<ProgressEvent>) -> EventStream {
    futures_util::stream::iter(events).boxed()
}

/// Stream fed by a channel; ends when every sender is dropped.
pub fn channel_stream(capacity: usize) -> (mpsc::Sender<ProgressEvent>, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, ReceiverStream::new(rx).boxed())
}

/// Maps a collaborator-specific stream into progress events, dropping items
/// the mapper does not recognise.
pub fn translate<S, T, F>(stream: S, mut mapper: F) -> EventStream
where
    S: futures_util::Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    F: FnMut(T) -> Option<ProgressEvent> + Send + 'static,
{
    stream
        .filter_map(move |item| futures_util::future::ready(mapper(item)))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn translate_drops_unmapped_items() {
        let raw = futures_util::stream::iter(vec![1u32, 2, 3, 4]);
        let mut stream = translate(raw, |n| {
            (n % 2 == 0).then(|| ProgressEvent::progress(n as f64 * 10.0, ""))
        });
        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event.percent());
        }
        assert_eq!(seen, vec![Some(20.0), Some(40.0)]);
    }

    #[tokio::test]
    async fn channel_stream_ends_when_senders_drop() {
        let (tx, mut stream) = channel_stream(4);
        tx.send(ProgressEvent::started("go")).await.unwrap();
        drop(tx);
        assert_eq!(stream.next().await, Some(ProgressEvent::started("go")));
        assert_eq!(stream.next().await, None);
    }
}
