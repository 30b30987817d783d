//! Sources of endpoint change events

use crate::types::EndpointChangeEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// An ordered, at-least-once stream of endpoint changes.
///
/// After a reconnect the source replays the full state as Added/Updated
/// events, so consumers must tolerate duplicates.
#[async_trait]
pub trait WatchSource: Send {
    /// Next event, or None once the source has ended.
    ///
    /// Must be cancel safe: the dispatch loop races it against shutdown.
    async fn next_event(&mut self) -> Option<EndpointChangeEvent>;

    /// Stop producing events and release the underlying watch
    async fn stop(&mut self);
}

/// Watch source fed through an mpsc channel
pub struct ChannelWatchSource {
    events: mpsc::Receiver<EndpointChangeEvent>,
}

impl ChannelWatchSource {
    pub fn new(events: mpsc::Receiver<EndpointChangeEvent>) -> Self {
        Self { events }
    }

    /// Create a bounded channel and the source reading from it
    pub fn channel(capacity: usize) -> (mpsc::Sender<EndpointChangeEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl WatchSource for ChannelWatchSource {
    async fn next_event(&mut self) -> Option<EndpointChangeEvent> {
        self.events.recv().await
    }

    async fn stop(&mut self) {
        debug!("Closing channel watch source");
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ServiceIdentity, SliceChange, SliceKey};

    fn event(slice: &str) -> EndpointChangeEvent {
        EndpointChangeEvent::Added(SliceChange {
            service: ServiceIdentity::new("ns1", "svcA"),
            slice: SliceKey::new(slice),
            addresses: vec!["10.0.0.1".to_string()],
        })
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut source) = ChannelWatchSource::channel(4);
        tx.send(event("ns1/a")).await.unwrap();
        tx.send(event("ns1/b")).await.unwrap();
        drop(tx);

        assert_eq!(source.next_event().await.unwrap().slice().as_str(), "ns1/a");
        assert_eq!(source.next_event().await.unwrap().slice().as_str(), "ns1/b");
        assert!(source.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_rejects_new_events() {
        let (tx, mut source) = ChannelWatchSource::channel(4);
        source.stop().await;

        assert!(tx.send(event("ns1/a")).await.is_err());
        assert!(source.next_event().await.is_none());
    }
}
