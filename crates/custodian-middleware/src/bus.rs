//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! Traffic is partitioned into three [`Topic`] lanes so components only
//! receive the messages they care about:
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Commands`] | Raw controller frames awaiting decode |
//! | [`Topic::Platform`] | OS signals: focus loss, package changes, link up/down, touches |
//! | [`Topic::Status`] | Connection state transitions |

use custodian_types::{CustodianError, Event};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Inbound controller frames, published by the connection manager.
    Commands,
    /// Platform signals, published by the OS glue.
    Platform,
    /// Connection state changes.
    Status,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    commands: broadcast::Sender<Event>,
    platform: broadcast::Sender<Event>,
    status: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (commands, _) = broadcast::channel(capacity);
        let (platform, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        Self {
            commands,
            platform,
            status,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`CustodianError::Channel`] when nobody is listening on the topic.
    /// Most publishers treat that as best-effort and ignore it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, CustodianError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| CustodianError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Commands => &self.commands,
            Topic::Platform => &self.platform,
            Topic::Status => &self.status,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, skipping over lag gaps.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_types::{EventPayload, PlatformSignal};

    fn make_event(source: &str) -> Event {
        Event::new(source, EventPayload::Platform(PlatformSignal::LinkUp))
    }

    #[test]
    fn publish_no_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::Platform, make_event("test"));
        assert!(matches!(result, Err(CustodianError::Channel(_))));
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event()
    -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::Platform);
        let mut subscriber2 = bus.subscribe_to(Topic::Platform);

        let event = make_event("platform::net");
        assert_eq!(bus.publish_to(Topic::Platform, event.clone())?, 2);

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    /// A subscriber on `Status` must not receive events published to
    /// `Commands` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events()
    -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut status_sub = bus.subscribe_to(Topic::Status);
        let _commands_sub = bus.subscribe_to(Topic::Commands);

        bus.publish_to(
            Topic::Commands,
            Event::new("ws", EventPayload::InboundFrame("{}".into())),
        )?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), status_sub.recv()).await;
        assert!(result.is_err(), "Status subscriber must not receive a Commands event");
        Ok(())
    }

    #[tokio::test]
    async fn next_skips_lag_gap() {
        let bus = EventBus::new(4);
        let mut slow_sub = bus.subscribe_to(Topic::Platform);
        for _ in 0..20 {
            let _ = bus.publish_to(Topic::Platform, make_event("flood"));
        }
        assert!(slow_sub.next().await.is_some());
    }

    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        let bus = EventBus::new(8);
        let mut slow_sub = bus.subscribe_to(Topic::Commands);
        for _ in 0..100 {
            let _ = bus.publish_to(
                Topic::Commands,
                Event::new("flood", EventPayload::InboundFrame("{}".into())),
            );
        }
        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
