use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use mls_types::{ProgressEvent, Topic};

const TOPIC_CAPACITY: usize = 2048;

/// Topic-per-site publish/subscribe. Publishers never block: a send to a
/// topic with no subscribers is dropped, and a slow subscriber lags and
/// loses events rather than back-pressuring the publisher. Subscribers see
/// every event published after their subscription; there is no replay.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &Topic) -> broadcast::Sender<ProgressEvent> {
        let key = topic.key();
        if let Some(tx) = self.topics.read().get(&key) {
            return tx.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(key)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<ProgressEvent> {
        self.sender(topic).subscribe()
    }

    pub fn publish(&self, topic: &Topic, event: ProgressEvent) {
        let _ = self.sender(topic).send(event);
    }

    /// Drops topics nobody listens to; called opportunistically by the
    /// artifact sweep so long-lived processes don't accumulate dead senders.
    pub fn prune_idle_topics(&self) {
        self.topics.write().retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .get(&topic.key())
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Publisher handle bound to one topic; what pipeline phases carry around.
#[derive(Clone)]
pub struct TopicPublisher {
    bus: EventBus,
    topic: Topic,
}

impl TopicPublisher {
    pub fn new(bus: EventBus, topic: Topic) -> Self {
        Self { bus, topic }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn publish(&self, event: ProgressEvent) {
        self.bus.publish(&self.topic, event);
    }

    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.publish(ProgressEvent::log(level, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::TopicKind;

    #[tokio::test]
    async fn subscribers_only_see_their_topic() {
        let bus = EventBus::new();
        let build_topic = Topic::new(TopicKind::Build, "site_a");
        let agent_topic = Topic::new(TopicKind::Agent, "site_a");

        let mut build_rx = bus.subscribe(&build_topic);
        let mut agent_rx = bus.subscribe(&agent_topic);

        bus.publish(&build_topic, ProgressEvent::phase("crawl"));
        bus.publish(&agent_topic, ProgressEvent::phase_iteration("planning", 1));

        assert_eq!(build_rx.recv().await.unwrap(), ProgressEvent::phase("crawl"));
        assert_eq!(
            agent_rx.recv().await.unwrap(),
            ProgressEvent::phase_iteration("planning", 1)
        );
        assert!(build_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::new();
        let topic = Topic::new(TopicKind::LiveEdit, "site_a");
        bus.publish(&topic, ProgressEvent::Done);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        let topic = Topic::new(TopicKind::Build, "site_a");
        bus.publish(&topic, ProgressEvent::phase("crawl"));
        let mut rx = bus.subscribe(&topic);
        bus.publish(&topic, ProgressEvent::phase("images"));
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::phase("images"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_from_one_publisher_arrive_in_order() {
        let bus = EventBus::new();
        let topic = Topic::new(TopicKind::Build, "site_a");
        let mut rx = bus.subscribe(&topic);
        let publisher = TopicPublisher::new(bus.clone(), topic);
        for step in ["crawl", "images", "css"] {
            publisher.publish(ProgressEvent::step_start(step, step));
        }
        for step in ["crawl", "images", "css"] {
            match rx.recv().await.unwrap() {
                ProgressEvent::StepStart { step: got, .. } => assert_eq!(got, step),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn prune_drops_topics_without_listeners() {
        let bus = EventBus::new();
        let topic = Topic::new(TopicKind::Build, "site_a");
        {
            let _rx = bus.subscribe(&topic);
            bus.prune_idle_topics();
            assert_eq!(bus.subscriber_count(&topic), 1);
        }
        bus.prune_idle_topics();
        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
