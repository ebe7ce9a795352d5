//! Topic transport abstraction
//!
//! The live-topic connector only depends on three middleware capabilities:
//! listing advertised feeds with their type names, subscribing to a feed as
//! a stream of raw payloads, and releasing a subscription. [`LoopbackBus`]
//! is an in-process implementation used by the demo runner and the tests.

use crate::error::{DashError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Depth of the raw feed between the transport and a subscription worker
const FEED_CAPACITY: usize = 16;

/// An advertised feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    /// Full feed name, starting with `/`
    pub name: String,
    /// Advertised message type name (e.g. `std_msgs/Float64`)
    pub type_name: String,
    /// Number of active publishers
    pub publishers: usize,
}

/// Handle identifying one transport subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Middleware contract used by the live-topic connector
#[cfg_attr(test, mockall::automock)]
pub trait TopicTransport: Send + Sync {
    /// Currently advertised feeds
    fn topics(&self) -> Vec<TopicInfo>;

    /// Subscribe to a feed; payloads arrive as raw bytes on the returned receiver
    fn subscribe(&self, topic: &str) -> Result<(SubscriptionId, Receiver<Vec<u8>>)>;

    /// Release a subscription. Must not return before the transport stopped delivering to it.
    fn unsubscribe(&self, id: SubscriptionId);
}

struct BusTopic {
    type_name: String,
    publishers: usize,
}

struct BusSubscription {
    topic: String,
    feed: Sender<Vec<u8>>,
}

#[derive(Default)]
struct BusState {
    topics: BTreeMap<String, BusTopic>,
    subscriptions: HashMap<SubscriptionId, BusSubscription>,
    next_id: u64,
}

/// In-process publish/subscribe bus
#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a feed with a type name. Advertising twice adds a publisher.
    pub fn advertise(&self, topic: &str, type_name: &str) {
        let mut state = self.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .and_modify(|t| t.publishers += 1)
            .or_insert_with(|| BusTopic {
                type_name: type_name.to_string(),
                publishers: 1,
            });
    }

    /// Withdraw a feed entirely; existing subscriptions stop receiving
    pub fn withdraw(&self, topic: &str) {
        let mut state = self.state.lock();
        state.topics.remove(topic);
        state.subscriptions.retain(|_, s| s.topic != topic);
    }

    /// Deliver a payload to every subscriber of `topic`. Full feeds drop the payload.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for sub in state.subscriptions.values().filter(|s| s.topic == topic) {
            match sub.feed.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("Feed for {} is full, dropping payload", topic);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        delivered
    }

    /// Publish a JSON document
    pub fn publish_json(&self, topic: &str, value: &serde_json::Value) -> usize {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.publish(topic, bytes),
            Err(e) => {
                tracing::warn!("Failed to encode message for {}: {}", topic, e);
                0
            }
        }
    }

    /// Number of live subscriptions, optionally restricted to one feed
    pub fn subscription_count(&self, topic: Option<&str>) -> usize {
        let state = self.state.lock();
        state
            .subscriptions
            .values()
            .filter(|s| topic.map_or(true, |t| s.topic == t))
            .count()
    }
}

impl TopicTransport for LoopbackBus {
    fn topics(&self) -> Vec<TopicInfo> {
        let state = self.state.lock();
        state
            .topics
            .iter()
            .map(|(name, t)| TopicInfo {
                name: name.clone(),
                type_name: t.type_name.clone(),
                publishers: t.publishers,
            })
            .collect()
    }

    fn subscribe(&self, topic: &str) -> Result<(SubscriptionId, Receiver<Vec<u8>>)> {
        let mut state = self.state.lock();
        if !state.topics.contains_key(topic) {
            return Err(DashError::Transport(format!("topic {} is not advertised", topic)));
        }
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;

        let (feed, rx) = bounded(FEED_CAPACITY);
        state.subscriptions.insert(
            id,
            BusSubscription {
                topic: topic.to_string(),
                feed,
            },
        );
        Ok((id, rx))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscriptions.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_and_list() {
        let bus = LoopbackBus::new();
        bus.advertise("/robot/odom", "nav_msgs/Odometry");
        bus.advertise("/robot/odom", "nav_msgs/Odometry");

        let topics = bus.topics();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].publishers, 2);
        assert_eq!(topics[0].type_name, "nav_msgs/Odometry");
    }

    #[test]
    fn test_publish_reaches_subscriber() {
        let bus = LoopbackBus::new();
        bus.advertise("/a", "std_msgs/String");
        let (id, rx) = bus.subscribe("/a").unwrap();

        assert_eq!(bus.publish("/a", b"hello".to_vec()), 1);
        assert_eq!(rx.try_recv().unwrap(), b"hello".to_vec());

        bus.unsubscribe(id);
        assert_eq!(bus.subscription_count(None), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_unknown_topic_fails() {
        let bus = LoopbackBus::new();
        assert!(bus.subscribe("/missing").is_err());
    }

    #[test]
    fn test_withdraw_drops_subscriptions() {
        let bus = LoopbackBus::new();
        bus.advertise("/a", "std_msgs/String");
        let _sub = bus.subscribe("/a").unwrap();
        bus.withdraw("/a");
        assert!(bus.topics().is_empty());
        assert_eq!(bus.subscription_count(Some("/a")), 0);
    }
}
