//! A resolved live-topic path
//!
//! Sources reading the same feed share one [`Subscription`]. The connector
//! takes and decodes each feed's payload once per poll and hands the
//! [`FeedUpdate`] to every source, each of which narrows it to its sub-path.

use super::codec::{header_stamp, CodecRegistry};
use super::subscription::{RateStats, Subscription};
use crate::path::SubPath;
use crate::types::SourceValue;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The most recent decoded message of a feed
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub value: SourceValue,
    pub received_at: DateTime<Utc>,
    /// Embedded header stamp, in seconds
    pub stamp: Option<f64>,
    /// Receipt time minus header stamp, in seconds
    pub delay: Option<f64>,
}

/// What one poll took off a feed
#[derive(Debug, Clone)]
pub enum FeedUpdate {
    Message(Arc<TopicMessage>),
    DecodeFailed(String),
}

/// Take at most one pending payload off `subscription` and decode it
pub fn take_update(
    subscription: &Subscription,
    type_name: &str,
    codecs: &CodecRegistry,
) -> Option<FeedUpdate> {
    let raw = subscription.take()?;
    Some(match codecs.decode(type_name, &raw.payload) {
        Ok(value) => {
            let stamp = header_stamp(&value);
            let received = raw.arrived_at.timestamp_micros() as f64 * 1e-6;
            FeedUpdate::Message(Arc::new(TopicMessage {
                value,
                received_at: raw.arrived_at,
                stamp,
                delay: stamp.map(|s| received - s),
            }))
        }
        Err(e) => FeedUpdate::DecodeFailed(e.to_string()),
    })
}

/// Source backed by a (possibly shared) topic subscription
pub struct TopicSource {
    topic: String,
    type_name: String,
    sub_path: SubPath,
    subscription: Option<Arc<Subscription>>,
    last: Option<Arc<TopicMessage>>,
    changed: bool,
    change_requested: bool,
    error: Option<String>,
}

impl TopicSource {
    pub(crate) fn new(type_name: &str, sub_path: SubPath, subscription: Arc<Subscription>) -> Self {
        Self {
            topic: subscription.topic().to_string(),
            type_name: type_name.to_string(),
            sub_path,
            subscription: Some(subscription),
            last: None,
            changed: false,
            change_requested: false,
            error: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn sub_path(&self) -> &SubPath {
        &self.sub_path
    }

    pub(crate) fn subscription(&self) -> Option<&Arc<Subscription>> {
        self.subscription.as_ref()
    }

    /// Take and apply this source's own update. Only valid while no other
    /// source shares the subscription; the connector uses [`Self::apply`].
    pub fn refresh(&mut self, codecs: &CodecRegistry) {
        let update = self
            .subscription
            .as_deref()
            .and_then(|sub| take_update(sub, &self.type_name, codecs));
        self.apply(update.as_ref());
    }

    /// Apply this poll's feed update
    ///
    /// No update leaves the previous message in place and clears `changed`.
    /// A decode failure keeps the previous message and records the error.
    pub fn apply(&mut self, update: Option<&FeedUpdate>) {
        self.changed = std::mem::take(&mut self.change_requested);

        match update {
            None => {}
            Some(FeedUpdate::Message(msg)) => {
                self.last = Some(msg.clone());
                self.changed = true;
                self.error = None;
            }
            Some(FeedUpdate::DecodeFailed(e)) => {
                if self.error.is_none() {
                    tracing::debug!("Failed to decode message on {}: {}", self.topic, e);
                }
                self.error = Some(e.clone());
            }
        }
    }

    /// Decoded message narrowed to the sub-path, or none before the first message
    pub fn data(&self) -> SourceValue {
        match &self.last {
            Some(msg) if self.sub_path.is_empty() => msg.value.clone(),
            Some(msg) => msg.value.select(&self.sub_path),
            None => SourceValue::None,
        }
    }

    pub fn message(&self) -> Option<&TopicMessage> {
        self.last.as_deref()
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last.as_ref().map(|m| m.received_at)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn request_changed(&mut self) {
        self.change_requested = true;
    }

    /// Receive statistics of the feed, `None` once released
    pub fn stats(&self) -> Option<RateStats> {
        self.subscription.as_ref().map(|s| s.stats())
    }

    /// Messages superseded in the slot before a poll took them
    pub fn dropped(&self) -> u64 {
        self.subscription.as_ref().map_or(0, |s| s.overwritten())
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.as_ref().map_or(true, |s| s.is_closed())
    }

    /// Release this source's share of the feed. The subscription closes
    /// with its last source.
    pub fn cleanup(&mut self) {
        self.subscription = None;
    }
}
