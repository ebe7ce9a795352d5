//! Live-topic connector (`/topics/...`)
//!
//! Paths name an advertised feed, optionally followed by a sub-path into the
//! decoded message: `/topics/robot/odom.pose.position.x`. The longest
//! advertised feed name that prefixes the remainder wins, so feeds whose
//! names share a prefix stay addressable.
//!
//! Every path on one feed shares a single [`Subscription`] whose worker
//! writes into a capacity-one slot. A poll takes at most one message per
//! feed, decodes it once and hands it to each of the feed's sources. The
//! subscription is released with the last source reading it. Feeds that
//! stop being advertised are retired and their paths become absent until the
//! feed reappears.
//!
//! Besides data sources the connector keeps two internal feeds: the clock
//! feed (to detect simulated time) and the transform feed, which populates a
//! [`TransformBuffer`] queried through [`TopicConnector::lookup_transform`].
//! Both are queued, and each poll applies every message they received.

pub mod codec;
pub mod slot;
pub mod source;
pub mod subscription;
pub mod transforms;
pub mod transport;

pub use codec::{Codec, CodecRegistry};
pub use source::{FeedUpdate, TopicMessage, TopicSource};
use source::take_update;
pub use subscription::{RateStats, Subscription};
pub use transforms::{Matrix4, Transform, TransformBuffer};
pub use transport::{LoopbackBus, SubscriptionId, TopicInfo, TopicTransport};

use super::{Connector, ConnectorTree, SourceSlot};
use crate::config::TopicConfig;
use crate::path::{SourcePath, SubPath};
use crate::registry::Source;
use crate::types::SourceValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Path prefix owned by this connector
pub const PREFIX: &str = "topics";

/// Suffix of lifecycle bookkeeping feeds that are hidden from browsing
const HIDDEN_SUFFIX: &str = "transition_event";

/// Split a path remainder into an advertised feed and a sub-path
///
/// The sub-path must start at a `.` or `[` boundary right after the feed name.
fn match_topic<'a>(remainder: &str, topics: &'a [TopicInfo]) -> Option<(&'a TopicInfo, SubPath)> {
    let best = topics
        .iter()
        .filter(|t| match remainder.strip_prefix(t.name.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with('['),
            None => false,
        })
        .max_by_key(|t| t.name.len())?;

    let rest = &remainder[best.name.len()..];
    let sub_path = SubPath::parse(rest).ok()?;
    Some((best, sub_path))
}

/// Seconds encoded in a clock message (`clock.sec` / `clock.nanosec`)
fn clock_seconds(value: &SourceValue) -> Option<f64> {
    let SourceValue::Document(doc) = value else {
        return None;
    };
    let clock = doc.get("clock")?;
    let sec = clock.get("sec")?.as_f64()?;
    let nanosec = clock.get("nanosec").and_then(|v| v.as_f64()).unwrap_or(0.0);
    Some(sec + nanosec * 1e-9)
}

/// Connector for live middleware feeds
pub struct TopicConnector {
    transport: Arc<dyn TopicTransport>,
    codecs: CodecRegistry,
    settings: TopicConfig,
    transforms: TransformBuffer,
    /// Subscriptions of data feeds, owned by their sources
    feeds: HashMap<String, Weak<Subscription>>,
    tf_feed: Option<Subscription>,
    clock_feed: Option<Subscription>,
    last_clock_arrival: Option<Instant>,
    last_clock_stamp: Option<f64>,
}

impl TopicConnector {
    pub fn new(transport: Arc<dyn TopicTransport>, settings: &TopicConfig) -> Self {
        Self {
            transport,
            codecs: CodecRegistry::new(),
            transforms: TransformBuffer::new(settings.tf_history, settings.tf_tolerance_secs),
            settings: settings.clone(),
            feeds: HashMap::new(),
            tf_feed: None,
            clock_feed: None,
            last_clock_arrival: None,
            last_clock_stamp: None,
        }
    }

    /// Decoders used for feed payloads; register custom types here
    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        &mut self.codecs
    }

    /// Transform taking points in `source` frame to `target` frame at `time`
    /// (seconds, `0.0` for latest). `None` when frames are unconnected or the
    /// lookup would extrapolate.
    pub fn lookup_transform(&self, target: &str, source: &str, time: f64) -> Option<Matrix4> {
        self.transforms.lookup(target, source, time)
    }

    /// Frames known to the transform buffer
    pub fn frames(&self) -> Vec<String> {
        self.transforms.frames()
    }

    /// True while the clock feed keeps publishing within the configured timeout
    pub fn sim_time_active(&self) -> bool {
        let timeout = Duration::from_millis(self.settings.sim_clock_timeout_ms);
        self.last_clock_arrival.is_some_and(|t| t.elapsed() < timeout)
    }

    /// Last time reported by the clock feed
    pub fn sim_time(&self) -> Option<f64> {
        self.last_clock_stamp
    }

    /// Number of data feeds currently subscribed
    pub fn feed_count(&self) -> usize {
        self.feeds.values().filter(|f| f.strong_count() > 0).count()
    }

    /// The live subscription for `topic`, opened on first use
    fn feed(&mut self, topic: &str) -> crate::error::Result<Arc<Subscription>> {
        if let Some(sub) = self.feeds.get(topic).and_then(Weak::upgrade) {
            if !sub.is_closed() {
                return Ok(sub);
            }
        }
        let sub = Arc::new(Subscription::open(
            self.transport.clone(),
            topic,
            self.settings.rate_window,
        )?);
        self.feeds.insert(topic.to_string(), Arc::downgrade(&sub));
        Ok(sub)
    }

    /// Subscribe or drop an internal feed depending on whether it is advertised
    fn sync_feed(
        transport: &Arc<dyn TopicTransport>,
        feed: &mut Option<Subscription>,
        topic: &str,
        advertised: &HashSet<&str>,
        rate_window: usize,
    ) {
        let wanted = advertised.contains(topic);
        match (feed.is_some(), wanted) {
            (false, true) => match Subscription::open_queued(transport.clone(), topic, rate_window) {
                Ok(sub) => *feed = Some(sub),
                Err(e) => tracing::debug!("Could not subscribe to {}: {}", topic, e),
            },
            (true, false) => {
                if let Some(sub) = feed.take() {
                    sub.close();
                }
            }
            _ => {}
        }
    }

    fn type_of<'a>(topics: &'a [TopicInfo], name: &str) -> &'a str {
        topics
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.type_name.as_str())
            .unwrap_or_default()
    }

    fn poll_clock(&mut self, topics: &[TopicInfo]) {
        let Some(feed) = self.clock_feed.as_ref() else {
            return;
        };
        let pending = feed.drain();
        if pending.is_empty() {
            return;
        }
        self.last_clock_arrival = Some(Instant::now());

        let type_name = Self::type_of(topics, &self.settings.clock_topic);
        for raw in pending {
            let stamp = match self.codecs.decode(type_name, &raw.payload) {
                Ok(value) => clock_seconds(&value),
                Err(e) => {
                    tracing::trace!("Ignoring clock message: {}", e);
                    None
                }
            };
            let Some(stamp) = stamp else {
                continue;
            };
            if self.last_clock_stamp.is_some_and(|prev| stamp < prev) {
                tracing::info!("Clock jumped backwards to {:.3}s, clearing transforms", stamp);
                self.transforms.clear();
            }
            self.last_clock_stamp = Some(stamp);
        }
    }

    /// Ingest every transform message received since the last poll, in order
    fn poll_transforms(&mut self, topics: &[TopicInfo]) {
        let Some(feed) = self.tf_feed.as_ref() else {
            return;
        };
        let type_name = Self::type_of(topics, &self.settings.tf_topic);
        for raw in feed.drain() {
            match self.codecs.decode(type_name, &raw.payload) {
                Ok(SourceValue::Document(doc)) => {
                    let n = transforms::ingest_tf_message(&mut self.transforms, &doc);
                    tracing::trace!("Ingested {} transforms", n);
                }
                Ok(_) => {}
                Err(e) => tracing::trace!("Ignoring transform message: {}", e),
            }
        }
    }
}

impl Connector for TopicConnector {
    fn prefix(&self) -> &'static str {
        PREFIX
    }

    fn create(&mut self, path: &SourcePath) -> Option<Source> {
        let topics = self.transport.topics();
        let (info, sub_path) = match_topic(path.remainder(), &topics)?;

        match self.feed(&info.name) {
            Ok(sub) => {
                tracing::debug!("Created topic source {} ({})", path, info.type_name);
                Some(Source::Topic(TopicSource::new(&info.type_name, sub_path, sub)))
            }
            Err(e) => {
                tracing::debug!("Failed to subscribe for {}: {}", path, e);
                None
            }
        }
    }

    fn poll(&mut self, sources: &mut [SourceSlot<'_>]) {
        let topics = self.transport.topics();
        let advertised: HashSet<&str> = topics.iter().map(|t| t.name.as_str()).collect();

        // One take per feed per poll, shared by all of the feed's sources
        let mut updates: HashMap<String, Option<FeedUpdate>> = HashMap::new();

        for slot in sources.iter_mut() {
            let retire = match slot.source.as_mut() {
                Some(Source::Topic(source)) => {
                    if advertised.contains(source.topic()) {
                        let update = updates.entry(source.topic().to_string()).or_insert_with(|| {
                            source.subscription().and_then(|sub| {
                                take_update(sub, source.type_name(), &self.codecs)
                            })
                        });
                        source.apply(update.as_ref());
                        false
                    } else {
                        true
                    }
                }
                _ => false,
            };
            if retire {
                if let Some(mut source) = slot.source.take() {
                    tracing::debug!("Retiring {}: feed is no longer advertised", slot.path);
                    source.cleanup();
                }
            }
        }
        self.feeds.retain(|_, feed| feed.strong_count() > 0);

        let window = self.settings.rate_window;
        Self::sync_feed(
            &self.transport,
            &mut self.clock_feed,
            &self.settings.clock_topic,
            &advertised,
            window,
        );
        Self::sync_feed(
            &self.transport,
            &mut self.tf_feed,
            &self.settings.tf_topic,
            &advertised,
            window,
        );
        self.poll_clock(&topics);
        self.poll_transforms(&topics);
    }

    fn describe(&self) -> ConnectorTree {
        let mut root = ConnectorTree::branch(PREFIX);
        let mut topics = self.transport.topics();
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        for info in topics
            .iter()
            .filter(|t| t.publishers > 0 && !t.name.ends_with(HIDDEN_SUFFIX))
        {
            let segments: Vec<&str> = info.name.split('/').filter(|s| !s.is_empty()).collect();
            let mut node = &mut root;
            for seg in &segments {
                let idx = match node.children.iter().position(|c| c.label == *seg) {
                    Some(i) => i,
                    None => {
                        node.children.push(ConnectorTree::branch(*seg));
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[idx];
            }
            node.path = Some(format!("/{}{}", PREFIX, info.name));
        }
        root
    }

    fn cleanup(&mut self) {
        for feed in [self.tf_feed.take(), self.clock_feed.take()].into_iter().flatten() {
            feed.close();
        }
        self.feeds.clear();
        self.transforms.clear();
        self.last_clock_arrival = None;
        self.last_clock_stamp = None;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(name: &str) -> TopicInfo {
        TopicInfo {
            name: name.to_string(),
            type_name: "x/Y".to_string(),
            publishers: 1,
        }
    }

    fn connector(bus: &LoopbackBus) -> TopicConnector {
        TopicConnector::new(Arc::new(bus.clone()), &TopicConfig::default())
    }

    #[test]
    fn test_longest_topic_prefix_wins() {
        let topics = vec![info("/odom"), info("/odom_raw"), info("/odom/filtered")];

        let (t, sub) = match_topic("/odom.pose.x", &topics).unwrap();
        assert_eq!(t.name, "/odom");
        assert_eq!(sub.to_string(), "pose.x");

        let (t, sub) = match_topic("/odom_raw", &topics).unwrap();
        assert_eq!(t.name, "/odom_raw");
        assert!(sub.is_empty());

        let (t, _) = match_topic("/odom/filtered[0]", &topics).unwrap();
        assert_eq!(t.name, "/odom/filtered");

        assert!(match_topic("/odomx", &topics).is_none());
        assert!(match_topic("/missing", &topics).is_none());
    }

    #[test]
    fn test_create_requires_advertised_feed() {
        let bus = LoopbackBus::new();
        let mut conn = connector(&bus);
        let path = SourcePath::parse("/topics/odom").unwrap();
        assert!(conn.create(&path).is_none());

        bus.advertise("/odom", "nav_msgs/Odometry");
        let mut source = conn.create(&path).expect("feed is advertised");
        assert_eq!(bus.subscription_count(Some("/odom")), 1);
        source.cleanup();
        assert_eq!(bus.subscription_count(Some("/odom")), 0);
    }

    #[test]
    fn test_paths_on_one_feed_share_a_subscription() {
        let bus = LoopbackBus::new();
        bus.advertise("/odom", "nav_msgs/Odometry");
        let mut conn = connector(&bus);
        let paths: Vec<SourcePath> = ["/topics/odom.pose", "/topics/odom.twist", "/topics/odom"]
            .iter()
            .map(|p| SourcePath::parse(p).unwrap())
            .collect();
        let mut sources: Vec<Option<Source>> = paths.iter().map(|p| conn.create(p)).collect();
        assert!(sources.iter().all(Option::is_some));
        assert_eq!(bus.subscription_count(Some("/odom")), 1);
        assert_eq!(conn.feed_count(), 1);

        bus.publish_json("/odom", &json!({"pose": 1.0, "twist": 2.0}));
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let mut slots: Vec<SourceSlot<'_>> = paths
                .iter()
                .zip(sources.iter_mut())
                .map(|(path, source)| SourceSlot { path, source })
                .collect();
            conn.poll(&mut slots);
            if sources[0].as_ref().unwrap().changed() || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(sources.iter().all(|s| s.as_ref().unwrap().changed()));
        assert_eq!(sources[0].as_ref().unwrap().data(), SourceValue::Number(1.0));
        assert_eq!(sources[1].as_ref().unwrap().data(), SourceValue::Number(2.0));

        for source in sources.iter_mut().flatten() {
            source.cleanup();
        }
        assert_eq!(bus.subscription_count(Some("/odom")), 0);
        conn.poll(&mut []);
        assert_eq!(conn.feed_count(), 0);
    }

    fn tf_message(parent: &str, child: &str, x: f64) -> serde_json::Value {
        json!({"transforms": [{
            "header": {"frame_id": parent, "stamp": {"sec": 0, "nanosec": 0}},
            "child_frame_id": child,
            "transform": {
                "translation": {"x": x, "y": 0.0, "z": 0.0},
                "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0}
            }
        }]})
    }

    #[test]
    fn test_transform_messages_between_polls_are_all_applied() {
        let bus = LoopbackBus::new();
        bus.advertise("/tf", "tf2_msgs/TFMessage");
        let mut conn = connector(&bus);
        conn.poll(&mut []);

        // Two broadcasters publish different edges before the next poll
        bus.publish_json("/tf", &tf_message("map", "odom", 1.0));
        bus.publish_json("/tf", &tf_message("odom", "base", 2.0));
        std::thread::sleep(Duration::from_millis(100));

        let deadline = Instant::now() + Duration::from_secs(2);
        while conn.frames().len() < 3 && Instant::now() < deadline {
            conn.poll(&mut []);
            std::thread::sleep(Duration::from_millis(5));
        }
        let mut frames = conn.frames();
        frames.sort();
        assert_eq!(frames, vec!["base", "map", "odom"]);
        let m = conn.lookup_transform("map", "base", 0.0).expect("chain is connected");
        assert!((m[0][3] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_poll_retires_withdrawn_feed() {
        let bus = LoopbackBus::new();
        bus.advertise("/a", "std_msgs/String");
        let mut conn = connector(&bus);
        let path = SourcePath::parse("/topics/a").unwrap();
        let mut source = conn.create(&path);
        assert!(source.is_some());

        bus.withdraw("/a");
        let mut slots = vec![SourceSlot {
            path: &path,
            source: &mut source,
        }];
        conn.poll(&mut slots);
        assert!(source.is_none());
    }

    #[test]
    fn test_describe_builds_segment_tree() {
        let bus = LoopbackBus::new();
        bus.advertise("/robot/odom", "nav_msgs/Odometry");
        bus.advertise("/robot/cmd", "geometry_msgs/Twist");
        bus.advertise("/robot/node/transition_event", "lifecycle_msgs/TransitionEvent");
        let conn = connector(&bus);

        let tree = conn.describe();
        assert_eq!(tree.label, "topics");
        assert_eq!(tree.children.len(), 1);
        let robot = &tree.children[0];
        assert_eq!(robot.label, "robot");
        assert_eq!(
            tree.paths(),
            vec!["/topics/robot/cmd", "/topics/robot/odom"]
        );
    }

    #[test]
    fn test_clock_detection_and_transforms() {
        let bus = LoopbackBus::new();
        bus.advertise("/clock", "rosgraph_msgs/Clock");
        bus.advertise("/tf", "tf2_msgs/TFMessage");
        let mut conn = connector(&bus);
        assert!(!conn.sim_time_active());

        // First poll subscribes the internal feeds
        conn.poll(&mut []);
        bus.publish_json("/clock", &json!({"clock": {"sec": 5, "nanosec": 0}}));
        bus.publish_json(
            "/tf",
            &json!({"transforms": [{
                "header": {"frame_id": "map", "stamp": {"sec": 5, "nanosec": 0}},
                "child_frame_id": "base",
                "transform": {
                    "translation": {"x": 1.0, "y": 0.0, "z": 0.0},
                    "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0}
                }
            }]}),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while (!conn.sim_time_active() || conn.frames().is_empty()) && Instant::now() < deadline {
            conn.poll(&mut []);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(conn.sim_time_active());
        assert_eq!(conn.sim_time(), Some(5.0));
        let m = conn.lookup_transform("map", "base", 0.0).expect("transform known");
        assert!((m[0][3] - 1.0).abs() < 1e-9);
        assert!(conn.lookup_transform("map", "nowhere", 0.0).is_none());

        conn.cleanup();
        assert!(conn.frames().is_empty());
        assert_eq!(bus.subscription_count(None), 0);
    }
}
