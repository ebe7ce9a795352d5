//! Owned feed worker for one topic subscription
//!
//! Each subscription runs a background thread that moves raw payloads from
//! the transport feed towards the frame loop, which pops without blocking.
//! Data feeds use a [`latest_slot`], so only the newest payload survives.
//! Queued feeds keep every payload up to [`QUEUE_CAPACITY`] for consumers
//! that must see each message, such as the transform feed. Closing a
//! subscription releases the transport handle and joins the worker before
//! returning.

use super::slot::{latest_slot, SlotReceiver, SlotSender};
use super::transport::{SubscriptionId, TopicTransport};
use crate::error::{DashError, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long the worker waits on the feed before re-checking the stop flag
const WORKER_WAKE_INTERVAL: Duration = Duration::from_millis(20);

/// Payloads a queued subscription holds before dropping new arrivals
pub const QUEUE_CAPACITY: usize = 1024;

/// A raw payload as handed from the worker to the frame loop
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Vec<u8>,
    pub arrived_at: DateTime<Utc>,
}

/// Receive-rate statistics over a rolling window of arrivals
#[derive(Debug, Clone)]
pub struct RateStats {
    window: usize,
    rates: VecDeque<f64>,
    last_arrival: Option<Instant>,
    pub received: u64,
}

impl RateStats {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            rates: VecDeque::with_capacity(window.max(1)),
            last_arrival: None,
            received: 0,
        }
    }

    pub fn record(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                self.rates.push_back(1.0 / dt);
                if self.rates.len() > self.window {
                    self.rates.pop_front();
                }
            }
        }
        self.last_arrival = Some(now);
        self.received += 1;
    }

    pub fn mean_hz(&self) -> f64 {
        if self.rates.is_empty() {
            0.0
        } else {
            self.rates.iter().sum::<f64>() / self.rates.len() as f64
        }
    }

    pub fn min_hz(&self) -> f64 {
        self.rates.iter().copied().fold(f64::NAN, f64::min)
    }

    pub fn max_hz(&self) -> f64 {
        self.rates.iter().copied().fold(f64::NAN, f64::max)
    }

    pub fn stddev_hz(&self) -> f64 {
        if self.rates.len() < 2 {
            return 0.0;
        }
        let mean = self.mean_hz();
        let variance = self.rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (self.rates.len() - 1) as f64;
        variance.sqrt()
    }
}

/// Worker end of the hand-off
enum Outlet {
    Latest(SlotSender<RawMessage>),
    Queue {
        tx: Sender<RawMessage>,
        dropped: Arc<AtomicU64>,
    },
}

impl Outlet {
    fn deliver(&self, message: RawMessage) {
        match self {
            Outlet::Latest(sender) => sender.publish(message),
            Outlet::Queue { tx, dropped } => match tx.try_send(message) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }
}

/// Frame-loop end of the hand-off
enum Inlet {
    Latest(SlotReceiver<RawMessage>),
    Queue {
        rx: Receiver<RawMessage>,
        dropped: Arc<AtomicU64>,
    },
}

/// A live subscription with its worker thread
///
/// Shared between every source reading the same feed; the last owner to
/// drop it releases the transport handle.
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    transport: Arc<dyn TopicTransport>,
    inlet: Inlet,
    stats: Arc<Mutex<RateStats>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Subscription {
    /// Subscribe to `topic`, keeping only the newest payload
    pub fn open(transport: Arc<dyn TopicTransport>, topic: &str, rate_window: usize) -> Result<Self> {
        let (sender, slot) = latest_slot();
        Self::start(transport, topic, rate_window, Outlet::Latest(sender), Inlet::Latest(slot))
    }

    /// Subscribe to `topic`, keeping every payload until it is drained
    pub fn open_queued(
        transport: Arc<dyn TopicTransport>,
        topic: &str,
        rate_window: usize,
    ) -> Result<Self> {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        Self::start(
            transport,
            topic,
            rate_window,
            Outlet::Queue {
                tx,
                dropped: dropped.clone(),
            },
            Inlet::Queue { rx, dropped },
        )
    }

    fn start(
        transport: Arc<dyn TopicTransport>,
        topic: &str,
        rate_window: usize,
        outlet: Outlet,
        inlet: Inlet,
    ) -> Result<Self> {
        let (id, feed) = transport.subscribe(topic)?;
        let stats = Arc::new(Mutex::new(RateStats::new(rate_window)));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let stats = stats.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("feed{}", topic.replace('/', "-")))
                .spawn(move || feed_worker(feed, outlet, stats, stop))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                transport.unsubscribe(id);
                return Err(DashError::Transport(format!(
                    "Failed to spawn worker for {}: {}",
                    topic, e
                )));
            }
        };

        tracing::debug!("Subscribed to {} ({:?})", topic, id);

        Ok(Self {
            id,
            topic: topic.to_string(),
            transport,
            inlet,
            stats,
            stop,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Pop the oldest undelivered payload (the only one for latest-value feeds), never blocking
    pub fn take(&self) -> Option<RawMessage> {
        if self.is_closed() {
            return None;
        }
        match &self.inlet {
            Inlet::Latest(slot) => slot.take(),
            Inlet::Queue { rx, .. } => rx.try_recv().ok(),
        }
    }

    /// Every undelivered payload, oldest first
    pub fn drain(&self) -> Vec<RawMessage> {
        if self.is_closed() {
            return Vec::new();
        }
        match &self.inlet {
            Inlet::Latest(slot) => slot.take().into_iter().collect(),
            Inlet::Queue { rx, .. } => rx.try_iter().collect(),
        }
    }

    /// Snapshot of the feed's receive statistics
    pub fn stats(&self) -> RateStats {
        self.stats.lock().clone()
    }

    /// Payloads lost before the frame loop took them: superseded in a
    /// latest-value slot, or arriving at a full queue
    pub fn overwritten(&self) -> u64 {
        match &self.inlet {
            Inlet::Latest(slot) => slot.overwritten(),
            Inlet::Queue { dropped, .. } => dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the transport subscription and join the worker. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        self.transport.unsubscribe(self.id);

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::warn!("Feed worker for {} panicked", self.topic);
            }
        }
        tracing::debug!("Unsubscribed from {} ({:?})", self.topic, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

fn feed_worker(
    feed: Receiver<Vec<u8>>,
    outlet: Outlet,
    stats: Arc<Mutex<RateStats>>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        match feed.recv_timeout(WORKER_WAKE_INTERVAL) {
            Ok(payload) => {
                stats.lock().record(Instant::now());
                outlet.deliver(RawMessage {
                    payload,
                    arrived_at: Utc::now(),
                });
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
