//! Capacity-one, overwrite-on-full hand-off between a feed worker and the frame loop
//!
//! The producer never blocks: when the slot already holds an undelivered
//! value, that value is discarded and replaced. The consumer only ever
//! pops, non-blocking. Only the newest sample survives.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Create a connected latest-value slot pair
pub fn latest_slot<T>() -> (SlotSender<T>, SlotReceiver<T>) {
    let (tx, rx) = bounded(1);
    let overwritten = Arc::new(AtomicU64::new(0));
    (
        SlotSender {
            tx,
            evict: rx.clone(),
            overwritten: overwritten.clone(),
        },
        SlotReceiver { rx, overwritten },
    )
}

/// Producer half, owned by a feed worker
pub struct SlotSender<T> {
    tx: Sender<T>,
    // Used only to discard the stale value when the slot is full
    evict: Receiver<T>,
    overwritten: Arc<AtomicU64>,
}

impl<T> SlotSender<T> {
    /// Store `value`, replacing any value the consumer has not taken yet
    pub fn publish(&self, mut value: T) {
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.evict.try_recv().is_ok() {
                        self.overwritten.fetch_add(1, Ordering::Relaxed);
                    }
                    value = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Consumer half, owned by the frame loop
pub struct SlotReceiver<T> {
    rx: Receiver<T>,
    overwritten: Arc<AtomicU64>,
}

impl<T> SlotReceiver<T> {
    /// Take the latest value if one arrived since the last call
    pub fn take(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Number of values that were replaced before being taken
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}
