//! Outbound Queue – bounded, priority-ordered, retrying message buffer.
//!
//! Every component that wants to tell the controller something pushes an
//! [`OutboundMessage`] here.  The connection worker is the single consumer: it
//! peeks the head with [`OutboundQueue::dequeue_next`], tries to send it, and
//! then calls [`ack`][OutboundQueue::ack] or [`nack`][OutboundQueue::nack].
//!
//! # Ordering
//!
//! Messages are kept sorted by `(priority desc, enqueued_at asc)`, with a
//! monotonic insertion sequence breaking timestamp ties.
//!
//! # Backpressure
//!
//! | queue state | incoming priority | result |
//! |---|---|---|
//! | below `max_size` | any | [`EnqueueOutcome::Queued`] |
//! | full | ≥ lowest queued priority | oldest lowest-priority message evicted, [`EnqueueOutcome::QueuedAfterEvicting`] |
//! | full | < lowest queued priority | incoming dropped, [`EnqueueOutcome::Dropped`] |
//!
//! # Example
//!
//! ```rust
//! use custodian_middleware::queue::{EnqueueOutcome, OutboundQueue};
//! use custodian_types::{OutboundPayload, Priority};
//!
//! let queue = OutboundQueue::new(2);
//! let payload = OutboundPayload::SupportMessage { text: "hi".into() };
//! assert_eq!(queue.push(payload.clone(), Priority::Low), EnqueueOutcome::Queued);
//! queue.push(payload.clone(), Priority::Low);
//! assert!(matches!(
//!     queue.push(payload, Priority::High),
//!     EnqueueOutcome::QueuedAfterEvicting(_)
//! ));
//! assert_eq!(queue.dequeue_next().unwrap().priority, Priority::High);
//! ```

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use custodian_types::{OutboundMessage, OutboundPayload, Priority};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default capacity of the outbound queue.
pub const DEFAULT_MAX_SIZE: usize = 500;

type OrderKey = (Reverse<Priority>, DateTime<Utc>, u64);

/// Result of [`OutboundQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full; the message with this id was evicted to make room.
    QueuedAfterEvicting(Uuid),
    /// The queue was full of higher-priority traffic; the incoming message was
    /// discarded.
    Dropped,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        !matches!(self, EnqueueOutcome::Dropped)
    }
}

/// Result of [`OutboundQueue::nack`].
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// The message stays at its position with this many recorded attempts.
    Retained(u32),
    /// The message exhausted its attempts and was removed.
    Dropped(OutboundMessage),
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<OrderKey, OutboundMessage>,
    index: HashMap<Uuid, OrderKey>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, id: &Uuid) -> Option<OutboundMessage> {
        let key = self.index.remove(id)?;
        self.items.remove(&key)
    }

    /// The oldest message of the lowest priority present.
    fn eviction_candidate(&self) -> Option<OrderKey> {
        let (lowest, _, _) = *self.items.keys().next_back()?;
        self.items
            .range((lowest, DateTime::<Utc>::MIN_UTC, 0)..)
            .next()
            .map(|(k, _)| *k)
    }
}

/// Bounded priority queue shared by all producers and the connection worker.
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    max_size: usize,
    notify: Notify,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl OutboundQueue {
    /// Create a queue holding at most `max_size` messages (minimum 1).
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_size: max_size.max(1),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `message`, applying the backpressure rules.
    pub fn enqueue(&self, message: OutboundMessage) -> EnqueueOutcome {
        let outcome = {
            let mut inner = self.lock();
            // Re-enqueueing an id replaces the earlier copy.
            inner.remove(&message.id);

            let mut outcome = EnqueueOutcome::Queued;
            if inner.items.len() >= self.max_size {
                match inner.eviction_candidate() {
                    Some(key) if message.priority >= key.0.0 => {
                        if let Some(evicted) = inner.items.remove(&key) {
                            inner.index.remove(&evicted.id);
                            warn!(
                                evicted = %evicted.id,
                                evicted_type = evicted.payload.name(),
                                "outbound queue full; evicted oldest lowest-priority message"
                            );
                            outcome = EnqueueOutcome::QueuedAfterEvicting(evicted.id);
                        }
                    }
                    _ => {
                        warn!(
                            id = %message.id,
                            message_type = message.payload.name(),
                            priority = ?message.priority,
                            "outbound queue full; dropping incoming message"
                        );
                        return EnqueueOutcome::Dropped;
                    }
                }
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let key = (Reverse(message.priority), message.enqueued_at, seq);
            debug!(id = %message.id, message_type = message.payload.name(), "enqueued");
            inner.index.insert(message.id, key);
            inner.items.insert(key, message);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Convenience wrapper: build an [`OutboundMessage`] and enqueue it.
    pub fn push(&self, payload: OutboundPayload, priority: Priority) -> EnqueueOutcome {
        self.enqueue(OutboundMessage::new(payload, priority))
    }

    /// Peek the highest-priority, oldest message without removing it.
    pub fn dequeue_next(&self) -> Option<OutboundMessage> {
        self.lock().items.values().next().cloned()
    }

    /// Remove a delivered message.  Returns it if it was still queued.
    pub fn ack(&self, id: &Uuid) -> Option<OutboundMessage> {
        self.lock().remove(id)
    }

    /// Record a failed delivery attempt.
    ///
    /// Returns `None` when `id` is not (or no longer) queued.
    pub fn nack(&self, id: &Uuid) -> Option<NackOutcome> {
        let mut inner = self.lock();
        let key = *inner.index.get(id)?;
        let message = inner.items.get_mut(&key)?;
        message.attempts += 1;
        if message.attempts >= message.max_attempts {
            let dropped = inner.remove(id)?;
            warn!(
                id = %dropped.id,
                message_type = dropped.payload.name(),
                attempts = dropped.attempts,
                "message exhausted its delivery attempts"
            );
            Some(NackOutcome::Dropped(dropped))
        } else {
            Some(NackOutcome::Retained(message.attempts))
        }
    }

    /// Remove every message enqueued more than `ttl` ago.
    pub fn purge_expired(&self, ttl: Duration) -> Vec<OutboundMessage> {
        self.purge_expired_at(Utc::now(), ttl)
    }

    /// [`purge_expired`][Self::purge_expired] against an explicit clock.
    pub fn purge_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<OutboundMessage> {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return Vec::new();
        };

        let mut inner = self.lock();
        let expired_ids: Vec<Uuid> = inner
            .items
            .values()
            .filter(|m| m.enqueued_at < cutoff)
            .map(|m| m.id)
            .collect();
        let expired: Vec<OutboundMessage> =
            expired_ids.iter().filter_map(|id| inner.remove(id)).collect();
        for message in &expired {
            warn!(
                id = %message.id,
                message_type = message.payload.name(),
                "message expired before delivery"
            );
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// All queued messages in delivery order.
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.lock().items.values().cloned().collect()
    }

    /// Resolves after the next enqueue (or immediately if one happened since
    /// the last wake-up).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
