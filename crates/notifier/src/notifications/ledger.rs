use crate::models::{add_duration, DeliveryKey, Event, State};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Verdict of the Ledger on a notification which is about to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing conflicting was delivered. Proceed.
    Fresh,
    /// An identical notification was delivered within the coalescing window.
    Merge,
    /// A newer event was already delivered to this contact.
    Supersede,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    state: State,
    // Newest event timestamp delivered for the key. Acts as an ordering watermark.
    watermark: DateTime<Utc>,
    delivered_at: DateTime<Utc>,
}

/// Ledger remembers recent deliveries of each (trigger, contact) pair,
/// so that duplicate notifications are merged and stale ones are
/// superseded rather than delivered out of order.
#[derive(Debug)]
pub struct Ledger {
    entries: HashMap<DeliveryKey, Entry>,
    coalesce_window: Duration,
    ttl: Duration,
}

impl Ledger {
    pub fn new(coalesce_window: Duration, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            coalesce_window,
            ttl: ttl.max(coalesce_window),
        }
    }

    pub fn check(&self, key: &DeliveryKey, event: &Event, now: DateTime<Utc>) -> Verdict {
        let Some(entry) = self.entries.get(key) else {
            return Verdict::Fresh;
        };
        if add_duration(entry.delivered_at, self.ttl) <= now {
            return Verdict::Fresh;
        }

        if event.timestamp < entry.watermark {
            Verdict::Supersede
        } else if event.state == entry.state
            && now < add_duration(entry.delivered_at, self.coalesce_window)
        {
            Verdict::Merge
        } else {
            Verdict::Fresh
        }
    }

    /// Record a delivery of `event` to `key` at `now`.
    pub fn record(&mut self, key: DeliveryKey, event: &Event, now: DateTime<Utc>) {
        let watermark = match self.entries.get(&key) {
            Some(entry) if entry.watermark > event.timestamp => entry.watermark,
            _ => event.timestamp,
        };
        self.entries.insert(
            key,
            Entry {
                state: event.state,
                watermark,
                delivered_at: now,
            },
        );
    }

    /// Forget deliveries which are older than the ledger's TTL.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.entries
            .retain(|_key, entry| now < add_duration(entry.delivered_at, ttl));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
