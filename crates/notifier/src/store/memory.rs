use super::{Error, Result, Store};
use crate::models::{
    Contact, Event, ScheduledNotification, Subscription, ThrottleKey, ThrottlingState, Trigger,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// MemoryStore is an in-process Store. Every operation is applied under a
/// single lock, which gives it the same atomicity a shared store provides.
/// Events are held in their encoded form, as a shared queue would hold them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events_ready: tokio::sync::Notify,
}

#[derive(Debug, Default)]
struct Inner {
    events: VecDeque<String>,
    // Keyed on (due timestamp, insertion sequence).
    notifications: BTreeMap<(DateTime<Utc>, u64), ScheduledNotification>,
    next_seq: u64,
    triggers: HashMap<String, Trigger>,
    subscriptions: BTreeMap<String, Subscription>,
    contacts: HashMap<String, Contact>,
    throttling: HashMap<ThrottleKey, ThrottlingState>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    unavailable: bool,
    failing_pushes: usize,
    event_pops: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the store as (un)available. While unavailable,
    /// every Store operation fails with Error::Unavailable.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unwrap().unavailable = !available;
    }

    /// Fail the next `count` calls to push_notification.
    pub fn fail_next_notification_pushes(&self, count: usize) {
        self.inner.lock().unwrap().failing_pushes = count;
    }

    pub fn put_trigger(&self, trigger: Trigger) {
        self.inner
            .lock()
            .unwrap()
            .triggers
            .insert(trigger.id.clone(), trigger);
    }

    pub fn put_subscription(&self, subscription: Subscription) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn remove_subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .remove(subscription_id)
    }

    pub fn put_contact(&self, contact: Contact) {
        self.inner
            .lock()
            .unwrap()
            .contacts
            .insert(contact.id.clone(), contact);
    }

    pub fn remove_contact(&self, contact_id: &str) -> Option<Contact> {
        self.inner.lock().unwrap().contacts.remove(contact_id)
    }

    /// Push an already-encoded event, as a producer would.
    pub fn push_raw_event(&self, raw: impl Into<String>) {
        self.inner.lock().unwrap().events.push_back(raw.into());
        self.events_ready.notify_one();
    }

    /// Number of attempts to pop an event, including failed ones.
    pub fn event_pops(&self) -> usize {
        self.inner.lock().unwrap().event_pops
    }

    pub fn queued_events(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    /// Snapshot of all queued notifications, in due order.
    pub fn queued_notifications(&self) -> Vec<ScheduledNotification> {
        self.inner
            .lock()
            .unwrap()
            .notifications
            .values()
            .cloned()
            .collect()
    }

    pub fn throttle_state(&self, key: &ThrottleKey) -> Option<ThrottlingState> {
        self.inner.lock().unwrap().throttling.get(key).cloned()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let guard = self.inner.lock().unwrap();
        if guard.unavailable {
            return Err(Error::Unavailable("memory store is marked unavailable".to_string()));
        }
        Ok(guard)
    }

    fn try_pop_event(&self) -> Result<Option<Event>> {
        self.inner.lock().unwrap().event_pops += 1;

        let Some(raw) = self.lock()?.events.pop_front() else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| Error::Decode {
                kind: "event",
                source,
            })
    }
}

impl Store for MemoryStore {
    async fn pop_event<'s>(&'s self, timeout: std::time::Duration) -> Result<Option<Event>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking, so that a push which
            // races with our check is not missed.
            let notified = self.events_ready.notified();

            if let Some(event) = self.try_pop_event()? {
                return Ok(Some(event));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn push_event<'s>(&'s self, event: Event) -> Result<()> {
        let raw = serde_json::to_string(&event).map_err(|source| Error::Decode {
            kind: "event",
            source,
        })?;
        self.lock()?.events.push_back(raw);
        self.events_ready.notify_one();
        Ok(())
    }

    async fn push_notification<'s>(&'s self, notification: ScheduledNotification) -> Result<()> {
        let mut inner = self.lock()?;

        if inner.failing_pushes != 0 {
            inner.failing_pushes -= 1;
            return Err(Error::Unavailable("injected push failure".to_string()));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .notifications
            .insert((notification.timestamp, seq), notification);

        Ok(())
    }

    async fn pop_due_notifications<'s>(
        &'s self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledNotification>> {
        let mut inner = self.lock()?;
        let mut due = Vec::new();

        while due.len() < limit {
            match inner.notifications.first_entry() {
                Some(entry) if entry.key().0 <= now => due.push(entry.remove()),
                _ => break,
            }
        }
        Ok(due)
    }

    async fn count_due_notifications<'s>(&'s self, now: DateTime<Utc>) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner
            .notifications
            .keys()
            .take_while(|(due, _seq)| *due <= now)
            .count())
    }

    async fn get_trigger<'s>(&'s self, trigger_id: &'s str) -> Result<Option<Trigger>> {
        Ok(self.lock()?.triggers.get(trigger_id).cloned())
    }

    async fn get_subscriptions_by_tags<'s>(
        &'s self,
        tags: &'s [String],
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .filter(|sub| sub.tags.iter().any(|tag| tags.contains(tag)))
            .cloned()
            .collect())
    }

    async fn get_subscription<'s>(
        &'s self,
        subscription_id: &'s str,
    ) -> Result<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(subscription_id).cloned())
    }

    async fn get_contact<'s>(&'s self, contact_id: &'s str) -> Result<Option<Contact>> {
        Ok(self.lock()?.contacts.get(contact_id).cloned())
    }

    async fn get_throttle_state<'s>(
        &'s self,
        key: &'s ThrottleKey,
    ) -> Result<Option<ThrottlingState>> {
        Ok(self.lock()?.throttling.get(key).cloned())
    }

    async fn set_throttle_state<'s>(
        &'s self,
        key: &'s ThrottleKey,
        expected: Option<&'s ThrottlingState>,
        next: ThrottlingState,
    ) -> Result<bool> {
        let mut inner = self.lock()?;

        if inner.throttling.get(key) != expected {
            return Ok(false);
        }
        inner.throttling.insert(key.clone(), next);
        Ok(true)
    }

    async fn write_heartbeat<'s>(&'s self, subsystem: &'s str, ts: DateTime<Utc>) -> Result<()> {
        self.lock()?.heartbeats.insert(subsystem.to_string(), ts);
        Ok(())
    }

    async fn read_heartbeat<'s>(&'s self, subsystem: &'s str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock()?.heartbeats.get(subsystem).cloned())
    }

    async fn ping<'s>(&'s self) -> Result<()> {
        self.lock().map(|_guard| ())
    }
}
