//! Store is the persistent, shared data store through which the notifier's
//! workers communicate. It's an external collaborator: implementations must
//! provide atomic queue pops and pushes, and an atomic compare-and-set of
//! throttling state, as workers rely on these rather than client-side locks.
use crate::models::{
    Contact, Event, ScheduledNotification, Subscription, ThrottleKey, ThrottlingState, Trigger,
};
use chrono::{DateTime, Utc};
use std::future::Future;

pub mod memory;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store is unavailable: {0}")]
    Unavailable(String),
    #[error("timed out waiting for the store")]
    Timeout,
    #[error("failed to decode stored {kind}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Transient errors are expected to resolve on retry.
    /// Others indicate a problem with the particular item being handled.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait Store: Send + Sync + 'static {
    /// Pop the next Event, waiting up to `timeout` for one to arrive.
    /// Returns None if no Event arrived within `timeout`.
    fn pop_event<'s>(
        &'s self,
        timeout: std::time::Duration,
    ) -> impl Future<Output = Result<Option<Event>>> + Send + 's;

    /// Push an Event to the events queue.
    fn push_event<'s>(&'s self, event: Event) -> impl Future<Output = Result<()>> + Send + 's;

    /// Queue a ScheduledNotification, ordered by its due timestamp.
    fn push_notification<'s>(
        &'s self,
        notification: ScheduledNotification,
    ) -> impl Future<Output = Result<()>> + Send + 's;

    /// Pop up to `limit` notifications which are due as of `now`, in
    /// ascending order of due timestamp and then of insertion.
    fn pop_due_notifications<'s>(
        &'s self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ScheduledNotification>>> + Send + 's;

    /// Count notifications which are due as of `now` but not yet popped.
    fn count_due_notifications<'s>(
        &'s self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send + 's;

    fn get_trigger<'s>(
        &'s self,
        trigger_id: &'s str,
    ) -> impl Future<Output = Result<Option<Trigger>>> + Send + 's;

    /// Fetch all Subscriptions having at least one of `tags`.
    fn get_subscriptions_by_tags<'s>(
        &'s self,
        tags: &'s [String],
    ) -> impl Future<Output = Result<Vec<Subscription>>> + Send + 's;

    fn get_subscription<'s>(
        &'s self,
        subscription_id: &'s str,
    ) -> impl Future<Output = Result<Option<Subscription>>> + Send + 's;

    fn get_contact<'s>(
        &'s self,
        contact_id: &'s str,
    ) -> impl Future<Output = Result<Option<Contact>>> + Send + 's;

    /// Fetch the current ThrottlingState of `key`. Implementations may evict
    /// states after their `expires_at`, but callers must also treat a
    /// returned state which has expired as absent.
    fn get_throttle_state<'s>(
        &'s self,
        key: &'s ThrottleKey,
    ) -> impl Future<Output = Result<Option<ThrottlingState>>> + Send + 's;

    /// Atomically replace the ThrottlingState of `key` with `next`, if and
    /// only if its current state is `expected`. Returns false on conflict.
    fn set_throttle_state<'s>(
        &'s self,
        key: &'s ThrottleKey,
        expected: Option<&'s ThrottlingState>,
        next: ThrottlingState,
    ) -> impl Future<Output = Result<bool>> + Send + 's;

    fn write_heartbeat<'s>(
        &'s self,
        subsystem: &'s str,
        ts: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send + 's;

    fn read_heartbeat<'s>(
        &'s self,
        subsystem: &'s str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send + 's;

    /// Verify that the store is reachable.
    fn ping<'s>(&'s self) -> impl Future<Output = Result<()>> + Send + 's;
}
