use crate::config::EventsConfig;
use crate::lifecycle::Worker;
use crate::models::{self, heartbeats, Event, ScheduledNotification};
use crate::store::{self, Store};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("event has no state transition (state is {0})")]
    NoTransition(models::State),
    #[error("trigger '{0}' of event was not found")]
    UnknownTrigger(String),
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Outcome of handling a single popped Event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Notifications were pushed for this many (subscription, contact) pairs.
    Scheduled(usize),
    /// The event was malformed or unresolvable, and was dropped.
    Dropped,
    /// Shutdown interrupted retries of a recoverable failure, and the event
    /// was returned to its queue.
    Requeued,
    /// The event could not be returned to its queue and was abandoned.
    Abandoned,
}

/// FetchEventsWorker consumes trigger state-change Events and schedules
/// a notification for each subscribed contact.
pub struct FetchEventsWorker<S: Store> {
    store: Arc<S>,
    config: EventsConfig,
}

impl<S: Store> FetchEventsWorker<S> {
    pub fn new(store: Arc<S>, config: EventsConfig) -> Self {
        Self { store, config }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(&self, shutdown: &CancellationToken) {
        let mut pop_failures = 0;

        while !shutdown.is_cancelled() {
            match self.store.pop_event(self.config.pop_timeout).await {
                Ok(Some(event)) => {
                    pop_failures = 0;
                    let _outcome = self.handle(event, Utc::now(), shutdown).await;
                }
                Ok(None) => pop_failures = 0,
                Err(err) if err.is_transient() => {
                    pop_failures += 1;
                    tracing::warn!(?err, pop_failures, "failed to pop event (will retry)");
                    self.config.backoff.sleep(pop_failures, shutdown).await;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(?err, "dropping malformed event");
                }
            }

            if let Err(err) = self
                .store
                .write_heartbeat(heartbeats::EVENTS, Utc::now())
                .await
            {
                tracing::warn!(?err, "failed to write events heartbeat");
            }
        }
    }

    /// Resolve `event` into the ScheduledNotifications it produces as of `now`.
    /// Exactly one notification is produced per distinct (subscription, contact) pair.
    pub async fn resolve(
        &self,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>, Error> {
        if event.state == event.old_state {
            return Err(Error::NoTransition(event.state));
        }
        let Some(trigger) = self.store.get_trigger(&event.trigger_id).await? else {
            return Err(Error::UnknownTrigger(event.trigger_id.clone()));
        };

        let subscriptions = self
            .store
            .get_subscriptions_by_tags(&trigger.tags)
            .await?;

        let due = models::add_duration(now, trigger.notify_delay.unwrap_or_default());
        let mut seen = BTreeSet::new();
        let mut notifications = Vec::new();

        for subscription in subscriptions {
            if !subscription.matches(&trigger.tags, event, now) {
                continue;
            }
            for contact_id in &subscription.contact_ids {
                if !seen.insert((subscription.id.clone(), contact_id.clone())) {
                    continue;
                }
                let Some(contact) = self.store.get_contact(contact_id).await? else {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        %contact_id,
                        "subscription references a contact which doesn't exist"
                    );
                    continue;
                };

                notifications.push(ScheduledNotification {
                    event: event.clone(),
                    trigger: trigger.clone(),
                    contact,
                    subscription_id: subscription.id.clone(),
                    throttled: false,
                    send_fail: 0,
                    timestamp: due,
                    created_at: now,
                    plot_image: None,
                });
            }
        }

        Ok(notifications)
    }

    /// Handle a popped `event`. The event was removed from its queue by the pop,
    /// so recoverable failures are retried until they succeed, or until
    /// `shutdown` is cancelled and the event is returned to its queue.
    #[tracing::instrument(
        skip_all,
        fields(trigger_id = %event.trigger_id, state = %event.state, old_state = %event.old_state)
    )]
    pub async fn handle(
        &self,
        event: Event,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let mut attempt = 0;
        let notifications = loop {
            match self.resolve(&event, now).await {
                Ok(notifications) => break notifications,
                Err(Error::Store(err)) if err.is_transient() => {
                    attempt += 1;
                    tracing::warn!(?err, attempt, "failed to resolve event (will retry)");

                    if !self.config.backoff.sleep(attempt, shutdown).await {
                        return self.repush(event).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "dropping unresolvable event");
                    return Outcome::Dropped;
                }
            }
        };
        let count = notifications.len();

        for (index, notification) in notifications.into_iter().enumerate() {
            match self.push_with_retry(notification, shutdown).await {
                Ok(()) => (),
                // Notifications which were already pushed will be pushed again
                // when the event is re-handled, and are merged by the scheduler.
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        ?err,
                        pushed = index,
                        count,
                        "stopped while pushing notifications (will re-push event)"
                    );
                    return self.repush(event).await;
                }
                Err(err) => {
                    tracing::error!(
                        ?err,
                        pushed = index,
                        count,
                        "dropping event after push failure"
                    );
                    return Outcome::Dropped;
                }
            }
        }

        if count == 0 {
            tracing::debug!("event matched no subscriptions");
        } else {
            tracing::info!(count, "scheduled notifications for event");
        }
        Outcome::Scheduled(count)
    }

    /// Push `notification`, retrying transient failures until it succeeds
    /// or `shutdown` is cancelled.
    async fn push_with_retry(
        &self,
        notification: ScheduledNotification,
        shutdown: &CancellationToken,
    ) -> store::Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.push_notification(notification.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    tracing::warn!(?err, attempt, "failed to push notification (will retry)");

                    if !self.config.backoff.sleep(attempt, shutdown).await {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Return `event` to its queue. Transient failures are retried until the
    /// push succeeds, even after shutdown, as the event is otherwise lost.
    async fn repush(&self, event: Event) -> Outcome {
        let mut attempt = 0;
        loop {
            match self.store.push_event(event.clone()).await {
                Ok(()) => return Outcome::Requeued,
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    tracing::warn!(?err, attempt, "failed to re-push event (will retry)");
                    tokio::time::sleep(self.config.backoff.delay(attempt)).await;
                }
                Err(err) => {
                    tracing::error!(?err, ?event, "failed to re-push event, abandoning it");
                    return Outcome::Abandoned;
                }
            }
        }
    }
}

impl<S: Store> Worker for FetchEventsWorker<S> {
    fn name(&self) -> &'static str {
        "events"
    }

    fn run(
        self,
        shutdown: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        async move { self.serve(&shutdown).await }
    }
}
