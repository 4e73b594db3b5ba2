use crate::config::{NotificationsConfig, ThrottlePolicy};
use crate::lifecycle::Worker;
use crate::models::{
    add_duration, heartbeats, DeliveryKey, ScheduledNotification, State, ThrottlingState,
};
use crate::senders::{self, Registry};
use crate::store::{self, Store};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod ledger;
pub mod throttling;

use ledger::{Ledger, Verdict};

/// Attempts made to compare-and-set a throttling state before re-queuing.
const THROTTLE_CAS_ATTEMPTS: usize = 3;

/// Delay of a notification which is re-queued after a recoverable Store failure.
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Disposition is the outcome of processing one due notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The notification was delivered.
    Delivered,
    /// Delivery failed and the notification was re-queued for another attempt.
    Retrying { send_fail: u32, due: DateTime<Utc> },
    /// Delivery failed and retries are exhausted. The notification was dropped.
    PermanentlyFailed,
    /// The notification fell within its throttling window. It's re-queued
    /// until `deferred_until`, or dropped if that's None.
    Throttled { deferred_until: Option<DateTime<Utc>> },
    /// The notification was re-queued after a recoverable Store failure.
    Requeued { due: DateTime<Utc> },
    /// The notification's subscription or contact is gone or disabled, or
    /// the Store rejected it as invalid.
    Dropped,
    /// An identical notification was recently delivered to the contact.
    Merged,
    /// A newer event of the trigger was already delivered to the contact.
    Superseded,
}

/// NotificationsWorker dequeues due notifications and dispatches them
/// through the sender Registry.
pub struct NotificationsWorker<S: Store> {
    store: Arc<S>,
    senders: Registry,
    config: NotificationsConfig,
    ledger: Mutex<Ledger>,
}

impl<S: Store> NotificationsWorker<S> {
    pub fn new(store: Arc<S>, senders: Registry, config: NotificationsConfig) -> Self {
        let ledger = Ledger::new(config.coalesce_window, config.ledger_ttl);

        Self {
            store,
            senders,
            config,
            ledger: Mutex::new(ledger),
        }
    }

    /// Serve until `shutdown` is cancelled. Cancellation is observed only
    /// between polls, so an in-progress batch always runs to completion.
    pub async fn serve(&self, shutdown: &CancellationToken) {
        let mut poll_failures = 0;

        while !shutdown.is_cancelled() {
            let dispositions = match self.poll(Utc::now()).await {
                Ok(dispositions) => dispositions,
                Err(err) => {
                    poll_failures += 1;
                    tracing::warn!(
                        ?err,
                        poll_failures,
                        "failed to fetch due notifications (will retry)"
                    );
                    self.config.backoff.sleep(poll_failures, shutdown).await;
                    continue;
                }
            };
            poll_failures = 0;

            if let Err(err) = self
                .store
                .write_heartbeat(heartbeats::NOTIFICATIONS, Utc::now())
                .await
            {
                tracing::warn!(?err, "failed to write notifications heartbeat");
            }

            if dispositions.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => (),
                    () = shutdown.cancelled() => (),
                }
            }
        }
    }

    /// Pop and process a batch of notifications which are due as of `now`.
    /// Notifications of different (trigger, contact) pairs are processed
    /// concurrently, while those of the same pair are processed in due order.
    pub async fn poll(
        &self,
        now: DateTime<Utc>,
    ) -> store::Result<Vec<(DeliveryKey, Disposition)>> {
        self.ledger.lock().unwrap().expire(now);

        let batch = self
            .store
            .pop_due_notifications(now, self.config.batch_size)
            .await?;

        if batch.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(count = batch.len(), "popped due notifications");

        let mut groups: BTreeMap<DeliveryKey, Vec<ScheduledNotification>> = BTreeMap::new();
        for notification in batch {
            groups
                .entry(notification.delivery_key())
                .or_default()
                .push(notification);
        }

        let groups = groups
            .into_iter()
            .map(|(key, group)| self.process_group(key, group, now));
        let dispositions = futures::future::join_all(groups).await;

        Ok(dispositions.into_iter().flatten().collect())
    }

    async fn process_group(
        &self,
        key: DeliveryKey,
        group: Vec<ScheduledNotification>,
        now: DateTime<Utc>,
    ) -> Vec<(DeliveryKey, Disposition)> {
        let mut seen: HashSet<(State, DateTime<Utc>)> = HashSet::new();
        let mut out = Vec::with_capacity(group.len());

        for notification in group {
            // Collapse copies of one event which were scheduled more than once.
            let event_id = (notification.event.state, notification.event.timestamp);

            let disposition = if !seen.insert(event_id) {
                tracing::debug!(
                    trigger_id = %key.trigger_id,
                    contact_id = %key.contact_id,
                    "merged duplicate notification within batch"
                );
                Disposition::Merged
            } else {
                self.process(notification, now).await
            };
            out.push((key.clone(), disposition));
        }
        out
    }

    /// Process a single due `notification` as of `now`.
    #[tracing::instrument(
        skip_all,
        fields(
            trigger_id = %notification.trigger.id,
            contact_id = %notification.contact.id,
            subscription_id = %notification.subscription_id,
            state = %notification.event.state,
            send_fail = notification.send_fail
        )
    )]
    pub async fn process(
        &self,
        mut notification: ScheduledNotification,
        now: DateTime<Utc>,
    ) -> Disposition {
        let key = notification.delivery_key();

        // Re-validate the subscription and contact, which may have changed
        // since the notification was scheduled.
        let subscription = match self
            .store
            .get_subscription(&notification.subscription_id)
            .await
        {
            Ok(Some(subscription))
                if subscription.enabled
                    && subscription.contact_ids.contains(&notification.contact.id) =>
            {
                subscription
            }
            Ok(_) => {
                tracing::debug!("dropping notification of removed or disabled subscription");
                return Disposition::Dropped;
            }
            Err(err) => return self.requeue_after_error(notification, now, err).await,
        };
        notification.contact = match self.store.get_contact(&notification.contact.id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                tracing::debug!("dropping notification of removed contact");
                return Disposition::Dropped;
            }
            Err(err) => return self.requeue_after_error(notification, now, err).await,
        };

        let verdict = self
            .ledger
            .lock()
            .unwrap()
            .check(&key, &notification.event, now);

        match verdict {
            Verdict::Fresh => (),
            Verdict::Merge => {
                tracing::debug!("merged notification with a recent identical delivery");
                return Disposition::Merged;
            }
            Verdict::Supersede => {
                tracing::debug!("dropping notification superseded by a newer delivered event");
                return Disposition::Superseded;
            }
        }

        // Retries were admitted by throttling on their first attempt.
        if subscription.throttling && notification.send_fail == 0 {
            match self.throttle(&notification, now).await {
                Ok(None) => (),
                Ok(Some(next_allowed)) => match self.config.throttling.policy {
                    ThrottlePolicy::Defer => {
                        tracing::debug!(%next_allowed, "deferring throttled notification");
                        notification.throttled = true;
                        notification.timestamp = next_allowed;

                        return self
                            .requeue(
                                notification,
                                Disposition::Throttled {
                                    deferred_until: Some(next_allowed),
                                },
                            )
                            .await;
                    }
                    ThrottlePolicy::Drop => {
                        tracing::debug!(%next_allowed, "dropping throttled notification");
                        return Disposition::Throttled {
                            deferred_until: None,
                        };
                    }
                },
                Err(err) => return self.requeue_after_error(notification, now, err).await,
            }
        }

        match self
            .senders
            .send(
                &notification.contact,
                &notification.event,
                &notification.trigger,
                notification.throttled,
            )
            .await
        {
            Ok(()) => {
                self.ledger
                    .lock()
                    .unwrap()
                    .record(key, &notification.event, now);
                tracing::info!(throttled = notification.throttled, "delivered notification");

                if subscription.throttling {
                    self.update_throttle(&notification, |current| {
                        throttling::confirm(current, &notification.event)
                    })
                    .await;
                }
                Disposition::Delivered
            }
            Err(err @ senders::Error::UnknownContactType(_)) => {
                tracing::warn!(%err, "dropping notification which cannot be delivered");

                if subscription.throttling {
                    self.release_throttle(&notification, now).await;
                }
                Disposition::Dropped
            }
            Err(err) => {
                notification.send_fail += 1;
                let send_fail = notification.send_fail;

                if send_fail >= self.config.max_retries {
                    tracing::error!(
                        error = ?anyhow::Error::from(err),
                        send_fail,
                        "notification permanently failed and is dropped"
                    );
                    if subscription.throttling {
                        self.release_throttle(&notification, now).await;
                    }
                    return Disposition::PermanentlyFailed;
                }
                let due = add_duration(now, self.config.retry_backoff.delay(send_fail));
                tracing::warn!(
                    error = ?anyhow::Error::from(err),
                    send_fail,
                    %due,
                    "failed to send notification (will retry)"
                );
                notification.timestamp = due;

                self.requeue(notification, Disposition::Retrying { send_fail, due })
                    .await
            }
        }
    }

    /// Apply throttling to `notification`, recording the outcome in the Store.
    /// Returns the time until which it's held, or None if it may be delivered.
    async fn throttle(
        &self,
        notification: &ScheduledNotification,
        now: DateTime<Utc>,
    ) -> store::Result<Option<DateTime<Utc>>> {
        let key = notification.throttle_key();

        for attempt in 1..=THROTTLE_CAS_ATTEMPTS {
            let current = self.store.get_throttle_state(&key).await?;
            let decision = throttling::evaluate(
                &self.config.throttling,
                current.as_ref(),
                &notification.event,
                now,
            );

            let (held, next) = match decision {
                throttling::Decision::Admit(next) => (None, next),
                throttling::Decision::Throttle(next) => (Some(next.next_allowed), next),
            };

            if self
                .store
                .set_throttle_state(&key, current.as_ref(), next)
                .await?
            {
                return Ok(held);
            }
            tracing::debug!(attempt, "throttling state changed concurrently (will retry)");
        }

        Err(store::Error::Unavailable(format!(
            "throttling state of {key:?} is contended"
        )))
    }

    /// Re-open the throttling window reserved by `notification`, which
    /// will never be delivered.
    async fn release_throttle(&self, notification: &ScheduledNotification, now: DateTime<Utc>) {
        self.update_throttle(notification, |current| {
            throttling::release(current, &notification.event, now)
        })
        .await;
    }

    /// Apply `update` to the throttling state of the notification's subscription.
    /// Failures are logged and otherwise ignored, leaving the window as it was.
    async fn update_throttle(
        &self,
        notification: &ScheduledNotification,
        update: impl Fn(&ThrottlingState) -> Option<ThrottlingState> + Send + Sync,
    ) {
        let key = notification.throttle_key();

        for attempt in 1..=THROTTLE_CAS_ATTEMPTS {
            let current = match self.store.get_throttle_state(&key).await {
                Ok(Some(current)) => current,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(?err, "failed to read throttling state");
                    return;
                }
            };
            let Some(next) = update(&current) else {
                return;
            };

            match self.store.set_throttle_state(&key, Some(&current), next).await {
                Ok(true) => return,
                Ok(false) => {
                    tracing::debug!(attempt, "throttling state changed concurrently (will retry)")
                }
                Err(err) => {
                    tracing::warn!(?err, "failed to update throttling state");
                    return;
                }
            }
        }
        tracing::warn!(?key, "throttling state is contended, leaving it unchanged");
    }

    async fn requeue_after_error(
        &self,
        notification: ScheduledNotification,
        now: DateTime<Utc>,
        err: store::Error,
    ) -> Disposition {
        if !err.is_transient() {
            tracing::warn!(?err, "dropping notification after store error");
            return Disposition::Dropped;
        }
        let due = add_duration(now, REQUEUE_DELAY);
        tracing::warn!(?err, %due, "failed to process notification (will re-queue)");

        let mut notification = notification;
        notification.timestamp = due;
        self.requeue(notification, Disposition::Requeued { due }).await
    }

    /// Return `notification` to the Store, yielding `disposition` on success.
    /// Transient failures are retried until the Store accepts it, even during
    /// shutdown, as a popped notification is otherwise lost.
    async fn requeue(
        &self,
        notification: ScheduledNotification,
        disposition: Disposition,
    ) -> Disposition {
        let mut attempt = 0;
        loop {
            match self.store.push_notification(notification.clone()).await {
                Ok(()) => return disposition,
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    tracing::warn!(
                        ?err,
                        attempt,
                        ?disposition,
                        "failed to re-queue notification (will retry)"
                    );
                    tokio::time::sleep(self.config.backoff.delay(attempt)).await;
                }
                Err(err) => {
                    tracing::error!(
                        ?err,
                        ?disposition,
                        "failed to re-queue notification, dropping it"
                    );
                    return Disposition::Dropped;
                }
            }
        }
    }
}

impl<S: Store> Worker for NotificationsWorker<S> {
    fn name(&self) -> &'static str {
        "notifications"
    }

    fn run(
        self,
        shutdown: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        async move { self.serve(&shutdown).await }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backoff::Backoff;
    use crate::config::ThrottlingConfig;
    use crate::models::{Contact, Event, Subscription, Trigger};
    use crate::senders::Sender;
    use crate::store::MemoryStore;
    use chrono::{TimeDelta, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records deliveries, and fails the first `fail_first` of them.
    #[derive(Debug, Default, Clone)]
    struct Recorder {
        sent: Arc<Mutex<Vec<(String, State, bool)>>>,
        attempts: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl Sender for Recorder {
        async fn send<'s>(
            &'s self,
            contact: &'s Contact,
            event: &'s Event,
            _trigger: &'s Trigger,
            throttled: bool,
        ) -> anyhow::Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                anyhow::bail!("connection refused");
            }
            self.sent
                .lock()
                .unwrap()
                .push((contact.id.clone(), event.state, throttled));
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn fixture(
        recorder: Recorder,
        throttling: bool,
        policy: ThrottlePolicy,
    ) -> (Arc<MemoryStore>, NotificationsWorker<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());

        for id in ["c1", "c2"] {
            store.put_contact(Contact {
                id: id.to_string(),
                type_: "email".to_string(),
                value: format!("{id}@example.test"),
            });
        }
        store.put_subscription(Subscription {
            id: "s1".to_string(),
            contact_ids: vec!["c1".to_string(), "c2".to_string()],
            tags: vec!["db".to_string()],
            enabled: true,
            throttling,
            ignore_warnings: false,
            ignore_recoverings: false,
            schedule: None,
        });

        let config = NotificationsConfig {
            poll_interval: Duration::from_millis(100),
            batch_size: 10,
            max_retries: 3,
            retry_backoff: Backoff {
                initial: Duration::from_secs(60),
                max: Duration::from_secs(600),
                jitter_percent: 0,
            },
            coalesce_window: Duration::from_secs(60),
            ledger_ttl: Duration::from_secs(3600),
            throttling: ThrottlingConfig {
                policy,
                window: Duration::from_secs(600),
                max_window: Duration::from_secs(3600),
                escalate_after: 10,
                expiry: Duration::from_secs(3600),
            },
            backoff: Backoff {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
                jitter_percent: 0,
            },
        };
        let senders = Registry::new(Duration::from_secs(5)).register("email", recorder);

        (store.clone(), NotificationsWorker::new(store, senders, config))
    }

    fn notification(contact: &str, state: State, event_ts: DateTime<Utc>) -> ScheduledNotification {
        ScheduledNotification {
            event: Event {
                trigger_id: "t1".to_string(),
                state,
                old_state: State::Ok,
                timestamp: event_ts,
                metric: None,
                value: None,
                message: None,
            },
            trigger: Trigger {
                id: "t1".to_string(),
                name: "Replication lag".to_string(),
                tags: vec!["db".to_string()],
                source_type: Default::default(),
                notify_delay: None,
            },
            contact: Contact {
                id: contact.to_string(),
                type_: "email".to_string(),
                value: format!("{contact}@example.test"),
            },
            subscription_id: "s1".to_string(),
            throttled: false,
            send_fail: 0,
            timestamp: event_ts,
            created_at: event_ts,
            plot_image: None,
        }
    }

    #[tokio::test]
    async fn test_batch_is_grouped_and_coalesced() {
        let recorder = Recorder::default();
        let (store, worker) = fixture(recorder.clone(), false, ThrottlePolicy::Defer);
        let t0 = t0();

        for n in [
            notification("c1", State::Error, t0),
            notification("c2", State::Error, t0),
            // Duplicate of the first, as produced by a re-pushed event.
            notification("c1", State::Error, t0),
            // Older than the first, and due after it.
            notification("c1", State::Warn, t0 - TimeDelta::seconds(30)),
        ] {
            let mut n = n;
            n.timestamp = t0;
            store.push_notification(n).await.unwrap();
        }

        let dispositions: Vec<_> = worker
            .poll(t0)
            .await
            .unwrap()
            .into_iter()
            .map(|(key, disposition)| (key.contact_id, disposition))
            .collect();

        insta::assert_debug_snapshot!(dispositions, @r###"
        [
            (
                "c1",
                Delivered,
            ),
            (
                "c1",
                Merged,
            ),
            (
                "c1",
                Superseded,
            ),
            (
                "c2",
                Delivered,
            ),
        ]
        "###);
        assert!(store.queued_notifications().is_empty());
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);

        // The same event, re-scheduled after delivery, is merged.
        store.push_notification(notification("c1", State::Error, t0)).await.unwrap();
        let dispositions = worker.poll(t0 + TimeDelta::seconds(10)).await.unwrap();
        assert_eq!(dispositions[0].1, Disposition::Merged);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let recorder = Recorder {
            fail_first: usize::MAX,
            ..Default::default()
        };
        let (store, worker) = fixture(recorder.clone(), false, ThrottlePolicy::Defer);
        let mut now = t0();

        store.push_notification(notification("c1", State::Error, now)).await.unwrap();

        let mut dispositions = Vec::new();
        for _ in 0..5 {
            for (_key, disposition) in worker.poll(now).await.unwrap() {
                dispositions.push(disposition);
            }
            match store.queued_notifications().first() {
                Some(queued) => now = queued.timestamp,
                None => break,
            }
        }

        assert_eq!(
            dispositions,
            vec![
                Disposition::Retrying {
                    send_fail: 1,
                    due: t0() + TimeDelta::seconds(60),
                },
                Disposition::Retrying {
                    send_fail: 2,
                    due: t0() + TimeDelta::seconds(180),
                },
                Disposition::PermanentlyFailed,
            ]
        );
        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 3);
        assert!(store.queued_notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidation_drops_stale_notifications() {
        let (store, worker) = fixture(Recorder::default(), false, ThrottlePolicy::Defer);
        let t0 = t0();

        store.remove_contact("c2");
        assert_eq!(
            worker.process(notification("c2", State::Error, t0), t0).await,
            Disposition::Dropped
        );

        let mut other_type = notification("c1", State::Error, t0);
        store.put_contact(Contact {
            id: "c1".to_string(),
            type_: "pager".to_string(),
            value: "+15550100".to_string(),
        });
        other_type.contact.type_ = "email".to_string();
        // The contact's current type is used, which has no sender.
        assert_eq!(worker.process(other_type, t0).await, Disposition::Dropped);

        store.remove_subscription("s1");
        assert_eq!(
            worker.process(notification("c1", State::Error, t0), t0).await,
            Disposition::Dropped
        );

    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_survives_store_outage() {
        let (store, worker) = fixture(Recorder::default(), false, ThrottlePolicy::Defer);
        let t0 = t0();
        store.set_available(false);

        let recover = tokio::spawn({
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                store.set_available(true);
            }
        });
        let disposition = worker.process(notification("c1", State::Error, t0), t0).await;
        recover.await.unwrap();

        let due = t0 + TimeDelta::seconds(1);
        assert_eq!(disposition, Disposition::Requeued { due });

        let queued = store.queued_notifications();
        assert_eq!(queued.len(), 1);
        assert_eq!((queued[0].contact.id.as_str(), queued[0].timestamp), ("c1", due));
    }

    #[tokio::test]
    async fn test_throttling_defers_within_window() {
        let recorder = Recorder::default();
        let (store, worker) = fixture(recorder.clone(), true, ThrottlePolicy::Defer);
        let t0 = t0();

        let first = worker.process(notification("c1", State::Error, t0), t0).await;
        assert_eq!(first, Disposition::Delivered);

        // A later event in the same state is held until the window closes.
        let at = t0 + TimeDelta::minutes(2);
        let second = worker.process(notification("c1", State::Error, at), at).await;
        let until = t0 + TimeDelta::minutes(10);
        assert_eq!(
            second,
            Disposition::Throttled {
                deferred_until: Some(until)
            }
        );
        let queued = store.queued_notifications();
        assert_eq!((queued.len(), queued[0].throttled, queued[0].timestamp), (1, true, until));

        // When it comes due, it's delivered and flagged as throttled.
        let dispositions = worker.poll(until).await.unwrap();
        assert_eq!(dispositions[0].1, Disposition::Delivered);
        assert_eq!(
            recorder.sent.lock().unwrap().clone(),
            vec![
                ("c1".to_string(), State::Error, false),
                ("c1".to_string(), State::Error, true),
            ]
        );

        let key = queued[0].throttle_key();
        let state = store.throttle_state(&key).unwrap();
        assert_eq!(state.last_sent, until);
        assert_eq!(state.next_allowed, until + TimeDelta::minutes(10));
    }

    #[tokio::test]
    async fn test_throttling_window_is_shared_by_triggers_and_contacts() {
        let recorder = Recorder::default();
        let (_store, worker) = fixture(recorder.clone(), true, ThrottlePolicy::Drop);
        let t0 = t0();

        // Every contact receives the event which opened the window.
        for contact in ["c1", "c2"] {
            assert_eq!(
                worker.process(notification(contact, State::Error, t0), t0).await,
                Disposition::Delivered
            );
        }

        // Another trigger matched by the subscription shares its window.
        let at = t0 + TimeDelta::minutes(2);
        let mut other = notification("c1", State::Error, at);
        other.event.trigger_id = "t2".to_string();
        other.trigger.id = "t2".to_string();
        assert_eq!(
            worker.process(other, at).await,
            Disposition::Throttled { deferred_until: None }
        );
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_undeliverable_notification_releases_window() {
        let recorder = Recorder::default();
        let (store, worker) = fixture(recorder.clone(), true, ThrottlePolicy::Drop);
        let t0 = t0();

        // c1 switched to a contact type which has no sender.
        store.put_contact(Contact {
            id: "c1".to_string(),
            type_: "pager".to_string(),
            value: "+15550100".to_string(),
        });
        assert_eq!(
            worker.process(notification("c1", State::Error, t0), t0).await,
            Disposition::Dropped
        );

        let key = notification("c1", State::Error, t0).throttle_key();
        assert_eq!(store.throttle_state(&key).unwrap().next_allowed, t0);

        // The window wasn't used, so the next event is delivered.
        let at = t0 + TimeDelta::minutes(2);
        assert_eq!(
            worker.process(notification("c2", State::Error, at), at).await,
            Disposition::Delivered
        );
        let state = store.throttle_state(&key).unwrap();
        assert!(state.confirmed);
        assert_eq!(state.next_allowed, at + TimeDelta::minutes(10));
    }

    #[tokio::test]
    async fn test_throttling_drop_policy() {
        let recorder = Recorder::default();
        let (store, worker) = fixture(recorder.clone(), true, ThrottlePolicy::Drop);
        let t0 = t0();

        assert_eq!(
            worker.process(notification("c1", State::Error, t0), t0).await,
            Disposition::Delivered
        );
        let at = t0 + TimeDelta::minutes(2);
        assert_eq!(
            worker.process(notification("c1", State::Error, at), at).await,
            Disposition::Throttled { deferred_until: None }
        );
        // A recovery is never throttled.
        let at = t0 + TimeDelta::minutes(3);
        assert_eq!(
            worker.process(notification("c1", State::Ok, at), at).await,
            Disposition::Delivered
        );

        assert!(store.queued_notifications().is_empty());
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_backs_off_while_store_is_unavailable() {
        let recorder = Recorder::default();
        let (store, worker) = fixture(recorder.clone(), false, ThrottlePolicy::Defer);
        let shutdown = CancellationToken::new();

        store
            .push_notification(notification("c1", State::Error, Utc::now()))
            .await
            .unwrap();
        store.set_available(false);

        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(recorder.sent.lock().unwrap().is_empty());

        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
        assert!(store.queued_notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_heartbeats_and_stops() {
        let (store, worker) = fixture(Recorder::default(), false, ThrottlePolicy::Defer);
        let shutdown = CancellationToken::new();

        store
            .push_notification(notification("c1", State::Error, Utc::now()))
            .await
            .unwrap();

        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert!(store.queued_notifications().is_empty());
        assert!(store
            .read_heartbeat(heartbeats::NOTIFICATIONS)
            .await
            .unwrap()
            .is_some());
    }
}
