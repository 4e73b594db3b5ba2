use crate::config::SelfStateConfig;
use crate::lifecycle::Worker;
use crate::models::{add_duration, Event, State, Trigger};
use crate::senders::Registry;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod checks;
pub mod health;

use checks::Check;
use health::{Health, Level, Transition};

/// SelfStateAlert is the in-memory alert of a subsystem which isn't Healthy.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfStateAlert {
    pub kind: Level,
    pub raised_at: DateTime<Utc>,
    pub last_notified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// The subsystem escalated to a worse Level.
    Escalation,
    /// The subsystem remains degraded, and the re-notify interval has passed.
    Reminder,
    /// The subsystem returned to Healthy.
    Recovery,
}

/// Notice is an admin notification sent by the Monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub subsystem: String,
    pub kind: NoticeKind,
    pub level: Level,
    pub detail: String,
}

struct Subsystem {
    health: Health,
    alert: Option<SelfStateAlert>,
}

/// Monitor watches the health of the platform's subsystems and alerts
/// admin contacts when they degrade or recover.
pub struct Monitor<S: Store> {
    store: Arc<S>,
    senders: Registry,
    config: SelfStateConfig,
    checks: Vec<Check>,
    subsystems: BTreeMap<String, Subsystem>,
}

impl<S: Store> Monitor<S> {
    /// Build a Monitor, or return None if self-state monitoring is disabled.
    pub fn new(store: Arc<S>, senders: Registry, config: SelfStateConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let mut checks = Vec::new();
        if config.store_check {
            checks.push(Check::StoreReachable);
        }
        for heartbeat in &config.heartbeats {
            checks.push(Check::Heartbeat {
                subsystem: heartbeat.subsystem.clone(),
                key: heartbeat.key().to_string(),
                lag_threshold: heartbeat.lag_threshold,
            });
        }
        if let Some(threshold) = config.queue_depth_threshold {
            checks.push(Check::QueueDepth { threshold });
        }

        Some(Self {
            store,
            senders,
            config,
            checks,
            subsystems: BTreeMap::new(),
        })
    }

    /// Current Level of `subsystem`, if it's been observed.
    pub fn level(&self, subsystem: &str) -> Option<Level> {
        self.subsystems.get(subsystem).map(|s| s.health.level())
    }

    pub fn alert(&self, subsystem: &str) -> Option<&SelfStateAlert> {
        self.subsystems.get(subsystem)?.alert.as_ref()
    }

    /// Serve until `shutdown` is cancelled, checking every `check_interval`.
    pub async fn serve(&mut self, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.check_interval) => (),
                () = shutdown.cancelled() => break,
            }
            self.check(Utc::now()).await;
        }
    }

    /// Run all checks as of `now`, and send admin notifications for the
    /// resulting transitions. Returns the Notices which were sent.
    pub async fn check(&mut self, now: DateTime<Utc>) -> Vec<Notice> {
        let mut notices = Vec::new();

        for check in self.checks.clone() {
            let observation = match check.observe(self.store.as_ref(), now).await {
                Ok(observation) => observation,
                Err(err) => {
                    tracing::warn!(
                        subsystem = check.subsystem(),
                        ?err,
                        "failed to check subsystem (will retry)"
                    );
                    continue;
                }
            };
            let store_down =
                matches!(check, Check::StoreReachable) && observation.level != Level::Healthy;

            if let Some(notice) = self.observe(check.subsystem(), observation, now) {
                notices.push(notice);
            }
            if store_down {
                tracing::warn!("store is unreachable, skipping remaining checks");
                break;
            }
        }

        for notice in &notices {
            self.notify(notice, now).await;
        }
        notices
    }

    fn observe(
        &mut self,
        subsystem: &str,
        observation: checks::Observation,
        now: DateTime<Utc>,
    ) -> Option<Notice> {
        let (degrade_after, recover_after) = (self.config.degrade_after, self.config.recover_after);
        let entry = self
            .subsystems
            .entry(subsystem.to_string())
            .or_insert_with(|| Subsystem {
                health: Health::new(degrade_after, recover_after),
                alert: None,
            });

        tracing::debug!(
            subsystem,
            level = ?observation.level,
            detail = %observation.detail,
            "observed subsystem"
        );

        let kind = match entry.health.observe(observation.level) {
            Some(Transition::Escalated { from, to }) => {
                tracing::error!(
                    subsystem,
                    ?from,
                    ?to,
                    detail = %observation.detail,
                    "subsystem degraded"
                );
                let raised_at = entry.alert.as_ref().map_or(now, |alert| alert.raised_at);

                entry.alert = Some(SelfStateAlert {
                    kind: to,
                    raised_at,
                    last_notified_at: now,
                });
                NoticeKind::Escalation
            }
            Some(Transition::Recovered { from }) => {
                tracing::info!(subsystem, ?from, "subsystem recovered");
                entry.alert = None;
                NoticeKind::Recovery
            }
            None => {
                let alert = entry.alert.as_mut()?;
                if now < add_duration(alert.last_notified_at, self.config.renotify_interval) {
                    return None;
                }
                alert.last_notified_at = now;
                NoticeKind::Reminder
            }
        };

        Some(Notice {
            subsystem: subsystem.to_string(),
            kind,
            level: entry.health.level(),
            detail: observation.detail,
        })
    }

    async fn notify(&self, notice: &Notice, now: DateTime<Utc>) {
        let (trigger, event) = synthetic(notice, now);

        for contact in &self.config.admin_contacts {
            if let Err(err) = self.senders.send(contact, &event, &trigger, false).await {
                tracing::error!(
                    error = ?anyhow::Error::from(err),
                    contact_id = %contact.id,
                    subsystem = %notice.subsystem,
                    "failed to send self-state notification"
                );
            }
        }
    }
}

fn state_of(level: Level) -> State {
    match level {
        Level::Healthy => State::Ok,
        Level::Degraded => State::Warn,
        Level::Critical => State::Error,
    }
}

/// Build the synthetic Trigger and Event through which `notice` is delivered.
fn synthetic(notice: &Notice, now: DateTime<Utc>) -> (Trigger, Event) {
    let trigger = Trigger {
        id: format!("selfstate.{}", notice.subsystem),
        name: format!("Notifier self-state: {}", notice.subsystem),
        tags: vec!["selfstate".to_string()],
        source_type: Default::default(),
        notify_delay: None,
    };
    let state = state_of(notice.level);
    let old_state = match notice.kind {
        NoticeKind::Escalation | NoticeKind::Reminder => state,
        NoticeKind::Recovery => State::Error,
    };
    let event = Event {
        trigger_id: trigger.id.clone(),
        state,
        old_state,
        timestamp: now,
        metric: Some(notice.subsystem.clone()),
        value: None,
        message: Some(notice.detail.clone()),
    };
    (trigger, event)
}

impl<S: Store> Worker for Monitor<S> {
    fn name(&self) -> &'static str {
        "selfstate"
    }

    fn run(
        mut self,
        shutdown: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        async move { self.serve(&shutdown).await }
    }
}
