use super::health::Level;
use crate::store::{self, Store};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Subsystem name of the store reachability check.
pub const STORE: &str = "store";
/// Subsystem name of the notification queue depth check.
pub const QUEUE: &str = "notifier.queue";

/// Check observes the health of one monitored subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// Lag of a heartbeat written by the subsystem.
    Heartbeat {
        subsystem: String,
        key: String,
        lag_threshold: Duration,
    },
    /// Reachability of the Store.
    StoreReachable,
    /// Number of notifications which are due but not yet dispatched.
    QueueDepth { threshold: usize },
}

/// Observation of a Check.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub level: Level,
    pub detail: String,
}

impl Check {
    pub fn subsystem(&self) -> &str {
        match self {
            Check::Heartbeat { subsystem, .. } => subsystem,
            Check::StoreReachable => STORE,
            Check::QueueDepth { .. } => QUEUE,
        }
    }

    /// Observe the subsystem as of `now`. Store errors are returned
    /// only by checks which are not themselves checking the Store.
    pub async fn observe<S: Store>(
        &self,
        store: &S,
        now: DateTime<Utc>,
    ) -> store::Result<Observation> {
        match self {
            Check::Heartbeat {
                key, lag_threshold, ..
            } => {
                let Some(last_seen) = store.read_heartbeat(key).await? else {
                    return Ok(Observation {
                        level: Level::Critical,
                        detail: format!("no heartbeat has been written to {key}"),
                    });
                };
                let lag = (now - last_seen).to_std().unwrap_or_default();

                Ok(Observation {
                    level: graded(lag, *lag_threshold, lag_threshold.saturating_mul(2)),
                    detail: format!(
                        "last heartbeat was {} ago (threshold {})",
                        humantime::format_duration(truncate_secs(lag)),
                        humantime::format_duration(*lag_threshold),
                    ),
                })
            }
            Check::StoreReachable => Ok(match store.ping().await {
                Ok(()) => Observation {
                    level: Level::Healthy,
                    detail: "store is reachable".to_string(),
                },
                Err(err) => Observation {
                    level: Level::Critical,
                    detail: format!("store is unreachable: {err}"),
                },
            }),
            Check::QueueDepth { threshold } => {
                let depth = store.count_due_notifications(now).await?;

                let level = if depth > threshold.saturating_mul(2) {
                    Level::Critical
                } else if depth > *threshold {
                    Level::Degraded
                } else {
                    Level::Healthy
                };
                Ok(Observation {
                    level,
                    detail: format!("{depth} notifications are due (threshold {threshold})"),
                })
            }
        }
    }
}

fn graded(lag: Duration, degraded: Duration, critical: Duration) -> Level {
    if lag >= critical {
        Level::Critical
    } else if lag > degraded {
        Level::Degraded
    } else {
        Level::Healthy
    }
}

fn truncate_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}
