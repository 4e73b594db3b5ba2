use chrono::{DateTime, Datelike, Timelike, Utc};
use std::time::Duration;

/// State of a trigger, as evaluated by the checking subsystem.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Ok,
    Warn,
    Error,
    NoData,
    Exception,
}

impl State {
    pub fn is_ok(&self) -> bool {
        matches!(self, State::Ok)
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::Warn => "WARN",
            State::Error => "ERROR",
            State::NoData => "NODATA",
            State::Exception => "EXCEPTION",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Event is a state transition of a trigger.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "triggerID")]
    pub trigger_id: String,
    pub state: State,
    pub old_state: State,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    /// Returns true if this event is a transition between OK and WARN only.
    pub fn is_warning_only(&self) -> bool {
        matches!(
            (self.old_state, self.state),
            (State::Ok, State::Warn) | (State::Warn, State::Ok) | (State::Warn, State::Warn)
        )
    }

    /// Returns true if this event recovers the trigger into OK.
    pub fn is_recovery(&self) -> bool {
        self.state.is_ok() && !self.old_state.is_ok()
    }
}

/// Source of the metrics which a trigger is evaluated over.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Graphite,
    Prometheus,
    #[default]
    Local,
}

/// Trigger is a named alerting rule, owned by the checking subsystem.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_type: SourceType,
    /// Delay applied to notifications of this trigger before they become due.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub notify_delay: Option<Duration>,
}

/// Schedule restricts the times of day and days of week during which
/// a subscription receives notifications.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Days on which the subscription is active. Empty means every day.
    #[serde(default)]
    pub days: Vec<chrono::Weekday>,
    /// Minute of the day at which the window opens.
    pub start_offset: u32,
    /// Minute of the day at which the window closes. A window whose
    /// end precedes its start wraps around midnight.
    pub end_offset: u32,
    /// Offset of the schedule's timezone from UTC, in minutes.
    #[serde(default)]
    pub tz_offset: i32,
}

impl Schedule {
    const MINUTES_PER_DAY: i64 = 24 * 60;

    /// Returns whether `ts` falls within this schedule.
    pub fn admits(&self, ts: DateTime<Utc>) -> bool {
        let local = ts + chrono::TimeDelta::minutes(self.tz_offset as i64);

        if !self.days.is_empty() && !self.days.contains(&local.weekday()) {
            return false;
        }
        let minute = (local.hour() * 60 + local.minute()) as i64;
        let (start, end) = (
            self.start_offset as i64 % Self::MINUTES_PER_DAY,
            self.end_offset as i64 % Self::MINUTES_PER_DAY,
        );

        if start <= end {
            start <= minute && minute <= end
        } else {
            minute >= start || minute <= end
        }
    }
}

/// Subscription maps a set of trigger tags to the contacts which are notified.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    #[serde(rename = "contacts")]
    pub contact_ids: Vec<String>,
    pub tags: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub throttling: bool,
    #[serde(default)]
    pub ignore_warnings: bool,
    #[serde(default)]
    pub ignore_recoverings: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

impl Subscription {
    /// Returns whether this subscription wants to be notified, at `now`,
    /// of `event` of a trigger having `trigger_tags`.
    pub fn matches(&self, trigger_tags: &[String], event: &Event, now: DateTime<Utc>) -> bool {
        if !self.enabled || self.tags.is_empty() {
            return false;
        }
        if !self.tags.iter().all(|tag| trigger_tags.contains(tag)) {
            return false;
        }
        if self.ignore_warnings && event.is_warning_only() {
            return false;
        }
        if self.ignore_recoverings && event.is_recovery() {
            return false;
        }
        match &self.schedule {
            Some(schedule) => schedule.admits(now),
            None => true,
        }
    }
}

/// Contact is a delivery address bound to one sender type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

/// ScheduledNotification is a pending delivery of an Event to a Contact.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotification {
    pub event: Event,
    pub trigger: Trigger,
    pub contact: Contact,
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    #[serde(default)]
    pub throttled: bool,
    #[serde(default)]
    pub send_fail: u32,
    /// Time at which this notification becomes due.
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot_image: Option<Vec<u8>>,
}

impl ScheduledNotification {
    pub fn delivery_key(&self) -> DeliveryKey {
        DeliveryKey {
            trigger_id: self.trigger.id.clone(),
            contact_id: self.contact.id.clone(),
        }
    }

    pub fn throttle_key(&self) -> ThrottleKey {
        ThrottleKey {
            subscription_id: self.subscription_id.clone(),
        }
    }
}

/// DeliveryKey identifies the (trigger, contact) pair within which
/// deliveries are ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub trigger_id: String,
    pub contact_id: String,
}

/// ThrottleKey identifies the throttling window of a subscription,
/// which is shared by all triggers the subscription matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ThrottleKey {
    pub subscription_id: String,
}

/// ThrottlingState of a ThrottleKey, held by the Store with its own expiry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlingState {
    /// State of the most recent delivery.
    pub state: State,
    /// Trigger and timestamp of the event whose delivery opened the window.
    /// Other contacts of the subscription also receive this event.
    #[serde(rename = "triggerID")]
    pub trigger_id: String,
    pub event_timestamp: DateTime<Utc>,
    /// Whether any delivery of the event has succeeded. An unconfirmed
    /// window is released if the event can't be delivered.
    #[serde(default)]
    pub confirmed: bool,
    pub last_sent: DateTime<Utc>,
    /// Earliest time at which another notification may be delivered.
    /// Never decreases while the key remains throttled.
    pub next_allowed: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Consecutive notifications throttled since the last delivery.
    pub throttled_count: u32,
    pub expires_at: DateTime<Utc>,
}

/// Returns `ts` advanced by `duration`, saturating at the latest representable time.
pub fn add_duration(ts: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| ts.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Well-known heartbeat keys.
pub mod heartbeats {
    /// Written by the Event Fetcher on every loop iteration.
    pub const EVENTS: &str = "notifier.events";
    /// Written by the Notification Scheduler on every loop iteration.
    pub const NOTIFICATIONS: &str = "notifier.notifications";
    /// Written by the trigger checking engine.
    pub const CHECKER: &str = "checker";
    /// Written by metric-event ingestion.
    pub const FILTER: &str = "filter";
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn event(old_state: State, state: State) -> Event {
        Event {
            trigger_id: "t1".to_string(),
            state,
            old_state,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 10, 30, 0).unwrap(), // A Monday.
            metric: None,
            value: None,
            message: None,
        }
    }

    fn subscription(tags: &[&str]) -> Subscription {
        Subscription {
            id: "s1".to_string(),
            contact_ids: vec!["c1".to_string()],
            tags: tags.iter().map(|t| t.to_string()).collect(),
            enabled: true,
            throttling: false,
            ignore_warnings: false,
            ignore_recoverings: false,
            schedule: None,
        }
    }

    #[test]
    fn test_schedule_windows() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 10, 30, 0).unwrap();

        let business = Schedule {
            days: vec![chrono::Weekday::Mon, chrono::Weekday::Tue],
            start_offset: 9 * 60,
            end_offset: 18 * 60,
            tz_offset: 0,
        };
        assert!(business.admits(ts));
        assert!(!business.admits(ts + chrono::TimeDelta::hours(8)));
        assert!(!business.admits(ts + chrono::TimeDelta::days(2)));

        // Window wrapping midnight, evaluated in UTC+3.
        let night = Schedule {
            days: Vec::new(),
            start_offset: 22 * 60,
            end_offset: 2 * 60,
            tz_offset: 180,
        };
        assert!(!night.admits(ts)); // 13:30 local.
        assert!(night.admits(ts + chrono::TimeDelta::hours(9))); // 22:30 local.
        assert!(night.admits(ts + chrono::TimeDelta::hours(12))); // 01:30 local.
    }

    #[test]
    fn test_subscription_matching() {
        let tags = vec!["db".to_string(), "prod".to_string()];
        let err = event(State::Ok, State::Error);
        let now = err.timestamp;

        assert!(subscription(&["db"]).matches(&tags, &err, now));
        assert!(subscription(&["db", "prod"]).matches(&tags, &err, now));
        assert!(!subscription(&["db", "staging"]).matches(&tags, &err, now));
        assert!(!subscription(&[]).matches(&tags, &err, now));

        let mut disabled = subscription(&["db"]);
        disabled.enabled = false;
        assert!(!disabled.matches(&tags, &err, now));

        let mut quiet = subscription(&["db"]);
        quiet.ignore_warnings = true;
        quiet.ignore_recoverings = true;
        assert!(quiet.matches(&tags, &err, now));
        assert!(!quiet.matches(&tags, &event(State::Ok, State::Warn), now));
        assert!(!quiet.matches(&tags, &event(State::Error, State::Ok), now));

        // Schedules are evaluated at the time of matching, not of the event.
        let mut business_hours = subscription(&["db"]);
        business_hours.schedule = Some(Schedule {
            days: Vec::new(),
            start_offset: 9 * 60,
            end_offset: 18 * 60,
            tz_offset: 0,
        });
        assert!(business_hours.matches(&tags, &err, now));
        assert!(!business_hours.matches(&tags, &err, now + chrono::TimeDelta::hours(12)));
    }

    #[test]
    fn test_event_wire_format() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "triggerID": "t1",
            "state": "NODATA",
            "oldState": "OK",
            "timestamp": "2024-03-04T10:30:00Z",
            "metric": "servers.web1.load",
        }))
        .unwrap();

        assert_eq!(event.state, State::NoData);
        assert_eq!(event.metric.as_deref(), Some("servers.web1.load"));
        assert!(event.value.is_none());
    }
}
