use crate::backoff::Backoff;
use crate::models::{heartbeats, Contact};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(
        "admin contact '{contact_id}' has type '{contact_type}', which has no configured sender"
    )]
    AdminSenderMissing {
        contact_id: String,
        contact_type: String,
    },
}

/// Config of the notifier daemon.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub notifier: NotifierConfig,
    pub selfstate: SelfStateConfig,
    /// Senders, keyed on the contact type which they deliver to.
    pub senders: BTreeMap<String, SenderKind>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifierConfig {
    pub events: EventsConfig,
    pub notifications: NotificationsConfig,
    /// Bound on the duration of a single send.
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            events: EventsConfig::default(),
            notifications: NotificationsConfig::default(),
            send_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    /// Maximum time to block waiting for an event, before re-checking
    /// whether the worker has been signaled to stop.
    #[serde(with = "humantime_serde")]
    pub pop_timeout: Duration,
    /// Backoff of retries against an unavailable store.
    pub backoff: Backoff,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_millis(500),
            backoff: Backoff {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(30),
                jitter_percent: 20,
            },
        }
    }
}

/// ThrottlePolicy determines what happens to a notification
/// which arrives within its subscription's throttling window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlePolicy {
    /// Re-queue the notification until the window closes, and then deliver it flagged as throttled.
    #[default]
    Defer,
    /// Drop the notification.
    Drop,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottlingConfig {
    pub policy: ThrottlePolicy,
    /// Minimum spacing of deliveries while a trigger remains in one non-OK state.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Upper bound to which the window may be extended.
    #[serde(with = "humantime_serde")]
    pub max_window: Duration,
    /// The window doubles after every this-many throttled notifications.
    pub escalate_after: u32,
    /// Throttling state expires once this long has passed without a delivery.
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            policy: ThrottlePolicy::Defer,
            window: Duration::from_secs(30 * 60),
            max_window: Duration::from_secs(4 * 60 * 60),
            escalate_after: 10,
            expiry: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationsConfig {
    /// Interval between polls of the notification queue when it's idle.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum number of notifications popped per poll.
    pub batch_size: usize,
    /// Number of failed sends after which a notification is dropped.
    pub max_retries: u32,
    /// Backoff between failed sends of a notification.
    pub retry_backoff: Backoff,
    /// Window within which an identical delivery is merged rather than repeated.
    #[serde(with = "humantime_serde")]
    pub coalesce_window: Duration,
    /// Retention of per-(trigger, contact) ordering watermarks.
    #[serde(with = "humantime_serde")]
    pub ledger_ttl: Duration,
    pub throttling: ThrottlingConfig,
    /// Backoff of retries against an unavailable store.
    pub backoff: Backoff,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: 3,
            retry_backoff: Backoff {
                initial: Duration::from_secs(60),
                max: Duration::from_secs(30 * 60),
                jitter_percent: 10,
            },
            coalesce_window: Duration::from_secs(60),
            ledger_ttl: Duration::from_secs(24 * 60 * 60),
            throttling: ThrottlingConfig::default(),
            backoff: Backoff {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(30),
                jitter_percent: 20,
            },
        }
    }
}

/// HeartbeatCheck monitors the lag of a heartbeat written by another subsystem.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatCheck {
    /// Name of the subsystem, used in alerts.
    pub subsystem: String,
    /// Heartbeat key written by the subsystem. Defaults to `subsystem`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub lag_threshold: Duration,
}

impl HeartbeatCheck {
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.subsystem)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelfStateConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Consecutive bad checks required to raise a subsystem's level.
    pub degrade_after: u32,
    /// Consecutive healthy checks required to return a subsystem to healthy.
    pub recover_after: u32,
    /// Minimum interval between repeated alerts of a degraded subsystem.
    #[serde(with = "humantime_serde")]
    pub renotify_interval: Duration,
    /// Contacts which receive self-state alerts.
    pub admin_contacts: Vec<Contact>,
    pub heartbeats: Vec<HeartbeatCheck>,
    /// Whether to monitor reachability of the store.
    pub store_check: bool,
    /// Number of overdue notifications above which the queue is degraded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth_threshold: Option<usize>,
}

impl Default for SelfStateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(10),
            degrade_after: 3,
            recover_after: 3,
            renotify_interval: Duration::from_secs(5 * 60),
            admin_contacts: Vec::new(),
            heartbeats: vec![
                HeartbeatCheck {
                    subsystem: heartbeats::FILTER.to_string(),
                    key: None,
                    lag_threshold: Duration::from_secs(60),
                },
                HeartbeatCheck {
                    subsystem: heartbeats::CHECKER.to_string(),
                    key: None,
                    lag_threshold: Duration::from_secs(120),
                },
                HeartbeatCheck {
                    subsystem: "events".to_string(),
                    key: Some(heartbeats::EVENTS.to_string()),
                    lag_threshold: Duration::from_secs(60),
                },
                HeartbeatCheck {
                    subsystem: "notifications".to_string(),
                    key: Some(heartbeats::NOTIFICATIONS.to_string()),
                    lag_threshold: Duration::from_secs(60),
                },
            ],
            store_check: true,
            queue_depth_threshold: None,
        }
    }
}

/// SenderKind is the implementation which delivers to a contact type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// Write notifications to the log.
    Log,
}

impl Config {
    /// Load and validate a YAML Config from `path`.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|err| match err {
            Error::Parse { source, .. } => Error::Parse {
                path: path.display().to_string(),
                source,
            },
            err => err,
        })
    }

    /// Parse and validate a YAML Config.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(content).map_err(|source| Error::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let NotificationsConfig {
            batch_size,
            max_retries,
            throttling,
            ..
        } = &self.notifier.notifications;

        if *batch_size == 0 {
            return Err(Error::Invalid(
                "notifier.notifications.batch_size must be positive".to_string(),
            ));
        }
        if *max_retries == 0 {
            return Err(Error::Invalid(
                "notifier.notifications.max_retries must be positive".to_string(),
            ));
        }
        if throttling.escalate_after == 0 {
            return Err(Error::Invalid(
                "notifier.notifications.throttling.escalate_after must be positive".to_string(),
            ));
        }
        if throttling.max_window < throttling.window {
            return Err(Error::Invalid(
                "notifier.notifications.throttling.max_window must be at least window".to_string(),
            ));
        }
        if self.notifier.events.pop_timeout.is_zero() {
            return Err(Error::Invalid("notifier.events.pop_timeout must be positive".to_string()));
        }

        let selfstate = &self.selfstate;
        if !selfstate.enabled {
            return Ok(());
        }
        if selfstate.degrade_after == 0 || selfstate.recover_after == 0 {
            return Err(Error::Invalid(
                "selfstate.degrade_after and selfstate.recover_after must be positive".to_string(),
            ));
        }
        if selfstate.check_interval.is_zero() {
            return Err(Error::Invalid("selfstate.check_interval must be positive".to_string()));
        }
        if selfstate.admin_contacts.is_empty() {
            return Err(Error::Invalid(
                "selfstate is enabled but has no admin_contacts".to_string(),
            ));
        }
        for contact in &selfstate.admin_contacts {
            if !self.senders.contains_key(&contact.type_) {
                return Err(Error::AdminSenderMissing {
                    contact_id: contact.id.clone(),
                    contact_type: contact.type_.clone(),
                });
            }
        }
        Ok(())
    }
}
