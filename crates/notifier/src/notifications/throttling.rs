use crate::config::ThrottlingConfig;
use crate::models::{add_duration, Event, ThrottlingState};
use chrono::{DateTime, Utc};

/// Decision of the throttling policy for a notification, along with the
/// ThrottlingState which must be stored for the decision to take effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Deliver the notification now.
    Admit(ThrottlingState),
    /// Hold the notification until `next_allowed` of the new state.
    Throttle(ThrottlingState),
}

impl Decision {
    pub fn into_state(self) -> ThrottlingState {
        match self {
            Decision::Admit(state) | Decision::Throttle(state) => state,
        }
    }
}

/// Evaluate a notification of `event` at `now`, given the `current`
/// ThrottlingState of its subscription (if any).
pub fn evaluate(
    config: &ThrottlingConfig,
    current: Option<&ThrottlingState>,
    event: &Event,
    now: DateTime<Utc>,
) -> Decision {
    // Expired states are treated as absent.
    let current = current.filter(|current| now < current.expires_at);

    // Every contact of the subscription receives the event which opened the window.
    if let Some(current) = current.filter(|current| opened_by(current, event)) {
        return Decision::Admit(current.clone());
    }

    let state = event.state;
    let Some(current) = current.filter(|current| current.state == state && !state.is_ok()) else {
        // A change of state resets throttling.
        return Decision::Admit(delivered(config, event, config.window, now, now));
    };

    if now >= current.next_allowed {
        return Decision::Admit(delivered(
            config,
            event,
            current.window,
            now,
            current.next_allowed,
        ));
    }

    let throttled_count = current.throttled_count + 1;
    let mut window = current.window;

    if throttled_count % config.escalate_after.max(1) == 0 {
        window = window.saturating_mul(2).min(config.max_window);
    }
    let next_allowed = current
        .next_allowed
        .max(add_duration(current.last_sent, window));

    Decision::Throttle(ThrottlingState {
        next_allowed,
        window,
        throttled_count,
        expires_at: current
            .expires_at
            .max(add_duration(next_allowed, config.expiry)),
        ..current.clone()
    })
}

/// Returns `current` marked as confirmed by a delivery of `event`,
/// or None if there's nothing to confirm.
pub fn confirm(current: &ThrottlingState, event: &Event) -> Option<ThrottlingState> {
    if current.confirmed || !opened_by(current, event) {
        return None;
    }
    Some(ThrottlingState {
        confirmed: true,
        ..current.clone()
    })
}

/// Returns `current` with its window closed as of `now`, if the window was
/// opened by `event` and no delivery of `event` has succeeded.
pub fn release(
    current: &ThrottlingState,
    event: &Event,
    now: DateTime<Utc>,
) -> Option<ThrottlingState> {
    if current.confirmed || !opened_by(current, event) || current.next_allowed <= now {
        return None;
    }
    Some(ThrottlingState {
        next_allowed: now,
        ..current.clone()
    })
}

fn opened_by(current: &ThrottlingState, event: &Event) -> bool {
    current.trigger_id == event.trigger_id && current.event_timestamp == event.timestamp
}

fn delivered(
    config: &ThrottlingConfig,
    event: &Event,
    window: std::time::Duration,
    now: DateTime<Utc>,
    floor: DateTime<Utc>,
) -> ThrottlingState {
    let next_allowed = if event.state.is_ok() {
        now
    } else {
        floor.max(add_duration(now, window))
    };

    ThrottlingState {
        state: event.state,
        trigger_id: event.trigger_id.clone(),
        event_timestamp: event.timestamp,
        confirmed: false,
        last_sent: now,
        next_allowed,
        window,
        throttled_count: 0,
        expires_at: add_duration(next_allowed, config.expiry),
    }
}
