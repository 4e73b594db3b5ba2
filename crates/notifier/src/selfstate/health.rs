/// Level of a monitored subsystem's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Healthy,
    Degraded,
    Critical,
}

/// Transition of a subsystem between Levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Escalated { from: Level, to: Level },
    Recovered { from: Level },
}

/// Health applies hysteresis to a stream of observed Levels.
///
/// A subsystem rises to a level only after `degrade_after` consecutive
/// observations at or above that level, and returns to Healthy only after
/// `recover_after` consecutive Healthy observations. It never steps down
/// from Critical to Degraded: only a full recovery clears it.
#[derive(Debug, Clone)]
pub struct Health {
    level: Level,
    degrade_after: u32,
    recover_after: u32,
    // Consecutive observations at or above Degraded, at Critical, and at Healthy.
    degraded_streak: u32,
    critical_streak: u32,
    healthy_streak: u32,
}

impl Health {
    pub fn new(degrade_after: u32, recover_after: u32) -> Self {
        Self {
            level: Level::Healthy,
            degrade_after: degrade_after.max(1),
            recover_after: recover_after.max(1),
            degraded_streak: 0,
            critical_streak: 0,
            healthy_streak: 0,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Observe a Level, returning the Transition it caused (if any).
    pub fn observe(&mut self, observed: Level) -> Option<Transition> {
        let bump = |streak: &mut u32, hit: bool| *streak = if hit { *streak + 1 } else { 0 };

        bump(&mut self.degraded_streak, observed >= Level::Degraded);
        bump(&mut self.critical_streak, observed == Level::Critical);
        bump(&mut self.healthy_streak, observed == Level::Healthy);

        let from = self.level;
        let to = if self.critical_streak >= self.degrade_after {
            Level::Critical
        } else if self.degraded_streak >= self.degrade_after {
            Level::Degraded
        } else if self.healthy_streak >= self.recover_after {
            Level::Healthy
        } else {
            from
        };

        if to > from {
            self.level = to;
            Some(Transition::Escalated { from, to })
        } else if to == Level::Healthy && from != Level::Healthy {
            self.level = to;
            Some(Transition::Recovered { from })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use Level::*;

    fn run(health: &mut Health, observations: &[Level]) -> Vec<(Level, Option<Transition>)> {
        observations
            .iter()
            .map(|observed| {
                let transition = health.observe(*observed);
                (health.level(), transition)
            })
            .collect()
    }

    #[test]
    fn test_blips_do_not_change_level() {
        let mut health = Health::new(3, 2);
        let out = run(
            &mut health,
            &[Critical, Healthy, Degraded, Critical, Healthy, Critical, Critical, Healthy],
        );
        assert!(out.iter().all(|(level, t)| *level == Healthy && t.is_none()), "{out:?}");
    }

    #[test]
    fn test_escalation_and_recovery() {
        let mut health = Health::new(3, 2);
        let out = run(
            &mut health,
            &[
                Degraded, Degraded, Degraded, // Rises to Degraded.
                Critical, Critical, // Two Critical: not yet.
                Degraded, // Streak of Critical is broken.
                Critical, Critical, Critical, // Rises to Critical.
                Degraded, Healthy, // Never steps down to Degraded.
                Healthy, // Recovers after two Healthy.
            ],
        );

        let transitions: Vec<_> = out.iter().filter_map(|(_, t)| *t).collect();
        assert_eq!(
            transitions,
            vec![
                Transition::Escalated { from: Healthy, to: Degraded },
                Transition::Escalated { from: Degraded, to: Critical },
                Transition::Recovered { from: Critical },
            ]
        );
        assert_eq!(out[9].0, Critical);
        assert_eq!(out[11].0, Healthy);
    }

    #[test]
    fn test_consecutive_critical_jumps_directly() {
        let mut health = Health::new(3, 3);
        let out = run(&mut health, &[Critical, Critical, Critical, Critical]);

        let transitions: Vec<_> = out.iter().filter_map(|(_, t)| *t).collect();
        assert_eq!(
            transitions,
            vec![Transition::Escalated { from: Healthy, to: Critical }]
        );
    }
}
