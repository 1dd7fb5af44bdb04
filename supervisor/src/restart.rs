//! Auto-restart policy.
//!
//! [`RestartPolicy::decide`] is a pure function of the death and the dead
//! handle's restart bookkeeping. The supervisor acts on the decision.

use std::time::{Duration, Instant};

use crate::config::SupervisorConfig;
use crate::crash::DeathClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch the last request after `delay`. `attempt` becomes the new
    /// handle's restart count.
    Restart { delay: Duration, attempt: u32 },
    /// Clean or intentional death
    NotNeeded,
    /// Died before the minimum runtime
    ConfigurationFailure { runtime: Duration },
    /// The counter reached the maximum inside the cooldown window
    BudgetExhausted { restarts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub min_runtime: Duration,
    pub cooldown: Duration,
    pub max_restarts: u32,
    pub delay: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            min_runtime: config.min_runtime,
            cooldown: config.restart_cooldown,
            max_restarts: config.max_restarts,
            delay: config.restart_delay,
        }
    }

    pub fn decide(
        &self,
        class: DeathClass,
        runtime: Duration,
        restart_count: u32,
        last_restart_time: Option<Instant>,
        now: Instant,
    ) -> RestartDecision {
        if class != DeathClass::Unexpected {
            return RestartDecision::NotNeeded;
        }
        if runtime < self.min_runtime {
            return RestartDecision::ConfigurationFailure { runtime };
        }

        // A quiet period longer than the cooldown proves the agent stable.
        let count = match last_restart_time {
            Some(last) if now.saturating_duration_since(last) > self.cooldown => 0,
            _ => restart_count,
        };
        if count >= self.max_restarts {
            return RestartDecision::BudgetExhausted { restarts: count };
        }
        RestartDecision::Restart {
            delay: self.delay,
            attempt: count + 1,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}
