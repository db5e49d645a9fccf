//! Controller configuration.
//!
//! Only two knobs come from the environment (`MAX_ACTIVE_MACHINES`,
//! `AGENT_LIFETIME_UNIT_MINUTES`); everything else is injected by the
//! composition root. Detection thresholds are fields rather than constants
//! so deployments can tune them.

use std::time::Duration;

use anyhow::{Context, Result};

/// Tunables for the agent lifecycle controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Machine cap enforced at agent creation (`MAX_ACTIVE_MACHINES`).
    pub max_active_machines: i64,
    /// Size of one lifetime slice in minutes (`AGENT_LIFETIME_UNIT_MINUTES`).
    pub lifetime_unit_minutes: u64,
    /// Lifetime budget granted to a new agent, in slices.
    pub default_lifetime_units: i64,
    /// Spacing of the top-level tick driving state logic and polling.
    pub tick_interval: Duration,
    /// RUNNING with zero messages for this long is a ghost agent.
    pub ghost_timeout: Duration,
    /// Consecutive transient RPC failures before the machine is declared
    /// dead.
    pub failure_threshold: u32,
    /// Minimum spacing of pull-request state syncs per agent.
    pub pr_sync_interval: Duration,
    /// Minimum spacing of git-history syncs per agent.
    pub git_poll_interval: Duration,
    /// How long provisioning waits for a pool assignment.
    pub reservation_wait: Duration,
    /// Spacing of the periodic credential refresh for idle/running agents.
    pub credential_refresh_interval: Duration,
    /// Remaining-context percentage the warning ladder starts from.
    pub initial_context_threshold: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_active_machines: 50,
            lifetime_unit_minutes: 20,
            default_lifetime_units: 12,
            tick_interval: Duration::from_secs(5),
            ghost_timeout: Duration::from_secs(180),
            failure_threshold: 5,
            pr_sync_interval: Duration::from_secs(30),
            git_poll_interval: Duration::from_secs(10),
            reservation_wait: Duration::from_secs(600),
            credential_refresh_interval: Duration::from_secs(600),
            initial_context_threshold: 70.0,
        }
    }
}

impl ControllerConfig {
    /// Load the environment-provided knobs, keeping defaults for the rest.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("MAX_ACTIVE_MACHINES") {
            config.max_active_machines =
                raw.parse().context("parsing MAX_ACTIVE_MACHINES")?;
        }
        if let Ok(raw) = std::env::var("AGENT_LIFETIME_UNIT_MINUTES") {
            config.lifetime_unit_minutes =
                raw.parse().context("parsing AGENT_LIFETIME_UNIT_MINUTES")?;
        }
        Ok(config)
    }
}
