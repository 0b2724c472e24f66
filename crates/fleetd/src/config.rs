//! fleetd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetgrid_rollout::ExecutorConfig;
use fleetgrid_state::ActionType;

/// Daemon configuration. Every field has a default, so a partial (or
/// absent) file works; CLI flags override on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetdConfig {
    /// Port the REST API listens on.
    pub port: u16,
    /// Directory holding the redb state store.
    pub data_dir: PathBuf,
    /// Seconds between housekeeping passes. Forced-time escalation runs on
    /// the same cadence.
    pub housekeeping_interval_secs: u64,
    /// Wall-clock budget for one housekeeping pass, in seconds.
    pub housekeeping_budget_secs: u64,
    /// Upper bound on groups per rollout.
    pub max_groups: usize,
    /// Action type for rollouts that don't specify one.
    pub default_action_type: ActionType,
    /// Deadline distance for time-forced rollouts without an explicit one,
    /// in seconds.
    pub forced_grace_secs: u64,
}

impl Default for FleetdConfig {
    fn default() -> Self {
        FleetdConfig {
            port: 8080,
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            housekeeping_interval_secs: 10,
            housekeeping_budget_secs: 30,
            max_groups: 500,
            default_action_type: ActionType::Forced,
            forced_grace_secs: 30 * 60,
        }
    }
}

impl FleetdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetdConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Executor tunables derived from this config.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_groups: self.max_groups,
            housekeeping_budget: Duration::from_secs(self.housekeeping_budget_secs),
            default_action_type: self.default_action_type,
            default_forced_grace: Duration::from_secs(self.forced_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: FleetdConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_groups, 500);
        assert_eq!(config.default_action_type, ActionType::Forced);
    }

    #[test]
    fn partial_file_overrides_named_fields_only() {
        let config: FleetdConfig = toml::from_str(
            r#"
port = 9090
default_action_type = "time_forced"
"#,
        )
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.default_action_type, ActionType::TimeForced);
        assert_eq!(config.housekeeping_interval_secs, 10);
    }

    #[test]
    fn executor_config_carries_tunables() {
        let config = FleetdConfig {
            max_groups: 7,
            housekeeping_budget_secs: 5,
            forced_grace_secs: 60,
            ..FleetdConfig::default()
        };
        let exec = config.executor_config();
        assert_eq!(exec.max_groups, 7);
        assert_eq!(exec.housekeeping_budget, Duration::from_secs(5));
        assert_eq!(exec.default_forced_grace, Duration::from_secs(60));
    }
}
