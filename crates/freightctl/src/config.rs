//! CLI configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Settings read from `FREIGHTCTL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct CtlConfig {
    /// Seconds to wait before re-invoking a running promotion.
    #[serde(default = "default_requeue_interval_secs")]
    pub requeue_interval_secs: u64,

    /// Upper bound on engine invocations per `promote` command.
    #[serde(default = "default_max_invocations")]
    pub max_invocations: u32,

    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Keep a work directory the engine created instead of removing it.
    #[serde(default)]
    pub keep_work_dir: bool,
}

fn default_requeue_interval_secs() -> u64 {
    5
}

fn default_max_invocations() -> u32 {
    60
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl CtlConfig {
    fn prefix() -> &'static str {
        "FREIGHTCTL_"
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        envy::prefixed(Self::prefix())
            .from_env::<CtlConfig>()
            .context("Invalid FREIGHTCTL_* environment variables")
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            requeue_interval_secs: default_requeue_interval_secs(),
            max_invocations: default_max_invocations(),
            log_format: default_log_format(),
            keep_work_dir: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> CtlConfig {
        envy::prefixed(CtlConfig::prefix())
            .from_iter::<_, CtlConfig>(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string())),
            )
            .unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = from_pairs(&[]);
        assert_eq!(config.requeue_interval_secs, 5);
        assert_eq!(config.max_invocations, 60);
        assert!(!config.json_logs());
        assert!(!config.keep_work_dir);
    }

    #[test]
    fn test_config_from_env() {
        let config = from_pairs(&[
            ("FREIGHTCTL_REQUEUE_INTERVAL_SECS", "1"),
            ("FREIGHTCTL_MAX_INVOCATIONS", "3"),
            ("FREIGHTCTL_LOG_FORMAT", "JSON"),
            ("FREIGHTCTL_KEEP_WORK_DIR", "true"),
            ("OTHER_SETTING", "ignored"),
        ]);
        assert_eq!(config.requeue_interval(), Duration::from_secs(1));
        assert_eq!(config.max_invocations, 3);
        assert!(config.json_logs());
        assert!(config.keep_work_dir);
    }
}
