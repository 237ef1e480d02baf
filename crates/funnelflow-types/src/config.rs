//! Engine configuration types for Funnelflow.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes the
//! resume scheduler and outbound webhook behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard upper bound for any outbound webhook call, in seconds.
pub const MAX_WEBHOOK_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.funnelflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhook: WebhookSettings,
}

/// Resume scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between polls for due WAITING executions.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum executions resumed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> u32 {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl SchedulerConfig {
    /// Poll interval, never shorter than one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Batch size, never zero.
    pub fn batch_limit(&self) -> u32 {
        self.batch_size.max(1)
    }
}

/// Outbound webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Default and maximum per-call timeout, capped at 30 seconds.
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// When set, requests carry an `X-Funnelflow-Signature` HMAC header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

fn default_webhook_timeout_secs() -> u64 {
    MAX_WEBHOOK_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    "funnelflow-workflow/0.1".to_string()
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout_secs(),
            user_agent: default_user_agent(),
            signing_secret: None,
        }
    }
}

impl WebhookSettings {
    /// Effective timeout for a call, given an optional per-step override.
    ///
    /// The result is always between one second and the configured maximum,
    /// which itself never exceeds [`MAX_WEBHOOK_TIMEOUT_SECS`].
    pub fn effective_timeout(&self, step_override: Option<u64>) -> Duration {
        let ceiling = self.timeout_secs.clamp(1, MAX_WEBHOOK_TIMEOUT_SECS);
        let secs = step_override.unwrap_or(ceiling).clamp(1, ceiling);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.webhook.timeout_secs, 30);
        assert_eq!(config.webhook.user_agent, "funnelflow-workflow/0.1");
        assert!(config.webhook.signing_secret.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.webhook.timeout_secs, 30);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
[scheduler]
poll_interval_secs = 5
batch_size = 25

[webhook]
timeout_secs = 10
signing_secret = "whsec_test"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.scheduler.batch_limit(), 25);
        assert_eq!(config.webhook.timeout_secs, 10);
        assert_eq!(config.webhook.user_agent, "funnelflow-workflow/0.1");
        assert_eq!(config.webhook.signing_secret.as_deref(), Some("whsec_test"));
    }

    #[test]
    fn test_scheduler_floors() {
        let config = SchedulerConfig {
            poll_interval_secs: 0,
            batch_size: 0,
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_limit(), 1);
    }

    #[test]
    fn test_webhook_timeout_is_clamped() {
        let settings = WebhookSettings::default();
        assert_eq!(settings.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(settings.effective_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(settings.effective_timeout(Some(600)), Duration::from_secs(30));
        assert_eq!(settings.effective_timeout(Some(0)), Duration::from_secs(1));

        let oversized = WebhookSettings {
            timeout_secs: 120,
            ..WebhookSettings::default()
        };
        assert_eq!(oversized.effective_timeout(None), Duration::from_secs(30));

        let tight = WebhookSettings {
            timeout_secs: 10,
            ..WebhookSettings::default()
        };
        assert_eq!(tight.effective_timeout(Some(20)), Duration::from_secs(10));
    }
}
