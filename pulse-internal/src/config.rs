use backon::ExponentialBuilder;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::plan::{ActionLimit, PlanPolicy};
use crate::quota::evaluator::QuotaSettings;

/// Top-level gateway configuration, loaded from a TOML file. Every section
/// is optional; a missing file section falls back to defaults that match a
/// single-process development deployment.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Per-plan limit overrides, keyed by plan then action name.
    #[serde(default)]
    pub plans: HashMap<String, HashMap<String, ActionLimit>>,
    #[serde(default)]
    pub anonymous: AnonymousConfig,
    #[serde(default)]
    pub trial: TrialConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Socket address to bind to. Defaults to 0.0.0.0:3000 when unset.
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// SHA-256 hashes of issued API keys mapped to the owning user id. Raw
    /// keys never appear in configuration.
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnonymousConfig {
    #[serde(default = "default_anonymous_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_anonymous_max_actions")]
    pub max_actions: u32,
}

impl Default for AnonymousConfig {
    fn default() -> Self {
        Self {
            window_secs: default_anonymous_window_secs(),
            max_actions: default_anonymous_max_actions(),
        }
    }
}

fn default_anonymous_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_anonymous_max_actions() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrialConfig {
    #[serde(default = "default_trial_duration_days")]
    pub duration_days: i64,
    /// How far ahead of expiry the one-shot reminder fires.
    #[serde(default = "default_trial_reminder_days")]
    pub reminder_days: i64,
}

impl TrialConfig {
    pub fn reminder_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.reminder_days)
    }
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            duration_days: default_trial_duration_days(),
            reminder_days: default_trial_reminder_days(),
        }
    }
}

fn default_trial_duration_days() -> i64 {
    7
}

fn default_trial_reminder_days() -> i64 {
    3
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Connection URL. Falls back to `PULSE_REDIS_URL`; with neither set the
    /// gateway runs on in-memory stores.
    pub url: Option<String>,
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

fn default_redis_timeout_ms() -> u64 {
    100
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Deterministic canned content, no network. The development default.
    #[default]
    Template,
    /// Plain HTTP JSON endpoint.
    Http,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: Option<Url>,
    pub api_key: Option<SecretString>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            base_url: None,
            api_key: None,
            timeout_ms: default_provider_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

/// Bounded exponential backoff for outbound HTTP calls.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_num_retries")]
    pub num_retries: usize,
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            num_retries: default_num_retries(),
            max_delay_s: default_max_delay_s(),
        }
    }
}

fn default_num_retries() -> usize {
    3
}

fn default_max_delay_s() -> f64 {
    10.0
}

impl RetryConfig {
    pub fn get_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_jitter()
            .with_max_delay(Duration::from_secs_f64(self.max_delay_s))
            .with_max_times(self.num_retries)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    /// Logs the notification and moves on. The development default.
    #[default]
    Log,
    /// POSTs the notification to a webhook endpoint.
    Http,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifierConfig {
    #[serde(default)]
    pub kind: NotifierKind,
    pub endpoint: Option<Url>,
    #[serde(default = "default_notifier_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::default(),
            endpoint: None,
            timeout_ms: default_notifier_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_notifier_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file `{}`: {e}", path.display()),
            })
        })?;
        config.verify()?;
        Ok(config)
    }

    /// Startup validation. Anything rejected here would otherwise surface as
    /// confusing runtime behavior.
    pub fn verify(&self) -> Result<(), Error> {
        PlanPolicy::with_overrides(&self.plans)?;

        if self.gateway.authentication.enabled && self.gateway.authentication.keys.is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "[gateway.authentication] is enabled but no keys are configured"
                    .to_string(),
            }));
        }
        if self.anonymous.window_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "anonymous.window_secs must be at least 1".to_string(),
            }));
        }
        if self.trial.duration_days < 1 {
            return Err(Error::new(ErrorDetails::Config {
                message: "trial.duration_days must be at least 1".to_string(),
            }));
        }
        if self.trial.reminder_days < 0 || self.trial.reminder_days > self.trial.duration_days {
            return Err(Error::new(ErrorDetails::Config {
                message: "trial.reminder_days must fit within the trial duration".to_string(),
            }));
        }
        if self.sweep.interval_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "sweep.interval_secs must be at least 1".to_string(),
            }));
        }
        if self.provider.kind == ProviderKind::Http && self.provider.base_url.is_none() {
            return Err(Error::new(ErrorDetails::Config {
                message: "provider.base_url is required when provider.kind is `http`".to_string(),
            }));
        }
        if self.notifier.kind == NotifierKind::Http && self.notifier.endpoint.is_none() {
            return Err(Error::new(ErrorDetails::Config {
                message: "notifier.endpoint is required when notifier.kind is `http`".to_string(),
            }));
        }
        for (section, retry) in [
            ("provider", &self.provider.retry),
            ("notifier", &self.notifier.retry),
        ] {
            if !retry.max_delay_s.is_finite() || retry.max_delay_s < 0.0 {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("{section}.retry.max_delay_s must be a non-negative number"),
                }));
            }
        }
        Ok(())
    }

    pub fn policy(&self) -> Result<PlanPolicy, Error> {
        PlanPolicy::with_overrides(&self.plans)
    }

    pub fn redis_url(&self) -> Option<String> {
        self.redis
            .url
            .clone()
            .or_else(|| std::env::var("PULSE_REDIS_URL").ok())
    }

    pub fn quota_settings(&self) -> QuotaSettings {
        QuotaSettings {
            trial_days: self.trial.duration_days,
            anonymous_window: chrono::Duration::seconds(
                i64::try_from(self.anonymous.window_secs).unwrap_or(i64::MAX),
            ),
            anonymous_max: self.anonymous.max_actions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ActionType;
    use crate::plan::Plan;

    #[test]
    fn test_empty_file_yields_development_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.verify().unwrap();

        assert_eq!(config.anonymous.window_secs, 86_400);
        assert_eq!(config.anonymous.max_actions, 1);
        assert_eq!(config.trial.duration_days, 7);
        assert_eq!(config.trial.reminder_days, 3);
        assert!(config.sweep.enabled);
        assert_eq!(config.sweep.interval_secs, 300);
        assert_eq!(config.redis.timeout_ms, 100);
        assert_eq!(config.provider.kind, ProviderKind::Template);
        assert_eq!(config.notifier.kind, NotifierKind::Log);
        assert!(!config.gateway.authentication.enabled);
        assert!(config.gateway.bind_address.is_none());
    }

    #[tokio::test]
    async fn test_load_and_verify_reads_a_real_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[trial]\nduration_days = 14").unwrap();

        let config = Config::load_and_verify_from_path(file.path())
            .await
            .unwrap();
        assert_eq!(config.trial.duration_days, 14);
    }

    #[tokio::test]
    async fn test_load_from_missing_path_reports_the_path() {
        let err = Config::load_and_verify_from_path(Path::new("/nonexistent/pulse.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pulse.toml"));
    }

    #[test]
    fn test_full_config_parses_and_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            bind_address = "127.0.0.1:8080"
            debug = true

            [gateway.authentication]
            enabled = true

            [gateway.authentication.keys]
            "0f9c1c3b" = "user-1"

            [plans.starter]
            profile_analysis = { limit = 10, period = "monthly" }

            [anonymous]
            window_secs = 3600
            max_actions = 2

            [trial]
            duration_days = 14
            reminder_days = 5

            [sweep]
            interval_secs = 60

            [redis]
            url = "redis://localhost:6379"
            timeout_ms = 250

            [provider]
            kind = "http"
            base_url = "https://llm.internal.example/v1"
            api_key = "sk-test"
            timeout_ms = 5000

            [provider.retry]
            num_retries = 2
            max_delay_s = 5.0

            [notifier]
            kind = "http"
            endpoint = "https://hooks.example.com/email"
            "#,
        )
        .unwrap();
        config.verify().unwrap();

        let policy = config.policy().unwrap();
        assert_eq!(
            policy.limit_for(Plan::Starter, ActionType::ProfileAnalysis).limit,
            10
        );
        // Untouched rows keep their defaults.
        assert_eq!(policy.limit_for(Plan::Starter, ActionType::Post).limit, 30);
        assert_eq!(config.redis_url().as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.quota_settings().anonymous_max, 2);
        assert_eq!(config.quota_settings().trial_days, 14);
        assert_eq!(config.provider.retry.num_retries, 2);
        assert_eq!(config.notifier.retry, RetryConfig::default());
    }

    #[test]
    fn test_unknown_plan_in_overrides_is_a_startup_error() {
        let config: Config = toml::from_str(
            r#"
            [plans.enterprise]
            post = { limit = 10000, period = "monthly" }
            "#,
        )
        .unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_unknown_action_in_overrides_is_a_startup_error() {
        let config: Config = toml::from_str(
            r#"
            [plans.starter]
            carousel = { limit = 10, period = "monthly" }
            "#,
        )
        .unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_enabled_auth_requires_keys() {
        let config: Config = toml::from_str(
            r#"
            [gateway.authentication]
            enabled = true
            "#,
        )
        .unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_reminder_window_must_fit_the_trial() {
        let config: Config = toml::from_str(
            r#"
            [trial]
            duration_days = 7
            reminder_days = 10
            "#,
        )
        .unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_http_provider_requires_base_url() {
        let config: Config = toml::from_str(
            r#"
            [provider]
            kind = "http"
            "#,
        )
        .unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_negative_retry_delay_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [notifier.retry]
            max_delay_s = -1.0
            "#,
        )
        .unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result = toml::from_str::<Config>(
            r#"
            [anonymous]
            window_seconds = 3600
            "#,
        );
        assert!(result.is_err());
    }
}
