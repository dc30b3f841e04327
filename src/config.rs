//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend origin, e.g. `https://api.example.com`
    pub base_url: String,
    /// API namespace segment prefixed to relative endpoints
    pub api_prefix: String,
    /// Deployment flavour; detected from `base_url` when unset
    pub deployment: Option<Deployment>,
    /// Telegram user id used for the identity header and token refresh
    pub user_id: Option<String>,
    /// Headers attached to every request
    pub default_headers: HashMap<String, String>,
    /// Timing knobs for local/dev hosts
    pub local: Tuning,
    /// Timing knobs for the public deployment
    pub production: Tuning,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Throttle configuration
    pub throttle: ThrottleConfig,
    /// Health monitor configuration
    pub health: HealthConfig,
    /// Token configuration
    pub token: TokenConfig,
    /// Well-known endpoints
    pub endpoints: EndpointsConfig,
    /// Endpoints whose readiness failure is surfaced on local hosts
    pub critical_endpoints: Vec<String>,
    /// Endpoints that allow at most one call in flight
    pub non_parallel_endpoints: Vec<String>,
    /// How often request counters are zeroed
    #[serde(with = "humantime_serde")]
    pub counters_reset_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_prefix: "api".to_string(),
            deployment: None,
            user_id: None,
            default_headers: HashMap::new(),
            local: Tuning::local(),
            production: Tuning::production(),
            retry: RetryConfig::default(),
            throttle: ThrottleConfig::default(),
            health: HealthConfig::default(),
            token: TokenConfig::default(),
            endpoints: EndpointsConfig::default(),
            critical_endpoints: vec![
                "auth".to_string(),
                "user".to_string(),
                "participate".to_string(),
            ],
            non_parallel_endpoints: vec![
                "participate".to_string(),
                "claim".to_string(),
                "daily-bonus".to_string(),
            ],
            counters_reset_interval: Duration::from_secs(3600),
        }
    }
}

impl ClientConfig {
    /// Config pointing at `base_url` with defaults elsewhere
    #[must_use]
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // MINIAPP_NET_ prefix, `__` for nesting
        figment = figment.merge(Env::prefixed("MINIAPP_NET_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Check invariants that serde cannot express
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute http(s) URL.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid base_url '{}': {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "base_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        Ok(())
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var pattern is valid");

        self.base_url = Self::expand_string(&re, &self.base_url);
        for value in self.default_headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Effective deployment: explicit setting, else detected from the host
    #[must_use]
    pub fn deployment(&self) -> Deployment {
        self.deployment
            .unwrap_or_else(|| Deployment::detect(&self.base_url))
    }

    /// Timing knobs for the effective deployment
    #[must_use]
    pub fn tuning(&self) -> &Tuning {
        match self.deployment() {
            Deployment::Local => &self.local,
            Deployment::Production => &self.production,
        }
    }

    /// Whether `endpoint` is on the critical allowlist
    #[must_use]
    pub fn is_critical(&self, endpoint: &str) -> bool {
        self.critical_endpoints
            .iter()
            .any(|p| !p.is_empty() && endpoint.contains(p.as_str()))
    }

    /// Whether `endpoint` is configured as one-at-a-time
    #[must_use]
    pub fn is_non_parallel(&self, endpoint: &str) -> bool {
        self.non_parallel_endpoints
            .iter()
            .any(|p| !p.is_empty() && endpoint.contains(p.as_str()))
    }
}

/// Where the backend runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    /// localhost or a dev host: short timeouts, strict readiness
    Local,
    /// Public deployment: long timeouts, optimistic readiness
    Production,
}

impl Deployment {
    /// Classify a base URL by its host
    #[must_use]
    pub fn detect(base_url: &str) -> Self {
        let Some(host) = Url::parse(base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            return Self::Local;
        };

        let local = host == "localhost"
            || host == "0.0.0.0"
            || host == "[::1]"
            || host.starts_with("127.")
            || host.starts_with("192.168.")
            || host.starts_with("10.")
            || host.ends_with(".local")
            || host.ends_with(".localhost");

        if local { Self::Local } else { Self::Production }
    }

    /// Whether this is the public deployment
    #[must_use]
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Per-deployment timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Dispatch timeout for ordinary requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Health probe timeout
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Token refresh timeout
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,
    /// Age after which the last probe no longer counts as fresh
    #[serde(with = "humantime_serde")]
    pub health_staleness: Duration,
    /// Base delay for transport retry backoff
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
}

impl Tuning {
    /// Defaults for local/dev hosts
    #[must_use]
    pub fn local() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(5),
            health_staleness: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
        }
    }

    /// Defaults for the public deployment
    #[must_use]
    pub fn production() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(15),
            refresh_timeout: Duration::from_secs(15),
            health_staleness: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self::production()
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt for transport failures and 401
    pub max_retries: u32,
    /// Upper bound on a single backoff delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_backoff: Duration::from_millis(15_000),
        }
    }
}

/// How a throttle rule's pattern is compared with an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Pattern occurs anywhere in the endpoint
    #[default]
    Contains,
    /// Endpoint starts with the pattern
    Prefix,
    /// Endpoint equals the pattern
    Exact,
}

/// One throttle rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleRule {
    /// Pattern compared with the normalized endpoint
    pub pattern: String,
    /// Comparison mode
    #[serde(default)]
    pub match_kind: MatchKind,
    /// Minimum interval between calls
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl ThrottleRule {
    /// Substring rule
    #[must_use]
    pub fn contains(pattern: &str, interval: Duration) -> Self {
        Self {
            pattern: pattern.to_string(),
            match_kind: MatchKind::Contains,
            interval,
        }
    }

    /// Whether this rule applies to `endpoint`
    #[must_use]
    pub fn matches(&self, endpoint: &str) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        match self.match_kind {
            MatchKind::Contains => endpoint.contains(self.pattern.as_str()),
            MatchKind::Prefix => endpoint.starts_with(self.pattern.as_str()),
            MatchKind::Exact => endpoint == self.pattern,
        }
    }
}

/// Throttle configuration. Rules are evaluated in order; first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Enable min-interval enforcement (blocks after 429 always apply)
    pub enabled: bool,
    /// Interval for endpoints no rule matches
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,
    /// Ordered rules
    pub rules: Vec<ThrottleRule>,
    /// Block duration when a 429 has no usable `Retry-After`
    #[serde(with = "humantime_serde")]
    pub default_retry_after: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_interval: Duration::from_millis(300),
            rules: vec![
                ThrottleRule::contains("daily-bonus", Duration::from_secs(5)),
                ThrottleRule::contains("participate", Duration::from_secs(2)),
                ThrottleRule::contains("raffles", Duration::from_secs(2)),
                ThrottleRule::contains("tasks", Duration::from_secs(1)),
                ThrottleRule::contains("auth", Duration::from_secs(1)),
            ],
            default_retry_after: Duration::from_secs(30),
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Poll interval while healthy
    #[serde(with = "humantime_serde")]
    pub healthy_interval: Duration,
    /// Poll interval after 1-2 consecutive failures
    #[serde(with = "humantime_serde")]
    pub degraded_interval: Duration,
    /// Poll interval at or above the warning threshold
    #[serde(with = "humantime_serde")]
    pub critical_interval: Duration,
    /// Consecutive failures before the "server unavailable" banner
    pub failure_threshold: u32,
    /// Let production traffic through when the forced probe fails.
    ///
    /// Availability over consistency: a product decision, kept on by default.
    pub production_fallback: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            healthy_interval: Duration::from_secs(60),
            degraded_interval: Duration::from_secs(30),
            critical_interval: Duration::from_secs(15),
            failure_threshold: 3,
            production_fallback: true,
        }
    }
}

/// Token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime assumed when the refresh response omits an expiry
    #[serde(with = "humantime_serde")]
    pub default_lifetime: Duration,
    /// Directory for the file token store; memory-only when unset
    pub storage_dir: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(24 * 60 * 60),
            storage_dir: None,
        }
    }
}

/// Well-known endpoints, relative to the API namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Liveness probe
    pub health: String,
    /// Token refresh
    pub refresh: String,
    /// Authenticated-namespace probe used by the self-test
    pub auth_probe: String,
    /// Origin sent with the cross-origin self-test probe
    pub probe_origin: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            health: "health".to_string(),
            refresh: "auth/refresh".to_string(),
            auth_probe: "auth/check".to_string(),
            probe_origin: "https://web.telegram.org".to_string(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "500ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "500ms", "30s", "5m", "1h" or bare seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_local_hosts() {
        assert_eq!(Deployment::detect("http://localhost:8000"), Deployment::Local);
        assert_eq!(Deployment::detect("http://127.0.0.1:3000"), Deployment::Local);
        assert_eq!(Deployment::detect("http://raffle.local"), Deployment::Local);
        assert_eq!(Deployment::detect("not a url"), Deployment::Local);
        assert_eq!(
            Deployment::detect("https://api.raffle-app.com"),
            Deployment::Production
        );
    }

    #[test]
    fn explicit_deployment_wins() {
        let config = ClientConfig {
            deployment: Some(Deployment::Production),
            ..ClientConfig::for_base_url("http://localhost:8000")
        };
        assert_eq!(config.deployment(), Deployment::Production);
        assert_eq!(config.tuning().probe_timeout, Duration::from_secs(15));
    }

    #[test]
    fn tuning_follows_deployment() {
        let local = ClientConfig::for_base_url("http://localhost:8000");
        assert_eq!(local.tuning().probe_timeout, Duration::from_secs(5));
        let prod = ClientConfig::for_base_url("https://api.raffle-app.com");
        assert_eq!(prod.tuning().request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn parse_durations() {
        assert_eq!(humantime_serde::parse("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn yaml_overrides_sections() {
        let yaml = r#"
base_url: "https://api.raffle-app.com"
user_id: "42"
retry:
  max_retries: 5
throttle:
  default_interval: "0s"
  rules:
    - pattern: "raffles"
      interval: "2s"
    - pattern: "api/user"
      match_kind: prefix
      interval: "500ms"
health:
  failure_threshold: 4
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.user_id.as_deref(), Some("42"));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_backoff, Duration::from_millis(15_000));
        assert_eq!(config.throttle.rules.len(), 2);
        assert_eq!(config.throttle.rules[1].match_kind, MatchKind::Prefix);
        assert_eq!(config.throttle.rules[1].interval, Duration::from_millis(500));
        assert_eq!(config.health.failure_threshold, 4);
        assert!(config.health.production_fallback);
    }

    #[test]
    fn rule_match_kinds() {
        let contains = ThrottleRule::contains("raffles", Duration::from_secs(1));
        assert!(contains.matches("api/raffles/7"));
        let prefix = ThrottleRule {
            match_kind: MatchKind::Prefix,
            ..ThrottleRule::contains("api/user", Duration::from_secs(1))
        };
        assert!(prefix.matches("api/user/42"));
        assert!(!prefix.matches("api/raffles/user"));
        let exact = ThrottleRule {
            match_kind: MatchKind::Exact,
            ..ThrottleRule::contains("api/tasks", Duration::from_secs(1))
        };
        assert!(exact.matches("api/tasks"));
        assert!(!exact.matches("api/tasks/1"));
    }

    #[test]
    fn validate_rejects_bad_base_url() {
        assert!(ClientConfig::for_base_url("ftp://example.com").validate().is_err());
        assert!(ClientConfig::for_base_url("nope").validate().is_err());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = ClientConfig::load(Some(Path::new("/nonexistent/miniapp.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miniapp.yaml");
        std::fs::write(&path, "base_url: \"https://api.raffle-app.com\"\napi_prefix: \"v1\"\n").unwrap();
        let config = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(config.api_prefix, "v1");
        assert_eq!(config.deployment(), Deployment::Production);
    }
}
