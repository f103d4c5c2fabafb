use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::DEFAULT_MAX_ENTRIES;
use crate::errors::ConfigError;
use crate::locale::LocaleConfig;
use crate::search_engine::{DEFAULT_ENDPOINT, DEFAULT_ENGINE};

/// Process-level settings. Built once at startup and handed to the pipeline;
/// nothing in the library reads the environment on its own.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub engine: String,
    pub http_timeout: Duration,
    /// `None` keeps cached runs for the lifetime of the process.
    pub cache_ttl: Option<Duration>,
    pub cache_max_entries: usize,
    pub dedupe_queries: bool,
    pub github_token: Option<String>,
    pub bind_addr: String,
    pub default_locale: LocaleConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            engine: DEFAULT_ENGINE.to_string(),
            http_timeout: Duration::from_secs(30),
            cache_ttl: None,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            dedupe_queries: true,
            github_token: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            default_locale: LocaleConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.parse().ok())
        }

        let defaults = AppConfig::default();
        let mut locale = defaults.default_locale.clone();
        if let Some(language) = text("SERP_LANGUAGE") {
            locale.language = language;
        }
        if let Some(country) = text("SERP_COUNTRY") {
            locale.country = country;
        }
        if let Some(location) = text("SERP_LOCATION") {
            locale.location = Some(location);
        }
        if let Some(domain) = text("SERP_GOOGLE_DOMAIN") {
            locale.google_domain = Some(domain);
        }
        if let Some(num) = parsed(text("SERP_NUM")) {
            locale.num = num;
        }
        if let Some(workers) = parsed(text("SERP_WORKERS")) {
            locale.workers = workers;
        }

        AppConfig {
            api_key: text("SERPAPI_API_KEY").or_else(|| text("SERPAPI_KEY")),
            endpoint: text("SERPAPI_ENDPOINT").unwrap_or(defaults.endpoint),
            engine: text("SERP_ENGINE").unwrap_or(defaults.engine),
            http_timeout: parsed(text("SERP_HTTP_TIMEOUT_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            cache_ttl: parsed::<u64>(text("SERP_CACHE_TTL_SECS"))
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            cache_max_entries: parsed(text("SERP_CACHE_MAX_ENTRIES"))
                .unwrap_or(defaults.cache_max_entries),
            dedupe_queries: text("SERP_DEDUPE_QUERIES")
                .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(defaults.dedupe_queries),
            github_token: text("GITHUB_TOKEN"),
            bind_addr: text("SERVER_BIND").unwrap_or(defaults.bind_addr),
            default_locale: locale,
        }
    }

    /// The credential, or the error that must stop the run before any call.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert!(cfg.api_key.is_none());
        assert!(matches!(cfg.require_api_key(), Err(ConfigError::MissingApiKey)));
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cfg.cache_ttl, None);
        assert!(cfg.dedupe_queries);
        assert_eq!(cfg.default_locale, LocaleConfig::default());
    }

    #[test]
    fn test_reads_variables() {
        let cfg = config(&[
            ("SERPAPI_KEY", " abc "),
            ("SERP_CACHE_TTL_SECS", "600"),
            ("SERP_DEDUPE_QUERIES", "false"),
            ("SERP_WORKERS", "4"),
            ("SERP_LANGUAGE", "en"),
            ("GITHUB_TOKEN", "ghp_x"),
        ]);
        assert_eq!(cfg.require_api_key().unwrap(), "abc");
        assert_eq!(cfg.cache_ttl, Some(Duration::from_secs(600)));
        assert!(!cfg.dedupe_queries);
        assert_eq!(cfg.default_locale.workers, 4);
        assert_eq!(cfg.default_locale.language, "en");
        assert_eq!(cfg.github_token.as_deref(), Some("ghp_x"));
    }

    #[test]
    fn test_blank_key_and_zero_ttl() {
        let cfg = config(&[("SERPAPI_API_KEY", "   "), ("SERP_CACHE_TTL_SECS", "0")]);
        assert!(cfg.require_api_key().is_err());
        assert_eq!(cfg.cache_ttl, None);
    }
}
