//! Cache configuration.
//!
//! Controls which requests the response cache serves and how long entries
//! live. Loaded once at startup from the `[cache]` section of
//! `readthrough.toml` and never mutated afterwards.

use std::time::Duration;

use serde::Deserialize;

use super::keys::DEFAULT_NAMESPACE;

const DEFAULT_MAX_AGE_SECS: u64 = 300;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_ERROR_LOG_INTERVAL_SECS: u64 = 30;
/// Upper bound for `max_age_secs`: one year.
pub const MAX_AGE_LIMIT_SECS: u64 = 365 * 24 * 60 * 60;
const DEFAULT_EXCLUDED_PREFIXES: [&str; 6] = [
    "/admin",
    "/api/auth",
    "/api/upload",
    "/_health",
    "/api/orders",
    "/api/users-permissions",
];

/// What `clear_all` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClearScope {
    /// Only keys inside the cache namespace.
    #[default]
    Namespace,
    /// Every key in the backend database.
    Database,
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve and store responses at all.
    pub enabled: bool,
    /// TTL applied to new entries.
    pub max_age_secs: u64,
    /// Requests whose path starts with any of these are never cached.
    pub excluded_prefixes: Vec<String>,
    /// Whether the query string participates in the key.
    pub include_query: bool,
    /// Key namespace; the cache never touches keys outside it.
    pub namespace: String,
    /// Larger bodies are passed through but not stored.
    pub max_body_bytes: usize,
    pub clear_scope: ClearScope,
    /// Minimum spacing between repeated backend-failure warnings.
    pub error_log_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            excluded_prefixes: DEFAULT_EXCLUDED_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
            include_query: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            clear_scope: ClearScope::Namespace,
            error_log_interval_secs: DEFAULT_ERROR_LOG_INTERVAL_SECS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_age_secs: settings.max_age.as_secs(),
            excluded_prefixes: settings.excluded_prefixes.clone(),
            include_query: settings.include_query,
            namespace: settings.namespace.clone(),
            max_body_bytes: settings.max_body_bytes.get(),
            clear_scope: settings.clear_scope,
            error_log_interval_secs: settings.error_log_interval.as_secs(),
        }
    }
}

impl CacheConfig {
    /// Returns true if `path` falls under an excluded prefix.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }

    /// Entry TTL, clamped to `1..=MAX_AGE_LIMIT_SECS` seconds.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs.clamp(1, MAX_AGE_LIMIT_SECS))
    }

    pub fn error_log_interval(&self) -> Duration {
        Duration::from_secs(self.error_log_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_age_secs, 300);
        assert!(config.include_query);
        assert_eq!(config.namespace, "cache");
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.clear_scope, ClearScope::Namespace);
        assert_eq!(config.excluded_prefixes.len(), 6);
    }

    #[test]
    fn max_age_is_clamped() {
        let mut config = CacheConfig {
            max_age_secs: 0,
            ..CacheConfig::default()
        };
        assert_eq!(config.max_age(), Duration::from_secs(1));

        config.max_age_secs = u64::MAX;
        assert_eq!(config.max_age(), Duration::from_secs(MAX_AGE_LIMIT_SECS));
    }

    #[test]
    fn excluded_prefixes_match_by_prefix() {
        let config = CacheConfig::default();
        assert!(config.is_excluded("/api/auth/me"));
        assert!(config.is_excluded("/admin"));
        assert!(config.is_excluded("/api/orders/7"));
        assert!(!config.is_excluded("/api/products"));
    }

    #[test]
    fn empty_prefix_does_not_exclude_everything() {
        let config = CacheConfig {
            excluded_prefixes: vec![String::new()],
            ..Default::default()
        };
        assert!(!config.is_excluded("/api/products"));
    }

    #[test]
    fn zero_max_age_clamps_to_one_second() {
        let config = CacheConfig {
            max_age_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.max_age(), Duration::from_secs(1));
    }
}
