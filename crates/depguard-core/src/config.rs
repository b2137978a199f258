//! Engine configuration.
//!
//! Defaults suit a hosted deployment; each knob can be overridden from the
//! environment via [`EngineConfig::from_env`].

use std::time::Duration;

/// Check-run name shared by every guardrail evaluation so re-runs update
/// the same run in place.
pub const DEFAULT_CHECK_RUN_NAME: &str = "Depguard / dependency guardrails";

/// Runtime settings shared by the remediation flow and the guardrail pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound for every VCS call.
    pub vcs_timeout: Duration,
    /// Upper bound for every vulnerability/license/policy lookup.
    pub source_timeout: Duration,
    /// Maximum in-flight package lookups, and maximum concurrently evaluated
    /// workspaces.
    pub max_concurrency: usize,
    /// Extra attempts for idempotent steps that fail transiently.
    pub transient_retries: u32,
    pub check_run_name: String,
    /// Namespace for remediation branches (`<prefix>/bump-...`).
    pub branch_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            vcs_timeout: Duration::from_secs(15),
            source_timeout: Duration::from_secs(10),
            max_concurrency: 8,
            transient_retries: 2,
            check_run_name: DEFAULT_CHECK_RUN_NAME.to_string(),
            branch_prefix: "depguard".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read overrides from `DEPGUARD_*` environment variables. Unset or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        EngineConfig {
            vcs_timeout: secs("DEPGUARD_VCS_TIMEOUT_SECS", defaults.vcs_timeout),
            source_timeout: secs("DEPGUARD_SOURCE_TIMEOUT_SECS", defaults.source_timeout),
            max_concurrency: lookup("DEPGUARD_MAX_CONCURRENCY")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_concurrency),
            transient_retries: lookup("DEPGUARD_TRANSIENT_RETRIES")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(defaults.transient_retries),
            check_run_name: lookup("DEPGUARD_CHECK_RUN_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.check_run_name),
            branch_prefix: lookup("DEPGUARD_BRANCH_PREFIX")
                .map(|v| v.trim().trim_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.branch_prefix),
        }
    }

    pub fn with_vcs_timeout(mut self, timeout: Duration) -> Self {
        self.vcs_timeout = timeout;
        self
    }

    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_check_run_name(mut self, name: &str) -> Self {
        self.check_run_name = name.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_keeps_defaults() {
        assert_eq!(EngineConfig::from_lookup(lookup(&[])), EngineConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DEPGUARD_VCS_TIMEOUT_SECS", "30"),
            ("DEPGUARD_MAX_CONCURRENCY", "2"),
            ("DEPGUARD_CHECK_RUN_NAME", "deps"),
            ("DEPGUARD_BRANCH_PREFIX", "/bots/"),
        ]));
        assert_eq!(config.vcs_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.check_run_name, "deps");
        assert_eq!(config.branch_prefix, "bots");
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DEPGUARD_VCS_TIMEOUT_SECS", "soon"),
            ("DEPGUARD_MAX_CONCURRENCY", "0"),
        ]));
        assert_eq!(config.vcs_timeout, EngineConfig::default().vcs_timeout);
        assert_eq!(config.max_concurrency, 8);
    }
}
