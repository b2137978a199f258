//! Vulnerability, license and policy data sources.
//!
//! The vulnerability database and the organization policy store are external
//! collaborators behind traits. License resolution consults the data source
//! first and falls back to the public npm registry ([`NpmRegistryLicenses`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported by data sources.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    #[error("registry request failed: {0}")]
    Http(String),

    #[error("unexpected registry response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::Http(err.to_string())
    }
}

/// Result type for data-source lookups.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Known vulnerability counts for one package version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulnCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl VulnCounts {
    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }

    /// `"1 critical, 2 high"`, or `"no known vulnerabilities"`.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            (self.critical, "critical"),
            (self.high, "high"),
            (self.medium, "medium"),
            (self.low, "low"),
        ]
        .iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{count} {label}"))
        .collect();
        if parts.is_empty() {
            "no known vulnerabilities".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// License policy in effect for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectivePolicy {
    /// Allow-list of SPDX identifiers. Empty means no license policy.
    pub accepted_licenses: Vec<String>,
    /// Treat packages without a resolvable license as violations.
    pub disallow_unknown_licenses: bool,
}

#[async_trait]
pub trait VulnerabilitySource: Send + Sync {
    async fn vuln_counts(&self, name: &str, version: &str) -> SourceResult<VulnCounts>;
}

#[async_trait]
pub trait LicenseSource: Send + Sync {
    /// SPDX license of a package, `None` when unknown.
    async fn license(&self, name: &str) -> SourceResult<Option<String>>;
}

#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn effective_policy(
        &self,
        organization_id: &str,
        project_id: &str,
    ) -> SourceResult<EffectivePolicy>;
}

// ---------------------------------------------------------------------------
// License fallback chain
// ---------------------------------------------------------------------------

/// Primary license source with a fallback consulted when the primary has no
/// answer or fails.
pub struct ChainedLicenseSource {
    primary: Arc<dyn LicenseSource>,
    fallback: Arc<dyn LicenseSource>,
}

impl ChainedLicenseSource {
    pub fn new(primary: Arc<dyn LicenseSource>, fallback: Arc<dyn LicenseSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl LicenseSource for ChainedLicenseSource {
    async fn license(&self, name: &str) -> SourceResult<Option<String>> {
        match self.primary.license(name).await {
            Ok(Some(license)) => return Ok(Some(license)),
            Ok(None) => debug!(package = %name, "license unknown to primary source"),
            Err(err) => warn!(package = %name, error = %err, "primary license source failed"),
        }
        self.fallback.license(name).await
    }
}

// ---------------------------------------------------------------------------
// npm registry
// ---------------------------------------------------------------------------

pub const NPM_REGISTRY_URL: &str = "https://registry.npmjs.org";

/// License lookup against the npm registry's `latest` document.
pub struct NpmRegistryLicenses {
    base_url: String,
    http_client: reqwest::Client,
}

impl NpmRegistryLicenses {
    pub fn new(base_url: &str, timeout: Duration) -> SourceResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("depguard/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Registry URL for a package; scoped names keep `@` and encode `/`.
    pub fn latest_url(&self, name: &str) -> String {
        format!("{}/{}/latest", self.base_url, name.replace('/', "%2F"))
    }
}

#[async_trait]
impl LicenseSource for NpmRegistryLicenses {
    async fn license(&self, name: &str) -> SourceResult<Option<String>> {
        let response = self.http_client.get(self.latest_url(name)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Http(format!(
                "registry returned {} for {name}",
                response.status()
            )));
        }
        let document: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(license_from_document(&document))
    }
}

/// `license` is a string in modern documents and `{ "type": ... }` in old ones.
pub fn license_from_document(document: &Value) -> Option<String> {
    match document.get("license") {
        Some(Value::String(license)) if !license.trim().is_empty() => {
            Some(license.trim().to_string())
        }
        Some(Value::Object(obj)) => obj
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t.trim().to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Static sources
// ---------------------------------------------------------------------------

/// Fixed vulnerability counts keyed by `name@version`; a `name@*` entry
/// matches any version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticVulnerabilities {
    counts: HashMap<String, VulnCounts>,
}

impl StaticVulnerabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, version: &str, counts: VulnCounts) -> Self {
        self.counts.insert(format!("{name}@{version}"), counts);
        self
    }
}

#[async_trait]
impl VulnerabilitySource for StaticVulnerabilities {
    async fn vuln_counts(&self, name: &str, version: &str) -> SourceResult<VulnCounts> {
        let exact = self.counts.get(&format!("{name}@{version}"));
        let any = || self.counts.get(&format!("{name}@*"));
        Ok(exact.or_else(any).copied().unwrap_or_default())
    }
}

/// Fixed licenses keyed by package name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticLicenses {
    licenses: HashMap<String, String>,
}

impl StaticLicenses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, license: &str) -> Self {
        self.licenses.insert(name.to_string(), license.to_string());
        self
    }
}

#[async_trait]
impl LicenseSource for StaticLicenses {
    async fn license(&self, name: &str) -> SourceResult<Option<String>> {
        Ok(self.licenses.get(name).cloned())
    }
}

/// The same policy for every project.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy(pub EffectivePolicy);

#[async_trait]
impl PolicySource for StaticPolicy {
    async fn effective_policy(
        &self,
        _organization_id: &str,
        _project_id: &str,
    ) -> SourceResult<EffectivePolicy> {
        Ok(self.0.clone())
    }
}

/// Offline advisory snapshot, as loaded from a JSON file:
///
/// ```json
/// { "vulnerabilities": { "lodash@4.17.20": { "high": 1 } },
///   "licenses": { "lodash": "MIT" } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorySnapshot {
    pub vulnerabilities: StaticVulnerabilities,
    pub licenses: StaticLicenses,
}
