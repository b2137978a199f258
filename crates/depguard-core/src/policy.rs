//! Vulnerability and license evaluation of a workspace diff.
//!
//! Severity blocking is cumulative: enabling a level also blocks on every
//! more severe level. `block_high` blocks a package with a critical finding
//! even when `block_critical` is off.

use std::sync::Arc;
use std::time::Duration;

use depguard_state::GuardrailConfig;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::warn;

use crate::diff::ManifestDiffResult;
use crate::sources::{EffectivePolicy, LicenseSource, VulnCounts, VulnerabilitySource};

/// Whether `counts` crosses any enabled severity threshold.
pub fn is_severity_blocked(config: &GuardrailConfig, counts: &VulnCounts) -> bool {
    let critical = counts.critical;
    let high = critical + counts.high;
    let medium = high + counts.medium;
    let any = medium + counts.low;

    (config.block_critical && critical > 0)
        || (config.block_high && high > 0)
        || (config.block_medium && medium > 0)
        || (config.block_low && any > 0)
}

/// Whether `license` violates the allow-list.
///
/// Only applies with `block_policy_violations` and a non-empty allow-list.
/// Comparison ignores ASCII case. An unknown license violates only when the
/// policy disallows unknowns.
pub fn is_policy_violation(
    config: &GuardrailConfig,
    policy: &EffectivePolicy,
    license: Option<&str>,
) -> bool {
    if !config.block_policy_violations || policy.accepted_licenses.is_empty() {
        return false;
    }
    match license {
        Some(license) => !policy
            .accepted_licenses
            .iter()
            .any(|accepted| accepted.trim().eq_ignore_ascii_case(license.trim())),
        None => policy.disallow_unknown_licenses,
    }
}

/// How a package entered the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageOrigin {
    DirectAdded,
    DirectBumped,
    TransitiveAdded,
}

/// Evaluation of one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageEvaluation {
    pub name: String,
    pub version: String,
    /// Previous version, bumped packages only.
    pub old_version: Option<String>,
    pub origin: PackageOrigin,
    pub vulns: VulnCounts,
    /// Resolved license. Not looked up for bumped packages.
    pub license: Option<String>,
    pub policy_violation: bool,
    pub blocked: bool,
}

/// Evaluation of one workspace, packages in diff order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceEvaluation {
    pub packages: Vec<PackageEvaluation>,
    pub blocked: bool,
}

impl WorkspaceEvaluation {
    pub fn of_origin(&self, origin: PackageOrigin) -> impl Iterator<Item = &PackageEvaluation> {
        self.packages.iter().filter(move |p| p.origin == origin)
    }
}

struct PackageJob {
    name: String,
    version: String,
    old_version: Option<String>,
    origin: PackageOrigin,
}

/// Looks up vulnerabilities and licenses for every package of a diff.
pub struct PolicyEvaluator {
    vulnerabilities: Arc<dyn VulnerabilitySource>,
    licenses: Arc<dyn LicenseSource>,
    source_timeout: Duration,
    max_concurrency: usize,
}

impl PolicyEvaluator {
    pub fn new(
        vulnerabilities: Arc<dyn VulnerabilitySource>,
        licenses: Arc<dyn LicenseSource>,
        source_timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            vulnerabilities,
            licenses,
            source_timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Evaluate every package of `diff`. Lookups run at most
    /// `max_concurrency` at a time; results keep the diff's order.
    pub async fn evaluate(
        &self,
        diff: &ManifestDiffResult,
        config: &GuardrailConfig,
        policy: &EffectivePolicy,
    ) -> WorkspaceEvaluation {
        let bumped = diff.direct_bumped.iter().map(|p| PackageJob {
            name: p.name.clone(),
            version: p.new_version.clone(),
            old_version: Some(p.old_version.clone()),
            origin: PackageOrigin::DirectBumped,
        });
        let added = diff.direct_added.iter().map(|p| PackageJob {
            name: p.name.clone(),
            version: p.version.clone(),
            old_version: None,
            origin: PackageOrigin::DirectAdded,
        });
        let transitive = diff.transitive_added.iter().map(|p| PackageJob {
            name: p.name.clone(),
            version: p.version.clone(),
            old_version: None,
            origin: PackageOrigin::TransitiveAdded,
        });

        let jobs: Vec<PackageJob> = bumped.chain(added).chain(transitive).collect();
        let packages: Vec<PackageEvaluation> = stream::iter(jobs)
            .map(|job| self.evaluate_package(job, config, policy))
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let blocked = packages.iter().any(|p| p.blocked);
        WorkspaceEvaluation { packages, blocked }
    }

    async fn evaluate_package(
        &self,
        job: PackageJob,
        config: &GuardrailConfig,
        policy: &EffectivePolicy,
    ) -> PackageEvaluation {
        let vulns = self.vuln_counts(&job.name, &job.version).await;
        let license = match job.origin {
            PackageOrigin::DirectBumped => None,
            PackageOrigin::DirectAdded | PackageOrigin::TransitiveAdded => {
                self.license(&job.name).await
            }
        };

        let severity_blocked = is_severity_blocked(config, &vulns);
        let policy_violation = job.origin != PackageOrigin::DirectBumped
            && is_policy_violation(config, policy, license.as_deref());
        let blocked = match job.origin {
            PackageOrigin::DirectBumped => severity_blocked,
            PackageOrigin::DirectAdded => severity_blocked || policy_violation,
            PackageOrigin::TransitiveAdded => {
                config.block_transitive_vulns && (severity_blocked || policy_violation)
            }
        };

        PackageEvaluation {
            name: job.name,
            version: job.version,
            old_version: job.old_version,
            origin: job.origin,
            vulns,
            license,
            policy_violation,
            blocked,
        }
    }

    async fn vuln_counts(&self, name: &str, version: &str) -> VulnCounts {
        let lookup = self.vulnerabilities.vuln_counts(name, version);
        match tokio::time::timeout(self.source_timeout, lookup).await {
            Ok(Ok(counts)) => counts,
            Ok(Err(err)) => {
                warn!(package = %name, %version, error = %err, "vulnerability lookup failed, counting as none");
                VulnCounts::default()
            }
            Err(_) => {
                warn!(package = %name, %version, "vulnerability lookup timed out, counting as none");
                VulnCounts::default()
            }
        }
    }

    async fn license(&self, name: &str) -> Option<String> {
        match tokio::time::timeout(self.source_timeout, self.licenses.license(name)).await {
            Ok(Ok(license)) => license,
            Ok(Err(err)) => {
                warn!(package = %name, error = %err, "license lookup failed, treating as unknown");
                None
            }
            Err(_) => {
                warn!(package = %name, "license lookup timed out, treating as unknown");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{AddedPackage, BumpedPackage};
    use crate::sources::{StaticLicenses, StaticVulnerabilities};

    fn counts(critical: u32, high: u32, medium: u32, low: u32) -> VulnCounts {
        VulnCounts {
            critical,
            high,
            medium,
            low,
        }
    }

    fn config() -> GuardrailConfig {
        GuardrailConfig::default()
    }

    #[test]
    fn high_finding_respects_threshold() {
        let high_only = counts(0, 1, 0, 0);
        let critical_gate = GuardrailConfig {
            block_critical: true,
            ..config()
        };
        assert!(!is_severity_blocked(&critical_gate, &high_only));

        let high_gate = GuardrailConfig {
            block_high: true,
            ..critical_gate
        };
        assert!(is_severity_blocked(&high_gate, &high_only));
    }

    #[test]
    fn critical_finding_blocks_under_any_single_threshold() {
        let critical = counts(1, 0, 0, 0);
        let gates = [
            GuardrailConfig { block_critical: true, ..config() },
            GuardrailConfig { block_high: true, ..config() },
            GuardrailConfig { block_medium: true, ..config() },
            GuardrailConfig { block_low: true, ..config() },
        ];
        for gate in gates {
            assert!(is_severity_blocked(&gate, &critical), "{gate:?}");
        }
        assert!(!is_severity_blocked(&config(), &critical));
    }

    #[test]
    fn low_threshold_blocks_everything_with_findings() {
        let gate = GuardrailConfig { block_low: true, ..config() };
        assert!(is_severity_blocked(&gate, &counts(0, 0, 0, 1)));
        assert!(!is_severity_blocked(&gate, &VulnCounts::default()));
    }

    #[test]
    fn policy_violation_rules() {
        let gate = GuardrailConfig {
            block_policy_violations: true,
            ..config()
        };
        let mit_only = EffectivePolicy {
            accepted_licenses: vec!["MIT".to_string()],
            disallow_unknown_licenses: false,
        };

        assert!(is_policy_violation(&gate, &mit_only, Some("WTFPL")));
        assert!(!is_policy_violation(&gate, &mit_only, Some("mit")));
        assert!(!is_policy_violation(&gate, &mit_only, None));
        assert!(is_policy_violation(
            &gate,
            &EffectivePolicy {
                disallow_unknown_licenses: true,
                ..mit_only.clone()
            },
            None
        ));

        // Disabled gate or empty allow-list never violates.
        assert!(!is_policy_violation(&config(), &mit_only, Some("WTFPL")));
        assert!(!is_policy_violation(&gate, &EffectivePolicy::default(), Some("WTFPL")));
    }

    #[tokio::test]
    async fn evaluates_packages_in_diff_order() {
        let vulns = StaticVulnerabilities::new()
            .with("lodash", "4.17.21", counts(0, 1, 0, 0))
            .with("minimist", "0.0.8", counts(1, 0, 0, 0));
        let licenses = StaticLicenses::new()
            .with("left-pad", "WTFPL")
            .with("express", "MIT")
            .with("minimist", "MIT");
        let evaluator = PolicyEvaluator::new(
            Arc::new(vulns),
            Arc::new(licenses),
            Duration::from_secs(1),
            2,
        );

        let diff = ManifestDiffResult {
            direct_added: vec![
                AddedPackage { name: "express".into(), version: "4.19.2".into() },
                AddedPackage { name: "left-pad".into(), version: "1.3.0".into() },
            ],
            direct_bumped: vec![BumpedPackage {
                name: "lodash".into(),
                old_version: "4.17.20".into(),
                new_version: "4.17.21".into(),
            }],
            transitive_added: vec![AddedPackage { name: "minimist".into(), version: "0.0.8".into() }],
        };
        let gate = GuardrailConfig {
            block_policy_violations: true,
            block_critical: true,
            ..config()
        };
        let policy = EffectivePolicy {
            accepted_licenses: vec!["MIT".to_string()],
            disallow_unknown_licenses: false,
        };

        let evaluation = evaluator.evaluate(&diff, &gate, &policy).await;
        let names: Vec<&str> = evaluation.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["lodash", "express", "left-pad", "minimist"]);

        let lodash = &evaluation.packages[0];
        assert_eq!(lodash.license, None);
        assert!(!lodash.blocked, "high finding under critical-only gate");

        let left_pad = &evaluation.packages[2];
        assert!(left_pad.policy_violation);
        assert!(left_pad.blocked);

        let minimist = &evaluation.packages[3];
        assert!(!minimist.blocked, "transitive blocking is off");
        assert!(evaluation.blocked);
    }

    #[tokio::test]
    async fn transitive_license_violation_blocks_when_transitive_checks_are_on() {
        let evaluator = PolicyEvaluator::new(
            Arc::new(StaticVulnerabilities::new()),
            Arc::new(StaticLicenses::new().with("gpl-lib", "GPL-3.0")),
            Duration::from_secs(1),
            2,
        );
        let diff = ManifestDiffResult {
            transitive_added: vec![AddedPackage { name: "gpl-lib".into(), version: "2.0.0".into() }],
            ..ManifestDiffResult::default()
        };
        let policy = EffectivePolicy {
            accepted_licenses: vec!["MIT".to_string()],
            disallow_unknown_licenses: false,
        };
        let gate = GuardrailConfig {
            block_policy_violations: true,
            ..config()
        };

        let evaluation = evaluator.evaluate(&diff, &gate, &policy).await;
        assert!(evaluation.packages[0].policy_violation);
        assert!(!evaluation.blocked, "transitive checks are off");

        let gate = GuardrailConfig {
            block_transitive_vulns: true,
            ..gate
        };
        let evaluation = evaluator.evaluate(&diff, &gate, &policy).await;
        assert!(evaluation.packages[0].blocked);
        assert!(evaluation.blocked);
    }
}
