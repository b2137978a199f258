//! Depguard Core Library
//!
//! Dependency remediation PRs and pull-request guardrails for npm projects.
//!
//! - [`RemediationEngine`] opens one bump/remove PR per request, idempotently.
//! - [`GuardrailPipeline`] evaluates the dependency changes of a PR and
//!   publishes a report and a check run.
//!
//! Source control, persistence and vulnerability data are reached through
//! traits ([`VcsClient`], `depguard_state` stores, [`sources`]); the engine
//! never implements them.

pub mod config;
pub mod diff;
pub mod error;
pub mod fakes;
pub mod guardrail;
pub mod lockfile;
pub mod manifest;
pub mod obs;
pub mod policy;
pub mod remediation;
pub mod report;
pub mod sources;
pub mod telemetry;
pub mod vcs;

pub use config::{EngineConfig, DEFAULT_CHECK_RUN_NAME};

pub use diff::{
    diff_workspace, resolve_workspaces, AddedPackage, BumpedPackage, ManifestDiffResult,
    WorkspaceSnapshot,
};

pub use error::{GuardrailError, GuardrailResult, RemediationError, RemediationResult};

pub use guardrail::{GuardrailPipeline, PullRequestEvent};

pub use lockfile::{Lockfile, PackagePin};

pub use manifest::{patch_manifest, Manifest, ManifestChange, ManifestError};

pub use policy::{
    is_policy_violation, is_severity_blocked, PackageEvaluation, PackageOrigin, PolicyEvaluator,
    WorkspaceEvaluation,
};

pub use remediation::{
    RemediationEngine, RemediationOutcome, RemediationRequest, ReconcileSummary, StaleReconciler,
};

pub use report::{publish_verdict, render_workspace_report, EvaluationVerdict, WorkspaceReport};

pub use sources::{
    AdvisorySnapshot, ChainedLicenseSource, EffectivePolicy, LicenseSource, NpmRegistryLicenses,
    PolicySource, SourceError, StaticLicenses, StaticPolicy, StaticVulnerabilities, VulnCounts,
    VulnerabilitySource,
};

pub use telemetry::{init_tracing, LogFormat};

pub use vcs::{InstallationToken, VcsClient, VcsError, VcsResult};

pub use depguard_state::{GuardrailConfig, RemediationType};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
