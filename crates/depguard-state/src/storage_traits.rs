//! Storage trait definitions for depguard
//!
//! These traits define the persistence seam the engine composes:
//! - `RemediationStore`: remediation PR records (create-or-fetch, supersede)
//! - `DependencyCatalog`: tracked dependency lookup per project
//! - `ProjectDirectory`: repository bindings and guardrail settings
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// RemediationStore: remediation PR records
// ---------------------------------------------------------------------------

/// Identifier of a tracked dependency within the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyId(pub String);

impl DependencyId {
    pub fn new(id: impl Into<String>) -> Self {
        DependencyId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DependencyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change a remediation PR applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationType {
    Bump,
    Remove,
}

impl RemediationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bump => "bump",
            Self::Remove => "remove",
        }
    }
}

impl std::fmt::Display for RemediationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniqueness key of a remediation record.
///
/// `target_version` is `None` for removals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemediationKey {
    pub project_id: String,
    pub dependency_id: DependencyId,
    pub kind: RemediationType,
    pub target_version: Option<String>,
}

impl std::fmt::Display for RemediationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project_id,
            self.dependency_id,
            self.kind,
            self.target_version.as_deref().unwrap_or("-")
        )
    }
}

/// A persisted remediation PR.
///
/// Records are never mutated: supersession deletes the old record and the
/// new request inserts a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub project_id: String,
    pub dependency_id: DependencyId,
    pub kind: RemediationType,
    pub target_version: Option<String>,
    pub pr_url: String,
    pub pr_number: u64,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
}

impl RemediationRecord {
    pub fn key(&self) -> RemediationKey {
        RemediationKey {
            project_id: self.project_id.clone(),
            dependency_id: self.dependency_id.clone(),
            kind: self.kind,
            target_version: self.target_version.clone(),
        }
    }
}

/// Remediation record persistence.
///
/// Guarantees:
/// - `insert` enforces uniqueness on [`RemediationKey`] and fails with
///   `StorageError::Conflict` when the key is taken. This is the only
///   serialization point between concurrent remediation requests.
/// - `upsert` replaces a record with the same key, or inserts it.
/// - `delete` is a no-op for absent keys.
#[async_trait]
pub trait RemediationStore: Send + Sync {
    /// Find the record for an exact key.
    async fn find(&self, key: &RemediationKey) -> StorageResult<Option<RemediationRecord>>;

    /// List records of one kind for a dependency within a project.
    async fn list_for_dependency(
        &self,
        project_id: &str,
        dependency_id: &DependencyId,
        kind: RemediationType,
    ) -> StorageResult<Vec<RemediationRecord>>;

    /// Insert a new record. Fails with `Conflict` if the key already exists.
    async fn insert(&self, record: RemediationRecord) -> StorageResult<()>;

    /// Insert or replace the record with the same key.
    async fn upsert(&self, record: RemediationRecord) -> StorageResult<()>;

    /// Delete the record for a key.
    async fn delete(&self, key: &RemediationKey) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// DependencyCatalog: tracked dependencies
// ---------------------------------------------------------------------------

/// Lookup of dependencies tracked for a project.
#[async_trait]
pub trait DependencyCatalog: Send + Sync {
    /// Resolve a package name to its tracked dependency id, if tracked.
    async fn resolve_dependency_id(
        &self,
        project_id: &str,
        package_name: &str,
    ) -> StorageResult<Option<DependencyId>>;
}

// ---------------------------------------------------------------------------
// ProjectDirectory: repository bindings and guardrail settings
// ---------------------------------------------------------------------------

/// Source-control location of a project's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryBinding {
    /// `owner/name`
    pub repo_full_name: String,
    pub default_branch: String,
    pub installation_id: u64,
    /// `""` for the repository root, otherwise a workspace folder.
    pub manifest_subpath: String,
}

/// Per-project guardrail switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub block_critical: bool,
    pub block_high: bool,
    pub block_medium: bool,
    pub block_low: bool,
    pub block_policy_violations: bool,
    pub block_transitive_vulns: bool,
}

/// A project linked to a repository, as seen by the PR guardrail pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectBinding {
    pub organization_id: String,
    pub project_id: String,
    pub repository: RepositoryBinding,
    pub guardrails: GuardrailConfig,
}

/// Read-only directory of projects and their repository links.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    /// Repository binding for a project. `None` when the organization has no
    /// installation or the project has no linked repository.
    async fn repository_binding(
        &self,
        organization_id: &str,
        project_id: &str,
    ) -> StorageResult<Option<RepositoryBinding>>;

    /// All projects linked to a repository (one per configured workspace).
    async fn projects_for_repository(
        &self,
        repo_full_name: &str,
    ) -> StorageResult<Vec<ProjectBinding>>;
}
