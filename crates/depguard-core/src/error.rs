//! Error taxonomy for the remediation flow and the guardrail pipeline.

use depguard_state::StorageError;
use serde_json::{json, Value};
use thiserror::Error;

use crate::manifest::ManifestError;
use crate::sources::SourceError;
use crate::vcs::VcsError;

/// Errors returned by the remediation flow.
///
/// These are returned to the caller as structured values, never thrown past
/// the API boundary: see [`RemediationError::to_response`].
#[derive(Debug, Error)]
pub enum RemediationError {
    /// The dependency is not tracked for the project.
    #[error("package {package} is not tracked for this project")]
    PackageUnknown { package: String },

    /// A bump was requested for a package that is not declared directly.
    #[error("{package} is not a direct dependency; transitive dependencies cannot be bumped")]
    NotDirectDependency { package: String },

    /// A removal was requested for a package the manifest does not declare.
    #[error("{package} is not declared in the manifest")]
    NotFound { package: String },

    /// The manifest file does not exist at the expected path.
    #[error("manifest not found at {path}")]
    ManifestNotFound { path: String },

    /// The manifest could not be parsed or serialized.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The project has no installation or no linked repository.
    #[error("no source-control repository is connected for project {project_id}")]
    NoVcsConnected { project_id: String },

    /// A branch with the remediation name exists but has no open PR, and the
    /// retry budget is exhausted. Requires manual branch deletion.
    #[error("branch {branch} already exists without an open pull request; delete the branch and retry")]
    BranchCollisionUnresolved { branch: String },

    /// Non-2xx response from the VCS.
    #[error("VCS API returned {status}: {body}")]
    VcsApi { status: u16, body: String },

    /// Timeout or connection failure.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RemediationError {
    /// Whether re-running the same request may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// User-facing error payload: `{"error": <message>}`.
    pub fn to_response(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

impl From<VcsError> for RemediationError {
    fn from(err: VcsError) -> Self {
        match err {
            VcsError::AlreadyExists { reference } => RemediationError::VcsApi {
                status: 422,
                body: format!("reference already exists: {reference}"),
            },
            VcsError::NotFound { resource } => RemediationError::VcsApi {
                status: 404,
                body: format!("not found: {resource}"),
            },
            VcsError::Api { status, body } => RemediationError::VcsApi { status, body },
            VcsError::Transient(detail) => RemediationError::TransientNetwork(detail),
        }
    }
}

impl From<ManifestError> for RemediationError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::NotDirectDependency { package } => {
                RemediationError::NotDirectDependency { package }
            }
            ManifestError::NotFound { package } => RemediationError::NotFound { package },
            ManifestError::Invalid(detail) | ManifestError::InvalidLockfile(detail) => {
                RemediationError::InvalidManifest(detail)
            }
        }
    }
}

/// Result type for remediation operations.
pub type RemediationResult<T> = std::result::Result<T, RemediationError>;

/// Errors raised while evaluating PR guardrails.
///
/// Workspace-scoped: a failing workspace is logged and skipped, it never
/// aborts its siblings or the check-run publication.
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("head manifest missing at {path}")]
    MissingManifest { path: String },

    #[error("data source error: {0}")]
    Source(#[from] SourceError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("workspace task failed: {0}")]
    Task(String),
}

/// Result type for guardrail operations.
pub type GuardrailResult<T> = std::result::Result<T, GuardrailError>;
