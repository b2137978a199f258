//! Remediation PRs: one open pull request per requested dependency change.
//!
//! [`RemediationEngine::remediate`] is idempotent. Repeated requests for the
//! same `(project, dependency, kind, target)` return the PR recorded by the
//! first one, and concurrent requests converge on a single PR through two
//! serialization points: the store's uniqueness constraint and the VCS ref
//! namespace (branch creation fails with `AlreadyExists` for the loser).

mod reconcile;

pub use reconcile::{ReconcileSummary, StaleReconciler};

use std::sync::Arc;

use chrono::Utc;
use depguard_state::{
    DependencyCatalog, ProjectDirectory, RemediationKey, RemediationRecord,
    RemediationStore, RemediationType, RepositoryBinding, StorageError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, Instrument};

use crate::config::EngineConfig;
use crate::diff::{workspace_file, MANIFEST_FILE};
use crate::error::{RemediationError, RemediationResult};
use crate::manifest::{patch_manifest, strip_range_prefix, ManifestChange};
use crate::obs;
use crate::vcs::{
    with_retry, with_timeout, FileContent, InstallationToken, NewPullRequest, PullRequestRef,
    VcsClient, VcsError,
};

/// A request to bump or remove one dependency of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub organization_id: String,
    pub project_id: String,
    pub dependency_name: String,
    pub change: ManifestChange,
    /// Currently installed version, quoted in the PR body when known.
    #[serde(default)]
    pub current_version: Option<String>,
}

impl RemediationRequest {
    pub fn bump(organization_id: &str, project_id: &str, dependency_name: &str, target: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            project_id: project_id.to_string(),
            dependency_name: dependency_name.to_string(),
            change: ManifestChange::Bump {
                target_version: target.to_string(),
            },
            current_version: None,
        }
    }

    pub fn remove(organization_id: &str, project_id: &str, dependency_name: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            project_id: project_id.to_string(),
            dependency_name: dependency_name.to_string(),
            change: ManifestChange::Remove,
            current_version: None,
        }
    }

    pub fn with_current_version(mut self, version: &str) -> Self {
        self.current_version = Some(version.to_string());
        self
    }

    pub fn kind(&self) -> RemediationType {
        match self.change {
            ManifestChange::Bump { .. } => RemediationType::Bump,
            ManifestChange::Remove => RemediationType::Remove,
        }
    }

    /// Bump target without range operators; `None` for removals.
    pub fn target_version(&self) -> Option<&str> {
        match &self.change {
            ManifestChange::Bump { target_version } => Some(strip_range_prefix(target_version)),
            ManifestChange::Remove => None,
        }
    }
}

/// Identity of the PR satisfying a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub pr_url: String,
    pub pr_number: u64,
    pub branch_name: String,
    /// `true` when an existing PR was returned instead of opening one.
    pub reused: bool,
}

impl RemediationOutcome {
    fn from_record(record: &RemediationRecord, reused: bool) -> Self {
        Self {
            pr_url: record.pr_url.clone(),
            pr_number: record.pr_number,
            branch_name: record.branch_name.clone(),
            reused,
        }
    }
}

/// Replace `/` and `@` so scoped names and versions are valid ref segments.
pub fn sanitize_ref_segment(raw: &str) -> String {
    raw.trim()
        .replace(['/', '@'], "-")
        .trim_start_matches('-')
        .to_string()
}

/// Deterministic remediation branch name.
///
/// `depguard/bump-lodash-4.18.0`, `depguard/remove-babel-core`.
pub fn branch_name(prefix: &str, kind: RemediationType, package: &str, target: Option<&str>) -> String {
    let package = sanitize_ref_segment(package);
    match (kind, target) {
        (RemediationType::Bump, Some(target)) => {
            format!("{prefix}/bump-{package}-{}", sanitize_ref_segment(target))
        }
        _ => format!("{prefix}/{kind}-{package}"),
    }
}

fn commit_message(package: &str, target: Option<&str>) -> String {
    match target {
        Some(target) => format!("chore(deps): bump {package} to {target}"),
        None => format!("chore(deps): remove unused dependency {package}"),
    }
}

fn pull_request_text(request: &RemediationRequest, manifest_path: &str) -> (String, String) {
    let package = &request.dependency_name;
    match request.target_version() {
        Some(target) => {
            let title = format!("Bump `{package}` to `{target}`");
            let from = request
                .current_version
                .as_deref()
                .map(|current| format!(" from `{current}`"))
                .unwrap_or_default();
            let body = format!(
                "Bumps `{package}`{from} to `{target}` in `{manifest_path}`.\n\n\
                 The declared range operator is kept. Regenerate the lockfile before merging."
            );
            (title, body)
        }
        None => {
            let title = format!("Remove unused dependency `{package}`");
            let body = format!(
                "Removes `{package}` from `{manifest_path}`.\n\n\
                 This dependency was detected as unused: nothing in the project imports it."
            );
            (title, body)
        }
    }
}

/// Runs remediation requests against the project directory, the record
/// store and the VCS.
pub struct RemediationEngine {
    catalog: Arc<dyn DependencyCatalog>,
    store: Arc<dyn RemediationStore>,
    directory: Arc<dyn ProjectDirectory>,
    vcs: Arc<dyn VcsClient>,
    config: EngineConfig,
}

impl RemediationEngine {
    pub fn new(
        catalog: Arc<dyn DependencyCatalog>,
        store: Arc<dyn RemediationStore>,
        directory: Arc<dyn ProjectDirectory>,
        vcs: Arc<dyn VcsClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            directory,
            vcs,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// API boundary: the outcome as JSON, or `{"error": <message>}`.
    pub async fn handle_request(&self, request: &RemediationRequest) -> Value {
        match self.remediate(request).await {
            Ok(outcome) => json!({
                "pr_url": outcome.pr_url,
                "pr_number": outcome.pr_number,
                "branch_name": outcome.branch_name,
                "reused": outcome.reused,
            }),
            Err(err) => err.to_response(),
        }
    }

    /// Guarantee a single open PR exists for `request` and return it.
    ///
    /// A branch created before a later failure is left in place; re-running
    /// the request takes the branch-already-exists path.
    pub async fn remediate(
        &self,
        request: &RemediationRequest,
    ) -> RemediationResult<RemediationOutcome> {
        let span = obs::remediation_span(
            &request.project_id,
            &request.dependency_name,
            request.kind().as_str(),
        );
        async {
            obs::emit_remediation_started(
                &request.project_id,
                &request.dependency_name,
                request.target_version(),
            );
            let result = self.run(request).await;
            if let Err(err) = &result {
                obs::emit_remediation_failed(err);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &RemediationRequest) -> RemediationResult<RemediationOutcome> {
        let dependency_id = self
            .catalog
            .resolve_dependency_id(&request.project_id, &request.dependency_name)
            .await?
            .ok_or_else(|| RemediationError::PackageUnknown {
                package: request.dependency_name.clone(),
            })?;

        let key = RemediationKey {
            project_id: request.project_id.clone(),
            dependency_id: dependency_id.clone(),
            kind: request.kind(),
            target_version: request.target_version().map(str::to_string),
        };

        // Fast path. Two requests can both miss here; the insert below and
        // the branch-already-exists path converge them on one PR.
        if let Some(record) = self.store.find(&key).await? {
            obs::emit_remediation_reused(record.pr_number, &record.branch_name, "record");
            return Ok(RemediationOutcome::from_record(&record, true));
        }

        let binding = self
            .directory
            .repository_binding(&request.organization_id, &request.project_id)
            .await?
            .ok_or_else(|| RemediationError::NoVcsConnected {
                project_id: request.project_id.clone(),
            })?;

        let retries = self.config.transient_retries;
        let limit = self.config.vcs_timeout;
        let token = with_retry(retries, limit, || {
            self.vcs.create_installation_token(binding.installation_id)
        })
        .await?;
        let repo = binding.repo_full_name.as_str();

        let base_sha = with_retry(retries, limit, || {
            self.vcs.get_branch_sha(&token, repo, &binding.default_branch)
        })
        .await?;

        // Validate the patch against the default branch before any write, so
        // an unpatchable request leaves no branch behind.
        let manifest_path = workspace_file(&binding.manifest_subpath, MANIFEST_FILE);
        let current = self.read_manifest(&token, repo, &manifest_path, &base_sha).await?;
        patch_manifest(&current.content, &request.dependency_name, &request.change)?;

        // Supersede older bumps only once this one is known to be applicable.
        if let Some(target) = request.target_version() {
            let reconciler = StaleReconciler::new(self.store.clone(), self.vcs.clone(), limit, retries);
            let summary = reconciler
                .reconcile(&token, repo, &request.project_id, &dependency_id, target)
                .await;
            debug!(?summary, "stale remediations reconciled");
        }

        let branch = match self
            .create_remediation_branch(request, &key, &token, &binding, &base_sha)
            .await?
        {
            BranchOutcome::Created(branch) => branch,
            BranchOutcome::Existing(outcome) => return Ok(outcome),
        };

        let on_branch = self.read_manifest(&token, repo, &manifest_path, &branch).await?;
        let patched = patch_manifest(&on_branch.content, &request.dependency_name, &request.change)?;
        with_timeout(
            limit,
            self.vcs.create_or_update_file(
                &token,
                repo,
                &branch,
                &manifest_path,
                &patched,
                &commit_message(&request.dependency_name, request.target_version()),
                Some(&on_branch.sha),
            ),
        )
        .await?;

        let (title, body) = pull_request_text(request, &manifest_path);
        let pull_request = NewPullRequest {
            base: binding.default_branch.clone(),
            head: branch.clone(),
            title,
            body,
        };
        let pr = with_timeout(limit, self.vcs.create_pull_request(&token, repo, &pull_request)).await?;

        let record = new_record(&key, &pr, &branch);
        match self.store.insert(record.clone()).await {
            Ok(()) => {
                obs::emit_remediation_opened(pr.number, &pr.html_url, &branch);
                Ok(RemediationOutcome::from_record(&record, false))
            }
            Err(StorageError::Conflict { .. }) => {
                // Lost the insert race: the winner's record is authoritative.
                let winner = self
                    .store
                    .find(&key)
                    .await?
                    .ok_or_else(|| StorageError::Conflict {
                        key: key.to_string(),
                    })?;
                obs::emit_remediation_reused(winner.pr_number, &winner.branch_name, "insert_conflict");
                Ok(RemediationOutcome::from_record(&winner, true))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_manifest(
        &self,
        token: &InstallationToken,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> RemediationResult<FileContent> {
        let file = with_retry(self.config.transient_retries, self.config.vcs_timeout, || {
            self.vcs.get_file_with_sha(token, repo, path, git_ref)
        })
        .await;
        match file {
            Ok(file) => Ok(file),
            Err(VcsError::NotFound { .. }) => Err(RemediationError::ManifestNotFound {
                path: path.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Create the remediation branch, or adopt the PR another actor already
    /// opened from it. An orphaned bump branch gets one retry under a
    /// timestamped name.
    async fn create_remediation_branch(
        &self,
        request: &RemediationRequest,
        key: &RemediationKey,
        token: &InstallationToken,
        binding: &RepositoryBinding,
        base_sha: &str,
    ) -> RemediationResult<BranchOutcome> {
        let repo = binding.repo_full_name.as_str();
        let limit = self.config.vcs_timeout;
        let canonical = branch_name(
            &self.config.branch_prefix,
            request.kind(),
            &request.dependency_name,
            request.target_version(),
        );
        let mut branch = canonical.clone();
        let mut retried = false;

        loop {
            let created = with_timeout(limit, self.vcs.create_branch(token, repo, &branch, base_sha)).await;
            match created {
                Ok(()) => return Ok(BranchOutcome::Created(branch)),
                Err(VcsError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }

            let open = with_retry(self.config.transient_retries, limit, || {
                self.vcs.list_pull_requests_by_head(token, repo, &branch)
            })
            .await?;

            if let Some(pr) = open.into_iter().next() {
                let record = new_record(key, &pr, &branch);
                self.store.upsert(record.clone()).await?;
                obs::emit_remediation_reused(pr.number, &branch, "branch");
                return Ok(BranchOutcome::Existing(RemediationOutcome::from_record(&record, true)));
            }

            if request.kind() == RemediationType::Bump && !retried {
                retried = true;
                branch = format!("{canonical}-{}", Utc::now().timestamp());
                debug!(%branch, "orphaned remediation branch, retrying under a new name");
                continue;
            }

            return Err(RemediationError::BranchCollisionUnresolved { branch });
        }
    }
}

enum BranchOutcome {
    Created(String),
    Existing(RemediationOutcome),
}

fn new_record(key: &RemediationKey, pr: &PullRequestRef, branch: &str) -> RemediationRecord {
    RemediationRecord {
        project_id: key.project_id.clone(),
        dependency_id: key.dependency_id.clone(),
        kind: key.kind,
        target_version: key.target_version.clone(),
        pr_url: pr.html_url.clone(),
        pr_number: pr.number,
        branch_name: branch.to_string(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_ref_safe() {
        assert_eq!(
            branch_name("depguard", RemediationType::Bump, "lodash", Some("4.18.0")),
            "depguard/bump-lodash-4.18.0"
        );
        assert_eq!(
            branch_name("depguard", RemediationType::Bump, "@babel/core", Some("7.24.0")),
            "depguard/bump-babel-core-7.24.0"
        );
        assert_eq!(
            branch_name("depguard", RemediationType::Remove, "@types/node", None),
            "depguard/remove-types-node"
        );
    }

    #[test]
    fn target_version_drops_range_operators() {
        let request = RemediationRequest::bump("org", "proj", "lodash", "^4.18.0");
        assert_eq!(request.target_version(), Some("4.18.0"));
        assert_eq!(request.kind(), RemediationType::Bump);
        assert_eq!(RemediationRequest::remove("org", "proj", "x").target_version(), None);
    }

    #[test]
    fn pull_request_text_per_kind() {
        let bump = RemediationRequest::bump("org", "proj", "lodash", "4.18.0").with_current_version("4.17.20");
        let (title, body) = pull_request_text(&bump, "package.json");
        assert_eq!(title, "Bump `lodash` to `4.18.0`");
        assert!(body.contains("from `4.17.20`"));

        let remove = RemediationRequest::remove("org", "proj", "left-pad");
        let (title, body) = pull_request_text(&remove, "web/package.json");
        assert_eq!(title, "Remove unused dependency `left-pad`");
        assert!(body.contains("detected as unused"));
        assert!(body.contains("web/package.json"));
    }

    #[test]
    fn commit_messages() {
        assert_eq!(commit_message("lodash", Some("4.18.0")), "chore(deps): bump lodash to 4.18.0");
        assert_eq!(
            commit_message("left-pad", None),
            "chore(deps): remove unused dependency left-pad"
        );
    }

    #[test]
    fn requests_deserialize_from_api_payloads() {
        let request: RemediationRequest = serde_json::from_value(json!({
            "organization_id": "org",
            "project_id": "proj",
            "dependency_name": "lodash",
            "change": { "action": "bump", "target_version": "4.18.0" }
        }))
        .unwrap();
        assert_eq!(request, RemediationRequest::bump("org", "proj", "lodash", "4.18.0"));

        let request: RemediationRequest = serde_json::from_value(json!({
            "organization_id": "org",
            "project_id": "proj",
            "dependency_name": "left-pad",
            "change": { "action": "remove" }
        }))
        .unwrap();
        assert_eq!(request.kind(), RemediationType::Remove);
    }
}
