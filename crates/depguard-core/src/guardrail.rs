//! Pull-request guardrail pipeline.
//!
//! A PR event is evaluated per workspace: every configured manifest folder
//! touched by the PR is diffed between base and head, its packages checked
//! against vulnerability counts and license policy, and the results
//! published as PR comments plus one check run on the head commit.
//!
//! Workspaces are evaluated concurrently, at most `max_concurrency` at a
//! time. A failing workspace is logged and left out of the verdict; it never
//! stops its siblings or the check-run publication.

use std::sync::Arc;

use depguard_state::{ProjectBinding, ProjectDirectory};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn, Instrument};

use crate::config::EngineConfig;
use crate::diff::{
    diff_workspace, normalize_subpath, resolve_workspaces, workspace_file, workspace_label,
    WorkspaceSnapshot, LOCKFILE_FILE, MANIFEST_FILE,
};
use crate::error::{GuardrailError, GuardrailResult};
use crate::lockfile::Lockfile;
use crate::manifest::Manifest;
use crate::obs;
use crate::policy::PolicyEvaluator;
use crate::report::{publish_verdict, EvaluationVerdict, WorkspaceReport};
use crate::sources::{LicenseSource, PolicySource, SourceError, VulnerabilitySource};
use crate::vcs::{with_retry, InstallationToken, VcsClient, VcsError};

/// Inbound pull-request event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub repo_full_name: String,
    pub base_sha: String,
    pub head_sha: String,
    pub pr_number: u64,
    pub installation_id: u64,
}

pub struct GuardrailPipeline {
    directory: Arc<dyn ProjectDirectory>,
    vcs: Arc<dyn VcsClient>,
    policies: Arc<dyn PolicySource>,
    evaluator: PolicyEvaluator,
    config: EngineConfig,
}

impl GuardrailPipeline {
    pub fn new(
        directory: Arc<dyn ProjectDirectory>,
        vcs: Arc<dyn VcsClient>,
        vulnerabilities: Arc<dyn VulnerabilitySource>,
        licenses: Arc<dyn LicenseSource>,
        policies: Arc<dyn PolicySource>,
        config: EngineConfig,
    ) -> Self {
        let evaluator = PolicyEvaluator::new(
            vulnerabilities,
            licenses,
            config.source_timeout,
            config.max_concurrency,
        );
        Self {
            directory,
            vcs,
            policies,
            evaluator,
            config,
        }
    }

    /// Evaluate in the background. The task's own error boundary logs any
    /// failure; the handle yields the verdict, or `None` when nothing was
    /// published.
    pub fn spawn(self: &Arc<Self>, event: PullRequestEvent) -> JoinHandle<Option<EvaluationVerdict>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            match pipeline.handle(&event).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    error!(
                        repo = %event.repo_full_name,
                        pr_number = event.pr_number,
                        error = %err,
                        "guardrail evaluation failed"
                    );
                    None
                }
            }
        })
    }

    /// Evaluate and publish. Returns `None` when the PR touches no
    /// configured workspace.
    pub async fn handle(
        self: &Arc<Self>,
        event: &PullRequestEvent,
    ) -> GuardrailResult<Option<EvaluationVerdict>> {
        let span = obs::guardrail_span(&event.repo_full_name, event.pr_number);
        self.run(event).instrument(span).await
    }

    async fn run(self: &Arc<Self>, event: &PullRequestEvent) -> GuardrailResult<Option<EvaluationVerdict>> {
        let retries = self.config.transient_retries;
        let limit = self.config.vcs_timeout;
        let repo = event.repo_full_name.as_str();

        let projects = self.directory.projects_for_repository(repo).await?;
        if projects.is_empty() {
            debug!("repository has no linked projects");
            return Ok(None);
        }

        let token = with_retry(retries, limit, || {
            self.vcs.create_installation_token(event.installation_id)
        })
        .await?;

        let changed = with_retry(retries, limit, || {
            self.vcs
                .get_changed_files(&token, repo, &event.base_sha, &event.head_sha)
        })
        .await?;

        let configured: Vec<String> = projects
            .iter()
            .map(|p| p.repository.manifest_subpath.clone())
            .collect();
        let workspaces = resolve_workspaces(&changed, &configured);
        if workspaces.is_empty() {
            debug!(changed = changed.len(), "no configured workspace touched");
            return Ok(None);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for (idx, subpath) in workspaces.iter().enumerate() {
            let Some(project) = projects
                .iter()
                .find(|p| normalize_subpath(&p.repository.manifest_subpath) == *subpath)
                .cloned()
            else {
                continue;
            };
            let pipeline = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            let event = event.clone();
            let label = workspace_label(subpath);
            join_set.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let report = pipeline.evaluate_workspace(&token, &event, &project, &label).await;
                    (idx, label, report)
                }
                .in_current_span(),
            );
        }

        let mut ordered: Vec<(usize, WorkspaceReport)> = Vec::with_capacity(workspaces.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, _, Ok(report))) => ordered.push((idx, report)),
                Ok((_, label, Err(err))) => obs::emit_workspace_skipped(&label, &err),
                Err(join_err) => {
                    let err = GuardrailError::Task(join_err.to_string());
                    warn!(error = %err, "workspace evaluation task aborted");
                }
            }
        }
        ordered.sort_by_key(|(idx, _)| *idx);

        let verdict = EvaluationVerdict::from_reports(ordered.into_iter().map(|(_, r)| r).collect());
        publish_verdict(
            self.vcs.as_ref(),
            &token,
            repo,
            event.pr_number,
            &event.head_sha,
            &verdict,
            &self.config,
        )
        .await?;
        obs::emit_guardrail_published(
            repo,
            event.pr_number,
            verdict.per_workspace.len(),
            verdict.overall_blocked,
        );

        Ok(Some(verdict))
    }

    async fn evaluate_workspace(
        &self,
        token: &InstallationToken,
        event: &PullRequestEvent,
        project: &ProjectBinding,
        label: &str,
    ) -> GuardrailResult<WorkspaceReport> {
        let subpath = &project.repository.manifest_subpath;
        let manifest_path = workspace_file(subpath, MANIFEST_FILE);
        let lock_path = workspace_file(subpath, LOCKFILE_FILE);

        let head_manifest = self
            .read_optional(token, event, &manifest_path, &event.head_sha)
            .await?
            .ok_or_else(|| GuardrailError::MissingManifest {
                path: manifest_path.clone(),
            })?;
        let base_manifest = self
            .read_optional(token, event, &manifest_path, &event.base_sha)
            .await?;
        let base_lock = self.read_optional(token, event, &lock_path, &event.base_sha).await?;
        let head_lock = self.read_optional(token, event, &lock_path, &event.head_sha).await?;

        let snapshot = WorkspaceSnapshot {
            base_manifest: match base_manifest {
                Some(text) => Manifest::parse(&text)?,
                None => Manifest::empty(),
            },
            head_manifest: Manifest::parse(&head_manifest)?,
            base_lock: base_lock.as_deref().map(Lockfile::parse).transpose()?,
            head_lock: head_lock.as_deref().map(Lockfile::parse).transpose()?,
        };
        let guardrails = project.guardrails;
        let diff = diff_workspace(&snapshot, guardrails.block_transitive_vulns);

        let policy = tokio::time::timeout(
            self.config.source_timeout,
            self.policies
                .effective_policy(&project.organization_id, &project.project_id),
        )
        .await
        .map_err(|_| SourceError::Unavailable("policy lookup timed out".to_string()))??;

        let evaluation = self.evaluator.evaluate(&diff, &guardrails, &policy).await;
        obs::emit_workspace_evaluated(label, evaluation.packages.len(), evaluation.blocked);
        Ok(WorkspaceReport::new(label, &evaluation))
    }

    /// File content at `git_ref`, `None` when the file does not exist there.
    async fn read_optional(
        &self,
        token: &InstallationToken,
        event: &PullRequestEvent,
        path: &str,
        git_ref: &str,
    ) -> GuardrailResult<Option<String>> {
        let file = with_retry(self.config.transient_retries, self.config.vcs_timeout, || {
            self.vcs
                .get_file_with_sha(token, &event.repo_full_name, path, git_ref)
        })
        .await;
        match file {
            Ok(file) => Ok(Some(file.content)),
            Err(VcsError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
