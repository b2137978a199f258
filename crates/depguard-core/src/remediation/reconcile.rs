//! Stale remediation reconciliation.
//!
//! A new bump target supersedes every open bump PR for the same dependency.
//! Cleanup is best-effort: failures are logged and counted, never returned.

use std::sync::Arc;
use std::time::Duration;

use depguard_state::{DependencyId, RemediationStore, RemediationType};
use serde::Serialize;
use tracing::{debug, warn};

use crate::obs;
use crate::vcs::{with_retry, with_timeout, InstallationToken, PullRequestState, VcsClient};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Open PRs closed.
    pub closed: usize,
    /// Records deleted.
    pub deleted: usize,
    /// Fetch, close or delete calls that failed and were skipped.
    pub failures: usize,
}

pub struct StaleReconciler {
    store: Arc<dyn RemediationStore>,
    vcs: Arc<dyn VcsClient>,
    vcs_timeout: Duration,
    retries: u32,
}

impl StaleReconciler {
    pub fn new(
        store: Arc<dyn RemediationStore>,
        vcs: Arc<dyn VcsClient>,
        vcs_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            store,
            vcs,
            vcs_timeout,
            retries,
        }
    }

    /// Retire bump records of `dependency_id` whose target is not
    /// `target_version`: close the PR if still open, then delete the record
    /// whether or not the close succeeded.
    pub async fn reconcile(
        &self,
        token: &InstallationToken,
        repo: &str,
        project_id: &str,
        dependency_id: &DependencyId,
        target_version: &str,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let records = match self
            .store
            .list_for_dependency(project_id, dependency_id, RemediationType::Bump)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, dependency = %dependency_id, "listing stale remediations failed");
                summary.failures += 1;
                return summary;
            }
        };

        let stale = records
            .into_iter()
            .filter(|record| record.target_version.as_deref() != Some(target_version));

        for record in stale {
            let superseded = record.target_version.as_deref().unwrap_or("-");
            let state = with_retry(self.retries, self.vcs_timeout, || {
                self.vcs.get_pull_request(token, repo, record.pr_number)
            })
            .await;

            match state {
                Ok(PullRequestState::Open) => {
                    let closed = with_timeout(
                        self.vcs_timeout,
                        self.vcs.close_pull_request(token, repo, record.pr_number),
                    )
                    .await;
                    match closed {
                        Ok(()) => {
                            summary.closed += 1;
                            obs::emit_stale_closed(record.pr_number, superseded);
                        }
                        Err(err) => {
                            summary.failures += 1;
                            warn!(pr_number = record.pr_number, error = %err, "closing stale PR failed");
                        }
                    }
                }
                Ok(PullRequestState::Closed) => {
                    debug!(pr_number = record.pr_number, "stale PR already closed");
                }
                Err(err) => {
                    summary.failures += 1;
                    warn!(pr_number = record.pr_number, error = %err, "fetching stale PR failed");
                }
            }

            match self.store.delete(&record.key()).await {
                Ok(()) => summary.deleted += 1,
                Err(err) => {
                    summary.failures += 1;
                    warn!(key = %record.key(), error = %err, "deleting stale remediation record failed");
                }
            }
        }

        summary
    }
}
