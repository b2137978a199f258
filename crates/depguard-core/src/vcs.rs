//! Source-control client seam.
//!
//! The engine composes a [`VcsClient`]; it never speaks HTTP to the VCS
//! itself. Every call the engine makes goes through [`with_timeout`], and
//! idempotent reads additionally through [`with_retry`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors reported by a [`VcsClient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VcsError {
    /// Ref creation lost the compare-and-swap on the ref namespace.
    #[error("reference already exists: {reference}")]
    AlreadyExists { reference: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Any other non-2xx response.
    #[error("VCS API returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Timeout or connection failure.
    #[error("transient VCS failure: {0}")]
    Transient(String),
}

impl VcsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type for VCS operations.
pub type VcsResult<T> = std::result::Result<T, VcsError>;

/// Short-lived installation access token.
#[derive(Clone, PartialEq, Eq)]
pub struct InstallationToken(String);

impl InstallationToken {
    pub fn new(token: impl Into<String>) -> Self {
        InstallationToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InstallationToken(***)")
    }
}

/// File content plus the blob SHA required to update it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    pub sha: String,
}

/// Identity of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub html_url: String,
    pub number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Closed,
}

/// A new pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
}

impl CheckConclusion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// An existing check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
}

/// Completed check-run payload. Check runs are always written with
/// `status = completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRunReport {
    pub name: String,
    pub conclusion: CheckConclusion,
    pub title: String,
    pub summary: String,
}

/// Source-control primitives consumed by the engine.
///
/// Implementations must report a lost ref-creation race as
/// [`VcsError::AlreadyExists`] and a missing file as [`VcsError::NotFound`].
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn create_installation_token(&self, installation_id: u64)
        -> VcsResult<InstallationToken>;

    async fn get_branch_sha(
        &self,
        token: &InstallationToken,
        repo: &str,
        branch: &str,
    ) -> VcsResult<String>;

    async fn create_branch(
        &self,
        token: &InstallationToken,
        repo: &str,
        name: &str,
        from_sha: &str,
    ) -> VcsResult<()>;

    async fn get_file_with_sha(
        &self,
        token: &InstallationToken,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> VcsResult<FileContent>;

    /// Write a file on `branch`. `sha` is the current blob SHA and acts as an
    /// optimistic-concurrency token; `None` creates the file.
    async fn create_or_update_file(
        &self,
        token: &InstallationToken,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> VcsResult<()>;

    async fn create_pull_request(
        &self,
        token: &InstallationToken,
        repo: &str,
        pull_request: &NewPullRequest,
    ) -> VcsResult<PullRequestRef>;

    /// Open pull requests whose head is `head` (a branch name).
    async fn list_pull_requests_by_head(
        &self,
        token: &InstallationToken,
        repo: &str,
        head: &str,
    ) -> VcsResult<Vec<PullRequestRef>>;

    async fn get_pull_request(
        &self,
        token: &InstallationToken,
        repo: &str,
        number: u64,
    ) -> VcsResult<PullRequestState>;

    async fn close_pull_request(
        &self,
        token: &InstallationToken,
        repo: &str,
        number: u64,
    ) -> VcsResult<()>;

    async fn list_check_runs_for_ref(
        &self,
        token: &InstallationToken,
        repo: &str,
        git_ref: &str,
    ) -> VcsResult<Vec<CheckRun>>;

    async fn create_check_run(
        &self,
        token: &InstallationToken,
        repo: &str,
        head_sha: &str,
        report: &CheckRunReport,
    ) -> VcsResult<CheckRun>;

    async fn update_check_run(
        &self,
        token: &InstallationToken,
        repo: &str,
        check_run_id: u64,
        report: &CheckRunReport,
    ) -> VcsResult<()>;

    async fn create_issue_comment(
        &self,
        token: &InstallationToken,
        repo: &str,
        number: u64,
        body: &str,
    ) -> VcsResult<()>;

    async fn get_changed_files(
        &self,
        token: &InstallationToken,
        repo: &str,
        base_sha: &str,
        head_sha: &str,
    ) -> VcsResult<Vec<String>>;
}

/// Bound a VCS call. An elapsed timeout becomes [`VcsError::Transient`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> VcsResult<T>
where
    F: Future<Output = VcsResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(VcsError::Transient(format!(
            "call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Re-run a whole step while it fails transiently, up to `retries` extra
/// attempts. Each attempt is bounded by `limit`.
///
/// Only use for steps that are safe to repeat (reads, or writes whose
/// duplicate is detected downstream).
pub async fn with_retry<T, F, Fut>(retries: u32, limit: Duration, mut step: F) -> VcsResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VcsResult<T>>,
{
    let mut attempt = 0;
    loop {
        match with_timeout(limit, step()).await {
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(attempt, error = %err, "retrying transient VCS failure");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_transient() {
        let result: VcsResult<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(VcsError::Transient(msg)) if msg.contains("50ms")));
    }

    #[tokio::test]
    async fn retry_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let result: VcsResult<()> = with_retry(2, Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VcsError::Transient("reset".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_api_errors() {
        let calls = AtomicU32::new(0);
        let result: VcsResult<()> = with_retry(3, Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(VcsError::Api {
                    status: 403,
                    body: "forbidden".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(VcsError::Api { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(VcsError::Transient("reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = InstallationToken::new("ghs_secret");
        assert_eq!(format!("{token:?}"), "InstallationToken(***)");
    }
}
