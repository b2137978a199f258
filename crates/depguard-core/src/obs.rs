//! Structured lifecycle events for remediation and guardrail flows.
//!
//! Every event carries an `event` field so log pipelines can filter on it,
//! e.g. `event=remediation.opened`.

use tracing::{info, warn};

/// Span tagging all logs of one remediation request.
/// `RemediationEngine::remediate` attaches it itself.
pub fn remediation_span(project_id: &str, dependency: &str, kind: &str) -> tracing::Span {
    tracing::info_span!(
        "depguard.remediation",
        project_id = %project_id,
        dependency = %dependency,
        kind = %kind,
    )
}

/// Span tagging all logs of one pull-request evaluation.
pub fn guardrail_span(repo: &str, pr_number: u64) -> tracing::Span {
    tracing::info_span!("depguard.guardrail", repo = %repo, pr_number)
}

pub fn emit_remediation_started(project_id: &str, dependency: &str, target: Option<&str>) {
    info!(
        event = "remediation.started",
        project_id = %project_id,
        dependency = %dependency,
        target = target.unwrap_or("-"),
    );
}

/// An existing PR satisfied the request (stored record or branch race).
pub fn emit_remediation_reused(pr_number: u64, branch: &str, via: &str) {
    info!(event = "remediation.reused", pr_number, branch = %branch, via = %via);
}

pub fn emit_remediation_opened(pr_number: u64, pr_url: &str, branch: &str) {
    info!(event = "remediation.opened", pr_number, pr_url = %pr_url, branch = %branch);
}

pub fn emit_remediation_failed(error: &dyn std::fmt::Display) {
    warn!(event = "remediation.failed", error = %error);
}

pub fn emit_stale_closed(pr_number: u64, superseded_target: &str) {
    info!(event = "reconcile.closed", pr_number, superseded_target = %superseded_target);
}

pub fn emit_workspace_evaluated(workspace: &str, packages: usize, blocked: bool) {
    info!(
        event = "guardrail.workspace_evaluated",
        workspace = %workspace,
        packages,
        blocked,
    );
}

pub fn emit_workspace_skipped(workspace: &str, error: &dyn std::fmt::Display) {
    warn!(event = "guardrail.workspace_skipped", workspace = %workspace, error = %error);
}

pub fn emit_guardrail_published(repo: &str, pr_number: u64, workspaces: usize, blocked: bool) {
    info!(
        event = "guardrail.published",
        repo = %repo,
        pr_number,
        workspaces,
        blocked,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_enter_without_subscriber() {
        let _remediation = remediation_span("proj-1", "lodash", "bump").entered();
        let _guardrail = guardrail_span("acme/web", 7).entered();
        emit_remediation_started("proj-1", "lodash", Some("4.18.0"));
    }
}
