//! Markdown reports, PR comments and the guardrail check run.

use std::fmt::Write as _;

use serde::Serialize;
use tracing::warn;

use crate::config::EngineConfig;
use crate::policy::{PackageEvaluation, PackageOrigin, WorkspaceEvaluation};
use crate::vcs::{
    with_retry, with_timeout, CheckConclusion, CheckRunReport, InstallationToken, VcsClient,
    VcsResult,
};

/// Rendered report of one evaluated workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceReport {
    pub workspace_label: String,
    pub report_text: String,
    pub blocked: bool,
    /// False when the workspace files changed but no dependency did.
    pub has_changes: bool,
}

impl WorkspaceReport {
    pub fn new(workspace_label: &str, evaluation: &WorkspaceEvaluation) -> Self {
        Self {
            workspace_label: workspace_label.to_string(),
            report_text: render_workspace_report(workspace_label, evaluation),
            blocked: evaluation.blocked,
            has_changes: !evaluation.packages.is_empty(),
        }
    }
}

/// Combined result of every evaluated workspace of a pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationVerdict {
    pub per_workspace: Vec<WorkspaceReport>,
    pub overall_blocked: bool,
}

impl EvaluationVerdict {
    pub fn from_reports(per_workspace: Vec<WorkspaceReport>) -> Self {
        let overall_blocked = per_workspace.iter().any(|r| r.blocked);
        Self {
            per_workspace,
            overall_blocked,
        }
    }

    pub fn conclusion(&self) -> CheckConclusion {
        if self.overall_blocked {
            CheckConclusion::Failure
        } else {
            CheckConclusion::Success
        }
    }

    /// Completed check-run payload for this verdict.
    pub fn check_run_report(&self, name: &str) -> CheckRunReport {
        let title = if self.overall_blocked {
            "Blocked by dependency guardrails"
        } else {
            "Dependency guardrails passed"
        };

        let summary = if self.per_workspace.is_empty() {
            "No workspace could be evaluated. See the service logs for details.".to_string()
        } else {
            self.per_workspace
                .iter()
                .map(|r| {
                    let state = if r.blocked { "blocked" } else { "passed" };
                    format!("- `{}`: {state}", r.workspace_label)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        CheckRunReport {
            name: name.to_string(),
            conclusion: self.conclusion(),
            title: title.to_string(),
            summary,
        }
    }
}

fn flag(package: &PackageEvaluation) -> &'static str {
    match (package.policy_violation, package.blocked) {
        (true, _) => " **(license not allowed)**",
        (false, true) => " **(blocking)**",
        _ => "",
    }
}

/// Markdown report for one workspace. Empty sections are left out.
pub fn render_workspace_report(label: &str, evaluation: &WorkspaceEvaluation) -> String {
    let mut out = format!("### Dependency report for `{label}`\n");

    if evaluation.packages.is_empty() {
        out.push_str("\nNo dependency changes detected.\n");
    }

    let mut updated = evaluation.of_origin(PackageOrigin::DirectBumped).peekable();
    if updated.peek().is_some() {
        out.push_str("\n#### Updated packages\n\n");
        for p in updated {
            let _ = writeln!(
                out,
                "- `{}` {} → {}: {}{}",
                p.name,
                p.old_version.as_deref().unwrap_or("?"),
                p.version,
                p.vulns.summary(),
                flag(p)
            );
        }
    }

    for (origin, heading) in [
        (PackageOrigin::DirectAdded, "Added direct dependencies"),
        (PackageOrigin::TransitiveAdded, "Added transitive dependencies"),
    ] {
        let mut added = evaluation.of_origin(origin).peekable();
        if added.peek().is_none() {
            continue;
        }
        let _ = write!(out, "\n#### {heading}\n\n");
        for p in added {
            let _ = writeln!(
                out,
                "- `{}` {}, license {}, {}{}",
                p.name,
                p.version,
                p.license.as_deref().unwrap_or("unknown"),
                p.vulns.summary(),
                flag(p)
            );
        }
    }

    if evaluation.blocked {
        out.push_str(
            "\n> **Blocked.** This workspace violates the project's dependency guardrails. \
             Resolve the flagged packages or adjust the project policy.\n",
        );
    }

    out
}

/// Post one comment per workspace with dependency changes, then create or
/// update the check run on `head_sha`.
///
/// Comment failures are logged and skipped; only the check-run write can
/// fail the publication.
pub async fn publish_verdict(
    vcs: &dyn VcsClient,
    token: &InstallationToken,
    repo: &str,
    pr_number: u64,
    head_sha: &str,
    verdict: &EvaluationVerdict,
    config: &EngineConfig,
) -> VcsResult<()> {
    for report in verdict.per_workspace.iter().filter(|r| r.has_changes) {
        let posted = with_timeout(
            config.vcs_timeout,
            vcs.create_issue_comment(token, repo, pr_number, &report.report_text),
        )
        .await;
        if let Err(err) = posted {
            warn!(workspace = %report.workspace_label, error = %err, "posting guardrail comment failed");
        }
    }

    let check = verdict.check_run_report(&config.check_run_name);
    let existing = with_retry(config.transient_retries, config.vcs_timeout, || {
        vcs.list_check_runs_for_ref(token, repo, head_sha)
    })
    .await?
    .into_iter()
    .find(|run| run.name == check.name);

    match existing {
        Some(run) => {
            with_retry(config.transient_retries, config.vcs_timeout, || {
                vcs.update_check_run(token, repo, run.id, &check)
            })
            .await
        }
        None => with_timeout(config.vcs_timeout, vcs.create_check_run(token, repo, head_sha, &check))
            .await
            .map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::VulnCounts;

    fn package(name: &str, origin: PackageOrigin) -> PackageEvaluation {
        PackageEvaluation {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            old_version: None,
            origin,
            vulns: VulnCounts::default(),
            license: Some("MIT".to_string()),
            policy_violation: false,
            blocked: false,
        }
    }

    #[test]
    fn renders_sections_and_blocking_notice() {
        let mut bumped = package("lodash", PackageOrigin::DirectBumped);
        bumped.old_version = Some("0.9.0".to_string());
        bumped.license = None;
        bumped.vulns.high = 1;
        bumped.blocked = true;

        let mut left_pad = package("left-pad", PackageOrigin::DirectAdded);
        left_pad.license = Some("WTFPL".to_string());
        left_pad.policy_violation = true;
        left_pad.blocked = true;

        let evaluation = WorkspaceEvaluation {
            packages: vec![bumped, left_pad],
            blocked: true,
        };
        let text = render_workspace_report("root", &evaluation);

        assert!(text.starts_with("### Dependency report for `root`"));
        assert!(text.contains("#### Updated packages"));
        assert!(text.contains("- `lodash` 0.9.0 → 1.0.0: 1 high **(blocking)**"));
        assert!(text.contains("#### Added direct dependencies"));
        assert!(text.contains("- `left-pad` 1.0.0, license WTFPL, no known vulnerabilities **(license not allowed)**"));
        assert!(!text.contains("transitive"));
        assert!(text.contains("**Blocked.**"));
    }

    #[test]
    fn empty_evaluation_renders_placeholder() {
        let text = render_workspace_report("packages/api", &WorkspaceEvaluation::default());
        assert!(text.contains("No dependency changes detected."));
        assert!(!text.contains("Blocked"));
    }

    #[test]
    fn verdict_blocks_when_any_workspace_blocks() {
        let passed = WorkspaceReport {
            workspace_label: "root".to_string(),
            report_text: String::new(),
            blocked: false,
            has_changes: true,
        };
        let blocked = WorkspaceReport {
            workspace_label: "packages/api".to_string(),
            blocked: true,
            ..passed.clone()
        };

        let verdict = EvaluationVerdict::from_reports(vec![passed.clone(), blocked]);
        assert!(verdict.overall_blocked);
        let check = verdict.check_run_report("guardrails");
        assert_eq!(check.conclusion, CheckConclusion::Failure);
        assert_eq!(check.title, "Blocked by dependency guardrails");
        assert!(check.summary.contains("- `packages/api`: blocked"));

        let verdict = EvaluationVerdict::from_reports(vec![passed]);
        assert_eq!(verdict.conclusion(), CheckConclusion::Success);
    }

    #[test]
    fn empty_verdict_still_has_a_summary() {
        let check = EvaluationVerdict::from_reports(Vec::new()).check_run_report("guardrails");
        assert_eq!(check.conclusion, CheckConclusion::Success);
        assert!(check.summary.contains("No workspace could be evaluated"));
    }
}
