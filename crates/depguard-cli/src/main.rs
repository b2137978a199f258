//! Depguard CLI
//!
//! Offline access to the depguard engine over local files.
//!
//! ## Commands
//!
//! - `patch`: bump or remove a dependency in a `package.json`
//! - `diff`: classify the dependency changes between two manifests/lockfiles
//! - `evaluate`: check those changes against a guardrail policy and print the
//!   report; exits with status 1 when the changes are blocked

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, Level};

use depguard_core::{
    diff_workspace, AdvisorySnapshot, ChainedLicenseSource, EffectivePolicy, EngineConfig,
    LicenseSource, Lockfile, LogFormat, Manifest, ManifestChange, ManifestDiffResult,
    NpmRegistryLicenses, PolicyEvaluator, WorkspaceReport, WorkspaceSnapshot,
};
use depguard_state::GuardrailConfig;

#[derive(Parser)]
#[command(name = "depguard")]
#[command(version = depguard_core::VERSION)]
#[command(about = "Dependency remediation and pull request guardrails", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bump or remove a direct dependency in a package.json
    #[command(group(ArgGroup::new("change").required(true).args(["bump", "remove"])))]
    Patch {
        /// Path to package.json
        manifest: PathBuf,

        /// Package to bump (requires --to)
        #[arg(long, requires = "to")]
        bump: Option<String>,

        /// Target version for --bump
        #[arg(long)]
        to: Option<String>,

        /// Package to remove
        #[arg(long)]
        remove: Option<String>,

        /// Rewrite the manifest in place instead of printing it
        #[arg(long)]
        write: bool,
    },

    /// Show dependency changes between two manifests as JSON
    Diff {
        #[command(flatten)]
        inputs: DiffInputs,
    },

    /// Evaluate dependency changes against a guardrail policy
    Evaluate {
        #[command(flatten)]
        inputs: DiffInputs,

        /// TOML file with [guardrails] and [policy] tables
        #[arg(long)]
        policy: PathBuf,

        /// JSON advisory snapshot with vulnerabilities and licenses
        #[arg(long)]
        advisories: Option<PathBuf>,

        /// Fall back to an npm registry for unknown licenses
        #[arg(long, num_args = 0..=1, default_missing_value = depguard_core::sources::NPM_REGISTRY_URL, env = "DEPGUARD_REGISTRY_URL")]
        registry: Option<String>,

        /// Workspace label used in the report
        #[arg(long, default_value = "root")]
        label: String,

        /// Report format
        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,
    },
}

#[derive(Args, Debug, Clone)]
struct DiffInputs {
    /// package.json on the base side (absent means an empty manifest)
    #[arg(long)]
    base_manifest: Option<PathBuf>,

    /// package.json on the head side
    #[arg(long)]
    head_manifest: PathBuf,

    /// package-lock.json on the base side
    #[arg(long)]
    base_lock: Option<PathBuf>,

    /// package-lock.json on the head side
    #[arg(long)]
    head_lock: Option<PathBuf>,

    /// Include newly installed transitive packages
    #[arg(long)]
    transitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

/// `--policy` file contents.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyFile {
    guardrails: GuardrailConfig,
    policy: EffectivePolicy,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    depguard_core::init_tracing(format, level);

    match cli.command {
        Commands::Patch {
            manifest,
            bump,
            to,
            remove,
            write,
        } => {
            let (package, change) = match (bump, to, remove) {
                (Some(package), Some(target_version), None) => {
                    (package, ManifestChange::Bump { target_version })
                }
                (None, _, Some(package)) => (package, ManifestChange::Remove),
                _ => bail!("pass either --bump <name> --to <version> or --remove <name>"),
            };
            let output = cmd_patch(&manifest, &package, &change, write)?;
            print!("{output}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Diff { inputs } => {
            let diff = cmd_diff(&inputs, inputs.transitive)?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Evaluate {
            inputs,
            policy,
            advisories,
            registry,
            label,
            format,
        } => {
            let (report, blocked) = cmd_evaluate(
                &inputs,
                &policy,
                advisories.as_deref(),
                registry.as_deref(),
                &label,
                format,
            )
            .await?;
            print!("{report}");
            Ok(if blocked {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    Manifest::parse(&read_file(path)?).with_context(|| format!("Invalid manifest: {:?}", path))
}

fn read_lockfile(path: Option<&Path>) -> Result<Option<Lockfile>> {
    path.map(|path| {
        Lockfile::parse(&read_file(path)?).with_context(|| format!("Invalid lockfile: {:?}", path))
    })
    .transpose()
}

/// Apply `change` and return the new manifest text, or a one-line summary
/// when writing in place.
fn cmd_patch(path: &Path, package: &str, change: &ManifestChange, write: bool) -> Result<String> {
    let mut manifest = read_manifest(path)?;
    let summary = match change {
        ManifestChange::Bump { target_version } => {
            let range = manifest.bump(package, target_version)?;
            format!("{package} → {range}")
        }
        ManifestChange::Remove => {
            manifest.remove(package)?;
            format!("removed {package}")
        }
    };
    let text = manifest.to_pretty_string()?;

    if !write {
        return Ok(text);
    }
    std::fs::write(path, &text).with_context(|| format!("Failed to write {:?}", path))?;
    info!(path = ?path, %summary, "manifest updated");
    Ok(format!("Updated {}: {summary}\n", path.display()))
}

fn load_snapshot(inputs: &DiffInputs) -> Result<WorkspaceSnapshot> {
    let base_manifest = match &inputs.base_manifest {
        Some(path) => read_manifest(path)?,
        None => Manifest::empty(),
    };
    Ok(WorkspaceSnapshot {
        base_manifest,
        head_manifest: read_manifest(&inputs.head_manifest)?,
        base_lock: read_lockfile(inputs.base_lock.as_deref())?,
        head_lock: read_lockfile(inputs.head_lock.as_deref())?,
    })
}

fn cmd_diff(inputs: &DiffInputs, include_transitive: bool) -> Result<ManifestDiffResult> {
    let snapshot = load_snapshot(inputs)?;
    let diff = diff_workspace(&snapshot, include_transitive);
    debug!(packages = diff.package_count(), "diff computed");
    Ok(diff)
}

async fn cmd_evaluate(
    inputs: &DiffInputs,
    policy_path: &Path,
    advisories_path: Option<&Path>,
    registry: Option<&str>,
    label: &str,
    format: ReportFormat,
) -> Result<(String, bool)> {
    let policy: PolicyFile = toml::from_str(&read_file(policy_path)?)
        .with_context(|| format!("Invalid policy file: {:?}", policy_path))?;
    let advisories: AdvisorySnapshot = match advisories_path {
        Some(path) => serde_json::from_str(&read_file(path)?)
            .with_context(|| format!("Invalid advisory snapshot: {:?}", path))?,
        None => AdvisorySnapshot::default(),
    };

    let config = EngineConfig::from_env();
    let include_transitive = inputs.transitive || policy.guardrails.block_transitive_vulns;
    let diff = cmd_diff(inputs, include_transitive)?;

    let static_licenses: Arc<dyn LicenseSource> = Arc::new(advisories.licenses);
    let licenses: Arc<dyn LicenseSource> = match registry {
        Some(url) => {
            let npm = NpmRegistryLicenses::new(url, config.source_timeout)
                .context("Failed to build registry client")?;
            Arc::new(ChainedLicenseSource::new(static_licenses, Arc::new(npm)))
        }
        None => static_licenses,
    };
    let evaluator = PolicyEvaluator::new(
        Arc::new(advisories.vulnerabilities),
        licenses,
        config.source_timeout,
        config.max_concurrency,
    );

    let evaluation = evaluator
        .evaluate(&diff, &policy.guardrails, &policy.policy)
        .await;
    let blocked = evaluation.blocked;
    let output = match format {
        ReportFormat::Markdown => WorkspaceReport::new(label, &evaluation).report_text,
        ReportFormat::Json => format!("{}\n", serde_json::to_string_pretty(&evaluation)?),
    };
    Ok((output, blocked))
}
