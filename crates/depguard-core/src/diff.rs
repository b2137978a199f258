//! Dependency diff between the base and head of a pull request.
//!
//! One [`WorkspaceSnapshot`] (manifest + optional lockfile on each side) is
//! classified into direct additions, direct version bumps and, when
//! requested, newly installed transitive packages.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::lockfile::Lockfile;
use crate::manifest::{strip_range_prefix, Manifest};

pub const MANIFEST_FILE: &str = "package.json";
pub const LOCKFILE_FILE: &str = "package-lock.json";

/// Manifest and lockfile of one workspace at base and head.
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    pub base_manifest: Manifest,
    pub head_manifest: Manifest,
    pub base_lock: Option<Lockfile>,
    pub head_lock: Option<Lockfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedPackage {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BumpedPackage {
    pub name: String,
    pub old_version: String,
    pub new_version: String,
}

/// Classified dependency changes of one workspace, each list sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDiffResult {
    pub direct_added: Vec<AddedPackage>,
    pub direct_bumped: Vec<BumpedPackage>,
    pub transitive_added: Vec<AddedPackage>,
}

impl ManifestDiffResult {
    pub fn is_empty(&self) -> bool {
        self.direct_added.is_empty()
            && self.direct_bumped.is_empty()
            && self.transitive_added.is_empty()
    }

    pub fn package_count(&self) -> usize {
        self.direct_added.len() + self.direct_bumped.len() + self.transitive_added.len()
    }
}

/// Installed version of a direct dependency: the lockfile when it knows the
/// package, otherwise the declared range without its operator.
fn installed_version(lock: Option<&Lockfile>, name: &str, declared: &str) -> String {
    lock.and_then(|l| l.resolved_version(name))
        .map(str::to_string)
        .unwrap_or_else(|| strip_range_prefix(declared).to_string())
}

/// Classify the dependency changes of one workspace.
///
/// `include_transitive` mirrors the project's `block_transitive_vulns`
/// switch; transitive additions are only computed when both lockfiles exist.
pub fn diff_workspace(snapshot: &WorkspaceSnapshot, include_transitive: bool) -> ManifestDiffResult {
    let base_direct = snapshot.base_manifest.direct_dependencies();
    let head_direct = snapshot.head_manifest.direct_dependencies();
    let base_lock = snapshot.base_lock.as_ref();
    let head_lock = snapshot.head_lock.as_ref();

    let mut result = ManifestDiffResult::default();

    for (name, head_range) in &head_direct {
        let new_version = installed_version(head_lock, name, head_range);
        match base_direct.get(name) {
            None => result.direct_added.push(AddedPackage {
                name: name.clone(),
                version: new_version,
            }),
            Some(base_range) => {
                let old_version = installed_version(base_lock, name, base_range);
                if old_version != new_version {
                    result.direct_bumped.push(BumpedPackage {
                        name: name.clone(),
                        old_version,
                        new_version,
                    });
                }
            }
        }
    }

    if include_transitive {
        if let (Some(base_lock), Some(head_lock)) = (base_lock, head_lock) {
            let base_pins = base_lock.package_pins();
            result.transitive_added = head_lock
                .package_pins()
                .difference(&base_pins)
                .filter(|pin| !head_direct.contains_key(&pin.name))
                .filter(|pin| !base_direct.contains_key(&pin.name))
                .map(|pin| AddedPackage {
                    name: pin.name.clone(),
                    version: pin.version.clone(),
                })
                .collect();
        }
    }

    result
}

/// Normalise a repository subpath: no leading `./`, no surrounding `/`.
pub fn normalize_subpath(path: &str) -> String {
    path.trim()
        .trim_start_matches("./")
        .trim_matches('/')
        .to_string()
}

/// Workspaces touched by a pull request.
///
/// A changed file counts when it is a manifest or lockfile; its directory
/// (`""` for the repository root) must equal a configured workspace subpath.
/// Matches are returned once each, in configured order.
pub fn resolve_workspaces(changed_files: &[String], configured: &[String]) -> Vec<String> {
    let touched: BTreeSet<String> = changed_files
        .iter()
        .filter_map(|path| {
            let path = normalize_subpath(path);
            let (dir, file) = match path.rsplit_once('/') {
                Some((dir, file)) => (dir.to_string(), file),
                None => (String::new(), path.as_str()),
            };
            (file == MANIFEST_FILE || file == LOCKFILE_FILE).then_some(dir)
        })
        .collect();

    let mut seen = BTreeSet::new();
    configured
        .iter()
        .map(|subpath| normalize_subpath(subpath))
        .filter(|subpath| touched.contains(subpath))
        .filter(|subpath| seen.insert(subpath.clone()))
        .collect()
}

/// Path of a workspace file, `file` at the root when `subpath` is empty.
pub fn workspace_file(subpath: &str, file: &str) -> String {
    let subpath = normalize_subpath(subpath);
    if subpath.is_empty() {
        file.to_string()
    } else {
        format!("{subpath}/{file}")
    }
}

/// Human label for a workspace.
pub fn workspace_label(subpath: &str) -> String {
    let subpath = normalize_subpath(subpath);
    if subpath.is_empty() {
        "root".to_string()
    } else {
        subpath
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(base: &str, head: &str, base_lock: Option<&str>, head_lock: Option<&str>) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            base_manifest: Manifest::parse(base).unwrap(),
            head_manifest: Manifest::parse(head).unwrap(),
            base_lock: base_lock.map(|l| Lockfile::parse(l).unwrap()),
            head_lock: head_lock.map(|l| Lockfile::parse(l).unwrap()),
        }
    }

    const BASE: &str = r#"{"dependencies": {"lodash": "^4.17.0", "express": "^4.18.0"}}"#;
    const HEAD: &str = r#"{"dependencies": {"lodash": "^4.17.0", "express": "^4.18.0", "left-pad": "1.3.0"}, "devDependencies": {"jest": "^29.0.0"}}"#;
    const BASE_LOCK: &str = r#"{"packages": {
        "": {"name": "web"},
        "node_modules/lodash": {"version": "4.17.20"},
        "node_modules/express": {"version": "4.18.2"},
        "node_modules/debug": {"version": "2.6.9"}
    }}"#;
    const HEAD_LOCK: &str = r#"{"packages": {
        "": {"name": "web"},
        "node_modules/lodash": {"version": "4.17.21"},
        "node_modules/express": {"version": "4.18.2"},
        "node_modules/debug": {"version": "2.6.9"},
        "node_modules/left-pad": {"version": "1.3.0"},
        "node_modules/jest": {"version": "29.7.0"},
        "node_modules/jest-cli": {"version": "29.7.0"},
        "node_modules/express/node_modules/debug": {"version": "4.3.4"}
    }}"#;

    #[test]
    fn classifies_added_and_bumped_direct_dependencies() {
        let diff = diff_workspace(&snapshot(BASE, HEAD, Some(BASE_LOCK), Some(HEAD_LOCK)), false);

        let added: Vec<(&str, &str)> = diff
            .direct_added
            .iter()
            .map(|p| (p.name.as_str(), p.version.as_str()))
            .collect();
        assert_eq!(added, vec![("jest", "29.7.0"), ("left-pad", "1.3.0")]);

        assert_eq!(
            diff.direct_bumped,
            vec![BumpedPackage {
                name: "lodash".to_string(),
                old_version: "4.17.20".to_string(),
                new_version: "4.17.21".to_string(),
            }]
        );
        assert!(diff.transitive_added.is_empty(), "transitive disabled");
    }

    #[test]
    fn transitive_additions_exclude_direct_names() {
        let diff = diff_workspace(&snapshot(BASE, HEAD, Some(BASE_LOCK), Some(HEAD_LOCK)), true);
        let transitive: Vec<String> = diff
            .transitive_added
            .iter()
            .map(|p| format!("{}@{}", p.name, p.version))
            .collect();
        assert_eq!(transitive, vec!["debug@4.3.4", "jest-cli@29.7.0"]);
    }

    #[test]
    fn transitive_needs_both_lockfiles() {
        let diff = diff_workspace(&snapshot(BASE, HEAD, None, Some(HEAD_LOCK)), true);
        assert!(diff.transitive_added.is_empty());
        // Without a base lockfile the base side falls back to the declared range.
        let bumped: Vec<(&str, &str, &str)> = diff
            .direct_bumped
            .iter()
            .map(|p| (p.name.as_str(), p.old_version.as_str(), p.new_version.as_str()))
            .collect();
        assert_eq!(
            bumped,
            vec![("express", "4.18.0", "4.18.2"), ("lodash", "4.17.0", "4.17.21")]
        );
    }

    #[test]
    fn added_version_falls_back_to_declared_range() {
        let diff = diff_workspace(&snapshot(BASE, HEAD, None, None), false);
        let left_pad = diff.direct_added.iter().find(|p| p.name == "left-pad").unwrap();
        assert_eq!(left_pad.version, "1.3.0");
        assert!(diff.direct_bumped.is_empty());
    }

    #[test]
    fn legacy_lockfiles_diff_like_modern_ones() {
        let base_lock = r#"{"dependencies": {"lodash": {"version": "4.17.20"}}}"#;
        let head_lock = r#"{"dependencies": {"lodash": {"version": "4.17.21"}, "left-pad": {"version": "1.3.0"}}}"#;
        let diff = diff_workspace(&snapshot(BASE, HEAD, Some(base_lock), Some(head_lock)), true);
        assert_eq!(diff.direct_bumped[0].new_version, "4.17.21");
        assert!(diff.transitive_added.is_empty());
    }

    #[test]
    fn unchanged_workspace_is_empty() {
        let diff = diff_workspace(&snapshot(BASE, BASE, Some(BASE_LOCK), Some(BASE_LOCK)), true);
        assert!(diff.is_empty());
        assert_eq!(diff.package_count(), 0);
    }

    #[test]
    fn resolves_touched_workspaces_in_configured_order() {
        let changed = vec![
            "packages/api/package-lock.json".to_string(),
            "packages/api/src/index.ts".to_string(),
            "package.json".to_string(),
            "packages/api/package.json".to_string(),
            "packages/web/README.md".to_string(),
            "docs/package.json".to_string(),
        ];
        let configured = vec![
            "".to_string(),
            "packages/web".to_string(),
            "./packages/api/".to_string(),
        ];
        assert_eq!(
            resolve_workspaces(&changed, &configured),
            vec!["".to_string(), "packages/api".to_string()]
        );
    }

    #[test]
    fn no_manifest_changes_resolve_nothing() {
        let changed = vec!["src/main.ts".to_string(), "package.json.bak".to_string()];
        assert!(resolve_workspaces(&changed, &["".to_string()]).is_empty());
    }

    #[test]
    fn workspace_paths_and_labels() {
        assert_eq!(workspace_file("", MANIFEST_FILE), "package.json");
        assert_eq!(workspace_file("packages/api/", LOCKFILE_FILE), "packages/api/package-lock.json");
        assert_eq!(workspace_label(""), "root");
        assert_eq!(workspace_label("./packages/api"), "packages/api");
    }
}
