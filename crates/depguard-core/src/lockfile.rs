//! `package-lock.json` version resolution.
//!
//! Two lockfile shapes are in the wild and both must resolve:
//! - the `packages` map keyed by install path (`node_modules/<name>`),
//!   written by npm 7 and later;
//! - the legacy per-name `dependencies` map (lockfile v1), nested for
//!   packages installed below another package.
//!
//! The `packages` map is consulted first; `dependencies` is the fallback.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::manifest::ManifestError;

const NODE_MODULES: &str = "node_modules/";

/// A resolved `name@version` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackagePin {
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for PackagePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Parsed lockfile.
#[derive(Debug, Clone, PartialEq)]
pub struct Lockfile {
    root: Map<String, Value>,
}

impl Lockfile {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ManifestError::InvalidLockfile(e.to_string()))?;
        match value {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(ManifestError::InvalidLockfile(
                "expected a JSON object at the root".to_string(),
            )),
        }
    }

    fn packages(&self) -> Option<&Map<String, Value>> {
        self.root.get("packages").and_then(Value::as_object)
    }

    fn legacy_dependencies(&self) -> Option<&Map<String, Value>> {
        self.root.get("dependencies").and_then(Value::as_object)
    }

    /// Installed version of a top-level package.
    pub fn resolved_version(&self, name: &str) -> Option<&str> {
        let from_packages = self
            .packages()
            .and_then(|packages| packages.get(&format!("{NODE_MODULES}{name}")))
            .and_then(entry_version);
        from_packages.or_else(|| {
            self.legacy_dependencies()
                .and_then(|deps| deps.get(name))
                .and_then(entry_version)
        })
    }

    /// Every installed `name@version`, excluding the root project entry and
    /// entries without a resolved version.
    pub fn package_pins(&self) -> BTreeSet<PackagePin> {
        let mut pins = BTreeSet::new();
        if let Some(packages) = self.packages() {
            for (path, entry) in packages {
                if path.is_empty() {
                    continue;
                }
                let Some(name) = package_name(path, entry) else {
                    continue;
                };
                if let Some(version) = entry_version(entry) {
                    pins.insert(PackagePin {
                        name,
                        version: version.to_string(),
                    });
                }
            }
        } else if let Some(deps) = self.legacy_dependencies() {
            collect_legacy(deps, &mut pins);
        }
        pins
    }
}

fn entry_version(entry: &Value) -> Option<&str> {
    entry
        .get("version")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
}

/// Name of an installed `packages` entry: the explicit `name` field when
/// present, otherwise the path segment after the last `node_modules/`.
/// Workspace-member entries (no `node_modules/` in the path) are not
/// installed packages and yield `None`.
fn package_name(path: &str, entry: &Value) -> Option<String> {
    let idx = path.rfind(NODE_MODULES)?;
    if let Some(name) = entry.get("name").and_then(Value::as_str) {
        return Some(name.to_string());
    }
    Some(path[idx + NODE_MODULES.len()..].to_string()).filter(|name| !name.is_empty())
}

fn collect_legacy(deps: &Map<String, Value>, pins: &mut BTreeSet<PackagePin>) {
    for (name, entry) in deps {
        if let Some(version) = entry_version(entry) {
            pins.insert(PackagePin {
                name: name.clone(),
                version: version.to_string(),
            });
        }
        if let Some(nested) = entry.get("dependencies").and_then(Value::as_object) {
            collect_legacy(nested, pins);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: &str = r#"{
  "name": "web",
  "lockfileVersion": 3,
  "packages": {
    "": { "name": "web", "version": "1.0.0" },
    "node_modules/lodash": { "version": "4.17.21" },
    "node_modules/@babel/core": { "version": "7.23.0" },
    "node_modules/express/node_modules/debug": { "version": "2.6.9" },
    "node_modules/linked": { "link": true, "resolved": "packages/linked" }
  }
}"#;

    const LEGACY: &str = r#"{
  "name": "web",
  "lockfileVersion": 1,
  "dependencies": {
    "lodash": { "version": "4.17.21" },
    "@babel/core": { "version": "7.23.0" },
    "express": {
      "version": "4.18.2",
      "dependencies": { "debug": { "version": "2.6.9" } }
    }
  }
}"#;

    #[test]
    fn resolves_from_packages_map() {
        let lock = Lockfile::parse(MODERN).unwrap();
        assert_eq!(lock.resolved_version("lodash"), Some("4.17.21"));
        assert_eq!(lock.resolved_version("@babel/core"), Some("7.23.0"));
        assert_eq!(lock.resolved_version("debug"), None);
    }

    #[test]
    fn resolves_from_legacy_dependencies_map() {
        let lock = Lockfile::parse(LEGACY).unwrap();
        assert_eq!(lock.resolved_version("lodash"), Some("4.17.21"));
        assert_eq!(lock.resolved_version("@babel/core"), Some("7.23.0"));
        assert_eq!(lock.resolved_version("missing"), None);
    }

    #[test]
    fn both_shapes_resolve_the_same_top_level_versions() {
        let modern = Lockfile::parse(MODERN).unwrap();
        let legacy = Lockfile::parse(LEGACY).unwrap();
        for name in ["lodash", "@babel/core"] {
            assert_eq!(modern.resolved_version(name), legacy.resolved_version(name));
        }
    }

    #[test]
    fn packages_map_wins_over_legacy_map() {
        let text = r#"{
  "packages": { "node_modules/lodash": { "version": "4.17.21" } },
  "dependencies": { "lodash": { "version": "4.17.15" } }
}"#;
        let lock = Lockfile::parse(text).unwrap();
        assert_eq!(lock.resolved_version("lodash"), Some("4.17.21"));
    }

    #[test]
    fn pins_skip_root_and_unversioned_entries() {
        let pins = Lockfile::parse(MODERN).unwrap().package_pins();
        let rendered: Vec<String> = pins.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["@babel/core@7.23.0", "debug@2.6.9", "lodash@4.17.21"]
        );
    }

    #[test]
    fn workspace_member_entries_are_not_pins() {
        let text = r#"{
  "packages": {
    "": { "name": "monorepo", "workspaces": ["packages/*"] },
    "packages/api": { "name": "api", "version": "1.0.0" },
    "node_modules/api": { "resolved": "packages/api", "link": true },
    "node_modules/lodash": { "version": "4.17.21" }
  }
}"#;
        let pins = Lockfile::parse(text).unwrap().package_pins();
        let rendered: Vec<String> = pins.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["lodash@4.17.21"]);
    }

    #[test]
    fn legacy_pins_include_nested_dependencies() {
        let pins = Lockfile::parse(LEGACY).unwrap().package_pins();
        assert!(pins.contains(&PackagePin {
            name: "debug".to_string(),
            version: "2.6.9".to_string(),
        }));
        assert_eq!(pins.len(), 4);
    }

    #[test]
    fn rejects_non_object_lockfile() {
        assert!(matches!(
            Lockfile::parse("\"text\""),
            Err(ManifestError::InvalidLockfile(_))
        ));
    }
}
