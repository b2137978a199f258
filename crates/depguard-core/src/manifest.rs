//! `package.json` patching.
//!
//! [`Manifest`] wraps an insertion-ordered JSON object so a patched manifest
//! re-serializes with the same key order and 2-space indentation the human
//! reviewer of the generated diff expects. Only the edited dependency entry
//! changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Sections searched for direct dependencies, in lookup order.
pub const DIRECT_SECTIONS: [&str; 2] = ["dependencies", "devDependencies"];

/// Errors produced by manifest and lockfile handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("{package} is not a direct dependency")]
    NotDirectDependency { package: String },

    #[error("{package} is not declared in the manifest")]
    NotFound { package: String },

    #[error("invalid manifest: {0}")]
    Invalid(String),

    #[error("invalid lockfile: {0}")]
    InvalidLockfile(String),
}

/// A requested manifest edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManifestChange {
    Bump { target_version: String },
    Remove,
}

/// Parsed `package.json` with key order preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    root: Map<String, Value>,
}

impl Manifest {
    /// Parse a manifest document. The root must be a JSON object.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ManifestError::Invalid(e.to_string()))?;
        match value {
            Value::Object(root) => Ok(Self { root }),
            other => Err(ManifestError::Invalid(format!(
                "expected a JSON object at the root, found {}",
                json_kind(&other)
            ))),
        }
    }

    /// An empty manifest, used when a workspace does not exist on the base side.
    pub fn empty() -> Self {
        Self { root: Map::new() }
    }

    fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.root.get(name).and_then(Value::as_object)
    }

    /// The section and declared range of a direct dependency, searching
    /// `dependencies` before `devDependencies`.
    pub fn declared(&self, package: &str) -> Option<(&'static str, &str)> {
        DIRECT_SECTIONS.iter().find_map(|section| {
            self.section(section)
                .and_then(|deps| deps.get(package))
                .map(|range| (*section, range.as_str().unwrap_or_default()))
        })
    }

    /// Union of `dependencies` and `devDependencies`, name → declared range.
    /// A dev entry never shadows a regular entry of the same name.
    pub fn direct_dependencies(&self) -> BTreeMap<String, String> {
        let mut direct = BTreeMap::new();
        for section in DIRECT_SECTIONS {
            let Some(deps) = self.section(section) else {
                continue;
            };
            for (name, range) in deps {
                direct
                    .entry(name.clone())
                    .or_insert_with(|| range.as_str().unwrap_or_default().to_string());
            }
        }
        direct
    }

    /// Bump a direct dependency to `target_version`, keeping the declared
    /// range prefix. Returns the new declared range.
    pub fn bump(&mut self, package: &str, target_version: &str) -> Result<String, ManifestError> {
        let (section, current) =
            self.declared(package)
                .ok_or_else(|| ManifestError::NotDirectDependency {
                    package: package.to_string(),
                })?;
        let updated = format!(
            "{}{}",
            range_prefix(current),
            strip_range_prefix(target_version)
        );

        if let Some(deps) = self.root.get_mut(section).and_then(Value::as_object_mut) {
            // In-place insert keeps the entry's position.
            deps.insert(package.to_string(), Value::String(updated.clone()));
        }
        Ok(updated)
    }

    /// Remove a dependency from every direct section that declares it.
    pub fn remove(&mut self, package: &str) -> Result<(), ManifestError> {
        let mut removed = false;
        for section in DIRECT_SECTIONS {
            if let Some(deps) = self.root.get_mut(section).and_then(Value::as_object_mut) {
                removed |= deps.shift_remove(package).is_some();
            }
        }
        if removed {
            Ok(())
        } else {
            Err(ManifestError::NotFound {
                package: package.to_string(),
            })
        }
    }

    /// Apply a [`ManifestChange`].
    pub fn apply(&mut self, package: &str, change: &ManifestChange) -> Result<(), ManifestError> {
        match change {
            ManifestChange::Bump { target_version } => self.bump(package, target_version).map(|_| ()),
            ManifestChange::Remove => self.remove(package),
        }
    }

    /// Serialize with 2-space indentation and a trailing newline.
    pub fn to_pretty_string(&self) -> Result<String, ManifestError> {
        let mut text = serde_json::to_string_pretty(&self.root)
            .map_err(|e| ManifestError::Invalid(e.to_string()))?;
        text.push('\n');
        Ok(text)
    }
}

/// Parse, patch and re-serialize a manifest document in one step.
pub fn patch_manifest(
    text: &str,
    package: &str,
    change: &ManifestChange,
) -> Result<String, ManifestError> {
    let mut manifest = Manifest::parse(text)?;
    manifest.apply(package, change)?;
    manifest.to_pretty_string()
}

/// `^`, `~`, or `""` for exact pins and anything else.
pub fn range_prefix(range: &str) -> &'static str {
    match range.trim_start().chars().next() {
        Some('^') => "^",
        Some('~') => "~",
        _ => "",
    }
}

/// Strip range operators from a version: `^4.18.0` → `4.18.0`.
pub fn strip_range_prefix(version: &str) -> &str {
    version
        .trim()
        .trim_start_matches(|c: char| matches!(c, '^' | '~' | '=' | 'v' | ' '))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
  "name": "web",
  "version": "1.0.0",
  "dependencies": {
    "lodash": "^4.17.0",
    "express": "4.18.2",
    "zod": "~3.22.0"
  },
  "devDependencies": {
    "typescript": "^5.3.0"
  },
  "scripts": {
    "build": "tsc"
  }
}
"#;

    fn bumped(range: &str, target: &str) -> String {
        let text = format!(r#"{{"dependencies": {{"lodash": "{range}"}}}}"#);
        let mut manifest = Manifest::parse(&text).unwrap();
        manifest.bump("lodash", target).unwrap()
    }

    #[test]
    fn bump_preserves_caret_prefix() {
        assert_eq!(bumped("^4.17.0", "4.18.0"), "^4.18.0");
    }

    #[test]
    fn bump_exact_pin_strips_target_prefix() {
        assert_eq!(bumped("4.17.0", "^4.18.0"), "4.18.0");
    }

    #[test]
    fn bump_preserves_tilde_prefix() {
        assert_eq!(bumped("~4.17.0", "~4.17.21"), "~4.17.21");
        assert_eq!(bumped("~4.17.0", "v4.17.21"), "~4.17.21");
    }

    #[test]
    fn bump_writes_into_dev_section() {
        let mut manifest = Manifest::parse(MANIFEST).unwrap();
        manifest.bump("typescript", "5.4.2").unwrap();
        assert_eq!(manifest.declared("typescript"), Some(("devDependencies", "^5.4.2")));
    }

    #[test]
    fn bump_unknown_package_is_not_direct() {
        let mut manifest = Manifest::parse(MANIFEST).unwrap();
        let err = manifest.bump("left-pad", "1.3.0").unwrap_err();
        assert_eq!(
            err,
            ManifestError::NotDirectDependency {
                package: "left-pad".to_string()
            }
        );
    }

    #[test]
    fn patch_keeps_key_order_and_formatting() {
        let patched = patch_manifest(
            MANIFEST,
            "lodash",
            &ManifestChange::Bump {
                target_version: "4.18.0".to_string(),
            },
        )
        .unwrap();
        assert_eq!(patched, MANIFEST.replace("^4.17.0", "^4.18.0"));
    }

    #[test]
    fn remove_keeps_sibling_order() {
        let patched = patch_manifest(MANIFEST, "express", &ManifestChange::Remove).unwrap();
        let expected = MANIFEST.replace("    \"express\": \"4.18.2\",\n", "");
        assert_eq!(patched, expected);
    }

    #[test]
    fn remove_missing_package_is_not_found() {
        let err = patch_manifest(MANIFEST, "left-pad", &ManifestChange::Remove).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound { .. }));
    }

    #[test]
    fn remove_clears_every_section() {
        let text = r#"{"dependencies": {"a": "1.0.0"}, "devDependencies": {"a": "1.0.0", "b": "2.0.0"}}"#;
        let mut manifest = Manifest::parse(text).unwrap();
        manifest.remove("a").unwrap();
        assert!(manifest.declared("a").is_none());
        assert!(manifest.declared("b").is_some());
    }

    #[test]
    fn direct_dependencies_prefers_regular_section() {
        let text = r#"{"dependencies": {"a": "^1.0.0"}, "devDependencies": {"a": "2.0.0", "b": "3.0.0"}}"#;
        let direct = Manifest::parse(text).unwrap().direct_dependencies();
        assert_eq!(direct.get("a").map(String::as_str), Some("^1.0.0"));
        assert_eq!(direct.get("b").map(String::as_str), Some("3.0.0"));
    }

    #[test]
    fn parse_rejects_non_object_root() {
        let err = Manifest::parse("[1, 2]").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(msg) if msg.contains("an array")));
        assert!(Manifest::parse("{ nope").is_err());
    }
}
