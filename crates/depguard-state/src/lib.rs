//! depguard-state: persistence seam for depguard
//!
//! The engine never talks to a database directly. It composes the traits in
//! [`storage_traits`]; production deployments back them with their own
//! store, tests use the in-memory [`fakes`].
//!
//! ## Key Components
//!
//! - `RemediationStore`: remediation PR records with a uniqueness constraint
//! - `DependencyCatalog`: package name → tracked dependency id
//! - `ProjectDirectory`: repository bindings and per-project guardrails

mod error;
pub mod fakes;
pub mod storage_traits;

pub use error::StorageError;
pub use storage_traits::{
    DependencyCatalog, DependencyId, GuardrailConfig, ProjectBinding, ProjectDirectory,
    RemediationKey, RemediationRecord, RemediationStore, RemediationType, RepositoryBinding,
    StorageResult,
};
