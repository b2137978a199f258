//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRemediationStore`, `MemoryDependencyCatalog`, and
//! `MemoryProjectDirectory` that satisfy the trait contracts without any
//! external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| StorageError::Poisoned(e.to_string()))
}

// ---------------------------------------------------------------------------
// MemoryRemediationStore
// ---------------------------------------------------------------------------

/// In-memory remediation store backed by a `HashMap<RemediationKey, record>`.
///
/// The map key doubles as the uniqueness constraint a relational backend
/// would enforce.
#[derive(Debug, Default)]
pub struct MemoryRemediationStore {
    records: Mutex<HashMap<RemediationKey, RemediationRecord>>,
}

impl MemoryRemediationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record.
    pub fn all(&self) -> Vec<RemediationRecord> {
        match self.records.lock() {
            Ok(records) => records.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl RemediationStore for MemoryRemediationStore {
    async fn find(&self, key: &RemediationKey) -> StorageResult<Option<RemediationRecord>> {
        let records = lock(&self.records)?;
        Ok(records.get(key).cloned())
    }

    async fn list_for_dependency(
        &self,
        project_id: &str,
        dependency_id: &DependencyId,
        kind: RemediationType,
    ) -> StorageResult<Vec<RemediationRecord>> {
        let records = lock(&self.records)?;
        let mut matching: Vec<RemediationRecord> = records
            .values()
            .filter(|r| {
                r.project_id == project_id && &r.dependency_id == dependency_id && r.kind == kind
            })
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn insert(&self, record: RemediationRecord) -> StorageResult<()> {
        let mut records = lock(&self.records)?;
        let key = record.key();
        if records.contains_key(&key) {
            return Err(StorageError::Conflict {
                key: key.to_string(),
            });
        }
        records.insert(key, record);
        Ok(())
    }

    async fn upsert(&self, record: RemediationRecord) -> StorageResult<()> {
        let mut records = lock(&self.records)?;
        records.insert(record.key(), record);
        Ok(())
    }

    async fn delete(&self, key: &RemediationKey) -> StorageResult<()> {
        let mut records = lock(&self.records)?;
        records.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDependencyCatalog
// ---------------------------------------------------------------------------

/// In-memory catalog keyed by `(project_id, package_name)`.
#[derive(Debug, Default)]
pub struct MemoryDependencyCatalog {
    entries: Mutex<HashMap<(String, String), DependencyId>>,
}

impl MemoryDependencyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `package_name` for `project_id` under `dependency_id`.
    pub fn with_dependency(self, project_id: &str, package_name: &str, dependency_id: &str) -> Self {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                (project_id.to_string(), package_name.to_string()),
                DependencyId::new(dependency_id),
            );
        }
        self
    }
}

#[async_trait]
impl DependencyCatalog for MemoryDependencyCatalog {
    async fn resolve_dependency_id(
        &self,
        project_id: &str,
        package_name: &str,
    ) -> StorageResult<Option<DependencyId>> {
        let entries = lock(&self.entries)?;
        Ok(entries
            .get(&(project_id.to_string(), package_name.to_string()))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryProjectDirectory
// ---------------------------------------------------------------------------

/// In-memory directory of project bindings.
#[derive(Debug, Default)]
pub struct MemoryProjectDirectory {
    projects: Mutex<Vec<ProjectBinding>>,
}

impl MemoryProjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, project: ProjectBinding) -> Self {
        if let Ok(mut projects) = self.projects.lock() {
            projects.push(project);
        }
        self
    }
}

#[async_trait]
impl ProjectDirectory for MemoryProjectDirectory {
    async fn repository_binding(
        &self,
        organization_id: &str,
        project_id: &str,
    ) -> StorageResult<Option<RepositoryBinding>> {
        let projects = lock(&self.projects)?;
        Ok(projects
            .iter()
            .find(|p| p.organization_id == organization_id && p.project_id == project_id)
            .map(|p| p.repository.clone()))
    }

    async fn projects_for_repository(
        &self,
        repo_full_name: &str,
    ) -> StorageResult<Vec<ProjectBinding>> {
        let projects = lock(&self.projects)?;
        Ok(projects
            .iter()
            .filter(|p| p.repository.repo_full_name == repo_full_name)
            .cloned()
            .collect())
    }
}
