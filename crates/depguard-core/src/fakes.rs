//! In-memory [`VcsClient`] (testing only)
//!
//! `FakeVcs` models a set of repositories as refs pointing at commit
//! snapshots (path → content + blob SHA). File writes create a new commit and
//! move the branch. Every write call is appended to a log so tests can
//! assert that a flow performed no writes at all.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::vcs::*;

type Tree = HashMap<String, FileContent>;

/// A pull request held by [`FakeVcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakePullRequest {
    pub repo: String,
    pub number: u64,
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
    pub state: PullRequestState,
}

impl FakePullRequest {
    fn reference(&self) -> PullRequestRef {
        PullRequestRef {
            html_url: format!("https://github.com/{}/pull/{}", self.repo, self.number),
            number: self.number,
        }
    }
}

/// A check run held by [`FakeVcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCheckRun {
    pub repo: String,
    pub id: u64,
    pub head_sha: String,
    pub report: CheckRunReport,
}

/// A comment held by [`FakeVcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeComment {
    pub repo: String,
    pub number: u64,
    pub body: String,
}

#[derive(Debug, Default)]
struct State {
    /// (repo, branch) → commit SHA
    branches: HashMap<(String, String), String>,
    /// (repo, commit SHA) → tree
    commits: HashMap<(String, String), Tree>,
    pull_requests: Vec<FakePullRequest>,
    check_runs: Vec<FakeCheckRun>,
    comments: Vec<FakeComment>,
    /// (repo, base, head) → changed paths
    changed_files: HashMap<(String, String, String), Vec<String>>,
    writes: Vec<String>,
    calls: HashMap<String, usize>,
    fail_next: HashMap<String, VecDeque<VcsError>>,
    fail_always: HashMap<String, VcsError>,
    sequence: u64,
}

impl State {
    fn next(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Record a call and return any injected failure for it.
    fn enter(&mut self, operation: &str) -> VcsResult<()> {
        *self.calls.entry(operation.to_string()).or_default() += 1;
        if let Some(err) = self
            .fail_next
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        match self.fail_always.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Resolve a branch name or a commit SHA to a commit SHA.
    fn resolve(&self, repo: &str, git_ref: &str) -> Option<String> {
        let key = (repo.to_string(), git_ref.to_string());
        if let Some(sha) = self.branches.get(&key) {
            return Some(sha.clone());
        }
        self.commits.contains_key(&key).then(|| git_ref.to_string())
    }

    fn commit(&mut self, repo: &str, tree: Tree) -> String {
        let sha = format!("c{:06}", self.next());
        self.commits.insert((repo.to_string(), sha.clone()), tree);
        sha
    }

    fn blob(&mut self, content: &str) -> FileContent {
        FileContent {
            content: content.to_string(),
            sha: format!("b{:06}", self.next()),
        }
    }

    fn tree_of(&mut self, files: &[(&str, &str)]) -> Tree {
        files
            .iter()
            .map(|(path, content)| (path.to_string(), self.blob(content)))
            .collect()
    }
}

/// In-memory VCS.
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<State>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A branch pointing at a fresh commit holding `files`.
    pub fn with_branch(self, repo: &str, branch: &str, files: &[(&str, &str)]) -> Self {
        {
            let mut state = self.state();
            let tree = state.tree_of(files);
            let sha = state.commit(repo, tree);
            state.branches.insert((repo.to_string(), branch.to_string()), sha);
        }
        self
    }

    /// A commit with a caller-chosen SHA, e.g. the base and head of a PR.
    pub fn with_commit(self, repo: &str, sha: &str, files: &[(&str, &str)]) -> Self {
        {
            let mut state = self.state();
            let tree = state.tree_of(files);
            state.commits.insert((repo.to_string(), sha.to_string()), tree);
        }
        self
    }

    pub fn with_changed_files(self, repo: &str, base: &str, head: &str, paths: &[&str]) -> Self {
        self.state().changed_files.insert(
            (repo.to_string(), base.to_string(), head.to_string()),
            paths.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    /// An open pull request from `head` into `base`.
    pub fn with_open_pull_request(self, repo: &str, head: &str, base: &str) -> Self {
        {
            let mut state = self.state();
            let number = state.next();
            state.pull_requests.push(FakePullRequest {
                repo: repo.to_string(),
                number,
                base: base.to_string(),
                head: head.to_string(),
                title: format!("Existing PR from {head}"),
                body: String::new(),
                state: PullRequestState::Open,
            });
        }
        self
    }

    /// Fail the next call of `operation` (method name) with `err`.
    pub fn fail_next(&self, operation: &str, err: VcsError) {
        self.state()
            .fail_next
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    /// Fail every call of `operation` with `err`.
    pub fn fail_always(&self, operation: &str, err: VcsError) {
        self.state()
            .fail_always
            .insert(operation.to_string(), err);
    }

    /// Log of write calls, in order, e.g. `create_branch depguard/bump-x-1.0.0`.
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Number of calls made to `operation`, including failed ones.
    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn branch_names(&self, repo: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .branches
            .keys()
            .filter(|(r, _)| r == repo)
            .map(|(_, b)| b.clone())
            .collect();
        names.sort();
        names
    }

    /// Content of `path` at a branch or commit.
    pub fn file_at(&self, repo: &str, git_ref: &str, path: &str) -> Option<String> {
        let state = self.state();
        let sha = state.resolve(repo, git_ref)?;
        state
            .commits
            .get(&(repo.to_string(), sha))
            .and_then(|tree| tree.get(path))
            .map(|file| file.content.clone())
    }

    pub fn pull_requests(&self) -> Vec<FakePullRequest> {
        self.state().pull_requests.clone()
    }

    pub fn check_runs(&self) -> Vec<FakeCheckRun> {
        self.state().check_runs.clone()
    }

    pub fn comments(&self) -> Vec<FakeComment> {
        self.state().comments.clone()
    }
}

#[async_trait]
impl VcsClient for FakeVcs {
    async fn create_installation_token(
        &self,
        installation_id: u64,
    ) -> VcsResult<InstallationToken> {
        self.state().enter("create_installation_token")?;
        Ok(InstallationToken::new(format!("token-{installation_id}")))
    }

    async fn get_branch_sha(
        &self,
        _token: &InstallationToken,
        repo: &str,
        branch: &str,
    ) -> VcsResult<String> {
        let mut state = self.state();
        state.enter("get_branch_sha")?;
        state
            .branches
            .get(&(repo.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| VcsError::NotFound {
                resource: format!("{repo}@{branch}"),
            })
    }

    async fn create_branch(
        &self,
        _token: &InstallationToken,
        repo: &str,
        name: &str,
        from_sha: &str,
    ) -> VcsResult<()> {
        let mut state = self.state();
        state.enter("create_branch")?;
        let key = (repo.to_string(), name.to_string());
        if state.branches.contains_key(&key) {
            return Err(VcsError::AlreadyExists {
                reference: format!("refs/heads/{name}"),
            });
        }
        if !state.commits.contains_key(&(repo.to_string(), from_sha.to_string())) {
            return Err(VcsError::Api {
                status: 422,
                body: format!("object {from_sha} does not exist"),
            });
        }
        state.branches.insert(key, from_sha.to_string());
        state.writes.push(format!("create_branch {name}"));
        Ok(())
    }

    async fn get_file_with_sha(
        &self,
        _token: &InstallationToken,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> VcsResult<FileContent> {
        let mut state = self.state();
        state.enter("get_file_with_sha")?;
        let not_found = || VcsError::NotFound {
            resource: format!("{repo}/{path}@{git_ref}"),
        };
        let sha = state.resolve(repo, git_ref).ok_or_else(not_found)?;
        state
            .commits
            .get(&(repo.to_string(), sha))
            .and_then(|tree| tree.get(path))
            .cloned()
            .ok_or_else(not_found)
    }

    async fn create_or_update_file(
        &self,
        _token: &InstallationToken,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        _message: &str,
        sha: Option<&str>,
    ) -> VcsResult<()> {
        let mut state = self.state();
        state.enter("create_or_update_file")?;
        let head = state
            .branches
            .get(&(repo.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| VcsError::NotFound {
                resource: format!("{repo}@{branch}"),
            })?;
        let mut tree = state
            .commits
            .get(&(repo.to_string(), head))
            .cloned()
            .unwrap_or_default();

        let current = tree.get(path).map(|file| file.sha.as_str());
        if current != sha {
            return Err(VcsError::Api {
                status: 409,
                body: format!("{path} does not match {}", sha.unwrap_or("<new file>")),
            });
        }

        let blob = state.blob(content);
        tree.insert(path.to_string(), blob);
        let commit = state.commit(repo, tree);
        state
            .branches
            .insert((repo.to_string(), branch.to_string()), commit);
        state
            .writes
            .push(format!("create_or_update_file {branch} {path}"));
        Ok(())
    }

    async fn create_pull_request(
        &self,
        _token: &InstallationToken,
        repo: &str,
        pull_request: &NewPullRequest,
    ) -> VcsResult<PullRequestRef> {
        let mut state = self.state();
        state.enter("create_pull_request")?;
        let duplicate = state.pull_requests.iter().any(|pr| {
            pr.repo == repo && pr.head == pull_request.head && pr.state == PullRequestState::Open
        });
        if duplicate {
            return Err(VcsError::Api {
                status: 422,
                body: format!("a pull request already exists for {}", pull_request.head),
            });
        }
        let number = state.next();
        let pr = FakePullRequest {
            repo: repo.to_string(),
            number,
            base: pull_request.base.clone(),
            head: pull_request.head.clone(),
            title: pull_request.title.clone(),
            body: pull_request.body.clone(),
            state: PullRequestState::Open,
        };
        let reference = pr.reference();
        state.pull_requests.push(pr);
        state
            .writes
            .push(format!("create_pull_request {}", pull_request.head));
        Ok(reference)
    }

    async fn list_pull_requests_by_head(
        &self,
        _token: &InstallationToken,
        repo: &str,
        head: &str,
    ) -> VcsResult<Vec<PullRequestRef>> {
        let mut state = self.state();
        state.enter("list_pull_requests_by_head")?;
        Ok(state
            .pull_requests
            .iter()
            .filter(|pr| pr.repo == repo && pr.head == head && pr.state == PullRequestState::Open)
            .map(FakePullRequest::reference)
            .collect())
    }

    async fn get_pull_request(
        &self,
        _token: &InstallationToken,
        repo: &str,
        number: u64,
    ) -> VcsResult<PullRequestState> {
        let mut state = self.state();
        state.enter("get_pull_request")?;
        state
            .pull_requests
            .iter()
            .find(|pr| pr.repo == repo && pr.number == number)
            .map(|pr| pr.state)
            .ok_or_else(|| VcsError::NotFound {
                resource: format!("{repo}#{number}"),
            })
    }

    async fn close_pull_request(
        &self,
        _token: &InstallationToken,
        repo: &str,
        number: u64,
    ) -> VcsResult<()> {
        let mut state = self.state();
        state.enter("close_pull_request")?;
        let pr = state
            .pull_requests
            .iter_mut()
            .find(|pr| pr.repo == repo && pr.number == number)
            .ok_or_else(|| VcsError::NotFound {
                resource: format!("{repo}#{number}"),
            })?;
        pr.state = PullRequestState::Closed;
        state.writes.push(format!("close_pull_request #{number}"));
        Ok(())
    }

    async fn list_check_runs_for_ref(
        &self,
        _token: &InstallationToken,
        repo: &str,
        git_ref: &str,
    ) -> VcsResult<Vec<CheckRun>> {
        let mut state = self.state();
        state.enter("list_check_runs_for_ref")?;
        Ok(state
            .check_runs
            .iter()
            .filter(|run| run.repo == repo && run.head_sha == git_ref)
            .map(|run| CheckRun {
                id: run.id,
                name: run.report.name.clone(),
            })
            .collect())
    }

    async fn create_check_run(
        &self,
        _token: &InstallationToken,
        repo: &str,
        head_sha: &str,
        report: &CheckRunReport,
    ) -> VcsResult<CheckRun> {
        let mut state = self.state();
        state.enter("create_check_run")?;
        let id = state.next();
        state.check_runs.push(FakeCheckRun {
            repo: repo.to_string(),
            id,
            head_sha: head_sha.to_string(),
            report: report.clone(),
        });
        state.writes.push(format!("create_check_run {}", report.name));
        Ok(CheckRun {
            id,
            name: report.name.clone(),
        })
    }

    async fn update_check_run(
        &self,
        _token: &InstallationToken,
        repo: &str,
        check_run_id: u64,
        report: &CheckRunReport,
    ) -> VcsResult<()> {
        let mut state = self.state();
        state.enter("update_check_run")?;
        let run = state
            .check_runs
            .iter_mut()
            .find(|run| run.repo == repo && run.id == check_run_id)
            .ok_or_else(|| VcsError::NotFound {
                resource: format!("check run {check_run_id}"),
            })?;
        run.report = report.clone();
        state.writes.push(format!("update_check_run {check_run_id}"));
        Ok(())
    }

    async fn create_issue_comment(
        &self,
        _token: &InstallationToken,
        repo: &str,
        number: u64,
        body: &str,
    ) -> VcsResult<()> {
        let mut state = self.state();
        state.enter("create_issue_comment")?;
        state.comments.push(FakeComment {
            repo: repo.to_string(),
            number,
            body: body.to_string(),
        });
        state.writes.push(format!("create_issue_comment #{number}"));
        Ok(())
    }

    async fn get_changed_files(
        &self,
        _token: &InstallationToken,
        repo: &str,
        base_sha: &str,
        head_sha: &str,
    ) -> VcsResult<Vec<String>> {
        let mut state = self.state();
        state.enter("get_changed_files")?;
        Ok(state
            .changed_files
            .get(&(repo.to_string(), base_sha.to_string(), head_sha.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> InstallationToken {
        InstallationToken::new("t")
    }

    #[tokio::test]
    async fn writes_move_the_branch_and_check_blob_sha() {
        let vcs = FakeVcs::new().with_branch("acme/web", "main", &[("package.json", "{}")]);
        let base = vcs.get_branch_sha(&token(), "acme/web", "main").await.unwrap();
        vcs.create_branch(&token(), "acme/web", "feature", &base).await.unwrap();

        let file = vcs
            .get_file_with_sha(&token(), "acme/web", "package.json", "feature")
            .await
            .unwrap();
        let stale = vcs
            .create_or_update_file(&token(), "acme/web", "feature", "package.json", "{\"a\":1}", "m", Some("nope"))
            .await;
        assert!(matches!(stale, Err(VcsError::Api { status: 409, .. })));

        vcs.create_or_update_file(&token(), "acme/web", "feature", "package.json", "{\"a\":1}", "m", Some(&file.sha))
            .await
            .unwrap();
        assert_eq!(vcs.file_at("acme/web", "feature", "package.json").as_deref(), Some("{\"a\":1}"));
        assert_eq!(vcs.file_at("acme/web", "main", "package.json").as_deref(), Some("{}"));
        assert_eq!(
            vcs.writes(),
            vec!["create_branch feature", "create_or_update_file feature package.json"]
        );
    }

    #[tokio::test]
    async fn duplicate_branch_is_already_exists() {
        let vcs = FakeVcs::new().with_branch("acme/web", "main", &[]);
        let base = vcs.get_branch_sha(&token(), "acme/web", "main").await.unwrap();
        let err = vcs.create_branch(&token(), "acme/web", "main", &base).await.unwrap_err();
        assert!(matches!(err, VcsError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_one_shot_or_sticky() {
        let vcs = FakeVcs::new();
        vcs.fail_next("create_installation_token", VcsError::Transient("reset".into()));
        assert!(vcs.create_installation_token(1).await.is_err());
        assert!(vcs.create_installation_token(1).await.is_ok());

        vcs.fail_always("get_changed_files", VcsError::Transient("down".into()));
        for _ in 0..2 {
            assert!(vcs.get_changed_files(&token(), "r", "a", "b").await.is_err());
        }
        assert_eq!(vcs.calls("get_changed_files"), 2);
    }
}
