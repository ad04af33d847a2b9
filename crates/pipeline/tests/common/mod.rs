#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use gitchron_pipeline::AnalysisOrchestrator;
use gitchron_store::SqliteStore;
use gitchron_types::{
    CommitRecord, CommitStats, FileChange, GitchronError, PipelineConfig, RepoStatus, Repository,
    RepositoryInput, Result, Store, TimelineEntry,
};
use parking_lot::Mutex;

pub fn init_repo(path: &Path) -> git2::Repository {
    let repo = git2::Repository::init(path).expect("git init");
    {
        let mut config = repo.config().expect("config");
        config.set_str("user.name", "Test Author").expect("user.name");
        config.set_str("user.email", "test@example.com").expect("user.email");
    }
    repo
}

/// Applies writes (`Some`) and deletions (`None`), then commits on HEAD.
pub fn commit_files(
    repo: &git2::Repository,
    files: &[(&str, Option<&str>)],
    message: &str,
    time: i64,
) -> String {
    let workdir = repo.workdir().expect("workdir").to_path_buf();
    let mut index = repo.index().expect("index");
    for (path, content) in files {
        let full = workdir.join(path);
        match content {
            Some(text) => {
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).expect("mkdir");
                }
                std::fs::write(&full, text).expect("write");
                index.add_path(Path::new(path)).expect("add");
            }
            None => {
                std::fs::remove_file(&full).expect("remove");
                index.remove_path(Path::new(path)).expect("remove from index");
            }
        }
    }
    index.write().expect("index write");
    let tree = repo
        .find_tree(index.write_tree().expect("write tree"))
        .expect("tree");
    let sig = git2::Signature::new("Test Author", "test@example.com", &git2::Time::new(time, 0))
        .expect("sig");
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .expect("commit")
        .to_string()
}

/// Linear history of `count` commits, each appending one line to `log.txt`.
pub fn linear_history(path: &Path, count: usize) -> Vec<String> {
    let repo = init_repo(path);
    let mut body = String::new();
    (0..count)
        .map(|i| {
            body.push_str(&format!("line {}\n", i));
            let message = format!("commit {}", i);
            commit_files(&repo, &[("log.txt", Some(&body))], &message, 1_000 + i as i64)
        })
        .collect()
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

pub fn orchestrator(workspace: &Path) -> (AnalysisOrchestrator, Arc<SqliteStore>) {
    orchestrator_with(PipelineConfig {
        workspace_root: workspace.to_path_buf(),
        ..PipelineConfig::default()
    })
}

pub fn orchestrator_with(config: PipelineConfig) -> (AnalysisOrchestrator, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    let orch = AnalysisOrchestrator::new(store.clone(), config).expect("orchestrator");
    (orch, store)
}

/// In-memory store whose file change writes fail once they reach a chosen commit.
pub struct FlakyStore {
    inner: SqliteStore,
    poisoned: Mutex<Option<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().expect("store"),
            poisoned: Mutex::new(None),
        }
    }

    pub fn fail_changes_of(&self, commit_hash: Option<&str>) {
        *self.poisoned.lock() = commit_hash.map(str::to_string);
    }
}

impl Store for FlakyStore {
    fn create_repository(&self, input: &RepositoryInput) -> Result<Repository> {
        self.inner.create_repository(input)
    }
    fn get_repository(&self, repo_id: i64) -> Result<Option<Repository>> {
        self.inner.get_repository(repo_id)
    }
    fn get_repository_by_url(&self, url: &str) -> Result<Option<Repository>> {
        self.inner.get_repository_by_url(url)
    }
    fn list_repositories(&self) -> Result<Vec<Repository>> {
        self.inner.list_repositories()
    }
    fn update_repository(&self, repo: &Repository) -> Result<()> {
        self.inner.update_repository(repo)
    }
    fn update_progress(
        &self,
        repo_id: i64,
        status: RepoStatus,
        progress: i32,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.inner.update_progress(repo_id, status, progress, error_message)
    }
    fn delete_repository(&self, repo_id: i64) -> Result<()> {
        self.inner.delete_repository(repo_id)
    }
    fn clear_history(&self, repo_id: i64) -> Result<()> {
        self.inner.clear_history(repo_id)
    }
    fn upsert_commits(&self, commits: &[CommitRecord]) -> Result<()> {
        self.inner.upsert_commits(commits)
    }
    fn upsert_file_changes(
        &self,
        repo_id: i64,
        changes: &HashMap<String, Vec<FileChange>>,
    ) -> Result<()> {
        if let Some(hash) = self.poisoned.lock().as_deref() {
            if changes.contains_key(hash) {
                return Err(GitchronError::Io(std::io::Error::other("disk full")));
            }
        }
        self.inner.upsert_file_changes(repo_id, changes)
    }
    fn update_commit_stats(
        &self,
        repo_id: i64,
        commit_hash: &str,
        stats: &CommitStats,
    ) -> Result<()> {
        self.inner.update_commit_stats(repo_id, commit_hash, stats)
    }
    fn indexed_commit_hashes(&self, repo_id: i64) -> Result<HashSet<String>> {
        self.inner.indexed_commit_hashes(repo_id)
    }
    fn count_commits(&self, repo_id: i64) -> Result<usize> {
        self.inner.count_commits(repo_id)
    }
    fn list_commits(&self, repo_id: i64, offset: usize, limit: usize) -> Result<Vec<CommitRecord>> {
        self.inner.list_commits(repo_id, offset, limit)
    }
    fn get_commit(&self, repo_id: i64, commit_hash: &str) -> Result<Option<CommitRecord>> {
        self.inner.get_commit(repo_id, commit_hash)
    }
    fn file_changes(
        &self,
        repo_id: i64,
        commit_hashes: &[String],
    ) -> Result<HashMap<String, Vec<FileChange>>> {
        self.inner.file_changes(repo_id, commit_hashes)
    }
    fn file_timeline(&self, repo_id: i64, file_path: &str) -> Result<Vec<TimelineEntry>> {
        self.inner.file_timeline(repo_id, file_path)
    }
    fn get_snapshot(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_snapshot(content_hash)
    }
}

pub fn flaky_orchestrator(config: PipelineConfig) -> (AnalysisOrchestrator, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::new());
    let orch = AnalysisOrchestrator::new(store.clone(), config).expect("orchestrator");
    (orch, store)
}
