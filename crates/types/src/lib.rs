use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GitchronError {
    #[cfg(feature = "rusqlite-errors")]
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[cfg(feature = "git2-errors")]
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("clone failed: {0}")]
    Clone(String),
    #[error("history parse failed: {0}")]
    Parse(String),
    #[error("stats unavailable: {0}")]
    StatsUnavailable(String),
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("filesystem error: {0}")]
    Filesystem(String),
    #[error("ingest error: {0}")]
    Ingest(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("repository {0} already has a job in flight")]
    Busy(i64),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("cancelled")]
    Cancelled,
}


pub type Result<T> = std::result::Result<T, GitchronError>;

// ── Repository ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoStatus {
    Pending,
    Analyzing,
    Done,
    Failed,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Pending => "PENDING",
            RepoStatus::Analyzing => "ANALYZING",
            RepoStatus::Done => "DONE",
            RepoStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RepoStatus::Pending),
            "ANALYZING" => Some(RepoStatus::Analyzing),
            "DONE" => Some(RepoStatus::Done),
            "FAILED" => Some(RepoStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress value stored for a failed repository.
pub const PROGRESS_FAILED: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub local_path: PathBuf,
    pub status: RepoStatus,
    pub analyze_progress: i32,
    pub analyze_depth: i32,
    pub analyze_since: Option<DateTime<Utc>>,
    pub analyze_until: Option<DateTime<Utc>>,
    pub analyze_path_filters: Vec<String>,
    pub analyze_shallow: bool,
    pub analyze_single_branch: bool,
    pub analyze_partial: bool,
    pub total_commits: i64,
    pub total_files: i64,
    pub repo_size: i64,
    pub can_load_more: bool,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Repository {
    /// Rebuilds the options that produced the current state.
    pub fn options(&self) -> AnalyzeOptions {
        AnalyzeOptions {
            depth: self.analyze_depth,
            since: self.analyze_since,
            until: self.analyze_until,
            path_filters: self.analyze_path_filters.clone(),
            shallow: self.analyze_shallow,
            single_branch: self.analyze_single_branch,
            partial: self.analyze_partial,
        }
    }

    /// Stores the echo of `options` on the repository row.
    pub fn apply_options(&mut self, options: &AnalyzeOptions) {
        self.analyze_depth = options.depth;
        self.analyze_since = options.since;
        self.analyze_until = options.until;
        self.analyze_path_filters = options.path_filters.clone();
        self.analyze_shallow = options.shallow;
        self.analyze_single_branch = options.single_branch;
        self.analyze_partial = options.partial;
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryInput {
    pub url: String,
    pub name: String,
    pub local_path: PathBuf,
    pub options: AnalyzeOptions,
}

/// Derives a display name from the last path segment of a clone URL.
pub fn repo_name_from_url(url: &str) -> String {
    let name = url
        .trim_end_matches('/')
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    if name.is_empty() {
        "repo".to_string()
    } else {
        name.to_string()
    }
}

// ── Analyze options ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzeOptions {
    /// Number of most-recent commits to consider; -1 means all of them.
    pub depth: i32,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub path_filters: Vec<String>,
    pub shallow: bool,
    pub single_branch: bool,
    pub partial: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            depth: -1,
            since: None,
            until: None,
            path_filters: Vec::new(),
            shallow: false,
            single_branch: true,
            partial: false,
        }
    }
}

impl AnalyzeOptions {
    /// Depth passed to the clone command, if the clone should be shallow.
    pub fn clone_depth(&self) -> Option<u32> {
        if self.shallow && self.depth > 0 {
            Some(self.depth as u32)
        } else {
            None
        }
    }

    pub fn depth_limit(&self) -> Option<usize> {
        (self.depth >= 0).then_some(self.depth as usize)
    }

    /// Inclusive time-window test on a commit timestamp (seconds).
    pub fn in_window(&self, commit_time: i64) -> bool {
        if let Some(since) = self.since {
            if commit_time < since.timestamp() {
                return false;
            }
        }
        if let Some(until) = self.until {
            if commit_time > until.timestamp() {
                return false;
            }
        }
        true
    }
}

// ── Commits & file changes ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub repo_id: i64,
    pub commit_hash: String,
    pub short_hash: String,
    pub parent_hash: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    pub commit_time: i64,
    pub additions: Option<u32>,
    pub deletions: Option<u32>,
    pub files_changed: Option<u32>,
    pub is_merge: bool,
    pub commit_order: i64,
}

impl CommitRecord {
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim()
    }

    pub fn stats(&self) -> Option<CommitStats> {
        match (self.additions, self.deletions, self.files_changed) {
            (Some(additions), Some(deletions), Some(files_changed)) => Some(CommitStats {
                additions,
                deletions,
                files_changed,
                calculated: true,
            }),
            _ => None,
        }
    }
}

pub fn short_hash(hash: &str) -> String {
    hash.chars().take(7).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Rename,
    Copy,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Add => "ADD",
            ChangeType::Modify => "MODIFY",
            ChangeType::Delete => "DELETE",
            ChangeType::Rename => "RENAME",
            ChangeType::Copy => "COPY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADD" => Some(ChangeType::Add),
            "MODIFY" => Some(ChangeType::Modify),
            "DELETE" => Some(ChangeType::Delete),
            "RENAME" => Some(ChangeType::Rename),
            "COPY" => Some(ChangeType::Copy),
            _ => None,
        }
    }

    /// Maps the status letter of a raw tree-diff entry. Type changes count as
    /// modifications.
    pub fn from_status_letter(c: char) -> Option<Self> {
        match c {
            'A' => Some(ChangeType::Add),
            'M' | 'T' => Some(ChangeType::Modify),
            'D' => Some(ChangeType::Delete),
            'R' => Some(ChangeType::Rename),
            'C' => Some(ChangeType::Copy),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub repo_id: i64,
    pub commit_hash: String,
    pub file_path: String,
    pub file_extension: Option<String>,
    pub change_type: ChangeType,
    pub old_path: Option<String>,
    pub similarity: Option<u8>,
    pub additions: u32,
    pub deletions: u32,
    pub binary: bool,
    pub diff_text: Option<String>,
    /// Snapshot loaded at ingestion time; reads go through [`Store::get_snapshot`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
    pub content_hash: Option<String>,
}

/// Lower-cased extension of the final path component, if any.
pub fn file_extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) if idx + 1 < name.len() => Some(name[idx + 1..].to_ascii_lowercase()),
        Some(_) => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStats {
    pub additions: u32,
    pub deletions: u32,
    pub files_changed: u32,
    pub calculated: bool,
}

impl CommitStats {
    /// Zeroed stats signalling "not computable right now".
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Sums per-file line counts into commit-level stats.
    pub fn from_changes(changes: &[FileChange]) -> Self {
        Self {
            additions: changes.iter().map(|c| c.additions).sum(),
            deletions: changes.iter().map(|c| c.deletions).sum(),
            files_changed: changes.len() as u32,
            calculated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub commit_hash: String,
    pub file_path: String,
}

impl ContentRequest {
    pub fn new(commit_hash: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            commit_hash: commit_hash.into(),
            file_path: file_path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub commit_hash: String,
    pub short_hash: String,
    pub commit_order: i64,
    pub commit_time: i64,
    pub author_name: String,
    pub subject: String,
    pub file_path: String,
    pub change_type: ChangeType,
    pub old_path: Option<String>,
    pub additions: u32,
    pub deletions: u32,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestSummary {
    pub commits_indexed: usize,
    pub commits_already_indexed: usize,
    pub commits_filtered: usize,
    pub file_changes: usize,
    pub warnings: Vec<String>,
}

// ── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory under which working copies are created and deleted.
    pub workspace_root: PathBuf,
    pub clone_timeout: Duration,
    pub fetch_timeout: Duration,
    pub diff_timeout: Duration,
    pub stats_timeout: Duration,
    /// Commits per extract-and-persist round.
    pub batch_size: usize,
    /// Commits per `diff-tree --stdin` process inside a batch.
    pub diff_chunk_size: usize,
    pub rename_threshold: u8,
    /// Per-file diff text cap; 0 disables diff text.
    pub max_diff_bytes: usize,
    pub snapshot_contents: bool,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("gitchron").join("clones"),
            clone_timeout: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(600),
            diff_timeout: Duration::from_secs(120),
            stats_timeout: Duration::from_secs(30),
            batch_size: 200,
            diff_chunk_size: 250,
            rename_threshold: 50,
            max_diff_bytes: 64 * 1024,
            snapshot_contents: false,
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(600),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.diff_chunk_size == 0 {
            return Err(GitchronError::Config(
                "batch sizes must be greater than zero".into(),
            ));
        }
        if self.rename_threshold > 100 {
            return Err(GitchronError::Config(format!(
                "rename threshold {} is not a percentage",
                self.rename_threshold
            )));
        }
        if self.cache_capacity == 0 {
            return Err(GitchronError::Config("cache capacity must be non-zero".into()));
        }
        Ok(())
    }
}

// ── Core traits ───────────────────────────────────────────────────────────

/// Persistence sink for the ingestion pipeline. Writes are idempotent upserts
/// keyed by natural keys, so replays never duplicate rows.
pub trait Store: Send + Sync {
    // Repository management
    fn create_repository(&self, input: &RepositoryInput) -> Result<Repository>;
    fn get_repository(&self, repo_id: i64) -> Result<Option<Repository>>;
    fn get_repository_by_url(&self, url: &str) -> Result<Option<Repository>>;
    fn list_repositories(&self) -> Result<Vec<Repository>>;
    fn update_repository(&self, repo: &Repository) -> Result<()>;
    fn update_progress(
        &self,
        repo_id: i64,
        status: RepoStatus,
        progress: i32,
        error_message: Option<&str>,
    ) -> Result<()>;
    /// Removes the repository row and everything that hangs off it.
    fn delete_repository(&self, repo_id: i64) -> Result<()>;
    /// Removes commits and file changes but keeps the repository row.
    fn clear_history(&self, repo_id: i64) -> Result<()>;

    // Ingest writes
    fn upsert_commits(&self, commits: &[CommitRecord]) -> Result<()>;
    /// Replaces the file changes of every commit present in `changes`.
    fn upsert_file_changes(
        &self,
        repo_id: i64,
        changes: &HashMap<String, Vec<FileChange>>,
    ) -> Result<()>;
    fn update_commit_stats(&self, repo_id: i64, commit_hash: &str, stats: &CommitStats)
        -> Result<()>;

    // Queries
    /// Commits whose file changes or stats have been persisted.
    fn indexed_commit_hashes(&self, repo_id: i64) -> Result<HashSet<String>>;
    fn count_commits(&self, repo_id: i64) -> Result<usize>;
    fn list_commits(&self, repo_id: i64, offset: usize, limit: usize) -> Result<Vec<CommitRecord>>;
    fn get_commit(&self, repo_id: i64, commit_hash: &str) -> Result<Option<CommitRecord>>;
    fn file_changes(
        &self,
        repo_id: i64,
        commit_hashes: &[String],
    ) -> Result<HashMap<String, Vec<FileChange>>>;
    fn file_timeline(&self, repo_id: i64, file_path: &str) -> Result<Vec<TimelineEntry>>;
    fn get_snapshot(&self, content_hash: &str) -> Result<Option<Vec<u8>>>;
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_options_wire_shape() {
        let json = r#"{"depth":100,"since":"2024-01-01T00:00:00Z","pathFilters":["src/"],"shallow":true}"#;
        let opts: AnalyzeOptions = serde_json::from_str(json).expect("deserialize");
        assert_eq!(opts.depth, 100);
        assert_eq!(opts.path_filters, vec!["src/"]);
        assert!(opts.shallow);
        assert!(opts.single_branch, "missing fields fall back to defaults");
        assert_eq!(opts.since.map(|t| t.timestamp()), Some(1704067200));
        assert_eq!(opts.clone_depth(), Some(100));
    }

    #[test]
    fn test_clone_depth_requires_shallow() {
        let opts = AnalyzeOptions {
            depth: 50,
            ..AnalyzeOptions::default()
        };
        assert_eq!(opts.clone_depth(), None);
        assert_eq!(opts.depth_limit(), Some(50));
        assert_eq!(AnalyzeOptions::default().depth_limit(), None);
    }

    #[test]
    fn test_window_is_inclusive() {
        let since = DateTime::from_timestamp(1000, 0).unwrap();
        let until = DateTime::from_timestamp(2000, 0).unwrap();
        let opts = AnalyzeOptions {
            since: Some(since),
            until: Some(until),
            ..AnalyzeOptions::default()
        };
        assert!(opts.in_window(1000));
        assert!(opts.in_window(2000));
        assert!(!opts.in_window(999));
        assert!(!opts.in_window(2001));
    }

    #[test]
    fn test_change_type_round_trip_and_letters() {
        for ct in [
            ChangeType::Add,
            ChangeType::Modify,
            ChangeType::Delete,
            ChangeType::Rename,
            ChangeType::Copy,
        ] {
            assert_eq!(ChangeType::parse(ct.as_str()), Some(ct));
        }
        assert_eq!(ChangeType::from_status_letter('T'), Some(ChangeType::Modify));
        assert_eq!(ChangeType::from_status_letter('U'), None);
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("src/main.RS"), Some("rs".to_string()));
        assert_eq!(file_extension("Makefile"), None);
        assert_eq!(file_extension(".gitignore"), None);
        assert_eq!(file_extension("a.b/c"), None);
        assert_eq!(file_extension("archive.tar.gz"), Some("gz".to_string()));
    }

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(repo_name_from_url("https://github.com/rust-lang/cargo.git"), "cargo");
        assert_eq!(repo_name_from_url("https://example.com/a/b/"), "b");
        assert_eq!(repo_name_from_url("git@github.com:user/tool.git"), "tool");
    }

    #[test]
    fn test_stats_from_changes() {
        let change = |a, d| FileChange {
            repo_id: 1,
            commit_hash: "abc".into(),
            file_path: "x".into(),
            file_extension: None,
            change_type: ChangeType::Modify,
            old_path: None,
            similarity: None,
            additions: a,
            deletions: d,
            binary: false,
            diff_text: None,
            file_content: None,
            content_hash: None,
        };
        let stats = CommitStats::from_changes(&[change(3, 1), change(2, 0)]);
        assert_eq!(stats.additions, 5);
        assert_eq!(stats.deletions, 1);
        assert_eq!(stats.files_changed, 2);
        assert!(stats.calculated);
        assert!(!CommitStats::unavailable().calculated);
    }

    #[test]
    fn test_default_config_is_valid() {
        PipelineConfig::default().validate().expect("default config");
        let bad = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(bad.validate(), Err(GitchronError::Config(_))));
    }

    #[test]
    fn test_status_strings() {
        for s in [
            RepoStatus::Pending,
            RepoStatus::Analyzing,
            RepoStatus::Done,
            RepoStatus::Failed,
        ] {
            assert_eq!(RepoStatus::parse(s.as_str()), Some(s));
        }
    }
}
