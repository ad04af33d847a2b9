//! Per-repository job progress.
//!
//! A repository has at most one [`ProgressWriter`], owned by the job that is
//! currently working on it. Readers take [`ProgressSnapshot`]s at any time.

use std::collections::HashMap;
use std::sync::Arc;

use gitchron_types::{GitchronError, RepoStatus, Result, PROGRESS_FAILED};
use parking_lot::Mutex;
use serde::Serialize;

/// Highest value reported while a job is still running.
pub const MAX_RUNNING_PROGRESS: i32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    Created,
    Cloning,
    ParsingMetadata,
    ParsingCommits,
    ExtractingChanges,
    Persisting,
    Complete,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Created => "CREATED",
            JobStage::Cloning => "CLONING",
            JobStage::ParsingMetadata => "PARSING_METADATA",
            JobStage::ParsingCommits => "PARSING_COMMITS",
            JobStage::ExtractingChanges => "EXTRACTING_CHANGES",
            JobStage::Persisting => "PERSISTING",
            JobStage::Complete => "COMPLETE",
            JobStage::Failed => "FAILED",
        }
    }

    /// Stage implied by a persisted status when no job state is in memory.
    pub fn for_status(status: RepoStatus) -> Self {
        match status {
            RepoStatus::Pending | RepoStatus::Analyzing => JobStage::Created,
            RepoStatus::Done => JobStage::Complete,
            RepoStatus::Failed => JobStage::Failed,
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub repo_id: i64,
    pub status: RepoStatus,
    pub progress: i32,
    pub stage: JobStage,
    pub message: Option<String>,
}

#[derive(Debug)]
struct ProgressState {
    status: RepoStatus,
    progress: i32,
    stage: JobStage,
    message: Option<String>,
    writer_active: bool,
}

impl ProgressState {
    fn pending() -> Self {
        Self {
            status: RepoStatus::Pending,
            progress: 0,
            stage: JobStage::Created,
            message: None,
            writer_active: false,
        }
    }
}

#[derive(Default)]
pub struct ProgressTracker {
    repos: Mutex<HashMap<i64, Arc<Mutex<ProgressState>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, repo_id: i64) -> Arc<Mutex<ProgressState>> {
        self.repos
            .lock()
            .entry(repo_id)
            .or_insert_with(|| Arc::new(Mutex::new(ProgressState::pending())))
            .clone()
    }

    /// Claims the repository for a job and moves it to ANALYZING at 0.
    /// Fails with [`GitchronError::Busy`] while another writer is alive.
    pub fn begin(&self, repo_id: i64) -> Result<ProgressWriter> {
        let state = self.state(repo_id);
        {
            let mut s = state.lock();
            if s.writer_active {
                return Err(GitchronError::Busy(repo_id));
            }
            *s = ProgressState {
                status: RepoStatus::Analyzing,
                progress: 0,
                stage: JobStage::Created,
                message: None,
                writer_active: true,
            };
        }
        Ok(ProgressWriter { repo_id, state })
    }

    pub fn is_busy(&self, repo_id: i64) -> bool {
        self.repos
            .lock()
            .get(&repo_id)
            .is_some_and(|s| s.lock().writer_active)
    }

    pub fn snapshot(&self, repo_id: i64) -> Option<ProgressSnapshot> {
        let state = self.repos.lock().get(&repo_id).cloned()?;
        let s = state.lock();
        Some(ProgressSnapshot {
            repo_id,
            status: s.status,
            progress: s.progress,
            stage: s.stage,
            message: s.message.clone(),
        })
    }

    /// Drops idle state for a repository. A live writer keeps its entry.
    pub fn forget(&self, repo_id: i64) {
        let mut repos = self.repos.lock();
        if repos.get(&repo_id).is_some_and(|s| !s.lock().writer_active) {
            repos.remove(&repo_id);
        }
    }
}

/// Exclusive write handle for one repository's progress. Dropping it releases
/// the repository; a job that never reached `complete` or `fail` is reported
/// as failed.
pub struct ProgressWriter {
    repo_id: i64,
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressWriter {
    pub fn repo_id(&self) -> i64 {
        self.repo_id
    }

    pub fn current(&self) -> i32 {
        self.state.lock().progress
    }

    /// Raises progress to `progress`, capped below completion. Lower values
    /// are ignored. Returns the value now visible to readers.
    pub fn advance(&self, progress: i32) -> i32 {
        let mut s = self.state.lock();
        if s.status == RepoStatus::Analyzing {
            let capped = progress.min(MAX_RUNNING_PROGRESS);
            if capped > s.progress {
                s.progress = capped;
            }
        }
        s.progress
    }

    /// Enters `stage` and advances to `progress`.
    pub fn stage(&self, stage: JobStage, progress: i32, message: impl Into<String>) -> i32 {
        {
            let mut s = self.state.lock();
            if s.status != RepoStatus::Analyzing {
                return s.progress;
            }
            s.stage = stage;
            s.message = Some(message.into());
        }
        self.advance(progress)
    }

    pub fn complete(&self) {
        let mut s = self.state.lock();
        s.status = RepoStatus::Done;
        s.progress = 100;
        s.stage = JobStage::Complete;
        s.message = None;
    }

    pub fn fail(&self, message: impl Into<String>) {
        let mut s = self.state.lock();
        s.status = RepoStatus::Failed;
        s.progress = PROGRESS_FAILED;
        s.stage = JobStage::Failed;
        s.message = Some(message.into());
    }
}

impl Drop for ProgressWriter {
    fn drop(&mut self) {
        let mut s = self.state.lock();
        if s.status == RepoStatus::Analyzing {
            s.status = RepoStatus::Failed;
            s.progress = PROGRESS_FAILED;
            s.stage = JobStage::Failed;
            s.message = Some("job aborted".to_string());
        }
        s.writer_active = false;
    }
}
