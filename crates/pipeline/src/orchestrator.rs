use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gitchron_ingest::{
    boundaries_at, directory_size, head_file_count, is_shallow, CloneManager, CommitHistoryParser,
    FetchOutcome, FileChangeExtractor, PathFilter, StatsCalculator,
};
use gitchron_types::{
    repo_name_from_url, AnalyzeOptions, CommitRecord, CommitStats, ContentRequest, FileChange,
    GitchronError, IngestSummary, PipelineConfig, RepoStatus, Repository, RepositoryInput, Result,
    Store, TimelineEntry, PROGRESS_FAILED,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::{CacheStats, ContentCache};
use crate::progress::{JobStage, ProgressSnapshot, ProgressTracker, ProgressWriter};

// Progress bands per stage.
const CLONE_DONE: i32 = 20;
const METADATA_DONE: i32 = 25;
const PARSE_DONE: i32 = 40;
const PERSIST_SPAN: i32 = 59;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub repo_id: i64,
    pub commit_hash: String,
    pub file_path: String,
}

impl ContentKey {
    fn request(&self) -> ContentRequest {
        ContentRequest::new(self.commit_hash.clone(), self.file_path.clone())
    }
}

#[derive(Debug, Clone, Copy)]
enum JobKind {
    Analyze,
    FetchMore { additional_depth: u32 },
}

struct Job {
    repo_id: i64,
    kind: JobKind,
    writer: ProgressWriter,
    cancel: Arc<AtomicBool>,
}

impl Job {
    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(GitchronError::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct RunningJob {
    handle: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
}

/// Runs ingestion jobs in the background and serves reads over their results.
///
/// Mutating calls (`analyze`, `fetch_more_history`, `delete`) return as soon
/// as the job is queued; progress is polled with `get_progress` or awaited
/// with `wait`.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    config: PipelineConfig,
    clones: CloneManager,
    history: CommitHistoryParser,
    extractor: FileChangeExtractor,
    stats: StatsCalculator,
    tracker: ProgressTracker,
    contents: ContentCache<ContentKey, Arc<Vec<u8>>>,
    timelines: ContentCache<(i64, String), Arc<Vec<TimelineEntry>>>,
    jobs: Mutex<HashMap<i64, RunningJob>>,
    summaries: Mutex<HashMap<i64, IngestSummary>>,
    runtime: Handle,
}

impl AnalysisOrchestrator {
    /// Builds an orchestrator bound to the current tokio runtime.
    pub fn new(store: Arc<dyn Store>, config: PipelineConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            GitchronError::Config("the orchestrator must be created inside a tokio runtime".into())
        })?;
        config.validate()?;
        let inner = Inner {
            clones: CloneManager::new(&config),
            history: CommitHistoryParser::new(),
            extractor: FileChangeExtractor::new(&config),
            stats: StatsCalculator::new(&config),
            tracker: ProgressTracker::new(),
            contents: ContentCache::new(config.cache_capacity, config.cache_ttl),
            timelines: ContentCache::new(config.cache_capacity, config.cache_ttl),
            jobs: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
            store,
            config,
            runtime,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    // ── Jobs ──────────────────────────────────────────────────────────────

    /// Registers `url` (or reuses an existing registration) and queues a
    /// full analysis under `options`. Stored history of an existing
    /// registration is replaced only once the new clone succeeds.
    pub fn analyze(&self, url: &str, options: AnalyzeOptions) -> Result<Repository> {
        let url = url.trim();
        if url.is_empty() {
            return Err(GitchronError::Config("repository URL is empty".into()));
        }
        PathFilter::new(&options.path_filters)?;

        let inner = &self.inner;
        let (mut repo, writer) = match inner.store.get_repository_by_url(url)? {
            Some(existing) => {
                let writer = inner.tracker.begin(existing.id)?;
                (existing, writer)
            }
            None => {
                let mut created = inner.store.create_repository(&RepositoryInput {
                    url: url.to_string(),
                    name: repo_name_from_url(url),
                    local_path: inner.config.workspace_root.clone(),
                    options: options.clone(),
                })?;
                let writer = inner.tracker.begin(created.id)?;
                created.local_path = inner.clones.local_path_for(created.id, &created.name);
                (created, writer)
            }
        };

        repo.apply_options(&options);
        repo.status = RepoStatus::Analyzing;
        repo.analyze_progress = 0;
        repo.error_message = None;
        inner.store.update_repository(&repo)?;

        info!(
            repo_id = repo.id,
            url,
            depth = options.depth,
            shallow = options.shallow,
            "analysis queued"
        );
        self.spawn_job(writer, JobKind::Analyze);
        Ok(repo)
    }

    /// Deepens a shallow working copy by `additional_depth` commits and
    /// ingests whatever history that uncovers.
    pub fn fetch_more_history(&self, repo_id: i64, additional_depth: u32) -> Result<Repository> {
        if additional_depth == 0 {
            return Err(GitchronError::Config("additional depth must be positive".into()));
        }
        let inner = &self.inner;
        let mut repo = self.get_repository(repo_id)?;
        if !repo.local_path.exists() {
            return Err(GitchronError::InvalidState(format!(
                "working copy of repository {} is missing; analyze it again",
                repo_id
            )));
        }

        let writer = inner.tracker.begin(repo_id)?;
        repo.status = RepoStatus::Analyzing;
        repo.analyze_progress = 0;
        repo.error_message = None;
        inner.store.update_repository(&repo)?;
        inner.timelines.invalidate_where(|(id, _)| *id == repo_id);

        info!(repo_id, additional_depth, "fetch-more queued");
        self.spawn_job(writer, JobKind::FetchMore { additional_depth });
        Ok(repo)
    }

    /// Removes the repository, its history rows and its working copy.
    pub fn delete(&self, repo_id: i64) -> Result<()> {
        let inner = &self.inner;
        let repo = self.get_repository(repo_id)?;
        let writer = inner.tracker.begin(repo_id)?;

        inner.store.delete_repository(repo_id)?;
        inner.invalidate(repo_id);
        inner.jobs.lock().remove(&repo_id);
        inner.summaries.lock().remove(&repo_id);
        let removal = inner.clones.delete_local_repository(&repo.local_path);

        drop(writer);
        inner.tracker.forget(repo_id);
        removal?;
        info!(repo_id, url = %repo.url, "repository deleted");
        Ok(())
    }

    /// Fails rows left ANALYZING by a process that died mid-job. Rows
    /// updated within `stale_after` may belong to another live process and
    /// are left alone.
    pub fn recover_interrupted(&self, stale_after: Duration) -> Result<usize> {
        let inner = &self.inner;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let cutoff = now - stale_after.as_secs() as i64;

        let mut recovered = 0;
        for repo in inner.store.list_repositories()? {
            if repo.status != RepoStatus::Analyzing
                || repo.updated_at > cutoff
                || inner.tracker.is_busy(repo.id)
            {
                continue;
            }
            inner.store.update_progress(
                repo.id,
                RepoStatus::Failed,
                PROGRESS_FAILED,
                Some("interrupted"),
            )?;
            warn!(repo_id = repo.id, url = %repo.url, "marked interrupted job as failed");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Asks a running job to stop at its next stage boundary.
    pub fn cancel(&self, repo_id: i64) -> bool {
        if let Some(job) = self.inner.jobs.lock().get(&repo_id) {
            job.cancel.store(true, Ordering::SeqCst);
        }
        self.inner.tracker.is_busy(repo_id)
    }

    /// Waits for the repository's current job, if any, then returns its row.
    pub async fn wait(&self, repo_id: i64) -> Result<Repository> {
        let handle = self
            .inner
            .jobs
            .lock()
            .get_mut(&repo_id)
            .and_then(|job| job.handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(repo_id, error = %e, "job task ended abnormally");
            }
        }
        self.get_repository(repo_id)
    }

    pub fn get_progress(&self, repo_id: i64) -> Result<ProgressSnapshot> {
        if let Some(snapshot) = self.inner.tracker.snapshot(repo_id) {
            return Ok(snapshot);
        }
        let repo = self.get_repository(repo_id)?;
        Ok(ProgressSnapshot {
            repo_id,
            status: repo.status,
            progress: repo.analyze_progress,
            stage: JobStage::for_status(repo.status),
            message: repo.error_message,
        })
    }

    /// Hit and miss counters of the file content cache.
    pub fn content_cache_stats(&self) -> CacheStats {
        self.inner.contents.stats()
    }

    /// Counters and warnings of the last finished job for `repo_id`.
    pub fn last_summary(&self, repo_id: i64) -> Option<IngestSummary> {
        self.inner.summaries.lock().get(&repo_id).cloned()
    }

    fn spawn_job(&self, writer: ProgressWriter, kind: JobKind) {
        let repo_id = writer.repo_id();
        let cancel = Arc::new(AtomicBool::new(false));
        let job = Job {
            repo_id,
            kind,
            writer,
            cancel: cancel.clone(),
        };

        let inner = self.inner.clone();
        let worker = self.inner.clone();
        let handle = self.inner.runtime.spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || worker.run_job(job)).await;
            if let Err(e) = outcome {
                // The writer was dropped during unwinding; mirror that in the store.
                error!(repo_id, error = %e, "analysis job panicked");
                let message = format!("job panicked: {}", e);
                if let Err(e) = inner.store.update_progress(
                    repo_id,
                    RepoStatus::Failed,
                    PROGRESS_FAILED,
                    Some(&message),
                ) {
                    warn!(repo_id, error = %e, "failed to record job panic");
                }
            }
            inner.timelines.invalidate_where(|(id, _)| *id == repo_id);
        });

        self.inner.jobs.lock().insert(
            repo_id,
            RunningJob {
                handle: Some(handle),
                cancel,
            },
        );
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub fn get_repository(&self, repo_id: i64) -> Result<Repository> {
        self.inner
            .store
            .get_repository(repo_id)?
            .ok_or_else(|| GitchronError::NotFound(format!("repository {}", repo_id)))
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>> {
        self.inner.store.list_repositories()
    }

    /// Commits ordered oldest first.
    pub fn list_commits(
        &self,
        repo_id: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CommitRecord>> {
        self.get_repository(repo_id)?;
        self.inner.store.list_commits(repo_id, offset, limit)
    }

    pub fn file_changes(
        &self,
        repo_id: i64,
        commit_hashes: &[String],
    ) -> Result<HashMap<String, Vec<FileChange>>> {
        self.get_repository(repo_id)?;
        self.inner.store.file_changes(repo_id, commit_hashes)
    }

    /// Stored stats, or freshly computed ones. Calculated results are persisted.
    pub fn commit_stats(&self, repo_id: i64, commit_hash: &str) -> Result<CommitStats> {
        let mut map = self.commit_stats_batch(repo_id, &[commit_hash.to_string()])?;
        map.remove(commit_hash)
            .ok_or_else(|| GitchronError::NotFound(format!("commit {}", commit_hash)))
    }

    pub fn commit_stats_batch(
        &self,
        repo_id: i64,
        commit_hashes: &[String],
    ) -> Result<HashMap<String, CommitStats>> {
        let repo = self.get_repository(repo_id)?;
        let store = &self.inner.store;

        let mut out = HashMap::new();
        let mut missing = Vec::new();
        for hash in commit_hashes {
            match store.get_commit(repo_id, hash)? {
                Some(commit) => match commit.stats() {
                    Some(stats) => {
                        out.insert(hash.clone(), stats);
                    }
                    None => missing.push(hash.clone()),
                },
                None => continue,
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let computed = self.inner.stats.calculate_stats_batch(&repo.local_path, &missing);
        for (hash, stats) in computed {
            if stats.calculated {
                store.update_commit_stats(repo_id, &hash, &stats)?;
            }
            out.insert(hash, stats);
        }
        Ok(out)
    }

    /// File contents at the given commits. Requests that resolve to nothing
    /// are absent from the result.
    pub fn file_contents(
        &self,
        repo_id: i64,
        requests: &[ContentRequest],
    ) -> Result<HashMap<ContentRequest, Arc<Vec<u8>>>> {
        let repo = self.get_repository(repo_id)?;
        let keys: Vec<ContentKey> = requests
            .iter()
            .map(|r| ContentKey {
                repo_id,
                commit_hash: r.commit_hash.clone(),
                file_path: r.file_path.clone(),
            })
            .collect();

        let inner = &self.inner;
        let found = inner
            .contents
            .get_or_fetch_many(&keys, |missing| inner.load_contents(&repo, missing))?;
        Ok(found.into_iter().map(|(key, bytes)| (key.request(), bytes)).collect())
    }

    pub fn file_content(
        &self,
        repo_id: i64,
        commit_hash: &str,
        file_path: &str,
    ) -> Result<Arc<Vec<u8>>> {
        let request = ContentRequest::new(commit_hash, file_path);
        self.file_contents(repo_id, std::slice::from_ref(&request))?
            .remove(&request)
            .ok_or_else(|| GitchronError::NotFound(format!("{} at {}", file_path, commit_hash)))
    }

    /// Every recorded change to `file_path`, oldest first.
    pub fn file_timeline(&self, repo_id: i64, file_path: &str) -> Result<Arc<Vec<TimelineEntry>>> {
        self.get_repository(repo_id)?;
        let store = &self.inner.store;
        self.inner
            .timelines
            .get_or_fetch((repo_id, file_path.to_string()), || {
                Ok(Arc::new(store.file_timeline(repo_id, file_path)?))
            })
    }
}

impl Inner {
    fn invalidate(&self, repo_id: i64) {
        self.contents.invalidate_where(|k| k.repo_id == repo_id);
        self.timelines.invalidate_where(|(id, _)| *id == repo_id);
    }

    fn load_repository(&self, repo_id: i64) -> Result<Repository> {
        self.store
            .get_repository(repo_id)?
            .ok_or_else(|| GitchronError::NotFound(format!("repository {}", repo_id)))
    }

    /// Records the stage in memory and in the store.
    fn report(
        &self,
        job: &Job,
        stage: JobStage,
        progress: i32,
        message: impl Into<String>,
    ) -> Result<()> {
        let visible = job.writer.stage(stage, progress, message);
        self.store
            .update_progress(job.repo_id, RepoStatus::Analyzing, visible, None)
    }

    fn run_job(&self, job: Job) {
        let result = match job.kind {
            JobKind::Analyze => self.run_analyze(&job),
            JobKind::FetchMore { additional_depth } => self.run_fetch_more(&job, additional_depth),
        };

        match result {
            Ok(summary) => {
                job.writer.complete();
                info!(
                    repo_id = job.repo_id,
                    indexed = summary.commits_indexed,
                    already_indexed = summary.commits_already_indexed,
                    filtered = summary.commits_filtered,
                    file_changes = summary.file_changes,
                    warnings = summary.warnings.len(),
                    "analysis complete"
                );
                self.summaries.lock().insert(job.repo_id, summary);
            }
            Err(e) => {
                let message = e.to_string();
                warn!(repo_id = job.repo_id, error = %message, "analysis failed");
                if let Err(store_err) = self.store.update_progress(
                    job.repo_id,
                    RepoStatus::Failed,
                    PROGRESS_FAILED,
                    Some(&message),
                ) {
                    error!(repo_id = job.repo_id, error = %store_err, "failed to record failure");
                }
                job.writer.fail(message);
            }
        }
    }

    fn run_analyze(&self, job: &Job) -> Result<IngestSummary> {
        let mut repo = self.load_repository(job.repo_id)?;
        let options = repo.options();

        job.check_cancel()?;
        self.report(job, JobStage::Cloning, 0, format!("cloning {}", repo.url))?;
        self.clones.clone(&repo.url, &repo.local_path, &options)?;

        // Rows from an earlier analysis go only after the new clone is in place.
        let previous = self.store.count_commits(repo.id)?;
        if previous > 0 {
            self.store.clear_history(repo.id)?;
            self.invalidate(repo.id);
            info!(repo_id = repo.id, purged = previous, "previous history purged");
        }
        self.report(job, JobStage::Cloning, CLONE_DONE, "clone complete")?;

        self.ingest(job, &mut repo, HashSet::new())
    }

    fn run_fetch_more(&self, job: &Job, additional_depth: u32) -> Result<IngestSummary> {
        let mut repo = self.load_repository(job.repo_id)?;

        job.check_cancel()?;
        let message = format!("fetching {} more commits", additional_depth);
        self.report(job, JobStage::Cloning, 0, message)?;
        // Old boundaries were diffed as roots; they get real parents now.
        let boundaries = boundaries_at(&repo.local_path)?;
        let outcome = self.clones.fetch_more_history(&repo.local_path, additional_depth)?;
        if let FetchOutcome::Deepened { still_shallow } = outcome {
            if repo.analyze_depth >= 0 {
                let extra = i32::try_from(additional_depth).unwrap_or(i32::MAX);
                repo.analyze_depth = repo.analyze_depth.saturating_add(extra);
            }
            info!(repo_id = repo.id, depth = repo.analyze_depth, still_shallow, "history deepened");
        }
        self.report(job, JobStage::Cloning, CLONE_DONE, "fetch complete")?;

        self.ingest(job, &mut repo, boundaries)
    }

    /// Metadata, history walk, then batched extract-and-persist.
    fn ingest(
        &self,
        job: &Job,
        repo: &mut Repository,
        reextract: HashSet<String>,
    ) -> Result<IngestSummary> {
        job.check_cancel()?;
        self.report(job, JobStage::ParsingMetadata, CLONE_DONE, "reading repository metadata")?;
        repo.total_files = head_file_count(&repo.local_path)? as i64;
        repo.repo_size = directory_size(&repo.local_path) as i64;
        repo.can_load_more = is_shallow(&repo.local_path)?;
        let roots = boundaries_at(&repo.local_path)?;
        self.report(job, JobStage::ParsingMetadata, METADATA_DONE, "metadata read")?;

        job.check_cancel()?;
        self.report(job, JobStage::ParsingCommits, METADATA_DONE, "parsing commit history")?;
        let options = repo.options();
        let writer = &job.writer;
        let parsed = self.history.parse_commits_with_options(
            &repo.local_path,
            repo.id,
            &options,
            &mut |done, total| {
                if total > 0 {
                    let span = (PARSE_DONE - METADATA_DONE) as usize;
                    writer.advance(METADATA_DONE + (span * done / total) as i32);
                }
            },
        )?;
        let in_range = parsed.commits.len();
        self.report(
            job,
            JobStage::ParsingCommits,
            PARSE_DONE,
            format!("{} commits in range", in_range),
        )?;

        let mut summary = IngestSummary {
            commits_filtered: parsed.filtered,
            warnings: parsed.warnings,
            ..IngestSummary::default()
        };

        let mut indexed = self.store.indexed_commit_hashes(repo.id)?;
        // Former boundaries drop their root diffs first, so a run that dies
        // before reaching them retries them next time.
        let root_diffs: HashMap<String, Vec<FileChange>> = reextract
            .iter()
            .filter(|hash| indexed.contains(*hash))
            .map(|hash| (hash.clone(), Vec::new()))
            .collect();
        self.store.upsert_file_changes(repo.id, &root_diffs)?;
        indexed.retain(|hash| !reextract.contains(hash));
        // Every row takes its final position in one transaction, so an aborted
        // extraction still leaves orders 1..N.
        self.store.upsert_commits(&parsed.commits)?;
        let fresh: Vec<CommitRecord> = parsed
            .commits
            .into_iter()
            .filter(|c| !indexed.contains(&c.commit_hash))
            .collect();
        summary.commits_already_indexed = in_range - fresh.len();

        self.extract_and_persist(job, repo, &fresh, &roots, &mut summary)?;

        repo.total_commits = self.store.count_commits(repo.id)? as i64;
        repo.status = RepoStatus::Done;
        repo.analyze_progress = 100;
        repo.error_message = None;
        self.store.update_repository(repo)?;
        Ok(summary)
    }

    fn extract_and_persist(
        &self,
        job: &Job,
        repo: &Repository,
        commits: &[CommitRecord],
        roots: &HashSet<String>,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        let total = commits.len();
        if total == 0 {
            return Ok(());
        }
        let filter = PathFilter::new(&repo.analyze_path_filters)?;
        let mut done = 0usize;

        for batch in commits.chunks(self.config.batch_size) {
            job.check_cancel()?;
            let base = PARSE_DONE + (PERSIST_SPAN as usize * done / total) as i32;
            self.report(
                job,
                JobStage::ExtractingChanges,
                base,
                format!("extracting changes {}/{}", done, total),
            )?;

            let hashes: Vec<String> = batch.iter().map(|c| c.commit_hash.clone()).collect();
            let changes = match self.extractor.parse_file_changes_batch(
                &repo.local_path,
                repo.id,
                &hashes,
                &filter,
            ) {
                Ok(changes) => changes,
                Err(e) => {
                    // Commits still land; their stats stay lazy.
                    warn!(
                        repo_id = repo.id,
                        error = %e,
                        commits = batch.len(),
                        "file change extraction failed"
                    );
                    summary.warnings.push(format!(
                        "file changes unavailable for {} commits: {}",
                        batch.len(),
                        e
                    ));
                    HashMap::new()
                }
            };

            // Filtered change lists do not describe the whole commit, and
            // shallow boundaries were diffed against an empty tree.
            let mut with_stats = Vec::new();
            if filter.is_empty() {
                for record in batch.iter().filter(|c| !roots.contains(&c.commit_hash)) {
                    if let Some(files) = changes.get(&record.commit_hash) {
                        let stats = CommitStats::from_changes(files);
                        let mut record = record.clone();
                        record.additions = Some(stats.additions);
                        record.deletions = Some(stats.deletions);
                        record.files_changed = Some(stats.files_changed);
                        with_stats.push(record);
                    }
                }
            }

            self.report(
                job,
                JobStage::Persisting,
                base,
                format!("persisting {} commits", batch.len()),
            )?;
            self.store.upsert_file_changes(repo.id, &changes)?;
            self.store.upsert_commits(&with_stats)?;

            done += batch.len();
            summary.commits_indexed += batch.len();
            summary.file_changes += changes.values().map(Vec::len).sum::<usize>();
            let reached = PARSE_DONE + (PERSIST_SPAN as usize * done / total) as i32;
            let message = format!("persisted {}/{}", done, total);
            self.report(job, JobStage::Persisting, reached, message)?;
        }
        Ok(())
    }

    /// Loads blobs from the working copy, falling back to stored snapshots.
    fn load_contents(
        &self,
        repo: &Repository,
        keys: &[ContentKey],
    ) -> Result<HashMap<ContentKey, Arc<Vec<u8>>>> {
        let mut out = HashMap::new();

        if repo.local_path.exists() {
            let requests: Vec<ContentRequest> = keys.iter().map(ContentKey::request).collect();
            match self.extractor.prefetch_file_contents(&repo.local_path, &requests) {
                Ok(blobs) => {
                    for key in keys {
                        if let Some(bytes) = blobs.get(&key.request()) {
                            out.insert(key.clone(), Arc::new(bytes.clone()));
                        }
                    }
                }
                Err(e) => warn!(repo_id = repo.id, error = %e, "content prefetch failed"),
            }
        }

        let missing: Vec<&ContentKey> = keys.iter().filter(|k| !out.contains_key(*k)).collect();
        if missing.is_empty() {
            return Ok(out);
        }
        let mut hashes: Vec<String> = missing.iter().map(|k| k.commit_hash.clone()).collect();
        hashes.sort();
        hashes.dedup();
        let changes = self.store.file_changes(repo.id, &hashes)?;
        for key in missing {
            let content_hash = changes
                .get(&key.commit_hash)
                .and_then(|files| files.iter().find(|f| f.file_path == key.file_path))
                .and_then(|f| f.content_hash.as_deref());
            if let Some(hash) = content_hash {
                if let Some(bytes) = self.store.get_snapshot(hash)? {
                    out.insert(key.clone(), Arc::new(bytes));
                }
            }
        }
        Ok(out)
    }
}
