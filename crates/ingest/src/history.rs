use std::collections::HashSet;
use std::path::Path;

use gitchron_types::{short_hash, AnalyzeOptions, CommitRecord, GitchronError, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};

use crate::clone::shallow_boundaries;

/// Progress is reported after this many commits, and once at the end.
pub const PROGRESS_EVERY: usize = 100;

/// Inclusion test built from `pathFilters`. Entries without glob
/// metacharacters are directory/file prefixes; the rest are globs.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    prefixes: Vec<String>,
    globs: Option<GlobSet>,
}

impl PathFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut prefixes = Vec::new();
        let mut builder = GlobSetBuilder::new();
        let mut glob_count = 0;

        for raw in patterns {
            let pattern = raw.trim().trim_start_matches("./");
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains(|c: char| matches!(c, '*' | '?' | '[' | '{')) {
                // A bare `*.rs` matches at any depth, like an ignore rule.
                let pattern = if pattern.contains('/') {
                    pattern.to_string()
                } else {
                    format!("**/{}", pattern)
                };
                let glob = GlobBuilder::new(&pattern)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| {
                        GitchronError::Config(format!("bad path filter '{}': {}", raw, e))
                    })?;
                builder.add(glob);
                glob_count += 1;
            } else {
                prefixes.push(pattern.trim_end_matches('/').to_string());
            }
        }

        let globs = if glob_count > 0 {
            Some(
                builder
                    .build()
                    .map_err(|e| GitchronError::Config(format!("bad path filters: {}", e)))?,
            )
        } else {
            None
        };
        Ok(Self { prefixes, globs })
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.globs.is_none()
    }

    /// Everything matches an empty filter.
    pub fn matches(&self, path: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        let prefix_hit = self.prefixes.iter().any(|p| {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        prefix_hit || self.globs.as_ref().is_some_and(|g| g.is_match(path))
    }
}

/// Ordered result of a history walk.
#[derive(Debug, Default)]
pub struct ParsedHistory {
    /// Oldest first, `commit_order` 1..N.
    pub commits: Vec<CommitRecord>,
    /// Commits inside the depth window dropped by the time or path filters.
    pub filtered: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommitHistoryParser;

impl CommitHistoryParser {
    pub fn new() -> Self {
        CommitHistoryParser
    }

    /// Walks HEAD's history into commit records under `options`.
    ///
    /// `progress` receives `(processed, total)` every [`PROGRESS_EVERY`]
    /// commits and once when the walk is done.
    pub fn parse_commits_with_options(
        &self,
        local_path: &Path,
        repo_id: i64,
        options: &AnalyzeOptions,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<ParsedHistory> {
        let repo = git2::Repository::open(local_path)
            .map_err(|e| {
                GitchronError::Parse(format!(
                    "cannot open {}: {}",
                    local_path.display(),
                    e.message()
                ))
            })?;
        let filter = PathFilter::new(&options.path_filters)?;
        let boundaries = shallow_boundaries(&repo);
        let mut parsed = ParsedHistory::default();

        if let Err(e) = repo.head() {
            if matches!(e.code(), git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound) {
                debug!(path = %local_path.display(), "HEAD is unborn, no history");
                progress(0, 0);
                return Ok(parsed);
            }
            return Err(GitchronError::Parse(e.message().to_string()));
        }

        // Pass 1: newest-first ids inside the depth window.
        let mut walk = repo.revwalk().map_err(parse_err)?;
        walk.push_head().map_err(parse_err)?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)
            .map_err(parse_err)?;

        let limit = options.depth_limit().unwrap_or(usize::MAX);
        let mut oids = Vec::new();
        for oid in walk {
            if oids.len() >= limit {
                break;
            }
            match oid {
                Ok(oid) => oids.push(oid),
                Err(e) => {
                    // Missing parents past a shallow cut surface here on older libgit2.
                    parsed.warnings.push(format!("revwalk stopped early: {}", e.message()));
                    break;
                }
            }
        }

        // Pass 2: load and filter.
        let total = oids.len();
        let mut kept = Vec::with_capacity(total);
        for (idx, oid) in oids.iter().enumerate() {
            if idx > 0 && idx % PROGRESS_EVERY == 0 {
                progress(idx, total);
            }

            let commit = match repo.find_commit(*oid) {
                Ok(c) => c,
                Err(e) => {
                    parsed.warnings.push(format!("failed to load commit {}: {}", oid, e.message()));
                    continue;
                }
            };

            let commit_time = commit.time().seconds();
            if !options.in_window(commit_time) {
                parsed.filtered += 1;
                continue;
            }

            let hash = oid.to_string();
            if !filter.is_empty() {
                let paths = match touched_paths(&repo, &commit, boundaries.contains(&hash)) {
                    Ok(paths) => paths,
                    Err(e) => {
                        parsed.warnings.push(format!("failed to diff commit {}: {}", hash, e));
                        Vec::new()
                    }
                };
                if !paths.iter().any(|p| filter.matches(p)) {
                    parsed.filtered += 1;
                    continue;
                }
            }

            let parents = raw_parents(&commit);
            let author = commit.author();
            kept.push(CommitRecord {
                repo_id,
                short_hash: short_hash(&hash),
                commit_hash: hash,
                parent_hash: parents.first().cloned(),
                author_name: author.name().unwrap_or("").to_string(),
                author_email: author.email().unwrap_or("").to_string(),
                message: commit.message().unwrap_or("").to_string(),
                commit_time,
                additions: None,
                deletions: None,
                files_changed: None,
                is_merge: parents.len() > 1,
                commit_order: 0,
            });
        }
        progress(total, total);

        kept.reverse();
        for (idx, record) in kept.iter_mut().enumerate() {
            record.commit_order = idx as i64 + 1;
        }

        for w in &parsed.warnings {
            warn!(path = %local_path.display(), "{}", w);
        }
        info!(
            path = %local_path.display(),
            considered = total,
            kept = kept.len(),
            filtered = parsed.filtered,
            "parsed commit history"
        );
        parsed.commits = kept;
        Ok(parsed)
    }
}

fn parse_err(e: git2::Error) -> GitchronError {
    GitchronError::Parse(e.message().to_string())
}

/// Parent ids as written in the commit object, ignoring shallow grafts.
pub fn raw_parents(commit: &git2::Commit) -> Vec<String> {
    match commit.raw_header() {
        Some(header) => header
            .lines()
            .take_while(|l| !l.is_empty())
            .filter_map(|l| l.strip_prefix("parent "))
            .map(|p| p.trim().to_string())
            .collect(),
        None => commit.parent_ids().map(|id| id.to_string()).collect(),
    }
}

/// Paths changed by `commit` relative to its first parent. Roots and shallow
/// boundaries are compared with the empty tree.
fn touched_paths(
    repo: &git2::Repository,
    commit: &git2::Commit,
    is_boundary: bool,
) -> Result<Vec<String>> {
    let tree = commit.tree()?;
    let parent_tree = if is_boundary || commit.parent_count() == 0 {
        None
    } else {
        Some(commit.parent(0)?.tree()?)
    };

    let mut opts = git2::DiffOptions::new();
    opts.skip_binary_check(true);
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;

    let mut paths = Vec::new();
    for delta in diff.deltas() {
        for file in [delta.old_file(), delta.new_file()] {
            if let Some(p) = file.path().and_then(|p| p.to_str()) {
                if paths.last().map(String::as_str) != Some(p) {
                    paths.push(p.to_string());
                }
            }
        }
    }
    Ok(paths)
}

/// Number of blobs in HEAD's tree; zero for an unborn HEAD.
pub fn head_file_count(local_path: &Path) -> Result<usize> {
    let repo = git2::Repository::open(local_path)
        .map_err(|e| GitchronError::Parse(e.message().to_string()))?;
    let tree = match repo.head().and_then(|h| h.peel_to_tree()) {
        Ok(tree) => tree,
        Err(_) => return Ok(0),
    };
    let mut count = 0usize;
    tree.walk(git2::TreeWalkMode::PreOrder, |_, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob) {
            count += 1;
        }
        git2::TreeWalkResult::Ok
    })?;
    Ok(count)
}

/// Ids recorded as shallow boundaries of the working copy at `local_path`.
pub fn boundaries_at(local_path: &Path) -> Result<HashSet<String>> {
    let repo = git2::Repository::open(local_path)
        .map_err(|e| GitchronError::Parse(e.message().to_string()))?;
    Ok(shallow_boundaries(&repo))
}
