use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use gitchron_types::{
    file_extension, ChangeType, ContentRequest, FileChange, GitchronError, PipelineConfig, Result,
};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::clone::shallow_boundaries;
use crate::command::GitCommand;
use crate::history::{raw_parents, PathFilter};

const NULL_OID_40: &str = "0000000000000000000000000000000000000000";

/// Derives per-file change records through batched `git diff-tree --stdin`.
pub struct FileChangeExtractor {
    git: GitCommand,
    diff_timeout: Duration,
    chunk_size: usize,
    rename_threshold: u8,
    max_diff_bytes: usize,
    snapshot_contents: bool,
}

/// One commit's diff request: the commit and, for merges, the first parent to
/// compare against.
#[derive(Debug, Clone)]
struct DiffTarget {
    commit: String,
    parent: Option<String>,
}

impl DiffTarget {
    fn stdin_line(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{} {}\n", self.commit, parent),
            None => format!("{}\n", self.commit),
        }
    }
}

impl FileChangeExtractor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            git: GitCommand::detect(),
            diff_timeout: config.diff_timeout,
            chunk_size: config.diff_chunk_size.max(1),
            rename_threshold: config.rename_threshold,
            max_diff_bytes: config.max_diff_bytes,
            snapshot_contents: config.snapshot_contents,
        }
    }

    /// File changes for every hash in `commit_hashes`, keyed by commit.
    ///
    /// Hashes that do not name a commit are absent from the map. Chunks run
    /// in parallel; a failing chunk is logged and skipped unless every chunk
    /// fails.
    pub fn parse_file_changes_batch(
        &self,
        local_path: &Path,
        repo_id: i64,
        commit_hashes: &[String],
        filter: &PathFilter,
    ) -> Result<HashMap<String, Vec<FileChange>>> {
        let targets = resolve_targets(local_path, commit_hashes)?;
        if targets.is_empty() {
            return Ok(HashMap::new());
        }

        let chunk_results: Vec<Result<Vec<(String, Vec<RawChange>)>>> = targets
            .par_chunks(self.chunk_size)
            .map(|chunk| self.diff_tree_chunk(local_path, chunk))
            .collect();

        let mut raw: HashMap<String, Vec<RawChange>> = HashMap::new();
        let mut first_err = None;
        let chunk_count = chunk_results.len();
        let mut failed = 0;
        for result in chunk_results {
            match result {
                Ok(entries) => raw.extend(entries),
                Err(e) => {
                    warn!(path = %local_path.display(), error = %e, "diff-tree chunk failed");
                    failed += 1;
                    first_err.get_or_insert(e);
                }
            }
        }
        if failed == chunk_count {
            if let Some(e) = first_err {
                return Err(e);
            }
        }

        let mut out: HashMap<String, Vec<FileChange>> = raw
            .into_iter()
            .map(|(hash, entries)| {
                let changes = entries
                    .into_iter()
                    .map(|entry| entry.into_file_change(repo_id, &hash))
                    .filter(|fc| {
                        filter.matches(&fc.file_path)
                            || fc.old_path.as_deref().is_some_and(|p| filter.matches(p))
                    })
                    .collect();
                (hash, changes)
            })
            .collect();

        if self.max_diff_bytes > 0 {
            self.fill_diff_text(local_path, &targets, &mut out);
        }
        if self.snapshot_contents {
            self.fill_snapshots(local_path, &mut out);
        }

        debug!(
            path = %local_path.display(),
            commits = out.len(),
            files = out.values().map(Vec::len).sum::<usize>(),
            "extracted file changes"
        );
        Ok(out)
    }

    /// Single-commit form of [`FileChangeExtractor::parse_file_changes_batch`].
    pub fn parse_file_changes(
        &self,
        local_path: &Path,
        repo_id: i64,
        commit_hash: &str,
        filter: &PathFilter,
    ) -> Result<Vec<FileChange>> {
        let mut map =
            self.parse_file_changes_batch(local_path, repo_id, &[commit_hash.to_string()], filter)?;
        map.remove(commit_hash)
            .ok_or_else(|| GitchronError::NotFound(format!("commit {}", commit_hash)))
    }

    /// Loads many `(commit, path)` blobs through one `git cat-file --batch`.
    /// Paths that do not resolve to a blob are absent from the result.
    pub fn prefetch_file_contents(
        &self,
        local_path: &Path,
        requests: &[ContentRequest],
    ) -> Result<HashMap<ContentRequest, Vec<u8>>> {
        let mut seen = HashSet::new();
        let wanted: Vec<&ContentRequest> = requests
            .iter()
            .filter(|r| !r.file_path.contains('\n') && !r.commit_hash.contains(char::is_whitespace))
            .filter(|r| seen.insert((*r).clone()))
            .collect();
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }

        let specs: Vec<String> = wanted
            .iter()
            .map(|r| format!("{}:{}", r.commit_hash, r.file_path))
            .collect();
        let blobs = self.cat_file_batch(local_path, &specs)?;

        Ok(wanted
            .into_iter()
            .zip(blobs)
            .filter_map(|(req, blob)| blob.map(|b| (req.clone(), b)))
            .collect())
    }

    fn cat_file_batch(&self, local_path: &Path, specs: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut input = String::new();
        for spec in specs {
            input.push_str(spec);
            input.push('\n');
        }
        let out = self.git.run_with_input(
            &["cat-file", "--batch"],
            Some(local_path),
            input.into_bytes(),
            self.diff_timeout,
        )?;
        parse_cat_file_batch(&out, specs.len())
    }

    fn diff_tree_chunk(
        &self,
        local_path: &Path,
        chunk: &[DiffTarget],
    ) -> Result<Vec<(String, Vec<RawChange>)>> {
        let rename = format!("-M{}%", self.rename_threshold);
        let copy = format!("-C{}%", self.rename_threshold);
        let args = [
            "diff-tree",
            "--stdin",
            "--always",
            "--root",
            "-r",
            "-z",
            "--raw",
            "--numstat",
            "--no-abbrev",
            rename.as_str(),
            copy.as_str(),
        ];
        let input: String = chunk.iter().map(DiffTarget::stdin_line).collect();
        let out = self
            .git
            .run_with_input(&args, Some(local_path), input.into_bytes(), self.diff_timeout)?;
        parse_diff_tree(&out)
    }

    fn fill_diff_text(
        &self,
        local_path: &Path,
        targets: &[DiffTarget],
        out: &mut HashMap<String, Vec<FileChange>>,
    ) {
        let wanted: Vec<(&DiffTarget, Vec<FileChange>)> = targets
            .iter()
            .filter_map(|t| out.remove(&t.commit).map(|changes| (t, changes)))
            .collect();

        let filled: Vec<(String, Vec<FileChange>)> = wanted
            .into_par_iter()
            .map_init(
                || git2::Repository::open(local_path).ok(),
                |repo, (target, mut changes)| {
                    if let Some(repo) = repo.as_ref() {
                        if let Err(e) = attach_patches(repo, target, &mut changes, self) {
                            // Blob-less clones lack the objects; leave the text empty.
                            debug!(commit = %target.commit, error = %e, "diff text unavailable");
                        }
                    }
                    (target.commit.clone(), changes)
                },
            )
            .collect();
        out.extend(filled);
    }

    fn fill_snapshots(&self, local_path: &Path, out: &mut HashMap<String, Vec<FileChange>>) {
        let mut ids: Vec<String> = out
            .values()
            .flatten()
            .filter(|fc| !fc.binary && fc.change_type != ChangeType::Delete)
            .filter_map(|fc| fc.content_hash.clone())
            .collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return;
        }

        let blobs = match self.cat_file_batch(local_path, &ids) {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(path = %local_path.display(), error = %e, "snapshot prefetch failed");
                return;
            }
        };
        let contents: HashMap<&str, String> = ids
            .iter()
            .zip(blobs)
            .filter_map(|(id, blob)| {
                blob.and_then(|b| String::from_utf8(b).ok()).map(|s| (id.as_str(), s))
            })
            .collect();

        for fc in out.values_mut().flatten() {
            if fc.change_type == ChangeType::Delete {
                continue;
            }
            if let Some(text) = fc.content_hash.as_deref().and_then(|h| contents.get(h)) {
                fc.file_content = Some(text.clone());
            }
        }
    }
}

/// Resolves hashes to commits present in the object store. Merges are paired
/// with their first parent; shallow boundaries are diffed as roots.
fn resolve_targets(local_path: &Path, commit_hashes: &[String]) -> Result<Vec<DiffTarget>> {
    let repo = git2::Repository::open(local_path).map_err(|e| {
        GitchronError::Ingest(format!("cannot open {}: {}", local_path.display(), e.message()))
    })?;
    let odb = repo.odb()?;
    let boundaries = shallow_boundaries(&repo);

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(commit_hashes.len());
    for hash in commit_hashes {
        if !seen.insert(hash.as_str()) {
            continue;
        }
        let commit = match git2::Oid::from_str(hash).and_then(|oid| repo.find_commit(oid)) {
            Ok(commit) => commit,
            Err(_) => {
                debug!(commit = %hash, "skipping unknown commit");
                continue;
            }
        };
        let commit_id = commit.id().to_string();
        let parents = raw_parents(&commit);
        let parent = if parents.len() > 1 && !boundaries.contains(&commit_id) {
            parents
                .first()
                .filter(|p| git2::Oid::from_str(p).is_ok_and(|oid| odb.exists(oid)))
                .cloned()
        } else {
            None
        };
        targets.push(DiffTarget {
            commit: commit_id,
            parent,
        });
    }
    Ok(targets)
}

fn attach_patches(
    repo: &git2::Repository,
    target: &DiffTarget,
    changes: &mut [FileChange],
    extractor: &FileChangeExtractor,
) -> std::result::Result<(), git2::Error> {
    if changes.iter().all(|c| c.binary) {
        return Ok(());
    }
    let commit = repo.find_commit(git2::Oid::from_str(&target.commit)?)?;
    let tree = commit.tree()?;

    // Same base as diff-tree used: explicit parent for merges, otherwise the
    // first parent unless the commit is a root or shallow cut.
    let base = match &target.parent {
        Some(parent) => Some(repo.find_commit(git2::Oid::from_str(parent)?)?.tree()?),
        None if commit.parent_count() > 0 && raw_parents(&commit).len() == 1 => {
            match commit.parent(0) {
                Ok(parent) => Some(parent.tree()?),
                Err(_) => None,
            }
        }
        None => None,
    };

    let mut diff = repo.diff_tree_to_tree(base.as_ref(), Some(&tree), None)?;
    let threshold = u16::from(extractor.rename_threshold);
    let mut find = git2::DiffFindOptions::new();
    find.renames(true)
        .copies(true)
        .rename_threshold(threshold)
        .copy_threshold(threshold);
    diff.find_similar(Some(&mut find))?;

    let mut texts: HashMap<String, String> = HashMap::new();
    for idx in 0..diff.deltas().count() {
        let Some(mut patch) = git2::Patch::from_diff(&diff, idx)? else {
            continue;
        };
        let delta = patch.delta();
        if delta.flags().is_binary() {
            continue;
        }
        let key = match delta.status() {
            git2::Delta::Deleted => delta.old_file().path(),
            _ => delta.new_file().path(),
        }
        .and_then(|p| p.to_str())
        .map(str::to_string);
        let Some(key) = key else { continue };
        let buf = patch.to_buf()?;
        if let Some(text) = buf.as_str() {
            let mut text = text.to_string();
            truncate_at_char_boundary(&mut text, extractor.max_diff_bytes);
            texts.insert(key, text);
        }
    }

    for change in changes.iter_mut().filter(|c| !c.binary) {
        change.diff_text = texts.remove(&change.file_path);
    }
    Ok(())
}

/// Truncates `text` to at most `max` bytes without splitting a character.
pub fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

// ── diff-tree output ──────────────────────────────────────────────────────

/// One entry of `--raw` output joined with its `--numstat` counts.
#[derive(Debug, Clone, PartialEq)]
struct RawChange {
    change_type: ChangeType,
    similarity: Option<u8>,
    new_oid: String,
    old_path: Option<String>,
    path: String,
    additions: u32,
    deletions: u32,
    binary: bool,
}

impl RawChange {
    fn into_file_change(self, repo_id: i64, commit_hash: &str) -> FileChange {
        let deleted = self.change_type == ChangeType::Delete;
        let content_hash =
            (!deleted && self.new_oid.bytes().any(|b| b != b'0')).then_some(self.new_oid);
        FileChange {
            repo_id,
            commit_hash: commit_hash.to_string(),
            file_extension: file_extension(&self.path),
            file_path: self.path,
            change_type: self.change_type,
            old_path: self.old_path,
            similarity: self.similarity,
            additions: self.additions,
            deletions: self.deletions,
            binary: self.binary,
            diff_text: None,
            file_content: None,
            content_hash,
        }
    }
}

fn is_object_id(token: &str) -> bool {
    (token.len() == 40 || token.len() == 64) && token.bytes().all(|b| b.is_ascii_hexdigit())
}

fn malformed(what: &str) -> GitchronError {
    GitchronError::Ingest(format!("unexpected diff-tree output: {}", what))
}

/// Parses `diff-tree --stdin -z --raw --numstat` output into per-commit entries.
fn parse_diff_tree(out: &[u8]) -> Result<Vec<(String, Vec<RawChange>)>> {
    let tokens: Vec<String> = out
        .split(|b| *b == 0)
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect();
    let mut commits = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let header = tokens[i].trim();
        i += 1;
        if header.is_empty() {
            continue;
        }
        if !is_object_id(header) {
            return Err(malformed(&format!("expected commit id, got '{}'", header)));
        }
        let commit = header.to_string();

        let mut entries: Vec<RawChange> = Vec::new();
        while i < tokens.len() && tokens[i].starts_with(':') {
            let meta: Vec<&str> = tokens[i][1..].split_whitespace().collect();
            i += 1;
            let [_, _, _, new_oid, status] = meta[..] else {
                return Err(malformed("short raw entry"));
            };
            let letter = status.chars().next().ok_or_else(|| malformed("empty status"))?;
            let score = status[letter.len_utf8()..].parse::<u8>().ok();

            let first = tokens.get(i).cloned().ok_or_else(|| malformed("missing path"))?;
            i += 1;
            let (old_path, path) = if matches!(letter, 'R' | 'C') {
                let second = tokens
                    .get(i)
                    .cloned()
                    .ok_or_else(|| malformed("missing rename target"))?;
                i += 1;
                (Some(first), second)
            } else {
                (None, first)
            };

            let Some(change_type) = ChangeType::from_status_letter(letter) else {
                debug!(
                    commit = %commit,
                    status,
                    path = %path,
                    "skipping unsupported change status"
                );
                continue;
            };
            entries.push(RawChange {
                change_type,
                similarity: if matches!(letter, 'R' | 'C') { score } else { None },
                new_oid: if new_oid == NULL_OID_40 { String::new() } else { new_oid.to_string() },
                old_path,
                path,
                additions: 0,
                deletions: 0,
                binary: false,
            });
        }

        let mut counts: HashMap<String, (u32, u32, bool)> = HashMap::new();
        while i < tokens.len() && tokens[i].contains('\t') {
            let mut parts = tokens[i].splitn(3, '\t');
            let added = parts.next().unwrap_or("-");
            let deleted = parts.next().unwrap_or("-");
            let rest = parts.next().unwrap_or("");
            i += 1;
            let path = if rest.is_empty() {
                // Renames put the old and new paths in their own tokens.
                let new_path = tokens
                    .get(i + 1)
                    .cloned()
                    .ok_or_else(|| malformed("missing numstat rename"))?;
                i += 2;
                new_path
            } else {
                rest.to_string()
            };
            let binary = added == "-" && deleted == "-";
            counts.insert(
                path,
                (
                    added.parse().unwrap_or(0),
                    deleted.parse().unwrap_or(0),
                    binary,
                ),
            );
        }

        for entry in &mut entries {
            if let Some((a, d, binary)) = counts.get(&entry.path) {
                entry.additions = *a;
                entry.deletions = *d;
                entry.binary = *binary;
            }
        }
        commits.push((commit, entries));
    }
    Ok(commits)
}

/// Splits `cat-file --batch` output into one optional blob per request.
fn parse_cat_file_batch(out: &[u8], expected: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let mut results = Vec::with_capacity(expected);
    let mut pos = 0;

    while results.len() < expected {
        let rest = &out[pos..];
        let nl = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| GitchronError::Ingest("truncated cat-file output".into()))?;
        let header = String::from_utf8_lossy(&rest[..nl]).into_owned();
        pos += nl + 1;

        if header.ends_with(" missing") || header.ends_with(" ambiguous") {
            results.push(None);
            continue;
        }
        let mut fields = header.rsplitn(3, ' ');
        let size: usize = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GitchronError::Ingest(format!("bad cat-file header '{}'", header)))?;
        let kind = fields.next().unwrap_or("");

        if pos + size > out.len() {
            return Err(GitchronError::Ingest("truncated cat-file body".into()));
        }
        let body = &out[pos..pos + size];
        pos += size + 1;
        results.push((kind == "blob").then(|| body.to_vec()));
    }
    Ok(results)
}
