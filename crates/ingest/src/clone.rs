use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gitchron_types::{AnalyzeOptions, GitchronError, PipelineConfig, Result};
use tracing::{info, warn};

use crate::command::GitCommand;

/// Result of deepening an existing working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The copy already had complete history; nothing was fetched.
    AlreadyComplete,
    Deepened { still_shallow: bool },
}

/// Creates, deepens and removes local working copies under one workspace root.
pub struct CloneManager {
    git: GitCommand,
    workspace_root: PathBuf,
    clone_timeout: Duration,
    fetch_timeout: Duration,
}

impl CloneManager {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            git: GitCommand::detect(),
            workspace_root: config.workspace_root.clone(),
            clone_timeout: config.clone_timeout,
            fetch_timeout: config.fetch_timeout,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Working-copy directory for a repository.
    pub fn local_path_for(&self, repo_id: i64, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.workspace_root.join(format!("{}-{}", repo_id, safe.trim_start_matches('.')))
    }

    /// Arguments for `git clone` under `options` (without the platform prefix).
    pub fn clone_args(url: &str, local_path: &Path, options: &AnalyzeOptions) -> Vec<String> {
        let mut args = vec!["clone".to_string(), "--no-tags".to_string()];
        if let Some(depth) = options.clone_depth() {
            args.push(format!("--depth={}", depth));
        }
        // --depth implies --single-branch, so the opposite must be explicit.
        args.push(if options.single_branch {
            "--single-branch".to_string()
        } else {
            "--no-single-branch".to_string()
        });
        if options.partial {
            args.push("--filter=blob:none".to_string());
        }
        args.push("--".to_string());
        args.push(url.to_string());
        args.push(local_path.to_string_lossy().into_owned());
        args
    }

    /// Clones `url` into `local_path`, replacing whatever was there.
    pub fn clone(&self, url: &str, local_path: &Path, options: &AnalyzeOptions) -> Result<()> {
        validate_url(url)?;

        if local_path.exists() {
            self.delete_local_repository(local_path)?;
        }
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GitchronError::Filesystem(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let args = Self::clone_args(url, local_path, options);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        info!(url, path = %local_path.display(), depth = ?options.clone_depth(), "cloning");

        let failure = match self.git.run_raw(&args, None, None, self.clone_timeout) {
            Ok(output) if output.success() => return Ok(()),
            Ok(output) => GitchronError::Clone(classify_clone_failure(&output.stderr)),
            Err(e) => e,
        };
        // Leave nothing half-written behind.
        if local_path.exists() {
            let _ = std::fs::remove_dir_all(local_path);
        }
        Err(failure)
    }

    /// Deepens a shallow working copy by `additional_depth` commits.
    pub fn fetch_more_history(
        &self,
        local_path: &Path,
        additional_depth: u32,
    ) -> Result<FetchOutcome> {
        if !is_shallow(local_path)? {
            return Ok(FetchOutcome::AlreadyComplete);
        }
        if additional_depth == 0 {
            return Ok(FetchOutcome::Deepened { still_shallow: true });
        }

        let deepen = format!("--deepen={}", additional_depth);
        info!(path = %local_path.display(), additional_depth, "deepening shallow clone");
        let output = self.git.run_raw(
            &["fetch", "--no-tags", &deepen, "origin"],
            Some(local_path),
            None,
            self.fetch_timeout,
        )?;
        if !output.success() {
            return Err(GitchronError::Clone(classify_clone_failure(&output.stderr)));
        }

        Ok(FetchOutcome::Deepened {
            still_shallow: is_shallow(local_path)?,
        })
    }

    /// Recursively removes a working copy. Paths outside the workspace root are refused.
    pub fn delete_local_repository(&self, local_path: &Path) -> Result<()> {
        if !local_path.exists() {
            return Ok(());
        }
        if !self.owns(local_path) {
            return Err(GitchronError::Filesystem(format!(
                "refusing to delete {} outside workspace {}",
                local_path.display(),
                self.workspace_root.display()
            )));
        }

        match std::fs::remove_dir_all(local_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                // Pack files are read-only on some platforms.
                clear_readonly(local_path);
                std::fs::remove_dir_all(local_path).map_err(|e| {
                    GitchronError::Filesystem(format!(
                        "cannot remove {}: {}",
                        local_path.display(),
                        e
                    ))
                })
            }
            Err(e) => Err(GitchronError::Filesystem(format!(
                "cannot remove {}: {}",
                local_path.display(),
                e
            ))),
        }
    }

    fn owns(&self, path: &Path) -> bool {
        let root = self
            .workspace_root
            .canonicalize()
            .unwrap_or_else(|_| self.workspace_root.clone());
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        path != root && path.starts_with(&root)
    }
}

fn validate_url(url: &str) -> Result<()> {
    let trimmed = url.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') || trimmed.chars().any(char::is_whitespace) {
        return Err(GitchronError::Clone(format!("invalid repository URL '{}'", url)));
    }
    Ok(())
}

/// Turns clone stderr into a short user-facing cause.
pub fn classify_clone_failure(stderr: &str) -> String {
    let lower = stderr.to_ascii_lowercase();
    let cause = if lower.contains("could not resolve host")
        || lower.contains("unable to access")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
    {
        "network unreachable"
    } else if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("does not appear to be a git repository")
    {
        "repository not found"
    } else if lower.contains("authentication")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
    {
        "repository is private or requires authentication"
    } else {
        "git clone failed"
    };

    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    if detail.is_empty() {
        cause.to_string()
    } else {
        format!("{}: {}", cause, detail)
    }
}

pub fn is_shallow(local_path: &Path) -> Result<bool> {
    let repo = git2::Repository::open(local_path)
        .map_err(|e| GitchronError::Parse(e.message().to_string()))?;
    Ok(repo.is_shallow())
}

/// Commit ids recorded as the cut-off points of a shallow clone.
pub fn shallow_boundaries(repo: &git2::Repository) -> HashSet<String> {
    match std::fs::read_to_string(repo.path().join("shallow")) {
        Ok(text) => text
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(_) => HashSet::new(),
    }
}

/// Bytes on disk under `path`, following no symlinks.
pub fn directory_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(entry.path()),
                Ok(ft) if ft.is_file() => {
                    total += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
                _ => {}
            }
        }
    }
    total
}

fn clear_readonly(path: &Path) {
    let mut stack = vec![path.to_path_buf()];
    while let Some(p) = stack.pop() {
        if let Ok(meta) = std::fs::symlink_metadata(&p) {
            let mut perms = meta.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            let _ = std::fs::set_permissions(&p, perms);
            if meta.is_dir() {
                if let Ok(entries) = std::fs::read_dir(&p) {
                    stack.extend(entries.flatten().map(|e| e.path()));
                }
            }
        }
    }
}
