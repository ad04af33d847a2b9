//! Working-copy side of the pipeline: cloning, history walks, batched file
//! change extraction and line statistics.

mod changes;
mod clone;
mod command;
mod history;
mod stats;

pub use changes::{truncate_at_char_boundary, FileChangeExtractor};
pub use clone::{
    classify_clone_failure, directory_size, is_shallow, shallow_boundaries, CloneManager,
    FetchOutcome,
};
pub use command::{GitCommand, GitOutput};
pub use history::{
    boundaries_at, head_file_count, CommitHistoryParser, ParsedHistory, PathFilter,
    PROGRESS_EVERY,
};
pub use stats::{GitNumstat, InProcessDiff, StatsCalculator, StatsStrategy};

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    /// `git init` with a fixed identity, like a fresh checkout.
    pub fn init_repo(path: &Path) -> git2::Repository {
        let repo = git2::Repository::init(path).expect("git init");
        {
            let mut config = repo.config().expect("config");
            config.set_str("user.name", "Test Author").expect("user.name");
            config.set_str("user.email", "test@example.com").expect("user.email");
        }
        repo
    }

    /// Writes one file and commits it on HEAD.
    pub fn commit_file(
        repo: &git2::Repository,
        path: &str,
        content: &str,
        message: &str,
        time: i64,
    ) -> git2::Oid {
        commit_files(repo, &[(path, Some(content))], message, time)
    }

    /// Applies writes (`Some`) and deletions (`None`), then commits on HEAD.
    pub fn commit_files(
        repo: &git2::Repository,
        files: &[(&str, Option<&str>)],
        message: &str,
        time: i64,
    ) -> git2::Oid {
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
        let tree_id = index.write_tree().expect("write tree");
        let tree = repo.find_tree(tree_id).expect("tree");

        let sig = git2::Signature::new("Test Author", "test@example.com", &git2::Time::new(time, 0))
            .expect("sig");
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .expect("commit")
    }

    pub fn file_url(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}
