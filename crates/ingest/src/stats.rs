use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use gitchron_types::{CommitStats, GitchronError, PipelineConfig, Result};
use rayon::prelude::*;
use tracing::debug;

use crate::clone::shallow_boundaries;
use crate::command::GitCommand;

/// One way of computing commit-level line statistics.
pub trait StatsStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns calculated stats, or an error when this strategy cannot
    /// produce them for `commit_hash`.
    fn try_compute(&self, local_path: &Path, commit_hash: &str) -> Result<CommitStats>;
}

/// Diffs the commit against its first parent inside the process.
pub struct InProcessDiff {
    rename_threshold: u16,
}

impl InProcessDiff {
    pub fn new(rename_threshold: u8) -> Self {
        Self {
            rename_threshold: u16::from(rename_threshold),
        }
    }
}

impl StatsStrategy for InProcessDiff {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn try_compute(&self, local_path: &Path, commit_hash: &str) -> Result<CommitStats> {
        let repo = git2::Repository::open(local_path)?;
        let oid = git2::Oid::from_str(commit_hash)
            .map_err(|e| GitchronError::StatsUnavailable(e.message().to_string()))?;
        let commit = repo.find_commit(oid)?;

        if shallow_boundaries(&repo).contains(&commit.id().to_string()) {
            return Err(GitchronError::StatsUnavailable(format!(
                "{} is a shallow boundary, parent objects are absent",
                commit_hash
            )));
        }

        let parent_tree = if commit.parent_count() > 0 {
            let parent = commit
                .parent(0)
                .map_err(|e| GitchronError::StatsUnavailable(e.message().to_string()))?;
            Some(parent.tree()?)
        } else {
            None
        };
        let tree = commit.tree()?;

        let mut diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
        let mut find = git2::DiffFindOptions::new();
        find.renames(true).rename_threshold(self.rename_threshold);
        diff.find_similar(Some(&mut find))?;

        let stats = diff.stats()?;
        Ok(CommitStats {
            additions: stats.insertions() as u32,
            deletions: stats.deletions() as u32,
            files_changed: stats.files_changed() as u32,
            calculated: true,
        })
    }
}

/// Runs `git diff-tree --numstat` against the first parent, bounded by a timeout.
pub struct GitNumstat {
    git: GitCommand,
    timeout: Duration,
    rename_threshold: u8,
}

impl GitNumstat {
    pub fn new(git: GitCommand, timeout: Duration, rename_threshold: u8) -> Self {
        Self {
            git,
            timeout,
            rename_threshold,
        }
    }
}

impl StatsStrategy for GitNumstat {
    fn name(&self) -> &'static str {
        "git-numstat"
    }

    fn try_compute(&self, local_path: &Path, commit_hash: &str) -> Result<CommitStats> {
        if commit_hash.is_empty() || !commit_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(GitchronError::StatsUnavailable(format!(
                "'{}' is not a commit id",
                commit_hash
            )));
        }
        let parent = format!("{}^", commit_hash);
        let rename = format!("-M{}%", self.rename_threshold);
        let out = self.git.run(
            &["diff-tree", "-r", "--numstat", "--no-commit-id", &rename, &parent, commit_hash],
            Some(local_path),
            self.timeout,
        )?;
        Ok(parse_numstat(&String::from_utf8_lossy(&out)))
    }
}

/// Sums `--numstat` lines. Binary entries count as changed files with no lines.
fn parse_numstat(text: &str) -> CommitStats {
    let mut stats = CommitStats {
        calculated: true,
        ..CommitStats::default()
    };
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.splitn(3, '\t');
        let added = parts.next().unwrap_or("-");
        let deleted = parts.next().unwrap_or("-");
        stats.additions += added.parse::<u32>().unwrap_or(0);
        stats.deletions += deleted.parse::<u32>().unwrap_or(0);
        stats.files_changed += 1;
    }
    stats
}

/// Tries each strategy in order and never fails: when none succeeds the
/// result is zeroed with `calculated = false`.
pub struct StatsCalculator {
    strategies: Vec<Box<dyn StatsStrategy>>,
}

impl StatsCalculator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_strategies(vec![
            Box::new(InProcessDiff::new(config.rename_threshold)),
            Box::new(GitNumstat::new(
                GitCommand::detect(),
                config.stats_timeout,
                config.rename_threshold,
            )),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn StatsStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn calculate_commit_stats(&self, local_path: &Path, commit_hash: &str) -> CommitStats {
        for strategy in &self.strategies {
            match strategy.try_compute(local_path, commit_hash) {
                Ok(stats) => return stats,
                Err(e) => {
                    debug!(
                        commit = %commit_hash,
                        strategy = strategy.name(),
                        error = %e,
                        "stats strategy failed"
                    );
                }
            }
        }
        CommitStats::unavailable()
    }

    pub fn calculate_stats_batch(
        &self,
        local_path: &Path,
        commit_hashes: &[String],
    ) -> HashMap<String, CommitStats> {
        commit_hashes
            .par_iter()
            .map(|hash| (hash.clone(), self.calculate_commit_stats(local_path, hash)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::CloneManager;
    use crate::testutil::{commit_file, commit_files, file_url, init_repo};
    use gitchron_types::AnalyzeOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Failing(Arc<AtomicUsize>);

    impl StatsStrategy for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn try_compute(&self, _: &Path, hash: &str) -> Result<CommitStats> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(GitchronError::StatsUnavailable(hash.to_string()))
        }
    }

    struct Fixed;

    impl StatsStrategy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn try_compute(&self, _: &Path, _: &str) -> Result<CommitStats> {
            Ok(CommitStats {
                additions: 7,
                deletions: 2,
                files_changed: 1,
                calculated: true,
            })
        }
    }

    #[test]
    fn test_parse_numstat() {
        let stats = parse_numstat("3\t1\ta.rs\n-\t-\tlogo.png\n10\t0\tb.rs\n");
        assert_eq!(stats.additions, 13);
        assert_eq!(stats.deletions, 1);
        assert_eq!(stats.files_changed, 3);
        assert!(stats.calculated);
        assert_eq!(parse_numstat("").files_changed, 0);
    }

    #[test]
    fn test_falls_through_to_next_strategy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calc = StatsCalculator::with_strategies(vec![
            Box::new(Failing(calls.clone())),
            Box::new(Fixed),
        ]);
        let stats = calc.calculate_commit_stats(Path::new("/nowhere"), "abc");
        assert_eq!(stats.additions, 7);
        assert!(stats.calculated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_failing_is_uncalculated_not_error() {
        let failing = Failing(Arc::new(AtomicUsize::new(0)));
        let calc = StatsCalculator::with_strategies(vec![Box::new(failing)]);
        assert_eq!(
            calc.calculate_commit_stats(Path::new("/nowhere"), "abc"),
            CommitStats::unavailable()
        );

        let real = StatsCalculator::new(&PipelineConfig::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let stats = real.calculate_commit_stats(dir.path(), &"a".repeat(40));
        assert!(!stats.calculated);
        assert_eq!((stats.additions, stats.deletions, stats.files_changed), (0, 0, 0));
    }

    #[test]
    fn test_strategies_agree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(dir.path());
        commit_files(&repo, &[("a.txt", Some("1\n2\n3\n")), ("b.txt", Some("x\n"))], "init", 1_000);
        let c2 = commit_files(
            &repo,
            &[("a.txt", Some("1\ntwo\n3\n4\n")), ("b.txt", None), ("c.txt", Some("new\n"))],
            "change",
            1_001,
        )
        .to_string();

        let in_process = InProcessDiff::new(50).try_compute(dir.path(), &c2).expect("in-process");
        let numstat = GitNumstat::new(GitCommand::detect(), Duration::from_secs(30), 50)
            .try_compute(dir.path(), &c2)
            .expect("numstat");
        assert_eq!(in_process, numstat);
        assert_eq!(in_process.additions, 3);
        assert_eq!(in_process.deletions, 2);
        assert_eq!(in_process.files_changed, 3);
    }

    #[test]
    fn test_root_commit_in_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(dir.path());
        let c1 = commit_file(&repo, "a.txt", "1\n2\n", "init", 1_000).to_string();

        let calc = StatsCalculator::new(&PipelineConfig::default());
        let stats = calc.calculate_commit_stats(dir.path(), &c1);
        assert!(stats.calculated);
        assert_eq!((stats.additions, stats.files_changed), (2, 1));
    }

    #[test]
    fn test_shallow_boundary_is_uncalculated() {
        let upstream = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(upstream.path());
        for i in 0..4 {
            commit_file(&repo, "log.txt", &format!("{i}\n"), "c", 1_000 + i);
        }

        let work = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            workspace_root: work.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let mgr = CloneManager::new(&config);
        let dest = mgr.local_path_for(1, "up");
        let opts = AnalyzeOptions {
            depth: 2,
            shallow: true,
            ..AnalyzeOptions::default()
        };
        mgr.clone(&file_url(upstream.path()), &dest, &opts).expect("clone");

        let clone = git2::Repository::open(&dest).expect("open");
        let boundary = shallow_boundaries(&clone).into_iter().next().expect("boundary");
        let head = clone.head().expect("head").target().expect("oid").to_string();

        let calc = StatsCalculator::new(&config);
        let batch = calc.calculate_stats_batch(&dest, &[boundary.clone(), head.clone()]);
        assert!(!batch[&boundary].calculated);
        let tip = batch[&head];
        assert!(tip.calculated);
        assert_eq!((tip.additions, tip.deletions, tip.files_changed), (1, 1, 1));
    }
}
