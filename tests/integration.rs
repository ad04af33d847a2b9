use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use gitchron_pipeline::AnalysisOrchestrator;
use gitchron_store::SqliteStore;
use gitchron_types::{AnalyzeOptions, ChangeType, PipelineConfig, RepoStatus, Store};

fn commit(repo: &git2::Repository, files: &[(&str, &str)], message: &str, time: i64) -> String {
    let workdir = repo.workdir().unwrap().to_path_buf();
    let mut index = repo.index().unwrap();
    for (path, content) in files {
        let full = workdir.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, content).unwrap();
        index.add_path(Path::new(path)).unwrap();
    }
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig =
        git2::Signature::new("Test User", "test@example.com", &git2::Time::new(time, 0)).unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
        .to_string()
}

fn sample_repo(path: &Path) -> Vec<String> {
    let repo = git2::Repository::init(path).unwrap();
    vec![
        commit(
            &repo,
            &[("README.md", "# Test Repo\n")],
            "initial commit: add README",
            1_700_000_000,
        ),
        commit(&repo, &[("src/main.rs", "fn main() {}\n")], "add main.rs", 1_700_000_100),
        commit(
            &repo,
            &[("src/main.rs", "fn main() {\n    println!(\"hi\");\n}\n")],
            "print greeting",
            1_700_000_200,
        ),
    ]
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end() {
    // 1. A real repository and an on-disk database
    let repo_dir = tempfile::tempdir().unwrap();
    let shas = sample_repo(repo_dir.path());
    let state = tempfile::tempdir().unwrap();
    let db_path = state.path().join("test.sqlite3");

    // 2. Analyze through the pipeline
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let config = PipelineConfig {
        workspace_root: state.path().join("clones"),
        ..PipelineConfig::default()
    };
    let orch = AnalysisOrchestrator::new(store.clone(), config).unwrap();
    let url = format!("file://{}", repo_dir.path().display());
    let repo = orch.analyze(&url, AnalyzeOptions::default()).unwrap();
    let repo = orch.wait(repo.id).await.unwrap();
    assert_eq!(repo.status, RepoStatus::Done, "{:?}", repo.error_message);
    assert_eq!(repo.total_commits, 3);

    // 3. Rows survive a reopen of the database
    drop(orch);
    let reopened = SqliteStore::open(&db_path).unwrap();
    let commits = reopened.list_commits(repo.id, 0, 10).unwrap();
    let hashes: Vec<&str> = commits.iter().map(|c| c.commit_hash.as_str()).collect();
    assert_eq!(hashes, shas.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(commits[0].subject(), "initial commit: add README");

    // 4. Timeline of a file across commits
    let timeline = reopened.file_timeline(repo.id, "src/main.rs").unwrap();
    let kinds: Vec<ChangeType> = timeline.iter().map(|e| e.change_type).collect();
    assert_eq!(kinds, vec![ChangeType::Add, ChangeType::Modify]);
    assert_eq!((timeline[1].additions, timeline[1].deletions), (3, 1));
}

#[test]
fn test_cli_analyze_and_query() {
    let repo_dir = tempfile::tempdir().unwrap();
    let shas = sample_repo(repo_dir.path());
    let home = tempfile::tempdir().unwrap();
    let url = format!("file://{}", repo_dir.path().display());

    let run = |args: &[&str]| {
        let output = Command::new(env!("CARGO_BIN_EXE_gitchron"))
            .arg("--home")
            .arg(home.path())
            .args(args)
            .env_remove("GITCHRON_DB")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "gitchron {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap()
    };

    let out = run(&["analyze", &url]);
    assert!(out.contains("3 commits indexed"), "{}", out);
    assert!(home.path().join("db.sqlite3").exists());

    let commits = run(&["commits", "1"]);
    assert_eq!(commits.lines().count(), 3);
    assert!(commits.contains("print greeting"));

    let status: serde_json::Value = serde_json::from_str(&run(&["status", "1"])).unwrap();
    assert_eq!(status["repository"]["status"], "DONE");
    assert_eq!(status["progress"]["progress"], 100);

    let stats: serde_json::Value = serde_json::from_str(&run(&["stats", "1", &shas[2]])).unwrap();
    assert_eq!(stats["additions"], 3);
    assert_eq!(stats["calculated"], true);

    assert_eq!(run(&["content", "1", &shas[0], "README.md"]), "# Test Repo\n");

    run(&["delete", "1"]);
    assert_eq!(run(&["status"]).lines().count(), 1, "only the header remains");
    let missing = Command::new(env!("CARGO_BIN_EXE_gitchron"))
        .arg("--home")
        .arg(home.path())
        .args(["commits", "1"])
        .env_remove("GITCHRON_DB")
        .output()
        .unwrap();
    assert!(!missing.status.success());
}
