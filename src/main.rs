use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gitchron_pipeline::AnalysisOrchestrator;
use gitchron_store::SqliteStore;
use gitchron_types::{AnalyzeOptions, PipelineConfig, RepoStatus, Repository};

#[derive(Parser)]
#[command(name = "gitchron", about = "Ingests git history into a queryable timeline")]
struct Cli {
    /// Database file (default: $GITCHRON_DB, then <home>/db.sqlite3)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// State directory holding the database and working copies (default: $GITCHRON_HOME, then ~/.gitchron)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a repository and index its history
    Analyze {
        url: String,
        /// Most recent commits to index; implies a shallow clone unless --full
        #[arg(long, allow_hyphen_values = true, default_value_t = -1)]
        depth: i32,
        /// Oldest commit time to keep (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        since: Option<String>,
        /// Newest commit time to keep (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        until: Option<String>,
        /// Path prefix or glob; repeatable
        #[arg(long = "path")]
        paths: Vec<String>,
        /// Clone full history even when --depth is set
        #[arg(long)]
        full: bool,
        #[arg(long = "all-branches")]
        all_branches: bool,
        /// Blobless clone
        #[arg(long)]
        partial: bool,
        /// Print progress to stderr while the job runs
        #[arg(long)]
        watch: bool,
    },
    Status {
        id: Option<i64>,
    },
    Commits {
        id: i64,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Files {
        id: i64,
        #[arg(required = true)]
        shas: Vec<String>,
    },
    Stats {
        id: i64,
        sha: String,
    },
    FetchMore {
        id: i64,
        #[arg(long)]
        depth: u32,
        #[arg(long)]
        watch: bool,
    },
    Content {
        id: i64,
        sha: String,
        path: String,
    },
    Timeline {
        id: i64,
        path: String,
    },
    Delete {
        id: i64,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("GITCHRON_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_home(flag: Option<PathBuf>) -> PathBuf {
    if let Some(p) = flag {
        return p;
    }
    if let Ok(v) = std::env::var("GITCHRON_HOME") {
        return PathBuf::from(v);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".gitchron")
}

fn resolve_db_path(flag: Option<PathBuf>, home: &Path) -> PathBuf {
    if let Some(p) = flag {
        return p;
    }
    if let Ok(v) = std::env::var("GITCHRON_DB") {
        return PathBuf::from(v);
    }
    home.join("db.sqlite3")
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => {
            let secs: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", name, v))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn pipeline_config(home: &Path) -> Result<PipelineConfig> {
    let defaults = PipelineConfig::default();
    Ok(PipelineConfig {
        workspace_root: home.join("clones"),
        clone_timeout: env_secs("GITCHRON_CLONE_TIMEOUT_SECS", defaults.clone_timeout)?,
        fetch_timeout: env_secs("GITCHRON_FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
        diff_timeout: env_secs("GITCHRON_DIFF_TIMEOUT_SECS", defaults.diff_timeout)?,
        stats_timeout: env_secs("GITCHRON_STATS_TIMEOUT_SECS", defaults.stats_timeout)?,
        snapshot_contents: std::env::var("GITCHRON_SNAPSHOTS")
            .is_ok_and(|v| v == "1" || v == "true"),
        ..defaults
    })
}

fn open_orchestrator(db: Option<PathBuf>, home: Option<PathBuf>) -> Result<AnalysisOrchestrator> {
    let home = resolve_home(home);
    let db_path = resolve_db_path(db, &home);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let config = pipeline_config(&home)?;
    debug!(
        db = %db_path.display(),
        workspace = %config.workspace_root.display(),
        "state resolved"
    );
    let stale_after = config
        .clone_timeout
        .max(config.fetch_timeout)
        .max(config.diff_timeout)
        + Duration::from_secs(60);

    let orch = AnalysisOrchestrator::new(Arc::new(store), config)
        .context("Failed to start the analysis pipeline")?;
    let recovered = orch
        .recover_interrupted(stale_after)
        .context("Failed to recover interrupted jobs")?;
    if recovered > 0 {
        eprintln!("Marked {} interrupted job(s) as failed", recovered);
    }
    Ok(orch)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid time '{}': expected YYYY-MM-DD or RFC 3339", s))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("Invalid time '{}'", s))?;
    Ok(midnight.and_utc())
}

fn format_timestamp(ts: i64) -> String {
    if ts <= 0 {
        return "never".to_string();
    }
    DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output to JSON")?;
    println!("{}", json);
    Ok(())
}

/// Hosts the job until it ends. Ctrl-C cancels it at the next stage boundary.
async fn run_job(orch: &AnalysisOrchestrator, repo_id: i64, watch: bool) -> Result<Repository> {
    let canceller = {
        let orch = orch.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(repo_id, "interrupt received, cancelling job");
                eprintln!("Cancelling...");
                orch.cancel(repo_id);
            }
        })
    };

    if watch {
        let mut last = None;
        loop {
            let snap = orch.get_progress(repo_id)?;
            if last != Some((snap.progress, snap.stage)) {
                last = Some((snap.progress, snap.stage));
                eprintln!(
                    "[{:>3}%] {:<18} {}",
                    snap.progress.max(0),
                    snap.stage.as_str(),
                    snap.message.as_deref().unwrap_or("")
                );
            }
            if snap.status != RepoStatus::Analyzing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    let repo = orch.wait(repo_id).await;
    canceller.abort();
    let repo = repo.context("Failed to read repository after the job")?;

    if repo.status == RepoStatus::Failed {
        anyhow::bail!(
            "Analysis of '{}' failed: {}",
            repo.name,
            repo.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    if let Some(summary) = orch.last_summary(repo_id) {
        println!(
            "Analyzed '{}' (id {}): {} commits indexed, {} already indexed, {} filtered, {} file changes",
            repo.name,
            repo.id,
            summary.commits_indexed,
            summary.commits_already_indexed,
            summary.commits_filtered,
            summary.file_changes
        );
        for warning in &summary.warnings {
            eprintln!("  warning: {}", warning);
        }
    }
    if repo.can_load_more {
        println!(
            "History is shallow; run `gitchron fetch-more {} --depth N` to load more",
            repo.id
        );
    }
    Ok(repo)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let orch = open_orchestrator(cli.db, cli.home)?;

    match cli.command {
        Commands::Analyze {
            url,
            depth,
            since,
            until,
            paths,
            full,
            all_branches,
            partial,
            watch,
        } => {
            let options = AnalyzeOptions {
                depth,
                since: since.as_deref().map(parse_time).transpose()?,
                until: until.as_deref().map(parse_time).transpose()?,
                path_filters: paths,
                shallow: depth > 0 && !full,
                single_branch: !all_branches,
                partial,
            };
            let repo = orch
                .analyze(&url, options)
                .with_context(|| format!("Failed to start analysis of '{}'", url))?;
            println!("Analyzing '{}' as repository {}", repo.name, repo.id);
            run_job(&orch, repo.id, watch).await?;
        }

        Commands::FetchMore { id, depth, watch } => {
            orch.fetch_more_history(id, depth)
                .with_context(|| format!("Failed to fetch more history for repository {}", id))?;
            let repo = run_job(&orch, id, watch).await?;
            println!("Repository {} now has {} commits", repo.id, repo.total_commits);
        }

        Commands::Status { id: Some(id) } => {
            let repo = orch
                .get_repository(id)
                .with_context(|| format!("Failed to look up repository {}", id))?;
            let progress = orch.get_progress(id).context("Failed to read progress")?;
            print_json(&serde_json::json!({ "repository": repo, "progress": progress }))?;
        }

        Commands::Status { id: None } => {
            let repos = orch.list_repositories().context("Failed to list repositories")?;
            println!(
                "{:>4}  {:<24} {:<10} {:>5} {:>8}  UPDATED",
                "ID", "NAME", "STATUS", "PROG", "COMMITS"
            );
            for r in &repos {
                println!(
                    "{:>4}  {:<24} {:<10} {:>5} {:>8}  {}",
                    r.id,
                    r.name,
                    r.status.as_str(),
                    r.analyze_progress,
                    r.total_commits,
                    format_timestamp(r.updated_at)
                );
            }
        }

        Commands::Commits { id, offset, limit } => {
            let commits = orch
                .list_commits(id, offset, limit)
                .with_context(|| format!("Failed to list commits of repository {}", id))?;
            for c in &commits {
                let churn = match c.stats() {
                    Some(s) => format!("+{}/-{}", s.additions, s.deletions),
                    None => "?".to_string(),
                };
                println!(
                    "{:>6}  {}  {}  {:<20} {:>12}  {}",
                    c.commit_order,
                    c.short_hash,
                    format_timestamp(c.commit_time),
                    c.author_name,
                    churn,
                    c.subject()
                );
            }
        }

        Commands::Files { id, shas } => {
            let changes = orch
                .file_changes(id, &shas)
                .with_context(|| format!("Failed to read file changes of repository {}", id))?;
            print_json(&changes)?;
        }

        Commands::Stats { id, sha } => {
            let stats = orch
                .commit_stats(id, &sha)
                .with_context(|| format!("Failed to compute stats for {}", sha))?;
            print_json(&stats)?;
        }

        Commands::Content { id, sha, path } => {
            let bytes = orch
                .file_content(id, &sha, &path)
                .with_context(|| format!("Failed to read {} at {}", path, sha))?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes).context("Failed to write content")?;
            stdout.flush().context("Failed to write content")?;
        }

        Commands::Timeline { id, path } => {
            let entries = orch
                .file_timeline(id, &path)
                .with_context(|| format!("Failed to read the timeline of {}", path))?;
            if entries.is_empty() {
                eprintln!("No recorded changes to {}", path);
            }
            for e in entries.iter() {
                println!(
                    "{:>6}  {}  {}  {:<8} +{}/-{}  {}",
                    e.commit_order,
                    e.short_hash,
                    format_timestamp(e.commit_time),
                    e.change_type.as_str(),
                    e.additions,
                    e.deletions,
                    e.subject
                );
            }
        }

        Commands::Delete { id } => {
            orch.delete(id).with_context(|| format!("Failed to delete repository {}", id))?;
            println!("Deleted repository {}", id);
        }
    }

    Ok(())
}
