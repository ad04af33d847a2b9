use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use gitchron_types::{
    ChangeType, CommitRecord, CommitStats, FileChange, GitchronError, RepoStatus, Repository,
    RepositoryInput, Result, Store, TimelineEntry,
};

use crate::SqliteStore;

// ── Helpers ───────────────────────────────────────────────────────────────

const REPO_COLUMNS: &str = "id, url, name, local_path, status, analyze_progress, analyze_depth,
     analyze_since, analyze_until, analyze_path_filters, analyze_shallow, analyze_single_branch,
     analyze_partial, total_commits, total_files, repo_size, can_load_more, error_message,
     created_at, updated_at";

const COMMIT_COLUMNS: &str = "repo_id, commit_hash, short_hash, parent_hash, author_name,
     author_email, message, commit_time, additions, deletions, files_changed, is_merge,
     commit_order";

const FILE_CHANGE_COLUMNS: &str = "repo_id, commit_hash, file_path, file_extension, change_type,
     old_path, similarity, additions, deletions, is_binary, diff_text, content_hash";

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn parse_path_filters(s: Option<String>) -> Vec<String> {
    match s {
        None => vec![],
        Some(j) => serde_json::from_str::<Vec<String>>(&j).unwrap_or_default(),
    }
}

fn parse_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn format_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    let status: String = row.get(4)?;
    Ok(Repository {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        local_path: PathBuf::from(row.get::<_, String>(3)?),
        status: RepoStatus::parse(&status).unwrap_or(RepoStatus::Failed),
        analyze_progress: row.get(5)?,
        analyze_depth: row.get(6)?,
        analyze_since: parse_time(row.get(7)?),
        analyze_until: parse_time(row.get(8)?),
        analyze_path_filters: parse_path_filters(row.get(9)?),
        analyze_shallow: row.get(10)?,
        analyze_single_branch: row.get(11)?,
        analyze_partial: row.get(12)?,
        total_commits: row.get(13)?,
        total_files: row.get(14)?,
        repo_size: row.get(15)?,
        can_load_more: row.get(16)?,
        error_message: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommitRecord> {
    Ok(CommitRecord {
        repo_id: row.get(0)?,
        commit_hash: row.get(1)?,
        short_hash: row.get(2)?,
        parent_hash: row.get(3)?,
        author_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        author_email: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        message: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        commit_time: row.get(7)?,
        additions: row.get(8)?,
        deletions: row.get(9)?,
        files_changed: row.get(10)?,
        is_merge: row.get(11)?,
        commit_order: row.get(12)?,
    })
}

fn row_to_file_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileChange> {
    let change_type: String = row.get(4)?;
    Ok(FileChange {
        repo_id: row.get(0)?,
        commit_hash: row.get(1)?,
        file_path: row.get(2)?,
        file_extension: row.get(3)?,
        change_type: ChangeType::parse(&change_type).unwrap_or(ChangeType::Modify),
        old_path: row.get(5)?,
        similarity: row.get(6)?,
        additions: row.get(7)?,
        deletions: row.get(8)?,
        binary: row.get(9)?,
        diff_text: row.get(10)?,
        file_content: None,
        content_hash: row.get(11)?,
    })
}

// ── impl Store ────────────────────────────────────────────────────────────

impl Store for SqliteStore {
    // ── Repository management ─────────────────────────────────────────────

    fn create_repository(&self, input: &RepositoryInput) -> Result<Repository> {
        let conn = self.conn.lock();
        let filters_json = serde_json::to_string(&input.options.path_filters)
            .unwrap_or_else(|_| "[]".to_string());
        let now = now_secs();
        conn.execute(
            "INSERT INTO repositories
                (url, name, local_path, status, analyze_progress, analyze_depth, analyze_since,
                 analyze_until, analyze_path_filters, analyze_shallow, analyze_single_branch,
                 analyze_partial, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'PENDING', 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                input.url,
                input.name,
                input.local_path.to_string_lossy().as_ref(),
                input.options.depth,
                format_time(input.options.since),
                format_time(input.options.until),
                filters_json,
                input.options.shallow,
                input.options.single_branch,
                input.options.partial,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let repo = conn.query_row(
            &format!("SELECT {REPO_COLUMNS} FROM repositories WHERE id = ?1"),
            params![id],
            row_to_repository,
        )?;
        Ok(repo)
    }

    fn get_repository(&self, repo_id: i64) -> Result<Option<Repository>> {
        let conn = self.conn.lock();
        let repo = conn
            .query_row(
                &format!("SELECT {REPO_COLUMNS} FROM repositories WHERE id = ?1"),
                params![repo_id],
                row_to_repository,
            )
            .optional()?;
        Ok(repo)
    }

    fn get_repository_by_url(&self, url: &str) -> Result<Option<Repository>> {
        let conn = self.conn.lock();
        let repo = conn
            .query_row(
                &format!("SELECT {REPO_COLUMNS} FROM repositories WHERE url = ?1"),
                params![url],
                row_to_repository,
            )
            .optional()?;
        Ok(repo)
    }

    fn list_repositories(&self) -> Result<Vec<Repository>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPO_COLUMNS} FROM repositories ORDER BY id"
        ))?;
        let repos: rusqlite::Result<Vec<Repository>> =
            stmt.query_map([], row_to_repository)?.collect();
        Ok(repos?)
    }

    fn update_repository(&self, repo: &Repository) -> Result<()> {
        let conn = self.conn.lock();
        let filters_json = serde_json::to_string(&repo.analyze_path_filters)
            .unwrap_or_else(|_| "[]".to_string());
        let updated = conn.execute(
            "UPDATE repositories SET
                local_path = ?2, status = ?3, analyze_progress = ?4, analyze_depth = ?5,
                analyze_since = ?6, analyze_until = ?7, analyze_path_filters = ?8,
                analyze_shallow = ?9, analyze_single_branch = ?10, analyze_partial = ?11,
                total_commits = ?12, total_files = ?13, repo_size = ?14, can_load_more = ?15,
                error_message = ?16, updated_at = ?17
             WHERE id = ?1",
            params![
                repo.id,
                repo.local_path.to_string_lossy().as_ref(),
                repo.status.as_str(),
                repo.analyze_progress,
                repo.analyze_depth,
                format_time(repo.analyze_since),
                format_time(repo.analyze_until),
                filters_json,
                repo.analyze_shallow,
                repo.analyze_single_branch,
                repo.analyze_partial,
                repo.total_commits,
                repo.total_files,
                repo.repo_size,
                repo.can_load_more,
                repo.error_message,
                now_secs(),
            ],
        )?;
        if updated == 0 {
            return Err(GitchronError::NotFound(format!("repository {}", repo.id)));
        }
        Ok(())
    }

    fn update_progress(
        &self,
        repo_id: i64,
        status: RepoStatus,
        progress: i32,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE repositories
             SET status = ?2, analyze_progress = ?3, error_message = ?4, updated_at = ?5
             WHERE id = ?1",
            params![repo_id, status.as_str(), progress, error_message, now_secs()],
        )?;
        Ok(())
    }

    fn delete_repository(&self, repo_id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM repositories WHERE id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(GitchronError::NotFound(format!("repository {}", repo_id)));
        }

        tx.execute("DELETE FROM file_changes WHERE repo_id = ?1", params![repo_id])?;
        tx.execute("DELETE FROM commits WHERE repo_id = ?1", params![repo_id])?;
        tx.execute("DELETE FROM repositories WHERE id = ?1", params![repo_id])?;

        // Snapshots are shared across repositories; drop only unreferenced ones.
        tx.execute(
            "DELETE FROM file_snapshots WHERE content_hash NOT IN
                (SELECT content_hash FROM file_changes WHERE content_hash IS NOT NULL)",
            [],
        )?;
        tx.commit()?;
        debug!(repo_id, "repository rows deleted");
        Ok(())
    }

    fn clear_history(&self, repo_id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM file_changes WHERE repo_id = ?1", params![repo_id])?;
        tx.execute("DELETE FROM commits WHERE repo_id = ?1", params![repo_id])?;
        tx.execute(
            "UPDATE repositories SET total_commits = 0, updated_at = ?2 WHERE id = ?1",
            params![repo_id, now_secs()],
        )?;
        tx.commit()?;
        debug!(repo_id, "commit history cleared");
        Ok(())
    }

    // ── Ingest writes ─────────────────────────────────────────────────────

    fn upsert_commits(&self, commits: &[CommitRecord]) -> Result<()> {
        if commits.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            // Re-ingestion keeps stats that were already computed and takes the
            // latest commit_order for the row.
            let mut stmt = tx.prepare_cached(
                "INSERT INTO commits
                    (repo_id, commit_hash, short_hash, parent_hash, author_name, author_email,
                     message, commit_time, additions, deletions, files_changed, is_merge,
                     commit_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(repo_id, commit_hash) DO UPDATE SET
                    parent_hash   = excluded.parent_hash,
                    commit_order  = excluded.commit_order,
                    additions     = COALESCE(excluded.additions, commits.additions),
                    deletions     = COALESCE(excluded.deletions, commits.deletions),
                    files_changed = COALESCE(excluded.files_changed, commits.files_changed)",
            )?;
            for c in commits {
                stmt.execute(params![
                    c.repo_id,
                    c.commit_hash,
                    c.short_hash,
                    c.parent_hash,
                    c.author_name,
                    c.author_email,
                    c.message,
                    c.commit_time,
                    c.additions,
                    c.deletions,
                    c.files_changed,
                    c.is_merge,
                    c.commit_order,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn upsert_file_changes(
        &self,
        repo_id: i64,
        changes: &HashMap<String, Vec<FileChange>>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut delete = tx.prepare_cached(
                "DELETE FROM file_changes WHERE repo_id = ?1 AND commit_hash = ?2",
            )?;
            let mut insert = tx.prepare_cached(&format!(
                "INSERT OR REPLACE INTO file_changes ({FILE_CHANGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ))?;
            let mut snapshot = tx.prepare_cached(
                "INSERT OR IGNORE INTO file_snapshots (content_hash, content_blob) VALUES (?1, ?2)",
            )?;

            for (commit_hash, files) in changes {
                delete.execute(params![repo_id, commit_hash])?;
                for f in files {
                    insert.execute(params![
                        repo_id,
                        commit_hash,
                        f.file_path,
                        f.file_extension,
                        f.change_type.as_str(),
                        f.old_path,
                        f.similarity,
                        f.additions,
                        f.deletions,
                        f.binary,
                        f.diff_text,
                        f.content_hash,
                    ])?;
                    if let (Some(hash), Some(content)) = (&f.content_hash, &f.file_content) {
                        let blob = zstd::encode_all(content.as_bytes(), 3)?;
                        snapshot.execute(params![hash, blob])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn update_commit_stats(
        &self,
        repo_id: i64,
        commit_hash: &str,
        stats: &CommitStats,
    ) -> Result<()> {
        if !stats.calculated {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE commits SET additions = ?3, deletions = ?4, files_changed = ?5
             WHERE repo_id = ?1 AND commit_hash = ?2",
            params![
                repo_id,
                commit_hash,
                stats.additions,
                stats.deletions,
                stats.files_changed
            ],
        )?;
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────────────

    fn indexed_commit_hashes(&self, repo_id: i64) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        // A commit counts once its changes or its stats have been written.
        let mut stmt = conn.prepare(
            "SELECT c.commit_hash FROM commits c
             WHERE c.repo_id = ?1
               AND (c.additions IS NOT NULL
                    OR EXISTS (SELECT 1 FROM file_changes f
                               WHERE f.repo_id = c.repo_id AND f.commit_hash = c.commit_hash))",
        )?;
        let hashes: rusqlite::Result<HashSet<String>> =
            stmt.query_map(params![repo_id], |row| row.get(0))?.collect();
        Ok(hashes?)
    }

    fn count_commits(&self, repo_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM commits WHERE repo_id = ?1",
            params![repo_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn list_commits(&self, repo_id: i64, offset: usize, limit: usize) -> Result<Vec<CommitRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE repo_id = ?1
             ORDER BY commit_order
             LIMIT ?2 OFFSET ?3"
        ))?;
        let commits: rusqlite::Result<Vec<CommitRecord>> = stmt
            .query_map(params![repo_id, limit as i64, offset as i64], row_to_commit)?
            .collect();
        Ok(commits?)
    }

    fn get_commit(&self, repo_id: i64, commit_hash: &str) -> Result<Option<CommitRecord>> {
        let conn = self.conn.lock();
        let commit = conn
            .query_row(
                &format!(
                    "SELECT {COMMIT_COLUMNS} FROM commits WHERE repo_id = ?1 AND commit_hash = ?2"
                ),
                params![repo_id, commit_hash],
                row_to_commit,
            )
            .optional()?;
        Ok(commit)
    }

    fn file_changes(
        &self,
        repo_id: i64,
        commit_hashes: &[String],
    ) -> Result<HashMap<String, Vec<FileChange>>> {
        let conn = self.conn.lock();
        let mut exists =
            conn.prepare_cached("SELECT 1 FROM commits WHERE repo_id = ?1 AND commit_hash = ?2")?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FILE_CHANGE_COLUMNS} FROM file_changes
             WHERE repo_id = ?1 AND commit_hash = ?2
             ORDER BY file_path"
        ))?;

        let mut result = HashMap::with_capacity(commit_hashes.len());
        for hash in commit_hashes {
            if !exists.exists(params![repo_id, hash])? {
                continue;
            }
            let files: rusqlite::Result<Vec<FileChange>> = stmt
                .query_map(params![repo_id, hash], row_to_file_change)?
                .collect();
            result.insert(hash.clone(), files?);
        }
        Ok(result)
    }

    fn file_timeline(&self, repo_id: i64, file_path: &str) -> Result<Vec<TimelineEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.commit_hash, c.short_hash, c.commit_order, c.commit_time, c.author_name,
                    c.message, f.file_path, f.change_type, f.old_path, f.additions, f.deletions,
                    f.content_hash
             FROM file_changes f
             JOIN commits c ON c.repo_id = f.repo_id AND c.commit_hash = f.commit_hash
             WHERE f.repo_id = ?1 AND (f.file_path = ?2 OR f.old_path = ?2)
             ORDER BY c.commit_order",
        )?;
        let entries: rusqlite::Result<Vec<TimelineEntry>> = stmt
            .query_map(params![repo_id, file_path], |row| {
                let message: Option<String> = row.get(5)?;
                let change_type: String = row.get(7)?;
                Ok(TimelineEntry {
                    commit_hash: row.get(0)?,
                    short_hash: row.get(1)?,
                    commit_order: row.get(2)?,
                    commit_time: row.get(3)?,
                    author_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    subject: message
                        .as_deref()
                        .and_then(|m| m.lines().next())
                        .unwrap_or("")
                        .trim()
                        .to_string(),
                    file_path: row.get(6)?,
                    change_type: ChangeType::parse(&change_type).unwrap_or(ChangeType::Modify),
                    old_path: row.get(8)?,
                    additions: row.get(9)?,
                    deletions: row.get(10)?,
                    content_hash: row.get(11)?,
                })
            })?
            .collect();
        Ok(entries?)
    }

    fn get_snapshot(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT content_blob FROM file_snapshots WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            None => Ok(None),
            Some(compressed) => Ok(Some(zstd::decode_all(compressed.as_slice())?)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
