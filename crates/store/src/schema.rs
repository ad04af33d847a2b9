/// All DDL for the gitchron SQLite schema.
/// Run in order; all statements are idempotent (IF NOT EXISTS).
pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS repositories (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    url                   TEXT NOT NULL UNIQUE,
    name                  TEXT NOT NULL,
    local_path            TEXT NOT NULL,
    status                TEXT NOT NULL DEFAULT 'PENDING',
    analyze_progress      INTEGER NOT NULL DEFAULT 0,
    analyze_depth         INTEGER NOT NULL DEFAULT -1,
    analyze_since         TEXT,
    analyze_until         TEXT,
    analyze_path_filters  TEXT NOT NULL DEFAULT '[]',
    analyze_shallow       INTEGER NOT NULL DEFAULT 0,
    analyze_single_branch INTEGER NOT NULL DEFAULT 1,
    analyze_partial       INTEGER NOT NULL DEFAULT 0,
    total_commits         INTEGER NOT NULL DEFAULT 0,
    total_files           INTEGER NOT NULL DEFAULT 0,
    repo_size             INTEGER NOT NULL DEFAULT 0,
    can_load_more         INTEGER NOT NULL DEFAULT 0,
    error_message         TEXT,
    created_at            INTEGER NOT NULL,
    updated_at            INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS commits (
    repo_id       INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash   TEXT NOT NULL,
    short_hash    TEXT NOT NULL,
    parent_hash   TEXT,
    author_name   TEXT,
    author_email  TEXT,
    message       TEXT,
    commit_time   INTEGER NOT NULL,
    additions     INTEGER,
    deletions     INTEGER,
    files_changed INTEGER,
    is_merge      INTEGER NOT NULL DEFAULT 0,
    commit_order  INTEGER NOT NULL,
    PRIMARY KEY (repo_id, commit_hash)
);

CREATE INDEX IF NOT EXISTS idx_commits_order
    ON commits (repo_id, commit_order);

CREATE TABLE IF NOT EXISTS file_changes (
    repo_id        INTEGER NOT NULL,
    commit_hash    TEXT NOT NULL,
    file_path      TEXT NOT NULL,
    file_extension TEXT,
    change_type    TEXT NOT NULL,
    old_path       TEXT,
    similarity     INTEGER,
    additions      INTEGER NOT NULL DEFAULT 0,
    deletions      INTEGER NOT NULL DEFAULT 0,
    is_binary      INTEGER NOT NULL DEFAULT 0,
    diff_text      TEXT,
    content_hash   TEXT,
    PRIMARY KEY (repo_id, commit_hash, file_path),
    FOREIGN KEY (repo_id, commit_hash)
        REFERENCES commits (repo_id, commit_hash) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_file_changes_path
    ON file_changes (repo_id, file_path);

CREATE TABLE IF NOT EXISTS file_snapshots (
    content_hash TEXT PRIMARY KEY,
    content_blob BLOB NOT NULL
);
"#;
