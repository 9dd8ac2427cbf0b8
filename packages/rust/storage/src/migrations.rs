//! SQL migration definitions for the docsink database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as a batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: pages, images, jobs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Scraped pages, one live row per normalized URL
CREATE TABLE IF NOT EXISTS pages (
    id         TEXT PRIMARY KEY,
    url        TEXT NOT NULL UNIQUE,
    title      TEXT NOT NULL,
    content    TEXT,
    scraped_at TEXT NOT NULL
);

-- Uploaded images and their page associations
CREATE TABLE IF NOT EXISTS images (
    id           TEXT PRIMARY KEY,
    page_id      TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    original_url TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    UNIQUE(page_id, original_url)
);

CREATE INDEX IF NOT EXISTS idx_images_page ON images(page_id);
CREATE INDEX IF NOT EXISTS idx_images_original ON images(original_url);

-- Durable job store
CREATE TABLE IF NOT EXISTS jobs (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'queued',
    args_json        TEXT,
    result_json      TEXT,
    logs             TEXT NOT NULL DEFAULT '',
    error            TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    finished_at      TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
