//! libSQL storage layer.
//!
//! The [`Storage`] struct wraps a local libSQL database holding pages,
//! image associations, and the durable job store. Page upserts are keyed
//! on the normalized URL; image rows are unique per (page, original URL).

mod jobs;
mod migrations;

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use uuid::Uuid;

use docsink_shared::{DocsinkError, PageRecord, Result};

pub use jobs::JobOutcome;

/// An image-association row ready for insertion, with the owning page
/// already resolved to its database id.
#[derive(Debug, Clone)]
pub struct ImageRowInsert {
    pub page_id: String,
    pub original_url: String,
    pub storage_path: String,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocsinkError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    DocsinkError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Page operations
    // -----------------------------------------------------------------------

    /// Upsert one chunk of pages, keyed on URL.
    ///
    /// Returns the `(url, id)` pairs of every row that survived: the id
    /// of the existing row on conflict, a fresh one on insert.
    pub async fn upsert_pages_chunk(&self, pages: &[PageRecord]) -> Result<Vec<(String, String)>> {
        let mut results = Vec::with_capacity(pages.len());

        for page in pages {
            let id = Uuid::now_v7().to_string();
            let mut rows = self
                .conn
                .query(
                    "INSERT INTO pages (id, url, title, content, scraped_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(url) DO UPDATE SET
                       title = excluded.title,
                       content = excluded.content,
                       scraped_at = excluded.scraped_at
                     RETURNING url, id",
                    params![
                        id.as_str(),
                        page.url.as_str(),
                        page.title.as_str(),
                        page.content.as_deref(),
                        page.scraped_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?;

            if let Some(row) = rows
                .next()
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?
            {
                let url: String = row
                    .get(0)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?;
                let row_id: String = row
                    .get(1)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?;
                results.push((url, row_id));
            }
        }

        Ok(results)
    }

    /// Which of `urls` already have a page row.
    pub async fn existing_page_urls(&self, urls: &[String]) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();
        for url in urls {
            let mut rows = self
                .conn
                .query(
                    "SELECT 1 FROM pages WHERE url = ?1",
                    params![url.as_str()],
                )
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?;
            if rows
                .next()
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?
                .is_some()
            {
                existing.insert(url.clone());
            }
        }
        Ok(existing)
    }

    /// Fetch a page by URL. Returns `(id, record)`.
    pub async fn get_page(&self, url: &str) -> Result<Option<(String, PageRecord)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, url, title, content, scraped_at FROM pages WHERE url = ?1",
                params![url],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?;
                let record = PageRecord {
                    url: row
                        .get::<String>(1)
                        .map_err(|e| DocsinkError::Storage(e.to_string()))?,
                    title: row
                        .get::<String>(2)
                        .map_err(|e| DocsinkError::Storage(e.to_string()))?,
                    content: row.get::<String>(3).ok(),
                    scraped_at: parse_timestamp(
                        &row.get::<String>(4)
                            .map_err(|e| DocsinkError::Storage(e.to_string()))?,
                    )?,
                };
                Ok(Some((id, record)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DocsinkError::Storage(e.to_string())),
        }
    }

    /// Total page count.
    pub async fn count_pages(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM pages", params![])
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?;
                Ok(count as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DocsinkError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Image operations
    // -----------------------------------------------------------------------

    /// Insert one chunk of image-association rows.
    ///
    /// Duplicate (page, original URL) pairs are ignored; the returned
    /// count covers newly inserted rows only.
    pub async fn insert_images_chunk(&self, rows: &[ImageRowInsert]) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0u64;

        for row in rows {
            let id = Uuid::now_v7().to_string();
            let affected = self
                .conn
                .execute(
                    "INSERT INTO images (id, page_id, original_url, storage_path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(page_id, original_url) DO NOTHING",
                    params![
                        id.as_str(),
                        row.page_id.as_str(),
                        row.original_url.as_str(),
                        row.storage_path.as_str(),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(|e| DocsinkError::Storage(e.to_string()))?;
            inserted += affected;
        }

        Ok(inserted)
    }

    /// All normalized original URLs with at least one stored association,
    /// the seed for a crawl run's uploaded-set.
    pub async fn uploaded_image_urls(&self) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query("SELECT DISTINCT original_url FROM images", params![])
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;

        let mut urls = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            urls.insert(
                row.get::<String>(0)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?,
            );
        }
        Ok(urls)
    }

    /// Associations for one page. Returns `(original_url, storage_path)`.
    pub async fn images_for_page(&self, page_id: &str) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT original_url, storage_path FROM images WHERE page_id = ?1",
                params![page_id],
            )
            .await
            .map_err(|e| DocsinkError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?,
                row.get::<String>(1)
                    .map_err(|e| DocsinkError::Storage(e.to_string()))?,
            ));
        }
        Ok(results)
    }
}

/// Parse an RFC 3339 timestamp column.
pub(crate) fn parse_timestamp(s: &str) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DocsinkError::Storage(format!("invalid date: {e}")))
}

#[cfg(test)]
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("docsink_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, title: &str) -> PageRecord {
        PageRecord {
            url: url.into(),
            title: title.into(),
            content: Some(format!("{title} body")),
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("docsink_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_url() {
        let storage = test_storage().await;

        let first = storage
            .upsert_pages_chunk(&[page("https://docs.example.com/a", "First")])
            .await
            .expect("insert");
        assert_eq!(first.len(), 1);
        let (_, first_id) = &first[0];

        let second = storage
            .upsert_pages_chunk(&[page("https://docs.example.com/a", "Updated")])
            .await
            .expect("upsert");
        let (_, second_id) = &second[0];

        // Same row survives with the original id and updated fields.
        assert_eq!(first_id, second_id);
        assert_eq!(storage.count_pages().await.unwrap(), 1);
        let (_, record) = storage
            .get_page("https://docs.example.com/a")
            .await
            .unwrap()
            .expect("page");
        assert_eq!(record.title, "Updated");
    }

    #[tokio::test]
    async fn existing_page_urls_reports_only_present_rows() {
        let storage = test_storage().await;
        storage
            .upsert_pages_chunk(&[page("https://docs.example.com/a", "A")])
            .await
            .unwrap();

        let existing = storage
            .existing_page_urls(&[
                "https://docs.example.com/a".to_string(),
                "https://docs.example.com/b".to_string(),
            ])
            .await
            .unwrap();
        assert!(existing.contains("https://docs.example.com/a"));
        assert!(!existing.contains("https://docs.example.com/b"));
    }

    #[tokio::test]
    async fn image_rows_are_unique_per_page_and_url() {
        let storage = test_storage().await;
        let ids = storage
            .upsert_pages_chunk(&[page("https://docs.example.com/a", "A")])
            .await
            .unwrap();
        let page_id = ids[0].1.clone();

        let row = ImageRowInsert {
            page_id: page_id.clone(),
            original_url: "https://cdn.example.com/a.png".into(),
            storage_path: "abc.jpg".into(),
        };

        let inserted = storage.insert_images_chunk(&[row.clone()]).await.unwrap();
        assert_eq!(inserted, 1);
        let inserted = storage.insert_images_chunk(&[row]).await.unwrap();
        assert_eq!(inserted, 0, "conflict must be ignored");

        let images = storage.images_for_page(&page_id).await.unwrap();
        assert_eq!(images.len(), 1);

        let uploaded = storage.uploaded_image_urls().await.unwrap();
        assert!(uploaded.contains("https://cdn.example.com/a.png"));
    }
}
