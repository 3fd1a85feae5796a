//! Legacy store schema versions.
//!
//! Not to be confused with the data migration in `crate::migrate`: these
//! only bring the SQLite schema up to date. Every statement uses IF NOT
//! EXISTS so a database written by the crawler itself is adopted as-is.

use tokio_rusqlite::{Connection, params};

use super::Error;

/// Schema steps in application order, numbered from 1.
const SCHEMA: &[(i64, &str)] = &[
    (1, include_str!("../../migrations/001_crawled_data.sql")),
    (2, include_str!("../../migrations/002_sessions.sql")),
];

/// Apply pending schema steps, each in its own transaction.
///
/// # Errors
///
/// Returns `Error::SchemaMigration` naming the step that failed.
pub async fn run(conn: &Connection) -> Result<(), Error> {
    let applied = conn
        .call(|conn| -> Result<Vec<i64>, Error> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS _migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                )",
            )?;
            let current: i64 =
                conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))?;

            let mut applied = Vec::new();
            for &(version, sql) in SCHEMA.iter().filter(|(version, _)| *version > current) {
                let tx = conn.transaction()?;
                tx.execute_batch(sql)
                    .map_err(|e| Error::SchemaMigration(format!("step {version}: {e}")))?;
                tx.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, chrono::Utc::now().to_rfc3339()],
                )?;
                tx.commit()?;
                applied.push(version);
            }
            Ok(applied)
        })
        .await
        .map_err(Error::from)?;

    if !applied.is_empty() {
        tracing::debug!(versions = ?applied, "legacy schema updated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn schema_version(conn: &Connection) -> i64 {
        conn.call(|conn| conn.query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let conn = Connection::open_in_memory().await.unwrap();
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let rows: i64 = conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(rows, SCHEMA.len() as i64);
        assert_eq!(schema_version(&conn).await, 2);
    }

    #[tokio::test]
    async fn test_adopts_existing_crawler_database() {
        let conn = Connection::open_in_memory().await.unwrap();
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE crawled_data (url TEXT PRIMARY KEY, html TEXT NOT NULL DEFAULT '',
                    cleaned_html TEXT NOT NULL DEFAULT '', markdown TEXT NOT NULL DEFAULT '',
                    extracted_content TEXT NOT NULL DEFAULT '', success INTEGER NOT NULL DEFAULT 0,
                    status_code INTEGER, media TEXT NOT NULL DEFAULT '{}', links TEXT NOT NULL DEFAULT '{}',
                    metadata TEXT NOT NULL DEFAULT '{}', response_headers TEXT NOT NULL DEFAULT '{}',
                    downloaded_files TEXT NOT NULL DEFAULT '[]', screenshot TEXT, error_message TEXT,
                    session_id TEXT, created_at TEXT NOT NULL, updated_at TEXT NOT NULL, expires_at INTEGER);
                 INSERT INTO crawled_data (url, created_at, updated_at) VALUES ('https://a.com/', '', '');",
            )
        })
        .await
        .unwrap();

        run(&conn).await.unwrap();

        let rows: i64 = conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM crawled_data", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let sessions: bool = conn
            .call(|conn| {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    params!["sessions"],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert!(sessions);
    }
}
