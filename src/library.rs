use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::FetchError;
use crate::sources::Source;

/// A finished chapter download on disk.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub series_id: i64,
    pub chapter: String,
    pub path: String,
    pub bytes: u64,
    pub downloaded_at: i64,
}

/// Persistent record of known series and what has been downloaded for them.
/// The scheduler consults it for idempotency and the storage budget.
pub trait SeriesStore: Send + Sync {
    /// Insert the series if new, returning its row id either way.
    fn ensure_series(
        &self,
        source: Source,
        source_series_id: &str,
        title: &str,
    ) -> Result<i64, FetchError>;

    fn find_download(
        &self,
        series_id: i64,
        chapter: &str,
    ) -> Result<Option<DownloadRecord>, FetchError>;

    fn record_download(
        &self,
        series_id: i64,
        chapter: &str,
        path: &str,
        bytes: u64,
    ) -> Result<(), FetchError>;

    /// Total bytes recorded against one series.
    fn bytes_for_series(&self, series_id: i64) -> Result<u64, FetchError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, FetchError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, FetchError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), FetchError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS series (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                source_series_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                UNIQUE(source, source_series_id)
            );
            CREATE TABLE IF NOT EXISTS downloaded_chapters (
                series_id INTEGER NOT NULL REFERENCES series(id),
                chapter TEXT NOT NULL,
                path TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                downloaded_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                UNIQUE(series_id, chapter)
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, FetchError> {
        self.conn
            .lock()
            .map_err(|_| FetchError::Store("store lock poisoned".to_string()))
    }
}

impl SeriesStore for SqliteStore {
    fn ensure_series(
        &self,
        source: Source,
        source_series_id: &str,
        title: &str,
    ) -> Result<i64, FetchError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO series (source, source_series_id, title) VALUES (?1, ?2, ?3)",
            params![source.key(), source_series_id, title],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM series WHERE source = ?1 AND source_series_id = ?2",
            params![source.key(), source_series_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn find_download(
        &self,
        series_id: i64,
        chapter: &str,
    ) -> Result<Option<DownloadRecord>, FetchError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT series_id, chapter, path, bytes, downloaded_at
                 FROM downloaded_chapters WHERE series_id = ?1 AND chapter = ?2",
                params![series_id, chapter],
                |row| {
                    Ok(DownloadRecord {
                        series_id: row.get(0)?,
                        chapter: row.get(1)?,
                        path: row.get(2)?,
                        bytes: row.get::<_, i64>(3)? as u64,
                        downloaded_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn record_download(
        &self,
        series_id: i64,
        chapter: &str,
        path: &str,
        bytes: u64,
    ) -> Result<(), FetchError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO downloaded_chapters (series_id, chapter, path, bytes, downloaded_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))",
            params![series_id, chapter, path, bytes as i64],
        )?;
        Ok(())
    }

    fn bytes_for_series(&self, series_id: i64) -> Result<u64, FetchError> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(bytes), 0) FROM downloaded_chapters WHERE series_id = ?1",
            params![series_id],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_series_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store
            .ensure_series(Source::Manhuaus, "solo-leveling", "Solo Leveling")
            .unwrap();
        let b = store
            .ensure_series(Source::Manhuaus, "solo-leveling", "Solo Leveling")
            .unwrap();
        assert_eq!(a, b);

        let other = store
            .ensure_series(Source::AsuraScans, "solo-leveling", "Solo Leveling")
            .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn downloads_round_trip_and_sum() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store
            .ensure_series(Source::Manhuaus, "gate", "The Gate")
            .unwrap();

        assert!(store.find_download(id, "Ch.1").unwrap().is_none());
        store.record_download(id, "Ch.1", "/x/ch1.cbz", 100).unwrap();
        store.record_download(id, "Ch.2", "/x/ch2.cbz", 250).unwrap();

        let rec = store.find_download(id, "Ch.1").unwrap().unwrap();
        assert_eq!(rec.path, "/x/ch1.cbz");
        assert_eq!(rec.bytes, 100);
        assert_eq!(store.bytes_for_series(id).unwrap(), 350);

        // Re-recording replaces, not duplicates.
        store.record_download(id, "Ch.1", "/x/ch1.cbz", 120).unwrap();
        assert_eq!(store.bytes_for_series(id).unwrap(), 370);
    }
}
