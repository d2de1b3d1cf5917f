//! SQLite-persisted record store.
//!
//! One row per canonical path; records are postcard-encoded blobs.
//! Connection work runs on tokio's blocking pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::storer::{FileRecord, RecordStorer};
use crate::vfs::error::{VfsError, VfsResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    path TEXT PRIMARY KEY,
    record BLOB NOT NULL
);
"#;

/// Record store backed by a SQLite database.
pub struct SqliteStorer {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorer").finish_non_exhaustive()
    }
}

impl SqliteStorer {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> VfsResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> VfsResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> VfsResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of stored records.
    pub fn count(&self) -> VfsResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Run `work` against the connection off the async workers.
    async fn with_conn<T, F>(&self, work: F) -> VfsResult<T>
    where
        F: FnOnce(&Connection) -> VfsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || work(&conn.lock()))
            .await
            .map_err(|e| VfsError::storage(format!("sqlite task failed: {e}")))?
    }

    fn fetch(conn: &Connection, path: &str) -> VfsResult<FileRecord> {
        let blob: Option<Vec<u8>> = conn
            .prepare_cached("SELECT record FROM records WHERE path = ?1")?
            .query_row(params![path], |row| row.get(0))
            .optional()?;
        match blob {
            Some(bytes) => FileRecord::from_bytes(&bytes),
            None => Err(VfsError::not_found(path)),
        }
    }
}

#[async_trait]
impl RecordStorer for SqliteStorer {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_record(&self, path: &str) -> VfsResult<FileRecord> {
        let path = path.to_string();
        self.with_conn(move |conn| Self::fetch(conn, &path)).await
    }

    async fn set_record(&self, path: &str, record: Option<&FileRecord>) -> VfsResult<()> {
        let path = path.to_string();
        let bytes = record.map(FileRecord::to_bytes).transpose()?;
        self.with_conn(move |conn| {
            match bytes {
                Some(bytes) => {
                    conn.execute(
                        "INSERT INTO records (path, record) VALUES (?1, ?2)
                         ON CONFLICT(path) DO UPDATE SET record = excluded.record",
                        params![path, bytes],
                    )?;
                }
                None => {
                    conn.execute("DELETE FROM records WHERE path = ?1", params![path])?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn get_records(&self, paths: &[String]) -> Vec<VfsResult<FileRecord>> {
        let count = paths.len();
        let paths = paths.to_vec();
        let fetched = self
            .with_conn(move |conn| Ok(paths.iter().map(|p| Self::fetch(conn, p)).collect::<Vec<_>>()))
            .await;
        match fetched {
            Ok(records) => records,
            Err(e) => (0..count).map(|_| Err(VfsError::storage(&e))).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let storer = SqliteStorer::in_memory().unwrap();
        let record = FileRecord::file(b"persisted".to_vec(), 0o644);

        storer.set_record("/f", Some(&record)).await.unwrap();
        assert_eq!(storer.get_record("/f").await.unwrap(), record);

        let mut updated = record.clone();
        updated.data = b"changed".to_vec();
        storer.set_record("/f", Some(&updated)).await.unwrap();
        assert_eq!(storer.get_record("/f").await.unwrap().data, b"changed");
        assert_eq!(storer.count().unwrap(), 1);

        storer.set_record("/f", None).await.unwrap();
        assert!(storer.get_record("/f").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_batch_lookup() {
        let storer = SqliteStorer::in_memory().unwrap();
        storer
            .set_record("/a", Some(&FileRecord::file(b"a".to_vec(), 0o644)))
            .await
            .unwrap();
        let found = storer
            .get_records(&["/a".to_string(), "/missing".to_string()])
            .await;
        assert_eq!(found[0].as_ref().unwrap().data, b"a");
        assert!(found[1].as_ref().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fs.db");

        {
            let storer = SqliteStorer::open(&db_path).unwrap();
            storer
                .set_record("/", Some(&FileRecord::directory(0o755)))
                .await
                .unwrap();
        }

        let storer = SqliteStorer::open(&db_path).unwrap();
        assert!(storer.get_record("/").await.unwrap().is_dir());
    }
}
