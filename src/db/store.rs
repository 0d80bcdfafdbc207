//! SQLite-backed capture store and upload outbox.

use anyhow::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::schema::SCHEMA;

/// One completed photo event.
///
/// `id` is assigned by the store on insert; an `id` of zero means "not yet
/// persisted" and asks the store to allocate one. Records are never updated
/// or deleted after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub id: i64,
    /// Path or URI of the stored image bytes. Referenced, not owned: the
    /// store does not track the file's later lifecycle.
    pub image_uri: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Epoch milliseconds at capture time.
    pub captured_at: i64,
}

impl CaptureRecord {
    pub fn new(image_uri: impl Into<String>, latitude: f64, longitude: f64, captured_at: i64) -> Self {
        Self {
            id: 0,
            image_uri: image_uri.into(),
            latitude,
            longitude,
            captured_at,
        }
    }
}

/// Outbox status of a pending remote transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "uploading" => Some(UploadStatus::Uploading),
            "uploaded" => Some(UploadStatus::Uploaded),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

/// One durable outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub capture_id: i64,
    pub staging_path: PathBuf,
    pub object_key: String,
    pub status: UploadStatus,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

/// Embedded store for capture metadata and the upload outbox.
///
/// Constructed once by the composition root and shared by handle; the inner
/// mutex serializes all statement execution, so concurrent callers only ever
/// contend on the lock, never on the connection. Calls may block on storage
/// I/O and belong off the interactive context.
pub struct CaptureStore {
    conn: Mutex<Connection>,
}

impl CaptureStore {
    /// Open (creating if needed) the store file and its parent directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute_batch(SCHEMA)?;
        // A row stuck at 'uploading' means a transfer was interrupted
        // mid-attempt; requeue it so the worker picks it up again.
        conn.execute(
            "UPDATE upload_outbox SET status = 'pending' WHERE status = 'uploading'",
            [],
        )?;
        Ok(())
    }

    // ========================================================================
    // Capture operations
    // ========================================================================

    /// Insert a capture record with insert-or-ignore semantics.
    ///
    /// A record with a conflicting id succeeds without modifying existing
    /// state and returns `None`. A fresh record (id 0) gets a store-assigned
    /// id, returned as `Some(id)`.
    pub fn insert(&self, record: &CaptureRecord) -> Result<Option<i64>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = if record.id == 0 {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO captures (image_uri, latitude, longitude, captured_at)
                VALUES (?, ?, ?, ?)
                "#,
                rusqlite::params![
                    record.image_uri,
                    record.latitude,
                    record.longitude,
                    record.captured_at
                ],
            )?
        } else {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO captures (id, image_uri, latitude, longitude, captured_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
                rusqlite::params![
                    record.id,
                    record.image_uri,
                    record.latitude,
                    record.longitude,
                    record.captured_at
                ],
            )?
        };

        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    /// All capture records, newest first. Ties on `captured_at` fall back to
    /// insertion order, which is store-defined.
    pub fn list_all(&self) -> Result<Vec<CaptureRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, image_uri, latitude, longitude, captured_at
            FROM captures
            ORDER BY captured_at DESC
            "#,
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(CaptureRecord {
                    id: row.get(0)?,
                    image_uri: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    captured_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    pub fn capture_count(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count = conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // Outbox operations
    // ========================================================================

    /// Queue a staged file for upload. The row becomes due immediately.
    pub fn enqueue_upload(
        &self,
        capture_id: i64,
        staging_path: &Path,
        object_key: &str,
        now_millis: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            r#"
            INSERT INTO upload_outbox (capture_id, staging_path, object_key, next_attempt_at)
            VALUES (?, ?, ?, ?)
            "#,
            rusqlite::params![
                capture_id,
                staging_path.to_string_lossy(),
                object_key,
                now_millis
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending outbox rows whose retry time has arrived, oldest due first.
    pub fn due_uploads(&self, now_millis: i64, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, capture_id, staging_path, object_key, status, attempts, next_attempt_at, last_error
            FROM upload_outbox
            WHERE status = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at ASC
            LIMIT ?
            "#,
        )?;
        let entries = stmt
            .query_map(rusqlite::params![now_millis, limit as i64], row_to_entry)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    pub fn mark_uploading(&self, outbox_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE upload_outbox SET status = 'uploading' WHERE id = ?",
            [outbox_id],
        )?;
        Ok(())
    }

    pub fn mark_uploaded(&self, outbox_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE upload_outbox SET status = 'uploaded', last_error = NULL WHERE id = ?",
            [outbox_id],
        )?;
        Ok(())
    }

    /// Record a failed attempt. Non-terminal failures go back to `pending`
    /// with a future retry time; terminal ones park at `failed`.
    pub fn mark_upload_failed(
        &self,
        outbox_id: i64,
        error: &str,
        next_attempt_at: i64,
        terminal: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let status = if terminal {
            UploadStatus::Failed
        } else {
            UploadStatus::Pending
        };
        conn.execute(
            r#"
            UPDATE upload_outbox
            SET status = ?, attempts = attempts + 1, next_attempt_at = ?, last_error = ?
            WHERE id = ?
            "#,
            rusqlite::params![status.as_str(), next_attempt_at, error, outbox_id],
        )?;
        Ok(())
    }

    /// The outbox row belonging to a capture, if one was ever enqueued.
    pub fn outbox_for_capture(&self, capture_id: i64) -> Result<Option<OutboxEntry>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let result = conn.query_row(
            r#"
            SELECT id, capture_id, staging_path, object_key, status, attempts, next_attempt_at, last_error
            FROM upload_outbox
            WHERE capture_id = ?
            "#,
            [capture_id],
            row_to_entry,
        );
        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every outbox row, newest first, for the `outbox` CLI view.
    pub fn outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, capture_id, staging_path, object_key, status, attempts, next_attempt_at, last_error
            FROM upload_outbox
            ORDER BY id DESC
            "#,
        )?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let status: String = row.get(4)?;
    Ok(OutboxEntry {
        id: row.get(0)?,
        capture_id: row.get(1)?,
        staging_path: PathBuf::from(row.get::<_, String>(2)?),
        object_key: row.get(3)?,
        status: UploadStatus::parse(&status).unwrap_or(UploadStatus::Failed),
        attempts: row.get(5)?,
        next_attempt_at: row.get(6)?,
        last_error: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_store() -> CaptureStore {
        let store = CaptureStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn test_insert_assigns_id() {
        let store = fresh_store();
        let id = store
            .insert(&CaptureRecord::new("/p/a.jpg", 1.0, 2.0, 100))
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(store.capture_count().unwrap(), 1);
    }

    #[test]
    fn test_insert_is_idempotent_under_conflict() {
        let store = fresh_store();
        let mut record = CaptureRecord::new("/p/a.jpg", 1.0, 2.0, 100);
        record.id = 7;

        assert_eq!(store.insert(&record).unwrap(), Some(7));
        // Same identity again: silent no-op, not an error.
        record.image_uri = "/p/other.jpg".to_string();
        assert_eq!(store.insert(&record).unwrap(), None);

        let rows = store.list_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].image_uri, "/p/a.jpg");
    }

    #[test]
    fn test_list_all_orders_newest_first() {
        let store = fresh_store();
        for ts in [100, 300, 200] {
            store
                .insert(&CaptureRecord::new(format!("/p/{ts}.jpg"), 0.0, 0.0, ts))
                .unwrap();
        }
        let timestamps: Vec<i64> = store
            .list_all()
            .unwrap()
            .iter()
            .map(|r| r.captured_at)
            .collect();
        assert_eq!(timestamps, vec![300, 200, 100]);
    }

    #[test]
    fn test_insert_list_round_trip() {
        let store = fresh_store();
        let record = CaptureRecord::new("/pictures/Watermarked_42.jpg", 48.85837, 2.29448, 42);
        let id = store.insert(&record).unwrap().unwrap();

        let rows = store.list_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].image_uri, record.image_uri);
        assert_eq!(rows[0].latitude, record.latitude);
        assert_eq!(rows[0].longitude, record.longitude);
        assert_eq!(rows[0].captured_at, record.captured_at);
    }

    #[test]
    fn test_file_backed_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("geoshot.db");
        let store = CaptureStore::open(&path).unwrap();
        store.initialize().unwrap();
        store
            .insert(&CaptureRecord::new("/p/a.jpg", 1.0, 2.0, 100))
            .unwrap();

        drop(store);
        let reopened = CaptureStore::open(&path).unwrap();
        reopened.initialize().unwrap();
        assert_eq!(reopened.capture_count().unwrap(), 1);
    }

    #[test]
    fn test_outbox_lifecycle() {
        let store = fresh_store();
        let capture_id = store
            .insert(&CaptureRecord::new("/p/a.jpg", 1.0, 2.0, 100))
            .unwrap()
            .unwrap();
        let outbox_id = store
            .enqueue_upload(capture_id, Path::new("/staging/photo_100.jpg"), "photo_100.jpg", 1_000)
            .unwrap();

        let due = store.due_uploads(1_000, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].object_key, "photo_100.jpg");
        assert_eq!(due[0].status, UploadStatus::Pending);
        assert_eq!(due[0].attempts, 0);

        // A failed attempt reschedules and is not due before its retry time.
        store
            .mark_upload_failed(outbox_id, "connection refused", 5_000, false)
            .unwrap();
        assert!(store.due_uploads(4_999, 10).unwrap().is_empty());
        let due = store.due_uploads(5_000, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("connection refused"));

        store.mark_uploaded(outbox_id).unwrap();
        assert!(store.due_uploads(10_000, 10).unwrap().is_empty());
        let entry = store.outbox_for_capture(capture_id).unwrap().unwrap();
        assert_eq!(entry.status, UploadStatus::Uploaded);
        assert_eq!(entry.last_error, None);
    }

    #[test]
    fn test_interrupted_upload_is_retried_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geoshot.db");
        let store = CaptureStore::open(&path).unwrap();
        store.initialize().unwrap();
        let capture_id = store
            .insert(&CaptureRecord::new("/p/a.jpg", 1.0, 2.0, 100))
            .unwrap()
            .unwrap();
        let outbox_id = store
            .enqueue_upload(capture_id, Path::new("/staging/x.jpg"), "x.jpg", 0)
            .unwrap();

        // Simulate a process killed between claiming the row and finishing
        // the transfer: the row is invisible to the retry query.
        store.mark_uploading(outbox_id).unwrap();
        assert!(store.due_uploads(i64::MAX, 10).unwrap().is_empty());

        drop(store);
        let reopened = CaptureStore::open(&path).unwrap();
        reopened.initialize().unwrap();
        let due = reopened.due_uploads(i64::MAX, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, UploadStatus::Pending);
        assert_eq!(due[0].object_key, "x.jpg");
    }

    #[test]
    fn test_terminal_failure_leaves_retry_queue() {
        let store = fresh_store();
        let capture_id = store
            .insert(&CaptureRecord::new("/p/a.jpg", 1.0, 2.0, 100))
            .unwrap()
            .unwrap();
        let outbox_id = store
            .enqueue_upload(capture_id, Path::new("/staging/x.jpg"), "x.jpg", 0)
            .unwrap();

        store
            .mark_upload_failed(outbox_id, "403 forbidden", 0, true)
            .unwrap();
        assert!(store.due_uploads(i64::MAX, 10).unwrap().is_empty());
        let entry = store.outbox_for_capture(capture_id).unwrap().unwrap();
        assert_eq!(entry.status, UploadStatus::Failed);
    }
}
