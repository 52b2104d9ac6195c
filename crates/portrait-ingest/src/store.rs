//! SQLite-backed store for download records, paintings and detected faces.
//!
//! One connection behind a mutex, shared by every worker. Writes made during
//! a run are grouped in a single transaction (`RunTransaction`) that is
//! committed once at the end, or rolled back when the run is abandoned.

use chrono::{DateTime, Utc};
use portrait_core::{
    BoundingBox, Emotion, LandmarkId, NormalizedFeature, Painting, PaintingId, Point,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// How long a connection waits for another process's write lock. A crawl
/// or analysis run holds the lock until it commits.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    remote_id   TEXT PRIMARY KEY,
    source_url  TEXT NOT NULL,
    status      TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS paintings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_id   TEXT NOT NULL UNIQUE,
    source_url  TEXT NOT NULL,
    image_ref   TEXT NOT NULL,
    analyzed    INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS landmarks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    painting_id   INTEGER NOT NULL REFERENCES paintings(id),
    category_id   INTEGER,
    bbox          TEXT NOT NULL,
    points        TEXT NOT NULL,
    vector        TEXT NOT NULL,
    posed_vector  TEXT NOT NULL,
    face_ref      TEXT
);

CREATE INDEX IF NOT EXISTS idx_landmarks_painting ON landmarks(painting_id);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("cannot create store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

/// Lifecycle of one catalog item's download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Fetched,
    /// Permanently rejected; never retried.
    Skipped,
    /// Transient failure; retried by later runs up to the attempt limit.
    Failed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Fetched => "fetched",
            DownloadStatus::Skipped => "skipped",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "fetched" => Ok(DownloadStatus::Fetched),
            "skipped" => Ok(DownloadStatus::Skipped),
            "failed" => Ok(DownloadStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown download status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRecord {
    pub remote_id: String,
    pub status: DownloadStatus,
    pub source_url: String,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of which catalog items have been ingested.
///
/// Implementations must tolerate concurrent calls from many workers.
pub trait DedupStore: Send + Sync {
    fn record(&self, remote_id: &str) -> Result<Option<DownloadRecord>, StoreError>;

    /// True once the item has been fetched.
    fn exists(&self, remote_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .record(remote_id)?
            .is_some_and(|r| r.status == DownloadStatus::Fetched))
    }

    /// Record a first sighting. Existing records are left untouched.
    fn mark_pending(&self, remote_id: &str, source_url: &str) -> Result<(), StoreError>;

    /// Mark the item fetched and create (or return) its painting row.
    fn mark_fetched(
        &self,
        remote_id: &str,
        source_url: &str,
        image_ref: &Path,
    ) -> Result<PaintingId, StoreError>;

    /// Record a transient failure. Returns the attempt count so far.
    fn mark_failed(&self, remote_id: &str, source_url: &str) -> Result<u32, StoreError>;

    /// Record a permanent rejection.
    fn mark_skipped(&self, remote_id: &str, source_url: &str) -> Result<(), StoreError>;

    fn begin_run(&self) -> Result<(), StoreError>;
    fn commit_run(&self) -> Result<(), StoreError>;
    fn rollback_run(&self) -> Result<(), StoreError>;
}

/// Writes of one run. Rolled back on drop unless `commit` was called.
pub struct RunTransaction<'a, S: DedupStore + ?Sized> {
    store: &'a S,
    finished: bool,
}

impl<'a, S: DedupStore + ?Sized> RunTransaction<'a, S> {
    pub fn begin(store: &'a S) -> Result<Self, StoreError> {
        store.begin_run()?;
        Ok(Self { store, finished: false })
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.store.commit_run()
    }
}

impl<S: DedupStore + ?Sized> Drop for RunTransaction<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("run abandoned, rolling back uncommitted writes");
            if let Err(e) = self.store.rollback_run() {
                tracing::error!(error = %e, "rollback failed");
            }
        }
    }
}

/// A detected face ready to be stored.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub painting_id: PaintingId,
    pub bounding_box: BoundingBox,
    pub points: Vec<Point>,
    pub category: Option<Emotion>,
    pub vector: Vec<f64>,
    pub posed_vector: Vec<f64>,
    pub face_ref: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub paintings: usize,
    pub analyzed: usize,
    pub landmarks: usize,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        tracing::info!(path = %path.display(), "store opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Close the connection, surfacing any error SQLite reports on shutdown.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| StoreError::Unavailable(e))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetched paintings whose faces have not been extracted yet, oldest first.
    pub fn paintings_pending_analysis(&self) -> Result<Vec<Painting>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, remote_id, source_url, image_ref FROM paintings
             WHERE analyzed = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], painting_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn painting(&self, id: PaintingId) -> Result<Option<Painting>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, remote_id, source_url, image_ref FROM paintings WHERE id = ?1",
                [id],
                painting_from_row,
            )
            .optional()?)
    }

    pub fn insert_face(&self, face: &FaceRecord) -> Result<LandmarkId, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO landmarks
                 (painting_id, category_id, bbox, points, vector, posed_vector, face_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                face.painting_id,
                face.category.map(Emotion::id),
                to_json(&face.bounding_box)?,
                to_json(&face.points)?,
                to_json(&face.vector)?,
                to_json(&face.posed_vector)?,
                face.face_ref.as_ref().map(|p| p.to_string_lossy().into_owned()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_analyzed(&self, painting_id: PaintingId) -> Result<(), StoreError> {
        self.conn()
            .execute("UPDATE paintings SET analyzed = 1 WHERE id = ?1", [painting_id])?;
        Ok(())
    }

    /// Snapshot of every stored face, in insertion order.
    pub fn features(&self) -> Result<Vec<NormalizedFeature>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, painting_id, category_id, vector, posed_vector FROM landmarks ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<u32>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut features = Vec::new();
        for row in rows {
            let (landmark_id, painting_id, category_id, vector, posed_vector) = row?;
            let category = match category_id {
                None => None,
                Some(id) => Some(Emotion::from_id(id).ok_or_else(|| {
                    StoreError::Corrupt(format!("landmark {landmark_id}: unknown category {id}"))
                })?),
            };
            features.push(NormalizedFeature {
                landmark_id,
                painting_id,
                category,
                vector: from_json(&vector)?,
                posed_vector: from_json(&posed_vector)?,
            });
        }
        Ok(features)
    }

    /// Saved face crop of a landmark row, if one was written.
    pub fn face_ref(&self, landmark_id: LandmarkId) -> Result<Option<PathBuf>, StoreError> {
        let face_ref: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT face_ref FROM landmarks WHERE id = ?1",
                [landmark_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(face_ref.flatten().map(PathBuf::from))
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn();
        let mut stats = StoreStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM downloads GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            match status.parse::<DownloadStatus>()? {
                DownloadStatus::Pending => stats.pending = count,
                DownloadStatus::Fetched => stats.fetched = count,
                DownloadStatus::Skipped => stats.skipped = count,
                DownloadStatus::Failed => stats.failed = count,
            }
        }

        let count = |sql: &str| -> Result<usize, StoreError> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
        };
        stats.paintings = count("SELECT COUNT(*) FROM paintings")?;
        stats.analyzed = count("SELECT COUNT(*) FROM paintings WHERE analyzed = 1")?;
        stats.landmarks = count("SELECT COUNT(*) FROM landmarks")?;
        Ok(stats)
    }

    fn upsert_status(
        conn: &Connection,
        remote_id: &str,
        source_url: &str,
        status: DownloadStatus,
    ) -> Result<u32, StoreError> {
        let attempts = conn.query_row(
            "INSERT INTO downloads (remote_id, source_url, status, attempts, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(remote_id) DO UPDATE SET
                 source_url = excluded.source_url,
                 status = excluded.status,
                 attempts = attempts + 1,
                 updated_at = excluded.updated_at
             RETURNING attempts",
            params![remote_id, source_url, status.as_str(), now()],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(attempts)
    }
}

impl DedupStore for Store {
    fn record(&self, remote_id: &str) -> Result<Option<DownloadRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT remote_id, status, source_url, attempts, updated_at
                 FROM downloads WHERE remote_id = ?1",
                [remote_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((remote_id, status, source_url, attempts, updated_at)) = row else {
            return Ok(None);
        };
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| StoreError::Corrupt(format!("{remote_id}: bad timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Some(DownloadRecord {
            status: status.parse()?,
            remote_id,
            source_url,
            attempts,
            updated_at,
        }))
    }

    fn mark_pending(&self, remote_id: &str, source_url: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO downloads (remote_id, source_url, status, attempts, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3)
             ON CONFLICT(remote_id) DO NOTHING",
            params![remote_id, source_url, now()],
        )?;
        Ok(())
    }

    fn mark_fetched(
        &self,
        remote_id: &str,
        source_url: &str,
        image_ref: &Path,
    ) -> Result<PaintingId, StoreError> {
        let conn = self.conn();
        Store::upsert_status(&conn, remote_id, source_url, DownloadStatus::Fetched)?;
        let id = conn.query_row(
            "INSERT INTO paintings (remote_id, source_url, image_ref, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(remote_id) DO UPDATE SET image_ref = excluded.image_ref
             RETURNING id",
            params![remote_id, source_url, image_ref.to_string_lossy(), now()],
            |row| row.get::<_, PaintingId>(0),
        )?;
        Ok(id)
    }

    fn mark_failed(&self, remote_id: &str, source_url: &str) -> Result<u32, StoreError> {
        Store::upsert_status(&self.conn(), remote_id, source_url, DownloadStatus::Failed)
    }

    fn mark_skipped(&self, remote_id: &str, source_url: &str) -> Result<(), StoreError> {
        Store::upsert_status(&self.conn(), remote_id, source_url, DownloadStatus::Skipped)?;
        Ok(())
    }

    fn begin_run(&self) -> Result<(), StoreError> {
        self.conn().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit_run(&self) -> Result<(), StoreError> {
        self.conn().execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback_run(&self) -> Result<(), StoreError> {
        self.conn().execute_batch("ROLLBACK")?;
        Ok(())
    }
}

fn painting_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Painting> {
    Ok(Painting {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        source_url: row.get(2)?,
        image_ref: PathBuf::from(row.get::<_, String>(3)?),
    })
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}
