//! SQLite-backed store for image records.
//!
//! All durable state lives here. Workers hold no cross-invocation state;
//! they read a record, act, and write narrow updates back. The narrow
//! update methods exist so a concurrent worker cannot clobber fields it
//! does not own.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("image not found: {0}")]
    NotFound(String),
}

/// Digest algorithm an image's checksum is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    Md5,
    #[default]
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Number of hex characters a digest of this algorithm has.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }

    /// Check that `checksum` is a well-formed digest for this algorithm.
    pub fn matches_checksum(&self, checksum: &str) -> bool {
        checksum.len() == self.hex_len() && checksum.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Image lifecycle status.
///
/// Transitions only move forward; the single backward-looking edge is
/// into `Failed`, which has no outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageStatus {
    #[default]
    Created,
    Downloading,
    Downloaded,
    Verifying,
    Verified,
    Pushing,
    Pushed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Pushing => "pushing",
            Self::Pushed => "pushed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "downloading" => Some(Self::Downloading),
            "downloaded" => Some(Self::Downloaded),
            "verifying" => Some(Self::Verifying),
            "verified" => Some(Self::Verified),
            "pushing" => Some(Self::Pushing),
            "pushed" => Some(Self::Pushed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An image record.
///
/// `image_path` and `checksum_path` are relative to the data root until
/// the image is `Pushed`, after which they hold absolute external URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: i64,
    /// Opaque identifier external systems use to refer to this image.
    pub external_id: String,
    /// Originating subsystem; prefixes the event subject.
    pub external_component: String,
    pub user_id: i64,
    pub name: String,
    pub description: String,
    /// On-disk basename inside the image folder.
    pub file_name: String,
    /// Present for pulled images, absent for uploaded ones.
    pub source_url: Option<String>,
    pub checksum: String,
    pub algorithm: ChecksumAlgorithm,
    pub image_path: String,
    pub checksum_path: String,
    /// Eligible for the Pusher once verified.
    pub publish: bool,
    pub status: ImageStatus,
    pub status_detail: String,
    pub deleted: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

const IMAGE_COLUMNS: &str = "id, external_id, external_component, user_id, name, description, \
     file_name, source_url, checksum, algorithm, image_path, checksum_path, publish, status, \
     status_detail, deleted, create_time, update_time";

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<Image> {
    let algorithm: String = row.get(9)?;
    let status: String = row.get(13)?;

    Ok(Image {
        id: row.get(0)?,
        external_id: row.get(1)?,
        external_component: row.get(2)?,
        user_id: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        file_name: row.get(6)?,
        source_url: row.get(7)?,
        checksum: row.get(8)?,
        algorithm: ChecksumAlgorithm::parse(&algorithm).unwrap_or_default(),
        image_path: row.get(10)?,
        checksum_path: row.get(11)?,
        publish: row.get(12)?,
        status: ImageStatus::parse(&status).unwrap_or(ImageStatus::Failed),
        status_detail: row.get(14)?,
        deleted: row.get(15)?,
        create_time: row.get(16)?,
        update_time: row.get(17)?,
    })
}

/// SQLite image store, shareable across worker tasks.
#[derive(Clone)]
pub struct ImageStore {
    conn: Arc<Mutex<Connection>>,
}

impl ImageStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL keeps readers unblocked during worker updates
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL,
                external_component TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                file_name TEXT NOT NULL,
                source_url TEXT,
                checksum TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                image_path TEXT NOT NULL,
                checksum_path TEXT NOT NULL,
                publish INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                status_detail TEXT NOT NULL DEFAULT '',
                deleted INTEGER NOT NULL DEFAULT 0,
                create_time TEXT NOT NULL,
                update_time TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_images_status ON images(status);
            CREATE INDEX IF NOT EXISTS idx_images_external_id ON images(external_id);
            CREATE INDEX IF NOT EXISTS idx_images_user_checksum ON images(user_id, checksum);
            "#,
        )?;

        debug!("image store schema initialized");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another store call panicked; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new record, assigning id and timestamps.
    pub fn add_image(&self, image: &mut Image) -> Result<(), StoreError> {
        let now = Utc::now();
        image.create_time = now;
        image.update_time = now;

        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO images (
                external_id, external_component, user_id, name, description, file_name,
                source_url, checksum, algorithm, image_path, checksum_path, publish,
                status, status_detail, deleted, create_time, update_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                image.external_id,
                image.external_component,
                image.user_id,
                image.name,
                image.description,
                image.file_name,
                image.source_url,
                image.checksum,
                image.algorithm.as_str(),
                image.image_path,
                image.checksum_path,
                image.publish,
                image.status.as_str(),
                image.status_detail,
                image.deleted,
                image.create_time,
                image.update_time,
            ],
        )?;
        image.id = conn.last_insert_rowid();
        Ok(())
    }

    /// Full update of the mutable fields of a record.
    pub fn update_image(&self, image: &mut Image) -> Result<(), StoreError> {
        image.update_time = Utc::now();
        let affected = self.lock().execute(
            r#"
            UPDATE images SET
                name = ?1, description = ?2, file_name = ?3, source_url = ?4,
                checksum = ?5, algorithm = ?6, image_path = ?7, checksum_path = ?8,
                publish = ?9, status = ?10, status_detail = ?11, update_time = ?12
            WHERE id = ?13
            "#,
            params![
                image.name,
                image.description,
                image.file_name,
                image.source_url,
                image.checksum,
                image.algorithm.as_str(),
                image.image_path,
                image.checksum_path,
                image.publish,
                image.status.as_str(),
                image.status_detail,
                image.update_time,
                image.id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("id {}", image.id)));
        }
        Ok(())
    }

    /// Update only the status of a record.
    pub fn update_image_status(&self, id: i64, status: ImageStatus) -> Result<(), StoreError> {
        let affected = self.lock().execute(
            "UPDATE images SET status = ?1, update_time = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now(), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("id {id}")));
        }
        Ok(())
    }

    /// Update status and human-readable detail together.
    pub fn update_image_status_and_detail(
        &self,
        id: i64,
        status: ImageStatus,
        detail: &str,
    ) -> Result<(), StoreError> {
        let affected = self.lock().execute(
            "UPDATE images SET status = ?1, status_detail = ?2, update_time = ?3 WHERE id = ?4",
            params![status.as_str(), detail, Utc::now(), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("id {id}")));
        }
        Ok(())
    }

    /// Rewrite the stored paths to their external URLs after a push.
    pub fn update_image_external_path(
        &self,
        id: i64,
        image_path: &str,
        checksum_path: &str,
    ) -> Result<(), StoreError> {
        let affected = self.lock().execute(
            "UPDATE images SET image_path = ?1, checksum_path = ?2, update_time = ?3 WHERE id = ?4",
            params![image_path, checksum_path, Utc::now(), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("id {id}")));
        }
        Ok(())
    }

    /// Soft-delete the live record for `(user_id, checksum)`.
    pub fn soft_delete_image(&self, user_id: i64, checksum: &str) -> Result<(), StoreError> {
        let affected = self.lock().execute(
            "UPDATE images SET deleted = 1, update_time = ?1 \
             WHERE user_id = ?2 AND checksum = ?3 AND deleted = 0",
            params![Utc::now(), user_id, checksum],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("user {user_id} checksum {checksum}")));
        }
        Ok(())
    }

    /// Hard-delete a record.
    pub fn delete_image_by_id(&self, id: i64) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM images WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_image_by_id(&self, id: i64) -> Result<Image, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1 AND deleted = 0"
        ))?;
        stmt.query_row(params![id], row_to_image)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("id {id}")))
    }

    pub fn get_image_by_external_id(&self, external_id: &str) -> Result<Image, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE external_id = ?1 AND deleted = 0 \
             ORDER BY create_time DESC, id DESC"
        ))?;
        stmt.query_row(params![external_id], row_to_image)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("external id {external_id}")))
    }

    /// Look up the live record for `(user_id, checksum)`, if any.
    pub fn get_image_by_checksum_and_user_id(
        &self,
        checksum: &str,
        user_id: i64,
    ) -> Result<Option<Image>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images \
             WHERE checksum = ?1 AND user_id = ?2 AND deleted = 0"
        ))?;
        Ok(stmt
            .query_row(params![checksum, user_id], row_to_image)
            .optional()?)
    }

    pub fn get_images_by_status(
        &self,
        status: ImageStatus,
        limit: usize,
    ) -> Result<Vec<Image>, StoreError> {
        self.query_images(
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images WHERE status = ?1 AND deleted = 0 \
                 ORDER BY create_time DESC, id DESC LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
        )
    }

    /// Images waiting to be pulled: `Created` with a source URL.
    pub fn get_image_for_download(&self, limit: usize) -> Result<Vec<Image>, StoreError> {
        self.query_images(
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images \
                 WHERE status = 'created' AND deleted = 0 \
                   AND source_url IS NOT NULL AND source_url != '' \
                 ORDER BY create_time DESC, id DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// In-flight downloads from a prior process incarnation (startup recovery).
    pub fn get_downloading_images(&self) -> Result<Vec<Image>, StoreError> {
        self.query_images(
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images \
                 WHERE status = 'downloading' AND deleted = 0 \
                 ORDER BY create_time DESC, id DESC"
            ),
            params![],
        )
    }

    /// In-flight pushes from a prior process incarnation (startup recovery).
    pub fn get_pushing_images(&self) -> Result<Vec<Image>, StoreError> {
        self.query_images(
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images \
                 WHERE status = 'pushing' AND deleted = 0 \
                 ORDER BY create_time DESC, id DESC"
            ),
            params![],
        )
    }

    pub fn get_image_for_verify(&self, limit: usize) -> Result<Vec<Image>, StoreError> {
        self.get_images_by_status(ImageStatus::Downloaded, limit)
    }

    /// Verified images marked for publication.
    pub fn get_image_for_push(&self, limit: usize) -> Result<Vec<Image>, StoreError> {
        self.query_images(
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images \
                 WHERE status = 'verified' AND publish = 1 AND deleted = 0 \
                 ORDER BY create_time DESC, id DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// Cleaner candidates: soft-deleted records or pushed images whose
    /// local files are reclaimable. The only query that sees deleted rows.
    pub fn get_image_for_clean(&self, limit: usize) -> Result<Vec<Image>, StoreError> {
        self.query_images(
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images \
                 WHERE deleted = 1 OR status = 'pushed' \
                 ORDER BY create_time DESC, id DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    fn query_images(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Image>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let images = stmt
            .query_map(params, row_to_image)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }
}
