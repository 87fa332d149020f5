//! Persistent vector store for bookmark embeddings.
//!
//! Records live in a SQLite file (`vectors.db`) keyed by bookmark id.
//! Embeddings are stored as a blob of little-endian f32 values, one run of
//! `dimensions` floats per title segment, with the segment count in its own
//! column.
//!
//! Schema versions (tracked with `PRAGMA user_version`):
//! - 1: one vector per bookmark, no content hash
//! - 2: adds `segments` and `content_hash`. A version 1 row reads as a
//!   single segment and gets its content hash backfilled at open time.
//!
//! The connection is opened lazily on first use, shared by every holder of
//! the store and closed with [`VectorStore::close`] or on drop. The next
//! operation after a close reopens it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::semantic::preprocess::content_hash;

/// Current schema version
pub const SCHEMA_VERSION: u32 = 2;

const CREATE_V1: &str = r#"
CREATE TABLE IF NOT EXISTS bookmark (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    url TEXT,
    date_added INTEGER,
    embedding BLOB NOT NULL
)
"#;

const ALTER_V2: &str = r#"
ALTER TABLE bookmark ADD COLUMN segments INTEGER NOT NULL DEFAULT 1;
ALTER TABLE bookmark ADD COLUMN content_hash INTEGER NOT NULL DEFAULT 0;
"#;

const SELECT_COLUMNS: &str = "id, title, url, date_added, content_hash, segments, embedding";

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bookmark {0} is already indexed")]
    DuplicateKey(String),

    #[error("Dimension mismatch: store holds {expected}-dimensional vectors, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Unsupported schema version {found}, this build supports up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// A bookmark with the embedding of its title.
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkRecord {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    /// Milliseconds since the Unix epoch
    pub date_added: Option<i64>,
    /// Hash of the title the embedding was computed from
    pub content_hash: u64,
    /// One vector per title segment, in title order
    pub embedding: Vec<Vec<f32>>,
}

impl BookmarkRecord {
    /// Dimensionality of the record's vectors, `None` for an empty embedding.
    pub fn dimensions(&self) -> Option<usize> {
        self.embedding.first().map(Vec::len)
    }

    fn validate(&self) -> Result<usize, StoreError> {
        let dimensions = self
            .dimensions()
            .ok_or_else(|| StoreError::InvalidRecord(format!("bookmark {} has no embedding", self.id)))?;

        if dimensions == 0 {
            return Err(StoreError::InvalidRecord(format!(
                "bookmark {} has an empty vector",
                self.id
            )));
        }

        if let Some(segment) = self.embedding.iter().find(|s| s.len() != dimensions) {
            return Err(StoreError::InvalidRecord(format!(
                "bookmark {} mixes {dimensions}- and {}-dimensional segments",
                self.id,
                segment.len()
            )));
        }

        if self.embedding.len() > u16::MAX as usize {
            return Err(StoreError::InvalidRecord(format!(
                "bookmark {} has too many segments",
                self.id
            )));
        }

        Ok(dimensions)
    }
}

/// Keyed collection of bookmark records backed by a single SQLite file.
pub struct VectorStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl VectorStore {
    /// Create a store for the given database path. Nothing is opened yet.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            conn: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a connection is currently open.
    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    /// Close the connection. The next operation reopens it.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            log::debug!("closed vector store {}", self.path.display());
        }
        Ok(())
    }

    /// Every stored record in insertion order.
    pub fn get_all(&self) -> Result<Vec<BookmarkRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM bookmark ORDER BY seq"
            ))?;
            let rows = stmt.query_map([], RawRecord::from_row)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?.decode()?);
            }
            Ok(records)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<BookmarkRecord>, StoreError> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM bookmark WHERE id = ?1"),
                    params![id],
                    RawRecord::from_row,
                )
                .optional()?;
            raw.map(RawRecord::decode).transpose()
        })
    }

    pub fn has(&self, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM bookmark WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Insert a new record.
    ///
    /// Fails with [`StoreError::DuplicateKey`] when the id is already
    /// stored; this is not an upsert. Fails with
    /// [`StoreError::DimensionMismatch`] when the record's vectors differ in
    /// length from those already stored.
    pub fn add(&self, record: &BookmarkRecord) -> Result<(), StoreError> {
        let dimensions = record.validate()?;

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            check_dimensions(&tx, dimensions)?;
            insert_row(&tx, record, None)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Swap the stored record with the same id for `record`, keeping its
    /// position in insertion order. Inserts when the id is not stored.
    ///
    /// The old record is only removed if the new one is written: on
    /// [`StoreError::DimensionMismatch`] or any SQLite failure the store is
    /// left as it was.
    pub fn replace(&self, record: &BookmarkRecord) -> Result<(), StoreError> {
        let dimensions = record.validate()?;

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let seq: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM bookmark WHERE id = ?1",
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute("DELETE FROM bookmark WHERE id = ?1", params![record.id])?;

            check_dimensions(&tx, dimensions)?;
            insert_row(&tx, record, seq)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove one record. Returns false when the id was not stored.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM bookmark WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM bookmark", [])?;
            Ok(())
        })
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM bookmark", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Dimensionality shared by all stored vectors, `None` when empty.
    pub fn dimensions(&self) -> Result<Option<usize>, StoreError> {
        self.with_conn(|conn| stored_dimensions(conn))
    }

    /// On-disk schema version.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
    }

    /// Run `f` against the open connection, opening it first if needed.
    fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        if guard.is_none() {
            *guard = Some(self.open()?);
        }

        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Poisoned),
        }
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        migrate(&mut conn)?;

        log::debug!("opened vector store {}", self.path.display());
        Ok(conn)
    }
}

/// Bring the schema up to [`SCHEMA_VERSION`]. Every step is additive.
fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    if current == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    if current < 1 {
        tx.execute_batch(CREATE_V1)?;
    }

    if current < 2 {
        tx.execute_batch(ALTER_V2)?;
        backfill_content_hash(&tx)?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    if current > 0 {
        log::info!("migrated vector store schema from version {current} to {SCHEMA_VERSION}");
    }

    Ok(())
}

fn backfill_content_hash(conn: &Connection) -> Result<(), StoreError> {
    let titles: Vec<(i64, String)> = {
        let mut stmt = conn.prepare("SELECT seq, title FROM bookmark")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut update = conn.prepare("UPDATE bookmark SET content_hash = ?1 WHERE seq = ?2")?;
    for (seq, title) in titles {
        update.execute(params![content_hash(&title) as i64, seq])?;
    }
    Ok(())
}

fn check_dimensions(conn: &Connection, dimensions: usize) -> Result<(), StoreError> {
    match stored_dimensions(conn)? {
        Some(expected) if expected != dimensions => Err(StoreError::DimensionMismatch {
            expected,
            got: dimensions,
        }),
        _ => Ok(()),
    }
}

/// `seq` is `None` for a fresh row at the end of insertion order.
fn insert_row(conn: &Connection, record: &BookmarkRecord, seq: Option<i64>) -> Result<(), StoreError> {
    let inserted = conn.execute(
        "INSERT INTO bookmark (seq, id, title, url, date_added, content_hash, segments, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            seq,
            record.id,
            record.title,
            record.url,
            record.date_added,
            record.content_hash as i64,
            record.embedding.len() as i64,
            encode_segments(&record.embedding),
        ],
    );

    match inserted {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Err(StoreError::DuplicateKey(record.id.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

fn stored_dimensions(conn: &Connection) -> Result<Option<usize>, StoreError> {
    let first = conn
        .query_row(
            "SELECT segments, length(embedding) FROM bookmark ORDER BY seq LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    Ok(first.and_then(|(segments, bytes)| {
        if segments <= 0 {
            None
        } else {
            Some(bytes as usize / 4 / segments as usize)
        }
    }))
}

/// Concatenate segments as little-endian f32 values.
fn encode_segments(segments: &[Vec<f32>]) -> Vec<u8> {
    let total: usize = segments.iter().map(Vec::len).sum();
    let mut bytes = Vec::with_capacity(total * 4);
    for segment in segments {
        for value in segment {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

/// Split a blob back into `segments` equally sized vectors.
fn decode_segments(id: &str, bytes: &[u8], segments: usize) -> Result<Vec<Vec<f32>>, StoreError> {
    if segments == 0 || bytes.len() % 4 != 0 || (bytes.len() / 4) % segments != 0 {
        return Err(StoreError::InvalidRecord(format!(
            "bookmark {id}: {} bytes cannot hold {segments} segments",
            bytes.len()
        )));
    }

    let dimensions = bytes.len() / 4 / segments;
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    Ok(values.chunks(dimensions).map(<[f32]>::to_vec).collect())
}

/// Row as read from SQLite, before the embedding blob is decoded.
struct RawRecord {
    id: String,
    title: String,
    url: Option<String>,
    date_added: Option<i64>,
    content_hash: i64,
    segments: i64,
    embedding: Vec<u8>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            url: row.get(2)?,
            date_added: row.get(3)?,
            content_hash: row.get(4)?,
            segments: row.get(5)?,
            embedding: row.get(6)?,
        })
    }

    fn decode(self) -> Result<BookmarkRecord, StoreError> {
        let segments = usize::try_from(self.segments).unwrap_or(0);
        let embedding = decode_segments(&self.id, &self.embedding, segments)?;

        Ok(BookmarkRecord {
            id: self.id,
            title: self.title,
            url: self.url,
            date_added: self.date_added,
            content_hash: self.content_hash as u64,
            embedding,
        })
    }
}
