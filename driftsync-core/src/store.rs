//! SQLite-backed version store.
//!
//! Durable, transactional persistence for database versions and the content
//! model, with a MASTER/DIRTY status partition on the version table. Every
//! mutating operation runs inside one `rusqlite` transaction; a failure on any
//! exit path rolls the transaction back, so no partial delta is ever visible.
//! A small LRU cache answers chunk-presence probes for the external chunker
//! and is invalidated after every commit that could affect it.

use crate::clock::VectorClock;
use crate::model::{
    ChunkChecksum, ChunkEntry, FileChecksum, FileContent, FileHistoryId, FileStatus, FileType,
    FileVersion, ModelError, MultiChunkEntry, MultiChunkId, PartialFileHistory,
};
use crate::version::{
    DatabaseBranch, DatabaseVersion, DatabaseVersionHeader, DatabaseVersionStatus, PurgeDelta,
};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::debug;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the version store. Persistence failures are always
/// fatal to the calling operation; the store never drops a write silently.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("store corrupt: {0}")]
    Corrupt(String),
}

const CHUNK_CACHE_SIZE: usize = 4096;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS databaseversion (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL,
    localtime INTEGER NOT NULL,
    client TEXT NOT NULL,
    vectorclock TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS databaseversion_vectorclock (
    databaseversion_id INTEGER NOT NULL REFERENCES databaseversion(id),
    client TEXT NOT NULL,
    logicaltime INTEGER NOT NULL,
    PRIMARY KEY (databaseversion_id, client)
);
CREATE TABLE IF NOT EXISTS chunk (
    checksum BLOB PRIMARY KEY,
    size INTEGER NOT NULL,
    databaseversion_id INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS multichunk (
    id BLOB PRIMARY KEY,
    databaseversion_id INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS multichunk_chunk (
    multichunk_id BLOB NOT NULL,
    chunk_checksum BLOB NOT NULL,
    idx INTEGER NOT NULL,
    PRIMARY KEY (multichunk_id, chunk_checksum)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS filecontent (
    checksum BLOB PRIMARY KEY,
    size INTEGER NOT NULL,
    databaseversion_id INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS filecontent_chunk (
    filecontent_checksum BLOB NOT NULL,
    chunk_checksum BLOB NOT NULL,
    idx INTEGER NOT NULL,
    PRIMARY KEY (filecontent_checksum, idx)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS filehistory (
    id BLOB NOT NULL,
    databaseversion_id INTEGER NOT NULL,
    PRIMARY KEY (id, databaseversion_id)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS fileversion (
    filehistory_id BLOB NOT NULL,
    version INTEGER NOT NULL,
    databaseversion_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    filecontent_checksum BLOB,
    size INTEGER NOT NULL,
    lastmodified INTEGER NOT NULL,
    posixperms TEXT NOT NULL,
    PRIMARY KEY (filehistory_id, version, databaseversion_id)
) WITHOUT ROWID;
";

/// Table cardinalities, mostly for status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub database_versions: usize,
    pub chunks: usize,
    pub multichunks: usize,
    pub file_contents: usize,
    pub file_versions: usize,
    pub file_histories: usize,
}

pub struct VersionStore {
    conn: Connection,
    chunk_cache: LruCache<ChunkChecksum, u64>,
}

impl VersionStore {
    /// Open or create the store database at `<dir>/local.db`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("local.db");
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.execute_batch(SCHEMA)?;

        debug!(path = %db_path.display(), "opened version store");
        Ok(Self {
            conn,
            chunk_cache: LruCache::new(NonZeroUsize::new(CHUNK_CACHE_SIZE).unwrap()),
        })
    }

    /// In-memory store, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            chunk_cache: LruCache::new(NonZeroUsize::new(CHUNK_CACHE_SIZE).unwrap()),
        })
    }

    // ==================== Mutations ====================

    /// Persist a full database version in one transaction.
    ///
    /// Writes header and clock first, then chunks, multichunks, file contents
    /// and file histories, in that dependency order, and finally replays the
    /// version's purge delta (if any). On any failure nothing is retained.
    pub fn persist(
        &mut self,
        version: &DatabaseVersion,
        status: DatabaseVersionStatus,
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let version_id = write_version(&tx, version, status)?;
        tx.commit()?;

        self.chunk_cache.clear();
        debug!(version_id, "persisted database version");
        Ok(version_id)
    }

    /// Flag a previously persisted version as DIRTY.
    ///
    /// Dirty versions are speculative local state; they are removed by
    /// [`VersionStore::remove_dirty`], never promoted back to MASTER.
    pub fn mark_dirty(&mut self, vector_clock: &VectorClock) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE databaseversion SET status = 'DIRTY' WHERE vectorclock = ?1",
            params![vector_clock.to_string()],
        )?;
        self.chunk_cache.clear();
        debug!(clock = %vector_clock, affected, "marked database version dirty");
        Ok(())
    }

    /// Delete all DIRTY versions and their rows.
    ///
    /// Order matters for referential consistency: dirty file versions, dirty
    /// file histories, orphaned file contents, multichunk ownership
    /// reassignment to the newest MASTER version, dirty clock rows, dirty
    /// version rows. Unreferenced chunks and multichunks are deliberately
    /// left for cleanup to reclaim. Returns the removed version ids.
    pub fn remove_dirty(&mut self) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;

        let dirty_ids: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT id FROM databaseversion WHERE status = 'DIRTY' ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };

        if dirty_ids.is_empty() {
            return Ok(Vec::new());
        }

        // Multichunks already uploaded by an interrupted up stay owned by
        // the newest accepted version until cleanup decides their fate.
        let replacement_version_id: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(id), 0) FROM databaseversion WHERE status = 'MASTER'",
                [],
                |row| row.get(0),
            )?;

        let id_list = dirty_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        tx.execute_batch(&format!(
            "DELETE FROM fileversion WHERE databaseversion_id IN ({id_list});
             DELETE FROM filehistory WHERE databaseversion_id IN ({id_list});"
        ))?;
        remove_unreferenced_file_contents(&tx)?;
        tx.execute(
            &format!(
                "UPDATE multichunk SET databaseversion_id = ?1 \
                 WHERE databaseversion_id IN ({id_list})"
            ),
            params![replacement_version_id],
        )?;
        tx.execute_batch(&format!(
            "DELETE FROM databaseversion_vectorclock WHERE databaseversion_id IN ({id_list});
             DELETE FROM databaseversion WHERE id IN ({id_list});"
        ))?;

        tx.commit()?;
        self.chunk_cache.clear();
        debug!(removed = dirty_ids.len(), "removed dirty database versions");
        Ok(dirty_ids)
    }

    // ==================== Headers and branches ====================

    /// The most recently persisted MASTER header, if any.
    pub fn last_header(&self) -> Result<Option<DatabaseVersionHeader>> {
        let row: Option<(i64, String, i64)> = self
            .conn
            .query_row(
                "SELECT id, client, localtime FROM databaseversion \
                 WHERE status = 'MASTER' ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((id, client, localtime)) => {
                let clock = self.vector_clock_for(id)?;
                Ok(Some(DatabaseVersionHeader::new(client, localtime, clock)))
            }
            None => Ok(None),
        }
    }

    /// Reconstruct the local MASTER branch, headers in creation order.
    pub fn local_branch(&self) -> Result<DatabaseBranch> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client, localtime FROM databaseversion \
             WHERE status = 'MASTER' ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut branch = DatabaseBranch::new();
        for (id, client, localtime) in rows {
            let clock = self.vector_clock_for(id)?;
            branch.add(DatabaseVersionHeader::new(client, localtime, clock));
        }
        Ok(branch)
    }

    fn vector_clock_for(&self, version_id: i64) -> Result<VectorClock> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT client, logicaltime FROM databaseversion_vectorclock \
             WHERE databaseversion_id = ?1",
        )?;
        let mut clock = VectorClock::new();
        let mut rows = stmt.query(params![version_id])?;
        while let Some(row) = rows.next()? {
            clock.set(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64);
        }
        Ok(clock)
    }

    // ==================== Streaming ====================

    /// Lazy cursor over one replica's MASTER versions, up to and including
    /// the given logical time, in creation order.
    pub fn stream_versions(&self, client: &str, through_logical_time: u64) -> Result<VersionCursor<'_>> {
        let mut stmt = self.conn.prepare(
            "SELECT dv.id FROM databaseversion dv \
             JOIN databaseversion_vectorclock vc ON vc.databaseversion_id = dv.id \
             WHERE dv.status = 'MASTER' AND dv.client = ?1 \
               AND vc.client = ?1 AND vc.logicaltime <= ?2 \
             ORDER BY dv.id",
        )?;
        let ids = stmt
            .query_map(params![client, through_logical_time as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(VersionCursor::new(self, ids))
    }

    /// Lazy cursor over all DIRTY versions, in creation order.
    pub fn stream_dirty_versions(&self) -> Result<VersionCursor<'_>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM databaseversion WHERE status = 'DIRTY' ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(VersionCursor::new(self, ids))
    }

    pub fn has_dirty_versions(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM databaseversion WHERE status = 'DIRTY'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Materialize one full database version by internal id.
    fn load_version(&self, version_id: i64) -> Result<DatabaseVersion> {
        let (client, localtime): (String, i64) = self.conn.query_row(
            "SELECT client, localtime FROM databaseversion WHERE id = ?1",
            params![version_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let header =
            DatabaseVersionHeader::new(client, localtime, self.vector_clock_for(version_id)?);
        let mut version = DatabaseVersion::with_header(header);

        let mut stmt = self
            .conn
            .prepare_cached("SELECT checksum, size FROM chunk WHERE databaseversion_id = ?1")?;
        let mut rows = stmt.query(params![version_id])?;
        while let Some(row) = rows.next()? {
            let checksum = ChunkChecksum::from_slice(&row.get::<_, Vec<u8>>(0)?)?;
            version.add_chunk(ChunkEntry::new(checksum, row.get::<_, i64>(1)? as u64));
        }

        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM multichunk WHERE databaseversion_id = ?1")?;
        let mc_ids = stmt
            .query_map(params![version_id], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for raw_id in mc_ids {
            let id = MultiChunkId::from_slice(&raw_id)?;
            version.add_multi_chunk(MultiChunkEntry::with_id(id, self.multichunk_members(&id)?));
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT checksum, size FROM filecontent WHERE databaseversion_id = ?1",
        )?;
        let contents = stmt
            .query_map(params![version_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (raw_checksum, size) in contents {
            let checksum = FileChecksum::from_slice(&raw_checksum)?;
            let chunks = self.file_content_chunks(&checksum)?;
            version.add_file_content(FileContent::new(checksum, size as u64, chunks));
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT filehistory_id, version, path, type, status, filecontent_checksum, \
                    size, lastmodified, posixperms \
             FROM fileversion WHERE databaseversion_id = ?1 \
             ORDER BY filehistory_id, version",
        )?;
        let mut rows = stmt.query(params![version_id])?;
        let mut histories: BTreeMap<FileHistoryId, PartialFileHistory> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let history_id = FileHistoryId::from_slice(&row.get::<_, Vec<u8>>(0)?)?;
            let file_version = file_version_from_row(row)?;
            histories
                .entry(history_id)
                .or_insert_with(|| PartialFileHistory::new(history_id))
                .append(file_version)
                .map_err(StoreError::Model)?;
        }
        for (_, history) in histories {
            version.add_file_history(history)?;
        }

        Ok(version)
    }

    // ==================== Queries ====================

    /// Cached chunk-presence probe; the external chunker uses this to decide
    /// whether content needs to be packed at all.
    pub fn chunk_exists(&mut self, checksum: &ChunkChecksum) -> Result<bool> {
        if self.chunk_cache.contains(checksum) {
            return Ok(true);
        }
        let size: Option<i64> = self
            .conn
            .query_row(
                "SELECT size FROM chunk WHERE checksum = ?1",
                params![checksum.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(size) = size {
            self.chunk_cache.put(*checksum, size as u64);
            return Ok(true);
        }
        Ok(false)
    }

    /// All MASTER file histories with their full version chains.
    pub fn all_file_histories(&self) -> Result<Vec<PartialFileHistory>> {
        let mut stmt = self.conn.prepare(
            "SELECT fv.filehistory_id, fv.version, fv.path, fv.type, fv.status, \
                    fv.filecontent_checksum, fv.size, fv.lastmodified, fv.posixperms \
             FROM fileversion fv \
             JOIN databaseversion dv ON dv.id = fv.databaseversion_id \
             WHERE dv.status = 'MASTER' \
             ORDER BY fv.filehistory_id, fv.version",
        )?;
        let mut rows = stmt.query([])?;
        let mut histories: BTreeMap<FileHistoryId, PartialFileHistory> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let history_id = FileHistoryId::from_slice(&row.get::<_, Vec<u8>>(0)?)?;
            let file_version = file_version_from_row(row)?;
            histories
                .entry(history_id)
                .or_insert_with(|| PartialFileHistory::new(history_id))
                .append(file_version)
                .map_err(StoreError::Model)?;
        }
        Ok(histories.into_values().collect())
    }

    /// Newest MASTER file version per history, the store's view of the tree.
    pub fn newest_file_versions(&self) -> Result<BTreeMap<FileHistoryId, FileVersion>> {
        let mut newest = BTreeMap::new();
        for history in self.all_file_histories()? {
            if let Some(last) = history.last_version() {
                newest.insert(history.id, last.clone());
            }
        }
        Ok(newest)
    }

    /// Chunk membership of every multichunk, in pack order.
    pub fn multichunk_chunk_map(&self) -> Result<BTreeMap<MultiChunkId, Vec<ChunkChecksum>>> {
        let mut stmt = self.conn.prepare(
            "SELECT multichunk_id, chunk_checksum FROM multichunk_chunk \
             ORDER BY multichunk_id, idx",
        )?;
        let mut rows = stmt.query([])?;
        let mut map: BTreeMap<MultiChunkId, Vec<ChunkChecksum>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let id = MultiChunkId::from_slice(&row.get::<_, Vec<u8>>(0)?)?;
            let chunk = ChunkChecksum::from_slice(&row.get::<_, Vec<u8>>(1)?)?;
            map.entry(id).or_default().push(chunk);
        }
        Ok(map)
    }

    /// Chunk recipe of every file content.
    pub fn file_content_chunk_map(&self) -> Result<BTreeMap<FileChecksum, Vec<ChunkChecksum>>> {
        let mut stmt = self.conn.prepare(
            "SELECT filecontent_checksum, chunk_checksum FROM filecontent_chunk \
             ORDER BY filecontent_checksum, idx",
        )?;
        let mut rows = stmt.query([])?;
        let mut map: BTreeMap<FileChecksum, Vec<ChunkChecksum>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let checksum = FileChecksum::from_slice(&row.get::<_, Vec<u8>>(0)?)?;
            let chunk = ChunkChecksum::from_slice(&row.get::<_, Vec<u8>>(1)?)?;
            map.entry(checksum).or_default().push(chunk);
        }
        Ok(map)
    }

    fn file_content_chunks(&self, checksum: &FileChecksum) -> Result<Vec<ChunkChecksum>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT chunk_checksum FROM filecontent_chunk \
             WHERE filecontent_checksum = ?1 ORDER BY idx",
        )?;
        let raw = stmt
            .query_map(params![checksum.as_bytes().as_slice()], |row| {
                row.get::<_, Vec<u8>>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.iter()
            .map(|bytes| ChunkChecksum::from_slice(bytes).map_err(StoreError::Model))
            .collect()
    }

    fn multichunk_members(&self, id: &MultiChunkId) -> Result<Vec<ChunkChecksum>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT chunk_checksum FROM multichunk_chunk \
             WHERE multichunk_id = ?1 ORDER BY idx",
        )?;
        let raw = stmt
            .query_map(params![id.as_bytes().as_slice()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.iter()
            .map(|bytes| ChunkChecksum::from_slice(bytes).map_err(StoreError::Model))
            .collect()
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let count = |sql: &str| -> Result<usize> {
            Ok(self.conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
        };
        Ok(StoreCounts {
            database_versions: count("SELECT COUNT(*) FROM databaseversion")?,
            chunks: count("SELECT COUNT(*) FROM chunk")?,
            multichunks: count("SELECT COUNT(*) FROM multichunk")?,
            file_contents: count("SELECT COUNT(*) FROM filecontent")?,
            file_versions: count("SELECT COUNT(*) FROM fileversion")?,
            file_histories: count("SELECT COUNT(DISTINCT id) FROM filehistory")?,
        })
    }

    /// Deterministic digest over all logical rows; two stores holding the
    /// same history produce the same fingerprint.
    pub fn content_fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();

        let mut feed = |sql: &str| -> Result<()> {
            let mut stmt = self.conn.prepare(sql)?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                for i in 0..column_count {
                    use rusqlite::types::ValueRef;
                    match row.get_ref(i)? {
                        ValueRef::Null => hasher.update(b"\0null"),
                        ValueRef::Integer(v) => hasher.update(v.to_le_bytes()),
                        ValueRef::Real(v) => hasher.update(v.to_le_bytes()),
                        ValueRef::Text(v) => hasher.update(v),
                        ValueRef::Blob(v) => hasher.update(v),
                    }
                    hasher.update(b"\x1f");
                }
                hasher.update(b"\x1e");
            }
            Ok(())
        };

        feed("SELECT status, localtime, client, vectorclock FROM databaseversion ORDER BY id")?;
        feed("SELECT client, logicaltime FROM databaseversion_vectorclock ORDER BY databaseversion_id, client")?;
        feed("SELECT checksum, size FROM chunk ORDER BY checksum")?;
        feed("SELECT id FROM multichunk ORDER BY id")?;
        feed("SELECT multichunk_id, chunk_checksum, idx FROM multichunk_chunk ORDER BY multichunk_id, idx")?;
        feed("SELECT checksum, size FROM filecontent ORDER BY checksum")?;
        feed("SELECT filecontent_checksum, chunk_checksum, idx FROM filecontent_chunk ORDER BY filecontent_checksum, idx")?;
        feed("SELECT id FROM filehistory ORDER BY id, databaseversion_id")?;
        feed("SELECT filehistory_id, version, path, type, status, filecontent_checksum, size, lastmodified, posixperms FROM fileversion ORDER BY filehistory_id, version")?;

        Ok(hex::encode(hasher.finalize()))
    }
}

// ==================== Row writers (transaction scope) ====================

fn write_version(
    tx: &Transaction<'_>,
    version: &DatabaseVersion,
    status: DatabaseVersionStatus,
) -> Result<i64> {
    let header = version
        .header
        .as_ref()
        .ok_or_else(|| StoreError::Corrupt("database version without header".to_string()))?;

    tx.execute(
        "INSERT INTO databaseversion (status, localtime, client, vectorclock) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            status.as_str(),
            header.localtime,
            header.client,
            header.vector_clock.to_string()
        ],
    )?;
    let version_id = tx.last_insert_rowid();

    for (client, logical_time) in header.vector_clock.iter() {
        tx.execute(
            "INSERT INTO databaseversion_vectorclock \
             (databaseversion_id, client, logicaltime) VALUES (?1, ?2, ?3)",
            params![version_id, client, logical_time as i64],
        )?;
    }

    for chunk in version.chunks() {
        tx.execute(
            "INSERT OR IGNORE INTO chunk (checksum, size, databaseversion_id) \
             VALUES (?1, ?2, ?3)",
            params![chunk.checksum.as_bytes().as_slice(), chunk.size as i64, version_id],
        )?;
    }

    for multichunk in version.multichunks() {
        write_multichunk(tx, multichunk, version_id)?;
    }

    for content in version.file_contents() {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO filecontent (checksum, size, databaseversion_id) \
             VALUES (?1, ?2, ?3)",
            params![content.checksum.as_bytes().as_slice(), content.size as i64, version_id],
        )?;
        if inserted > 0 {
            for (idx, chunk) in content.chunks.iter().enumerate() {
                tx.execute(
                    "INSERT INTO filecontent_chunk \
                     (filecontent_checksum, chunk_checksum, idx) VALUES (?1, ?2, ?3)",
                    params![
                        content.checksum.as_bytes().as_slice(),
                        chunk.as_bytes().as_slice(),
                        idx as i64
                    ],
                )?;
            }
        }
    }

    for history in version.file_histories() {
        write_file_history(tx, history, version_id, status)?;
    }

    if !version.purge.is_empty() {
        apply_purge(tx, &version.purge)?;
    }

    Ok(version_id)
}

fn write_multichunk(tx: &Transaction<'_>, entry: &MultiChunkEntry, version_id: i64) -> Result<()> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO multichunk (id, databaseversion_id) VALUES (?1, ?2)",
        params![entry.id.as_bytes().as_slice(), version_id],
    )?;
    if inserted > 0 {
        for (idx, chunk) in entry.chunks.iter().enumerate() {
            tx.execute(
                "INSERT INTO multichunk_chunk (multichunk_id, chunk_checksum, idx) \
                 VALUES (?1, ?2, ?3)",
                params![
                    entry.id.as_bytes().as_slice(),
                    chunk.as_bytes().as_slice(),
                    idx as i64
                ],
            )?;
        }
    }
    Ok(())
}

fn write_file_history(
    tx: &Transaction<'_>,
    history: &PartialFileHistory,
    version_id: i64,
    status: DatabaseVersionStatus,
) -> Result<()> {
    let first_new = match history.versions().first() {
        Some(v) => v.version,
        None => return Ok(()),
    };

    // Appends to MASTER history must extend the persisted chain; this is
    // checked before any row of the history is written.
    if status == DatabaseVersionStatus::Master {
        let current_max: Option<i64> = tx
            .query_row(
                "SELECT MAX(fv.version) FROM fileversion fv \
                 JOIN databaseversion dv ON dv.id = fv.databaseversion_id \
                 WHERE fv.filehistory_id = ?1 AND dv.status = 'MASTER'",
                params![history.id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if let Some(current_max) = current_max {
            if first_new <= current_max as u64 {
                return Err(StoreError::Model(ModelError::InvalidVersionOrder {
                    version: first_new,
                    current_max: current_max as u64,
                }));
            }
        }
    }

    tx.execute(
        "INSERT OR IGNORE INTO filehistory (id, databaseversion_id) VALUES (?1, ?2)",
        params![history.id.as_bytes().as_slice(), version_id],
    )?;

    for file_version in history.versions() {
        tx.execute(
            "INSERT INTO fileversion \
             (filehistory_id, version, databaseversion_id, path, type, status, \
              filecontent_checksum, size, lastmodified, posixperms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                history.id.as_bytes().as_slice(),
                file_version.version as i64,
                version_id,
                file_version.path,
                file_version.file_type.as_str(),
                file_version.status.as_str(),
                file_version.checksum.as_ref().map(|c| c.as_bytes().to_vec()),
                file_version.size as i64,
                file_version.last_modified,
                file_version.posix_permissions,
            ],
        )?;
    }
    Ok(())
}

/// Replay a purge delta: expired file versions, purged histories, then
/// orphaned contents, orphaned chunk entries and the listed multichunks.
/// Runs the same way on every replica, which keeps stores identical.
fn apply_purge(tx: &Transaction<'_>, purge: &PurgeDelta) -> Result<()> {
    for (history_id, through_version) in &purge.file_versions_through {
        tx.execute(
            "DELETE FROM fileversion WHERE filehistory_id = ?1 AND version <= ?2",
            params![history_id.as_bytes().as_slice(), *through_version as i64],
        )?;
    }
    for history_id in &purge.file_histories {
        tx.execute(
            "DELETE FROM fileversion WHERE filehistory_id = ?1",
            params![history_id.as_bytes().as_slice()],
        )?;
    }
    tx.execute(
        "DELETE FROM filehistory WHERE id NOT IN (SELECT DISTINCT filehistory_id FROM fileversion)",
        [],
    )?;
    remove_unreferenced_file_contents(tx)?;
    tx.execute(
        "DELETE FROM chunk WHERE checksum NOT IN \
         (SELECT DISTINCT chunk_checksum FROM filecontent_chunk)",
        [],
    )?;
    for multichunk_id in &purge.multichunks {
        tx.execute(
            "DELETE FROM multichunk_chunk WHERE multichunk_id = ?1",
            params![multichunk_id.as_bytes().as_slice()],
        )?;
        tx.execute(
            "DELETE FROM multichunk WHERE id = ?1",
            params![multichunk_id.as_bytes().as_slice()],
        )?;
    }
    Ok(())
}

fn remove_unreferenced_file_contents(tx: &Transaction<'_>) -> Result<()> {
    tx.execute(
        "DELETE FROM filecontent_chunk WHERE filecontent_checksum NOT IN \
         (SELECT DISTINCT filecontent_checksum FROM fileversion \
          WHERE filecontent_checksum IS NOT NULL)",
        [],
    )?;
    tx.execute(
        "DELETE FROM filecontent WHERE checksum NOT IN \
         (SELECT DISTINCT filecontent_checksum FROM fileversion \
          WHERE filecontent_checksum IS NOT NULL)",
        [],
    )?;
    Ok(())
}

fn file_version_from_row(row: &rusqlite::Row<'_>) -> Result<FileVersion> {
    let checksum = row
        .get::<_, Option<Vec<u8>>>(5)?
        .map(|bytes| FileChecksum::from_slice(&bytes))
        .transpose()?;
    Ok(FileVersion {
        version: row.get::<_, i64>(1)? as u64,
        path: row.get(2)?,
        file_type: FileType::parse(&row.get::<_, String>(3)?)?,
        status: FileStatus::parse(&row.get::<_, String>(4)?)?,
        checksum,
        size: row.get::<_, i64>(6)? as u64,
        last_modified: row.get(7)?,
        posix_permissions: row.get(8)?,
    })
}

/// Lazy, finite, forward-only sequence of fully materialized database
/// versions. Header ids are snapshotted up front; each `next()` call loads
/// one full version. Restart by issuing the query again.
pub struct VersionCursor<'a> {
    store: &'a VersionStore,
    ids: std::vec::IntoIter<i64>,
}

impl<'a> VersionCursor<'a> {
    fn new(store: &'a VersionStore, ids: Vec<i64>) -> Self {
        Self {
            store,
            ids: ids.into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.len() == 0
    }
}

impl Iterator for VersionCursor<'_> {
    type Item = Result<DatabaseVersion>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        Some(self.store.load_version(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileStatus, FileType};
    use tempfile::TempDir;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        let mut c = VectorClock::new();
        for (client, time) in entries {
            c.set(*client, *time);
        }
        c
    }

    fn file_version(n: u64, path: &str, checksum: Option<FileChecksum>) -> FileVersion {
        FileVersion {
            version: n,
            path: path.to_string(),
            file_type: FileType::File,
            status: if n == 1 { FileStatus::New } else { FileStatus::Changed },
            checksum,
            size: 512,
            last_modified: 1_700_000_000 + n as i64,
            posix_permissions: "rw-r--r--".to_string(),
        }
    }

    fn sample_version(client: &str, logical_time: u64, path: &str) -> DatabaseVersion {
        let mut dv = DatabaseVersion::with_header(DatabaseVersionHeader::new(
            client,
            1_700_000_000,
            clock(&[(client, logical_time)]),
        ));

        let seed = format!("{path}-{logical_time}");
        let chunk = ChunkEntry::new(ChunkChecksum::from_data(seed.as_bytes()), 512);
        dv.add_chunk(chunk);
        dv.add_multi_chunk(MultiChunkEntry::new(vec![chunk.checksum]));
        let content =
            FileContent::new(FileChecksum::from_data(seed.as_bytes()), 512, vec![chunk.checksum]);
        dv.add_file_content(content.clone());

        let mut history = PartialFileHistory::new(FileHistoryId::from_data(path.as_bytes()));
        history
            .append(file_version(logical_time, path, Some(content.checksum)))
            .unwrap();
        dv.add_file_history(history).unwrap();
        dv
    }

    #[test]
    fn test_persist_and_reload_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut store = VersionStore::open(tmp.path()).unwrap();

        let dv = sample_version("A", 1, "file.txt");
        store.persist(&dv, DatabaseVersionStatus::Master).unwrap();

        let reloaded: Vec<_> = store
            .stream_versions("A", 10)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0], dv);
    }

    #[test]
    fn test_persist_rejects_out_of_order_history_append() {
        let mut store = VersionStore::open_in_memory().unwrap();
        store
            .persist(&sample_version("A", 1, "file.txt"), DatabaseVersionStatus::Master)
            .unwrap();

        // Same history, same version number again: rejected, nothing written.
        let mut stale = DatabaseVersion::with_header(DatabaseVersionHeader::new(
            "A",
            1_700_000_000,
            clock(&[("A", 2)]),
        ));
        let mut history = PartialFileHistory::new(FileHistoryId::from_data(b"file.txt"));
        history.append(file_version(1, "file.txt", None)).unwrap();
        stale.add_file_history(history).unwrap();

        let before = store.counts().unwrap();
        let err = store.persist(&stale, DatabaseVersionStatus::Master).err();
        assert!(matches!(err, Some(StoreError::Model(_))));
        assert_eq!(store.counts().unwrap(), before);
    }

    #[test]
    fn test_local_branch_and_last_header() {
        let mut store = VersionStore::open_in_memory().unwrap();
        store
            .persist(&sample_version("A", 1, "a.txt"), DatabaseVersionStatus::Master)
            .unwrap();
        let mut second = sample_version("A", 2, "b.txt");
        second.header.as_mut().unwrap().vector_clock = clock(&[("A", 2)]);
        store.persist(&second, DatabaseVersionStatus::Master).unwrap();

        let branch = store.local_branch().unwrap();
        assert_eq!(branch.len(), 2);
        assert_eq!(branch.max_logical_time("A"), 2);
        assert_eq!(
            store.last_header().unwrap().unwrap().vector_clock,
            clock(&[("A", 2)])
        );
    }

    #[test]
    fn test_mark_and_remove_dirty() {
        let mut store = VersionStore::open_in_memory().unwrap();
        let master = sample_version("A", 1, "kept.txt");
        store.persist(&master, DatabaseVersionStatus::Master).unwrap();

        let speculative = sample_version("B", 1, "speculative.txt");
        store
            .persist(&speculative, DatabaseVersionStatus::Master)
            .unwrap();
        store
            .mark_dirty(&speculative.header().unwrap().vector_clock)
            .unwrap();
        assert!(store.has_dirty_versions().unwrap());

        let dirty: Vec<_> = store
            .stream_dirty_versions()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].header().unwrap().client, "B");

        let removed = store.remove_dirty().unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!store.has_dirty_versions().unwrap());

        // Dirty file versions and contents are gone, MASTER rows untouched,
        // the dirty multichunk is reassigned and left for cleanup.
        let counts = store.counts().unwrap();
        assert_eq!(counts.database_versions, 1);
        assert_eq!(counts.file_versions, 1);
        assert_eq!(counts.file_contents, 1);
        assert_eq!(counts.file_histories, 1);
        assert_eq!(counts.multichunks, 2);
        assert_eq!(counts.chunks, 2);

        let branch = store.local_branch().unwrap();
        assert_eq!(branch.len(), 1);
        assert_eq!(branch.headers()[0].client, "A");
    }

    #[test]
    fn test_chunk_exists_cache_invalidation() {
        let mut store = VersionStore::open_in_memory().unwrap();
        let dv = sample_version("A", 1, "file.txt");
        let checksum = dv.chunks().next().unwrap().checksum;

        assert!(!store.chunk_exists(&checksum).unwrap());
        store.persist(&dv, DatabaseVersionStatus::Master).unwrap();
        assert!(store.chunk_exists(&checksum).unwrap());
        assert!(!store.chunk_exists(&ChunkChecksum::from_data(b"missing")).unwrap());
    }

    #[test]
    fn test_stream_versions_is_bounded_by_logical_time() {
        let mut store = VersionStore::open_in_memory().unwrap();
        for n in 1..=3u64 {
            let mut dv = sample_version("A", n, &format!("f{n}.txt"));
            dv.header.as_mut().unwrap().vector_clock = clock(&[("A", n)]);
            store.persist(&dv, DatabaseVersionStatus::Master).unwrap();
        }

        let cursor = store.stream_versions("A", 2).unwrap();
        assert_eq!(cursor.len(), 2);
        let versions: Vec<_> = cursor.collect::<Result<_>>().unwrap();
        assert_eq!(versions[0].header().unwrap().own_logical_time(), 1);
        assert_eq!(versions[1].header().unwrap().own_logical_time(), 2);
    }

    #[test]
    fn test_purge_delta_removes_orphans() {
        let mut store = VersionStore::open_in_memory().unwrap();
        for n in 1..=3u64 {
            let mut dv = DatabaseVersion::with_header(DatabaseVersionHeader::new(
                "A",
                1_700_000_000,
                clock(&[("A", n)]),
            ));
            let seed = format!("file-{n}");
            let chunk = ChunkEntry::new(ChunkChecksum::from_data(seed.as_bytes()), 512);
            dv.add_chunk(chunk);
            dv.add_multi_chunk(MultiChunkEntry::new(vec![chunk.checksum]));
            let content =
                FileContent::new(FileChecksum::from_data(seed.as_bytes()), 512, vec![chunk.checksum]);
            dv.add_file_content(content.clone());
            let mut history = PartialFileHistory::new(FileHistoryId::from_data(b"file.txt"));
            history
                .append(file_version(n, "file.txt", Some(content.checksum)))
                .unwrap();
            dv.add_file_history(history).unwrap();
            store.persist(&dv, DatabaseVersionStatus::Master).unwrap();
        }

        let multichunks = store.multichunk_chunk_map().unwrap();
        let doomed: Vec<MultiChunkId> = multichunks
            .iter()
            .filter(|(_, chunks)| {
                chunks.contains(&ChunkChecksum::from_data(b"file-1"))
            })
            .map(|(id, _)| *id)
            .collect();

        let mut purge_version = DatabaseVersion::with_header(DatabaseVersionHeader::new(
            "A",
            1_700_000_100,
            clock(&[("A", 4)]),
        ));
        purge_version
            .purge
            .file_versions_through
            .insert(FileHistoryId::from_data(b"file.txt"), 1);
        purge_version.purge.multichunks = doomed;
        store
            .persist(&purge_version, DatabaseVersionStatus::Master)
            .unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.file_versions, 2);
        assert_eq!(counts.file_contents, 2);
        assert_eq!(counts.chunks, 2);
        assert_eq!(counts.multichunks, 2);
    }
}
