//! Database versions: the atomic unit of history.
//!
//! A `DatabaseVersion` bundles a header (replica id, wall-clock time, vector
//! clock) with the content-model delta produced by one synchronization cycle.
//! A replica's `DatabaseBranch` is the ordered sequence of headers it knows,
//! used to compute what one replica is missing relative to another.

use crate::clock::VectorClock;
use crate::model::{
    ChunkChecksum, ChunkEntry, FileChecksum, FileContent, FileHistoryId, ModelError,
    MultiChunkEntry, MultiChunkId, PartialFileHistory,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Magic bytes for serialized database files.
pub const DATABASE_FILE_MAGIC: &[u8; 4] = b"DSDB";

/// Format version for serialized database files.
pub const DATABASE_FILE_VERSION: u8 = 1;

/// Whether a persisted version belongs to accepted history or is locally
/// staged and pending removal. DIRTY rows are removed, never promoted back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseVersionStatus {
    Master,
    Dirty,
}

impl DatabaseVersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseVersionStatus::Master => "MASTER",
            DatabaseVersionStatus::Dirty => "DIRTY",
        }
    }

}

/// Identity and ordering metadata of one database version.
///
/// Uniquely identified by the (client, vector clock) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersionHeader {
    pub client: String,
    /// Wall-clock creation time, Unix seconds. Informational only; ordering
    /// is always decided by the vector clock.
    pub localtime: i64,
    pub vector_clock: VectorClock,
}

impl DatabaseVersionHeader {
    pub fn new(client: impl Into<String>, localtime: i64, vector_clock: VectorClock) -> Self {
        Self {
            client: client.into(),
            localtime,
            vector_clock,
        }
    }

    /// The logical time this header assigns to its own replica.
    pub fn own_logical_time(&self) -> u64 {
        self.vector_clock.get(&self.client)
    }
}

impl fmt::Display for DatabaseVersionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/T={}", self.client, self.vector_clock, self.localtime)
    }
}

/// Replay instructions carried by a cleanup's database version.
///
/// Other replicas apply the purge instead of re-deriving the pruning
/// decision, so all stores converge on identical rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeDelta {
    /// Per history: remove all file versions up to and including this number.
    pub file_versions_through: BTreeMap<FileHistoryId, u64>,
    /// Histories removed entirely (delete wins over keep).
    pub file_histories: Vec<FileHistoryId>,
    /// Multichunks whose chunks are all unreferenced after the prune.
    pub multichunks: Vec<MultiChunkId>,
}

impl PurgeDelta {
    pub fn is_empty(&self) -> bool {
        self.file_versions_through.is_empty()
            && self.file_histories.is_empty()
            && self.multichunks.is_empty()
    }
}

/// One atomic history delta: header plus added content-model entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersion {
    pub header: Option<DatabaseVersionHeader>,
    chunks: BTreeMap<ChunkChecksum, ChunkEntry>,
    multichunks: BTreeMap<MultiChunkId, MultiChunkEntry>,
    file_contents: BTreeMap<FileChecksum, FileContent>,
    file_histories: BTreeMap<FileHistoryId, PartialFileHistory>,
    pub purge: PurgeDelta,
}

impl DatabaseVersion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(header: DatabaseVersionHeader) -> Self {
        Self {
            header: Some(header),
            ..Self::default()
        }
    }

    pub fn header(&self) -> Result<&DatabaseVersionHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| anyhow!("database version has no header"))
    }

    /// Register a chunk. Re-adding identical content is a no-op.
    pub fn add_chunk(&mut self, chunk: ChunkEntry) {
        self.chunks.entry(chunk.checksum).or_insert(chunk);
    }

    /// Register a multichunk. Re-adding the same id is a no-op.
    pub fn add_multi_chunk(&mut self, multichunk: MultiChunkEntry) {
        self.multichunks.entry(multichunk.id).or_insert(multichunk);
    }

    /// Register a file content. Re-adding the same checksum is a no-op.
    pub fn add_file_content(&mut self, content: FileContent) {
        self.file_contents.entry(content.checksum).or_insert(content);
    }

    /// Register or extend a file history.
    ///
    /// Appending to an existing history fails if a version number does not
    /// exceed the chain's current maximum.
    pub fn add_file_history(&mut self, history: PartialFileHistory) -> Result<(), ModelError> {
        match self.file_histories.get_mut(&history.id) {
            Some(existing) => {
                for version in history.versions() {
                    existing.append(version.clone())?;
                }
                Ok(())
            }
            None => {
                self.file_histories.insert(history.id, history);
                Ok(())
            }
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ChunkEntry> {
        self.chunks.values()
    }

    pub fn multichunks(&self) -> impl Iterator<Item = &MultiChunkEntry> {
        self.multichunks.values()
    }

    pub fn file_contents(&self) -> impl Iterator<Item = &FileContent> {
        self.file_contents.values()
    }

    pub fn file_histories(&self) -> impl Iterator<Item = &PartialFileHistory> {
        self.file_histories.values()
    }

    /// Replace a history under a new id (conflict-copy rewrite).
    pub fn rename_file_history(&mut self, old: &FileHistoryId, renamed: PartialFileHistory) {
        self.file_histories.remove(old);
        self.file_histories.insert(renamed.id, renamed);
    }

    pub fn is_empty_delta(&self) -> bool {
        self.chunks.is_empty()
            && self.multichunks.is_empty()
            && self.file_contents.is_empty()
            && self.file_histories.is_empty()
            && self.purge.is_empty()
    }
}

/// Ordered sequence of a replica's database version headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseBranch {
    headers: Vec<DatabaseVersionHeader>,
}

impl DatabaseBranch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, header: DatabaseVersionHeader) {
        self.headers.push(header);
    }

    pub fn headers(&self) -> &[DatabaseVersionHeader] {
        &self.headers
    }

    pub fn last(&self) -> Option<&DatabaseVersionHeader> {
        self.headers.last()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn contains(&self, header: &DatabaseVersionHeader) -> bool {
        self.headers
            .iter()
            .any(|h| h.client == header.client && h.vector_clock == header.vector_clock)
    }

    /// Union of all clocks in the branch: "everything this branch knows".
    pub fn target_clock(&self) -> VectorClock {
        self.headers
            .iter()
            .fold(VectorClock::new(), |acc, h| acc.merged_with(&h.vector_clock))
    }

    /// Highest logical time this branch has seen from the given replica.
    pub fn max_logical_time(&self, client: &str) -> u64 {
        self.headers
            .iter()
            .map(|h| h.vector_clock.get(client))
            .max()
            .unwrap_or(0)
    }
}

/// Branches keyed by replica id, the reconciler's working set.
#[derive(Debug, Clone, Default)]
pub struct DatabaseBranches {
    branches: BTreeMap<String, DatabaseBranch>,
}

impl DatabaseBranches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch_mut(&mut self, client: &str) -> &mut DatabaseBranch {
        self.branches.entry(client.to_string()).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatabaseBranch)> {
        self.branches.iter().map(|(c, b)| (c.as_str(), b))
    }

    pub fn clients(&self) -> impl Iterator<Item = &str> {
        self.branches.keys().map(|c| c.as_str())
    }

    /// Union target clock over every branch.
    pub fn target_clock(&self) -> VectorClock {
        self.branches
            .values()
            .fold(VectorClock::new(), |acc, b| acc.merged_with(&b.target_clock()))
    }
}

/// Serialize a database file (one or more versions) with zstd framing.
///
/// Layout: magic(4), format version(1), uncompressed len(u32 LE),
/// compressed len(u32 LE), zstd payload.
pub fn encode_database_file(versions: &[DatabaseVersion]) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(versions).map_err(|e| anyhow!("failed to serialize database file: {e}"))?;
    let compressed =
        zstd::encode_all(&payload[..], 3).map_err(|e| anyhow!("failed to compress database file: {e}"))?;

    let mut buf = Vec::with_capacity(13 + compressed.len());
    buf.extend_from_slice(DATABASE_FILE_MAGIC);
    buf.push(DATABASE_FILE_VERSION);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Inverse of [`encode_database_file`].
pub fn decode_database_file(data: &[u8]) -> Result<Vec<DatabaseVersion>> {
    if data.len() < 13 {
        return Err(anyhow!("database file too short for header"));
    }
    if &data[0..4] != DATABASE_FILE_MAGIC {
        return Err(anyhow!("invalid database file magic"));
    }
    if data[4] != DATABASE_FILE_VERSION {
        return Err(anyhow!("unknown database file version {}", data[4]));
    }
    let compressed_len = u32::from_le_bytes(data[9..13].try_into().unwrap()) as usize;
    if data.len() < 13 + compressed_len {
        return Err(anyhow!("database file truncated"));
    }

    let payload = zstd::decode_all(&data[13..13 + compressed_len])
        .map_err(|e| anyhow!("failed to decompress database file: {e}"))?;
    bincode::deserialize(&payload).map_err(|e| anyhow!("failed to deserialize database file: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileStatus, FileType, FileVersion};

    fn header(client: &str, entries: &[(&str, u64)]) -> DatabaseVersionHeader {
        let mut clock = VectorClock::new();
        for (c, t) in entries {
            clock.set(*c, *t);
        }
        DatabaseVersionHeader::new(client, 1_700_000_000, clock)
    }

    fn sample_version() -> DatabaseVersion {
        let mut dv = DatabaseVersion::with_header(header("A", &[("A", 1)]));

        let chunk = ChunkEntry::new(ChunkChecksum::from_data(b"chunk"), 512);
        dv.add_chunk(chunk);
        dv.add_multi_chunk(MultiChunkEntry::new(vec![chunk.checksum]));

        let content = FileContent::new(FileChecksum::from_data(b"file"), 512, vec![chunk.checksum]);
        dv.add_file_content(content.clone());

        let mut history = PartialFileHistory::new(FileHistoryId::from_data(b"file.txt"));
        history
            .append(FileVersion {
                version: 1,
                path: "file.txt".to_string(),
                file_type: FileType::File,
                status: FileStatus::New,
                checksum: Some(content.checksum),
                size: 512,
                last_modified: 1_700_000_000,
                posix_permissions: "rw-r--r--".to_string(),
            })
            .unwrap();
        dv.add_file_history(history).unwrap();
        dv
    }

    #[test]
    fn test_add_chunk_is_idempotent() {
        let mut dv = sample_version();
        let before = dv.chunks().count();
        dv.add_chunk(ChunkEntry::new(ChunkChecksum::from_data(b"chunk"), 512));
        assert_eq!(dv.chunks().count(), before);
    }

    #[test]
    fn test_add_file_history_appends() {
        let mut dv = sample_version();
        let id = FileHistoryId::from_data(b"file.txt");

        let mut more = PartialFileHistory::new(id);
        more.append(FileVersion {
            version: 2,
            path: "file.txt".to_string(),
            file_type: FileType::File,
            status: FileStatus::Changed,
            checksum: Some(FileChecksum::from_data(b"file v2")),
            size: 600,
            last_modified: 1_700_000_100,
            posix_permissions: "rw-r--r--".to_string(),
        })
        .unwrap();
        dv.add_file_history(more).unwrap();

        let history = dv.file_histories().find(|h| h.id == id).unwrap();
        assert_eq!(history.versions().len(), 2);

        // Out-of-order append is rejected before anything changes.
        let mut stale = PartialFileHistory::new(id);
        stale
            .append(FileVersion {
                version: 2,
                path: "file.txt".to_string(),
                file_type: FileType::File,
                status: FileStatus::Changed,
                checksum: None,
                size: 0,
                last_modified: 0,
                posix_permissions: String::new(),
            })
            .unwrap();
        assert!(dv.add_file_history(stale).is_err());
    }

    #[test]
    fn test_branch_target_clock_and_contains() {
        let mut branch = DatabaseBranch::new();
        branch.add(header("A", &[("A", 1)]));
        branch.add(header("A", &[("A", 2), ("B", 1)]));

        assert_eq!(branch.target_clock().get("A"), 2);
        assert_eq!(branch.target_clock().get("B"), 1);
        assert_eq!(branch.max_logical_time("A"), 2);
        assert!(branch.contains(&header("A", &[("A", 1)])));
        assert!(!branch.contains(&header("B", &[("A", 1)])));
    }

    #[test]
    fn test_database_file_roundtrip() {
        let versions = vec![sample_version(), {
            let mut dv = DatabaseVersion::with_header(header("A", &[("A", 2)]));
            dv.purge
                .file_versions_through
                .insert(FileHistoryId::from_data(b"file.txt"), 3);
            dv
        }];

        let encoded = encode_database_file(&versions).unwrap();
        assert_eq!(&encoded[0..4], DATABASE_FILE_MAGIC);

        let decoded = decode_database_file(&encoded).unwrap();
        assert_eq!(decoded, versions);
    }

    #[test]
    fn test_database_file_rejects_garbage() {
        assert!(decode_database_file(b"tooshort").is_err());
        assert!(decode_database_file(&[0u8; 32]).is_err());
    }
}
