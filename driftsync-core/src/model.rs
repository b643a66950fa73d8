//! Deduplicated content model for the synchronization database.
//!
//! Files are split (by the external chunker) into content-addressed chunks,
//! chunks are packed into multichunks for transport, and a file content is an
//! ordered chunk recipe. A file's life at one path is a `PartialFileHistory`:
//! an append-only chain of `FileVersion`s.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Errors raised while assembling model objects, before anything is persisted.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("file version {version} does not follow current maximum {current_max}")]
    InvalidVersionOrder { version: u64, current_max: u64 },

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

macro_rules! checksum_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Compute the identifier from raw data.
            pub fn from_data(data: &[u8]) -> Self {
                Self(Sha256::digest(data).into())
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(hex_str: &str) -> Result<Self, ModelError> {
                let bytes = hex::decode(hex_str)
                    .map_err(|e| ModelError::InvalidId(e.to_string()))?;
                Self::from_slice(&bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ModelError> {
                if bytes.len() != 32 {
                    return Err(ModelError::InvalidId(format!(
                        "expected 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

checksum_type!(
    /// Content hash of a single chunk.
    ChunkChecksum
);
checksum_type!(
    /// Identifier of a multichunk, derived from its ordered chunk list.
    MultiChunkId
);
checksum_type!(
    /// Content hash of a fully reconstructed file.
    FileChecksum
);
checksum_type!(
    /// Identifier of a file history (one logical file across versions).
    FileHistoryId
);

impl MultiChunkId {
    /// Derive the id of a multichunk from the checksums it contains, in order.
    pub fn from_chunks(chunks: &[ChunkChecksum]) -> Self {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk.as_bytes());
        }
        Self(hasher.finalize().into())
    }
}

impl FileHistoryId {
    /// Deterministic id for a conflict copy of an existing history.
    ///
    /// Both sides of a conflict must derive the same id so their stores
    /// converge after exchanging database versions.
    pub fn conflict_copy(original: &FileHistoryId, losing_client: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(original.as_bytes());
        hasher.update(losing_client.as_bytes());
        Self(hasher.finalize().into())
    }
}

/// A content-addressed block of file data. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub checksum: ChunkChecksum,
    pub size: u64,
}

impl ChunkEntry {
    pub fn new(checksum: ChunkChecksum, size: u64) -> Self {
        Self { checksum, size }
    }
}

/// A packed container of chunks, the unit of remote storage.
///
/// A chunk belongs to exactly one multichunk at any time; the id is derived
/// from the chunk list and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChunkEntry {
    pub id: MultiChunkId,
    pub chunks: Vec<ChunkChecksum>,
}

impl MultiChunkEntry {
    pub fn new(chunks: Vec<ChunkChecksum>) -> Self {
        Self {
            id: MultiChunkId::from_chunks(&chunks),
            chunks,
        }
    }

    pub fn with_id(id: MultiChunkId, chunks: Vec<ChunkChecksum>) -> Self {
        Self { id, chunks }
    }
}

/// Ordered chunk recipe reconstructing one file's full bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub checksum: FileChecksum,
    pub size: u64,
    pub chunks: Vec<ChunkChecksum>,
}

impl FileContent {
    pub fn new(checksum: FileChecksum, size: u64, chunks: Vec<ChunkChecksum>) -> Self {
        Self {
            checksum,
            size,
            chunks,
        }
    }
}

/// Kind of filesystem entry a version describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Folder,
    Symlink,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "FILE",
            FileType::Folder => "FOLDER",
            FileType::Symlink => "SYMLINK",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "FILE" => Ok(FileType::File),
            "FOLDER" => Ok(FileType::Folder),
            "SYMLINK" => Ok(FileType::Symlink),
            other => Err(ModelError::InvalidId(format!("unknown file type {other}"))),
        }
    }
}

/// What happened to the path in this version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    New,
    Changed,
    Renamed,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "NEW",
            FileStatus::Changed => "CHANGED",
            FileStatus::Renamed => "RENAMED",
            FileStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "NEW" => Ok(FileStatus::New),
            "CHANGED" => Ok(FileStatus::Changed),
            "RENAMED" => Ok(FileStatus::Renamed),
            "DELETED" => Ok(FileStatus::Deleted),
            other => Err(ModelError::InvalidId(format!("unknown file status {other}"))),
        }
    }
}

/// One state of a file path at a point in history.
///
/// Deletions and folders carry no content checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub version: u64,
    pub path: String,
    pub file_type: FileType,
    pub status: FileStatus,
    pub checksum: Option<FileChecksum>,
    pub size: u64,
    /// Last-modified time, Unix seconds.
    pub last_modified: i64,
    /// Posix permission string, e.g. "rw-r--r--".
    pub posix_permissions: String,
}

impl FileVersion {
    pub fn is_deleted(&self) -> bool {
        self.status == FileStatus::Deleted
    }
}

/// Append-only chain of `FileVersion`s for one logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFileHistory {
    pub id: FileHistoryId,
    versions: Vec<FileVersion>,
}

impl PartialFileHistory {
    pub fn new(id: FileHistoryId) -> Self {
        Self {
            id,
            versions: Vec::new(),
        }
    }

    /// Append a version; its number must exceed the chain's current maximum.
    pub fn append(&mut self, version: FileVersion) -> Result<(), ModelError> {
        if let Some(last) = self.versions.last() {
            if version.version <= last.version {
                return Err(ModelError::InvalidVersionOrder {
                    version: version.version,
                    current_max: last.version,
                });
            }
        }
        self.versions.push(version);
        Ok(())
    }

    pub fn versions(&self) -> &[FileVersion] {
        &self.versions
    }

    pub fn last_version(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    pub fn max_version_number(&self) -> Option<u64> {
        self.versions.last().map(|v| v.version)
    }
}

/// Conflict-copy path for a losing file version: `file (B's conflicted copy).txt`.
pub fn conflict_copy_path(path: &str, losing_client: &str) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    format!("{dir}{stem} ({losing_client}'s conflicted copy){ext}")
}
