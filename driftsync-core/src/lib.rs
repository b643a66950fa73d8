//! Driftsync Core Library
//!
//! The versioned, deduplicating synchronization database shared by all
//! replicas of a file tree:
//! - Vector clocks and database version history
//! - Deduplicated content model (chunks, multichunks, file contents,
//!   file histories)
//! - SQLite version store (WAL mode) with MASTER/DIRTY partition
//! - Branch reconciliation (down) with deterministic conflict resolution
//! - Publishing local versions (up)
//! - Cleanup/garbage collection with replayable purge versions
//! - Remote transfer abstraction with a local-directory backend and a
//!   fault-injecting test wrapper

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod down;
pub mod model;
pub mod multichunk;
pub mod store;
pub mod transfer;
pub mod up;
pub mod version;

pub use cleanup::{
    CleanupOperation, CleanupOptions, CleanupResult, CleanupResultCode, LocalStatus,
    NoPendingChanges,
};
pub use clock::{ClockComparison, VectorClock};
pub use config::RepoConfig;
pub use down::{Changeset, DownOperation, DownResult, DownStatus};
pub use model::{
    ChunkChecksum, ChunkEntry, FileChecksum, FileContent, FileHistoryId, FileStatus, FileType,
    FileVersion, ModelError, MultiChunkEntry, MultiChunkId, PartialFileHistory,
};
pub use multichunk::{MultiChunkReader, MultiChunkWriter, DEFAULT_MULTICHUNK_SIZE};
pub use store::{StoreCounts, StoreError, VersionCursor, VersionStore};
pub use transfer::{
    Cipher, LocalTransferManager, PlaintextCipher, RemoteFile, RemoteFileKind, StorageTestResult,
    TransferManager, UnreliableTransferManager,
};
pub use up::{UpOperation, UpResult};
pub use version::{
    decode_database_file, encode_database_file, DatabaseBranch, DatabaseBranches, DatabaseVersion,
    DatabaseVersionHeader, DatabaseVersionStatus, PurgeDelta,
};
