//! Cleanup: pruning obsolete history and reclaiming remote space.
//!
//! Cleanup only runs from a fully synchronized state (no dirty rows, no
//! pending local changes, no unseen remote versions). All pruning decisions
//! are captured in a purge delta carried by a regular database version, so
//! every other replica replays the identical deletions instead of
//! re-deriving them. Local mutations commit in one transaction before any
//! remote deletion is attempted; remote deletions are best-effort.

use crate::config::RepoConfig;
use crate::down::remote_changes_exist;
use crate::model::{ChunkChecksum, FileChecksum, MultiChunkId};
use crate::multichunk::{MultiChunkReader, MultiChunkWriter, DEFAULT_MULTICHUNK_SIZE};
use crate::store::VersionStore;
use crate::transfer::{Cipher, RemoteFile, RemoteFileKind, TransferManager};
use crate::up::upload_bytes;
use crate::version::{
    encode_database_file, DatabaseVersion, DatabaseVersionHeader, DatabaseVersionStatus,
    PurgeDelta,
};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Reports whether the local tree has edits not yet captured in a database
/// version. Scanning lives outside the core; cleanup only needs the verdict.
pub trait LocalStatus {
    fn has_local_changes(&self) -> Result<bool>;
}

/// Status source for a tree known to be clean (tests, post-up callers).
pub struct NoPendingChanges;

impl LocalStatus for NoPendingChanges {
    fn has_local_changes(&self) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub remove_old_versions: bool,
    /// Most recent versions kept per file history when pruning.
    pub keep_versions_count: usize,
    pub repackage_multichunks: bool,
    /// Multichunks whose referenced-chunk ratio falls below this are
    /// repackaged.
    pub repackage_fill_ratio: f64,
    pub merge_remote_files: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            remove_old_versions: true,
            keep_versions_count: 5,
            repackage_multichunks: false,
            repackage_fill_ratio: 0.75,
            merge_remote_files: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupResultCode {
    Ok,
    OkNothingDone,
    /// Dirty rows exist; a prior up/down was interrupted.
    NokDirtyLocal,
    /// The local tree has uncaptured edits.
    NokLocalChanges,
    /// The remote holds versions this replica has not applied.
    NokRemoteChanges,
}

#[derive(Debug)]
pub struct CleanupResult {
    pub code: CleanupResultCode,
    /// File histories pruned or purged entirely.
    pub removed_old_versions_count: usize,
    /// Multichunks removed locally and (best-effort) remotely, including
    /// repackaged ones.
    pub removed_multichunks: Vec<MultiChunkId>,
    pub repackaged_multichunks_count: usize,
    pub merged_database_files_count: usize,
}

impl CleanupResult {
    fn precondition(code: CleanupResultCode) -> Self {
        Self {
            code,
            removed_old_versions_count: 0,
            removed_multichunks: Vec::new(),
            repackaged_multichunks_count: 0,
            merged_database_files_count: 0,
        }
    }
}

pub struct CleanupOperation<'a, T: TransferManager, C: Cipher> {
    config: &'a RepoConfig,
    store: &'a mut VersionStore,
    transfer: &'a T,
    cipher: &'a C,
    local_status: &'a dyn LocalStatus,
    options: CleanupOptions,
}

impl<'a, T: TransferManager, C: Cipher> CleanupOperation<'a, T, C> {
    pub fn new(
        config: &'a RepoConfig,
        store: &'a mut VersionStore,
        transfer: &'a T,
        cipher: &'a C,
        local_status: &'a dyn LocalStatus,
        options: CleanupOptions,
    ) -> Self {
        Self {
            config,
            store,
            transfer,
            cipher,
            local_status,
            options,
        }
    }

    pub fn execute(&mut self) -> Result<CleanupResult> {
        // Preconditions, checked in order with short-circuit.
        if self.store.has_dirty_versions()? {
            info!("cleanup blocked: dirty database versions present");
            return Ok(CleanupResult::precondition(CleanupResultCode::NokDirtyLocal));
        }
        if self.local_status.has_local_changes()? {
            info!("cleanup blocked: local changes pending");
            return Ok(CleanupResult::precondition(
                CleanupResultCode::NokLocalChanges,
            ));
        }
        let branch = self.store.local_branch()?;
        if remote_changes_exist(self.transfer, &branch)? {
            info!("cleanup blocked: remote changes not yet applied");
            return Ok(CleanupResult::precondition(
                CleanupResultCode::NokRemoteChanges,
            ));
        }

        let mut purge = PurgeDelta::default();
        if self.options.remove_old_versions {
            self.plan_version_pruning(&mut purge)?;
        }

        let surviving_chunks = self.surviving_chunks(&purge)?;
        let multichunk_map = self.store.multichunk_chunk_map()?;
        for (id, chunks) in &multichunk_map {
            if chunks.iter().all(|c| !surviving_chunks.contains(c)) {
                purge.multichunks.push(*id);
            }
        }

        let mut new_multichunks = Vec::new();
        let mut repackaged = Vec::new();
        // Staging space for repackaging; must outlive the uploads below.
        let mut staging = None;
        if self.options.repackage_multichunks {
            let dir = tempfile::tempdir().context("Failed to create repackaging directory")?;
            self.plan_repackaging(
                dir.path(),
                &purge,
                &multichunk_map,
                &surviving_chunks,
                &mut new_multichunks,
                &mut repackaged,
            )?;
            staging = Some(dir);
        }

        let merge_candidates = if self.options.merge_remote_files {
            self.own_remote_databases()?
        } else {
            Vec::new()
        };

        let removed_old_versions_count =
            purge.file_versions_through.len() + purge.file_histories.len();
        let has_purge_work = !purge.is_empty() || !new_multichunks.is_empty();
        if !has_purge_work && merge_candidates.len() <= 1 {
            info!("cleanup found nothing to do");
            return Ok(CleanupResult::precondition(
                CleanupResultCode::OkNothingDone,
            ));
        }

        let mut removed_multichunks = purge.multichunks.clone();
        removed_multichunks.extend(repackaged.iter().copied());

        // Merging alone reorganizes remote files without touching logical
        // history, so no purge version is created for it.
        if has_purge_work {
            // Repackaged containers go up before the local commit; surplus
            // remote files are harmless, missing ones are not.
            for (entry, path) in &new_multichunks {
                self.transfer
                    .upload(path, &RemoteFile::multichunk(entry.id))?;
            }
            drop(staging);
            purge.multichunks.extend(repackaged.iter().copied());

            // One transaction: the purge version enters local history and its
            // delta is replayed, exactly as other replicas will replay it.
            let header = DatabaseVersionHeader::new(
                self.config.machine_name.clone(),
                chrono::Utc::now().timestamp(),
                branch.target_clock().increment(&self.config.machine_name),
            );
            info!(header = %header, "persisting purge database version");
            let mut purge_version = DatabaseVersion::with_header(header.clone());
            purge_version.purge = purge;
            for (entry, _) in &new_multichunks {
                purge_version.add_multi_chunk(entry.clone());
            }
            self.store
                .persist(&purge_version, DatabaseVersionStatus::Master)
                .context("Failed to persist purge database version")?;

            let encoded = encode_database_file(std::slice::from_ref(&purge_version))?;
            upload_bytes(
                self.transfer,
                &self.cipher.encrypt(&encoded)?,
                &RemoteFile::database(&header.client, header.own_logical_time()),
            )
            .context("Failed to upload purge database file")?;
        }

        let merged_database_files_count = if merge_candidates.len() > 1 {
            self.merge_remote_files()?
        } else {
            0
        };

        // Best-effort remote deletions; the local store stays authoritative
        // and the next cleanup retries the same orphans.
        for id in &removed_multichunks {
            if let Err(e) = self.transfer.delete(&RemoteFile::multichunk(*id)) {
                warn!(multichunk = %id, error = %e, "remote multichunk deletion failed");
            }
        }

        info!(
            removed_old_versions_count,
            removed_multichunks = removed_multichunks.len(),
            repackaged = repackaged.len(),
            merged_database_files_count,
            "cleanup complete"
        );
        Ok(CleanupResult {
            code: CleanupResultCode::Ok,
            removed_old_versions_count,
            removed_multichunks,
            repackaged_multichunks_count: repackaged.len(),
            merged_database_files_count,
        })
    }

    /// Decide which file versions and histories to prune. Delete wins over
    /// keep: a history whose newest version is a deletion is purged whole.
    fn plan_version_pruning(&self, purge: &mut PurgeDelta) -> Result<()> {
        for history in self.store.all_file_histories()? {
            let versions = history.versions();
            let newest = match versions.last() {
                Some(v) => v,
                None => continue,
            };
            if newest.is_deleted() {
                purge.file_histories.push(history.id);
            } else if versions.len() > self.options.keep_versions_count {
                let cutoff = &versions[versions.len() - self.options.keep_versions_count - 1];
                purge.file_versions_through.insert(history.id, cutoff.version);
            }
        }
        Ok(())
    }

    /// Chunks still referenced by any file content that survives the prune.
    fn surviving_chunks(&self, purge: &PurgeDelta) -> Result<BTreeSet<ChunkChecksum>> {
        let mut surviving_contents: BTreeSet<FileChecksum> = BTreeSet::new();
        for history in self.store.all_file_histories()? {
            if purge.file_histories.contains(&history.id) {
                continue;
            }
            let through = purge
                .file_versions_through
                .get(&history.id)
                .copied()
                .unwrap_or(0);
            for version in history.versions() {
                if version.version > through {
                    if let Some(checksum) = version.checksum {
                        surviving_contents.insert(checksum);
                    }
                }
            }
        }

        let content_map = self.store.file_content_chunk_map()?;
        let mut chunks = BTreeSet::new();
        for checksum in &surviving_contents {
            if let Some(list) = content_map.get(checksum) {
                chunks.extend(list.iter().copied());
            }
        }
        Ok(chunks)
    }

    /// Download under-full multichunks and repack their live chunks into
    /// fresh containers. The old ids join the purge list; the new entries
    /// ride in the purge version's delta.
    fn plan_repackaging(
        &self,
        staging: &std::path::Path,
        purge: &PurgeDelta,
        multichunk_map: &std::collections::BTreeMap<MultiChunkId, Vec<ChunkChecksum>>,
        surviving_chunks: &BTreeSet<ChunkChecksum>,
        new_multichunks: &mut Vec<(crate::model::MultiChunkEntry, std::path::PathBuf)>,
        repackaged: &mut Vec<MultiChunkId>,
    ) -> Result<()> {
        let mut writer = MultiChunkWriter::new(DEFAULT_MULTICHUNK_SIZE);
        let mut packed_count = 0usize;

        for (id, chunks) in multichunk_map {
            if purge.multichunks.contains(id) || chunks.is_empty() {
                continue;
            }
            let referenced = chunks
                .iter()
                .filter(|c| surviving_chunks.contains(*c))
                .count();
            let ratio = referenced as f64 / chunks.len() as f64;
            if ratio >= self.options.repackage_fill_ratio {
                continue;
            }

            info!(multichunk = %id, ratio, "repackaging under-full multichunk");
            let local = staging.join(format!("dl-{}", id.to_hex()));
            self.transfer
                .download(&RemoteFile::multichunk(*id), &local)?;
            let reader = MultiChunkReader::open(&local)?;
            for (checksum, data) in reader.read_all()? {
                if !surviving_chunks.contains(&checksum) {
                    continue;
                }
                writer.add_chunk(checksum, data);
                if writer.is_full() {
                    let path = staging.join(format!("repack-{packed_count}"));
                    new_multichunks.push((writer.write(&path)?, path));
                    packed_count += 1;
                    writer = MultiChunkWriter::new(DEFAULT_MULTICHUNK_SIZE);
                }
            }
            repackaged.push(*id);
        }

        if !writer.is_empty() {
            let path = staging.join(format!("repack-{packed_count}"));
            new_multichunks.push((writer.write(&path)?, path));
        }
        Ok(())
    }

    fn own_remote_databases(&self) -> Result<Vec<RemoteFile>> {
        Ok(self
            .transfer
            .list(RemoteFileKind::Database)?
            .into_iter()
            .filter(|remote| {
                matches!(remote, RemoteFile::Database { client, .. }
                    if *client == self.config.machine_name)
            })
            .collect())
    }

    /// Collapse this replica's per-version remote database files into one
    /// consolidated file carrying the same versions. Runs after the purge
    /// version exists, so the consolidated file includes it.
    fn merge_remote_files(&mut self) -> Result<usize> {
        let own = self.own_remote_databases()?;
        if own.len() <= 1 {
            return Ok(0);
        }

        let max_time = self
            .store
            .local_branch()?
            .max_logical_time(&self.config.machine_name);
        let versions: Vec<DatabaseVersion> = self
            .store
            .stream_versions(&self.config.machine_name, max_time)?
            .collect::<crate::store::Result<_>>()?;
        if versions.is_empty() {
            return Ok(0);
        }

        let merged = RemoteFile::database(&self.config.machine_name, max_time);
        let encoded = encode_database_file(&versions)?;
        upload_bytes(self.transfer, &self.cipher.encrypt(&encoded)?, &merged)
            .context("Failed to upload merged database file")?;
        info!(name = %merged.name(), versions = versions.len(), "merged remote database files");

        let mut deleted = 0;
        for remote in own {
            if remote == merged {
                continue;
            }
            match self.transfer.delete(&remote) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(name = %remote.name(), error = %e, "remote database deletion failed"),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::model::{
        ChunkEntry, FileContent, FileHistoryId, FileStatus, FileType, FileVersion,
        PartialFileHistory,
    };
    use crate::transfer::{LocalTransferManager, PlaintextCipher};
    use tempfile::TempDir;

    struct PendingChanges;

    impl LocalStatus for PendingChanges {
        fn has_local_changes(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn version_for(client: &str, logical_time: u64, path: &str, number: u64) -> DatabaseVersion {
        let mut clock = VectorClock::new();
        clock.set(client, logical_time);
        let mut dv = DatabaseVersion::with_header(DatabaseVersionHeader::new(
            client,
            1_700_000_000,
            clock,
        ));

        let seed = format!("{path}-{number}");
        let chunk = ChunkEntry::new(ChunkChecksum::from_data(seed.as_bytes()), 512);
        dv.add_chunk(chunk);
        dv.add_multi_chunk(crate::model::MultiChunkEntry::new(vec![chunk.checksum]));
        let content =
            FileContent::new(FileChecksum::from_data(seed.as_bytes()), 512, vec![chunk.checksum]);
        dv.add_file_content(content.clone());

        let mut history = PartialFileHistory::new(FileHistoryId::from_data(path.as_bytes()));
        history
            .append(FileVersion {
                version: number,
                path: path.to_string(),
                file_type: FileType::File,
                status: if number == 1 { FileStatus::New } else { FileStatus::Changed },
                checksum: Some(content.checksum),
                size: 512,
                last_modified: 1_700_000_000 + number as i64,
                posix_permissions: "rw-r--r--".to_string(),
            })
            .unwrap();
        dv.add_file_history(history).unwrap();
        dv
    }

    fn setup(
        remote_dir: &TempDir,
    ) -> (RepoConfig, VersionStore, LocalTransferManager) {
        let config = RepoConfig::new("A", "a").unwrap();
        let store = VersionStore::open_in_memory().unwrap();
        let transfer = LocalTransferManager::new(remote_dir.path());
        transfer.init().unwrap();
        (config, store, transfer)
    }

    #[test]
    fn test_cleanup_blocked_by_dirty_rows() {
        let remote_dir = TempDir::new().unwrap();
        let (config, mut store, transfer) = setup(&remote_dir);

        let dv = version_for("A", 1, "file.txt", 1);
        store.persist(&dv, DatabaseVersionStatus::Master).unwrap();
        store
            .mark_dirty(&dv.header().unwrap().vector_clock)
            .unwrap();

        let cipher = PlaintextCipher;
        let result = CleanupOperation::new(
            &config,
            &mut store,
            &transfer,
            &cipher,
            &NoPendingChanges,
            CleanupOptions::default(),
        )
        .execute()
        .unwrap();
        assert_eq!(result.code, CleanupResultCode::NokDirtyLocal);
        assert_eq!(store.counts().unwrap().database_versions, 1);
    }

    #[test]
    fn test_cleanup_blocked_by_local_changes() {
        let remote_dir = TempDir::new().unwrap();
        let (config, mut store, transfer) = setup(&remote_dir);

        let cipher = PlaintextCipher;
        let result = CleanupOperation::new(
            &config,
            &mut store,
            &transfer,
            &cipher,
            &PendingChanges,
            CleanupOptions::default(),
        )
        .execute()
        .unwrap();
        assert_eq!(result.code, CleanupResultCode::NokLocalChanges);
    }

    #[test]
    fn test_cleanup_blocked_by_remote_changes() {
        let remote_dir = TempDir::new().unwrap();
        let (config, mut store, transfer) = setup(&remote_dir);

        // A remote file this store has never applied.
        let payload = encode_database_file(&[version_for("B", 1, "file.txt", 1)]).unwrap();
        upload_bytes(&transfer, &payload, &RemoteFile::database("B", 1)).unwrap();

        let cipher = PlaintextCipher;
        let result = CleanupOperation::new(
            &config,
            &mut store,
            &transfer,
            &cipher,
            &NoPendingChanges,
            CleanupOptions::default(),
        )
        .execute()
        .unwrap();
        assert_eq!(result.code, CleanupResultCode::NokRemoteChanges);
        assert_eq!(store.counts().unwrap().database_versions, 0);
    }

    #[test]
    fn test_cleanup_nothing_to_do() {
        let remote_dir = TempDir::new().unwrap();
        let (config, mut store, transfer) = setup(&remote_dir);

        let dv = version_for("A", 1, "file.txt", 1);
        store.persist(&dv, DatabaseVersionStatus::Master).unwrap();
        let payload = encode_database_file(std::slice::from_ref(&dv)).unwrap();
        upload_bytes(&transfer, &payload, &RemoteFile::database("A", 1)).unwrap();

        let cipher = PlaintextCipher;
        let result = CleanupOperation::new(
            &config,
            &mut store,
            &transfer,
            &cipher,
            &NoPendingChanges,
            CleanupOptions::default(),
        )
        .execute()
        .unwrap();
        assert_eq!(result.code, CleanupResultCode::OkNothingDone);
        assert_eq!(store.counts().unwrap().database_versions, 1);
    }

    #[test]
    fn test_merge_only_cleanup_leaves_logical_history_untouched() {
        let remote_dir = TempDir::new().unwrap();
        let (config, mut store, transfer) = setup(&remote_dir);

        // Three single-version histories: nothing to prune, nothing orphaned.
        for (n, path) in [(1, "one.txt"), (2, "two.txt"), (3, "three.txt")] {
            let dv = version_for("A", n, path, 1);
            store.persist(&dv, DatabaseVersionStatus::Master).unwrap();
            let payload = encode_database_file(std::slice::from_ref(&dv)).unwrap();
            upload_bytes(&transfer, &payload, &RemoteFile::database("A", n)).unwrap();
        }

        let cipher = PlaintextCipher;
        let options = CleanupOptions {
            merge_remote_files: true,
            ..CleanupOptions::default()
        };
        let result = CleanupOperation::new(
            &config,
            &mut store,
            &transfer,
            &cipher,
            &NoPendingChanges,
            options,
        )
        .execute()
        .unwrap();

        assert_eq!(result.code, CleanupResultCode::Ok);
        assert_eq!(result.removed_old_versions_count, 0);
        assert!(result.removed_multichunks.is_empty());
        assert_eq!(result.merged_database_files_count, 2);

        // Remote files collapsed, but no purge version and no clock advance.
        assert_eq!(
            transfer.list(RemoteFileKind::Database).unwrap(),
            vec![RemoteFile::database("A", 3)]
        );
        assert_eq!(store.counts().unwrap().database_versions, 3);
        assert_eq!(store.local_branch().unwrap().max_logical_time("A"), 3);
    }

    #[test]
    fn test_cleanup_purges_deleted_history() {
        let remote_dir = TempDir::new().unwrap();
        let (config, mut store, transfer) = setup(&remote_dir);

        store
            .persist(&version_for("A", 1, "doomed.txt", 1), DatabaseVersionStatus::Master)
            .unwrap();

        // Deletion version: no content, newest status DELETED.
        let mut clock = VectorClock::new();
        clock.set("A", 2);
        let mut deletion = DatabaseVersion::with_header(DatabaseVersionHeader::new(
            "A",
            1_700_000_001,
            clock,
        ));
        let mut history = PartialFileHistory::new(FileHistoryId::from_data(b"doomed.txt"));
        history
            .append(FileVersion {
                version: 2,
                path: "doomed.txt".to_string(),
                file_type: FileType::File,
                status: FileStatus::Deleted,
                checksum: None,
                size: 0,
                last_modified: 1_700_000_001,
                posix_permissions: "rw-r--r--".to_string(),
            })
            .unwrap();
        deletion.add_file_history(history).unwrap();
        store
            .persist(&deletion, DatabaseVersionStatus::Master)
            .unwrap();

        for dv in [&version_for("A", 1, "doomed.txt", 1), &deletion] {
            let payload = encode_database_file(std::slice::from_ref(dv)).unwrap();
            let header = dv.header().unwrap();
            upload_bytes(
                &transfer,
                &payload,
                &RemoteFile::database("A", header.own_logical_time()),
            )
            .unwrap();
        }

        let cipher = PlaintextCipher;
        let result = CleanupOperation::new(
            &config,
            &mut store,
            &transfer,
            &cipher,
            &NoPendingChanges,
            CleanupOptions::default(),
        )
        .execute()
        .unwrap();

        assert_eq!(result.code, CleanupResultCode::Ok);
        assert_eq!(result.removed_old_versions_count, 1);
        assert_eq!(result.removed_multichunks.len(), 1);

        let counts = store.counts().unwrap();
        assert_eq!(counts.file_versions, 0);
        assert_eq!(counts.file_histories, 0);
        assert_eq!(counts.chunks, 0);
        assert_eq!(counts.multichunks, 0);
        // The purge version joined local history and went up.
        assert_eq!(counts.database_versions, 3);
        assert!(transfer
            .list(RemoteFileKind::Database)
            .unwrap()
            .contains(&RemoteFile::database("A", 3)));
    }
}
