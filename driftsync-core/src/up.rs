//! Publishing local changes to the remote.
//!
//! The external chunker deposits a delta `DatabaseVersion` (no header) plus
//! the packed multichunk container files; this operation stamps the header,
//! persists the version as MASTER, and uploads the artifacts. Scanning and
//! chunking the local tree stay outside the core.

use crate::config::RepoConfig;
use crate::model::MultiChunkId;
use crate::store::VersionStore;
use crate::transfer::{Cipher, RemoteFile, TransferManager};
use crate::version::{
    encode_database_file, DatabaseVersion, DatabaseVersionHeader, DatabaseVersionStatus,
};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Outcome of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpResult {
    /// The delta was empty; nothing uploaded, nothing persisted.
    UpToDate,
    /// Unapplied remote versions exist; download before uploading.
    SkippedRemoteChanges,
    /// The version was persisted and uploaded.
    Applied { header: DatabaseVersionHeader },
}

pub struct UpOperation<'a, T: TransferManager, C: Cipher> {
    config: &'a RepoConfig,
    store: &'a mut VersionStore,
    transfer: &'a T,
    cipher: &'a C,
}

impl<'a, T: TransferManager, C: Cipher> UpOperation<'a, T, C> {
    pub fn new(
        config: &'a RepoConfig,
        store: &'a mut VersionStore,
        transfer: &'a T,
        cipher: &'a C,
    ) -> Self {
        Self {
            config,
            store,
            transfer,
            cipher,
        }
    }

    /// Publish one delta. `multichunk_files` maps the delta's multichunk ids
    /// to their already-packed container files on disk.
    pub fn execute(
        &mut self,
        mut delta: DatabaseVersion,
        multichunk_files: &BTreeMap<MultiChunkId, PathBuf>,
    ) -> Result<UpResult> {
        if delta.is_empty_delta() {
            info!("nothing to upload");
            return Ok(UpResult::UpToDate);
        }

        // Leftovers of an interrupted upload would collide with the next
        // clock; consolidate them before deriving the new header.
        if self.store.has_dirty_versions()? {
            let removed = self.store.remove_dirty()?;
            info!(removed = removed.len(), "removed dirty database versions from interrupted upload");
        }

        let branch = self.store.local_branch()?;
        if crate::down::remote_changes_exist(self.transfer, &branch)? {
            info!("remote changes detected, skipping upload");
            return Ok(UpResult::SkippedRemoteChanges);
        }

        // The new clock must dominate everything this replica has applied,
        // not just its own previous version.
        let clock = branch.target_clock().increment(&self.config.machine_name);
        let header = DatabaseVersionHeader::new(
            self.config.machine_name.clone(),
            chrono::Utc::now().timestamp(),
            clock,
        );
        info!(header = %header, "publishing database version");
        delta.header = Some(header.clone());

        // Multichunks go up first: a database file must never reference
        // content the remote does not hold yet.
        for multichunk in delta.multichunks() {
            let local = multichunk_files.get(&multichunk.id).with_context(|| {
                format!("no container file for multichunk {}", multichunk.id)
            })?;
            self.transfer
                .upload(local, &RemoteFile::multichunk(multichunk.id))?;
        }

        self.store
            .persist(&delta, DatabaseVersionStatus::Master)
            .context("Failed to persist database version")?;

        let encoded = encode_database_file(std::slice::from_ref(&delta))?;
        let payload = self.cipher.encrypt(&encoded)?;
        let remote = RemoteFile::database(&header.client, header.own_logical_time());

        if let Err(e) = upload_bytes(self.transfer, &payload, &remote) {
            // The version stays local but leaves accepted history; the next
            // up starts over after remove_dirty.
            warn!(error = %e, "database file upload failed, marking version dirty");
            self.store.mark_dirty(&header.vector_clock)?;
            return Err(e);
        }

        info!(name = %remote.name(), "uploaded database file");
        Ok(UpResult::Applied { header })
    }
}

/// Upload a byte buffer through a path-based transfer manager.
pub(crate) fn upload_bytes<T: TransferManager>(
    transfer: &T,
    payload: &[u8],
    remote: &RemoteFile,
) -> Result<()> {
    let staging = tempfile::NamedTempFile::new().context("Failed to create staging file")?;
    std::fs::write(staging.path(), payload).context("Failed to write staging file")?;
    transfer.upload(staging.path(), remote)
}
