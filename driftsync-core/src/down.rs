//! Branch reconciliation: merging remote history into the local store.
//!
//! Remote database files are downloaded, decoded and applied in causal
//! order. True conflicts (simultaneous vector clocks) are resolved
//! deterministically: the version from the lexicographically smaller client
//! id wins, the loser's colliding file versions become renamed conflict
//! copies. Divergence of the local replica is surfaced to the caller, never
//! resolved here.

use crate::clock::{ClockComparison, VectorClock};
use crate::config::RepoConfig;
use crate::model::{conflict_copy_path, FileHistoryId, FileStatus, FileVersion, PartialFileHistory};
use crate::store::VersionStore;
use crate::transfer::{Cipher, RemoteFile, RemoteFileKind, TransferManager};
use crate::version::{
    decode_database_file, DatabaseBranch, DatabaseBranches, DatabaseVersion,
    DatabaseVersionHeader, DatabaseVersionStatus,
};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Net effect of a reconciliation on the file tree, for the external
/// filesystem applier. Paths are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownStatus {
    /// The combined remote state was already known locally.
    UpToDate,
    /// New versions were applied.
    Applied,
}

#[derive(Debug)]
pub struct DownResult {
    pub status: DownStatus,
    pub changeset: Changeset,
    pub applied_count: usize,
    /// Conflicts resolved during this run (conflict copies plus retracted
    /// local versions).
    pub conflicts_resolved: usize,
    /// Local MASTER versions unknown to the remote; the caller must upload
    /// before further downloads are meaningful.
    pub local_versions_to_upload: Vec<DatabaseVersionHeader>,
}

/// Whether the remote holds any database file newer than what the branch
/// has seen from its producing replica.
pub fn remote_changes_exist<T: TransferManager>(
    transfer: &T,
    branch: &DatabaseBranch,
) -> Result<bool> {
    for remote in transfer.list(RemoteFileKind::Database)? {
        if let RemoteFile::Database {
            client,
            logical_time,
        } = &remote
        {
            if *logical_time > branch.max_logical_time(client) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

pub struct DownOperation<'a, T: TransferManager, C: Cipher> {
    config: &'a RepoConfig,
    store: &'a mut VersionStore,
    transfer: &'a T,
    cipher: &'a C,
}

impl<'a, T: TransferManager, C: Cipher> DownOperation<'a, T, C> {
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

    pub fn execute(&mut self) -> Result<DownResult> {
        let local_branch = self.store.local_branch()?;
        let before = self.store.newest_file_versions()?;

        let remote_databases = self.transfer.list(RemoteFileKind::Database)?;
        let local_versions_to_upload =
            local_divergence(&local_branch, &self.config.machine_name, &remote_databases);

        let new_files: Vec<&RemoteFile> = remote_databases
            .iter()
            .filter(|remote| match remote {
                RemoteFile::Database {
                    client,
                    logical_time,
                } => *logical_time > local_branch.max_logical_time(client),
                _ => false,
            })
            .collect();

        if new_files.is_empty() {
            info!("no new remote database files");
            return Ok(DownResult {
                status: DownStatus::UpToDate,
                changeset: Changeset::default(),
                applied_count: 0,
                conflicts_resolved: 0,
                local_versions_to_upload,
            });
        }

        // Download and decode, dropping anything the local branch already has.
        let mut incoming: Vec<DatabaseVersion> = Vec::new();
        for remote in &new_files {
            let staging =
                tempfile::NamedTempFile::new().context("Failed to create staging file")?;
            self.transfer.download(remote, staging.path())?;
            let payload =
                std::fs::read(staging.path()).context("Failed to read downloaded file")?;
            let decoded = decode_database_file(&self.cipher.decrypt(&payload)?)
                .with_context(|| format!("Failed to decode {}", remote.name()))?;
            for version in decoded {
                let header = version.header()?;
                if !local_branch.contains(header) {
                    debug!(header = %header, "queueing remote database version");
                    incoming.push(version);
                }
            }
        }

        let mut branches = DatabaseBranches::new();
        for header in local_branch.headers() {
            branches.branch_mut(&header.client).add(header.clone());
        }
        for version in &incoming {
            let header = version.header()?;
            branches.branch_mut(&header.client).add(header.clone());
        }
        debug!(target_clock = %branches.target_clock(), "reconciling towards target");

        let ordered = topological_order(incoming)?;

        let mut current_max: BTreeMap<FileHistoryId, u64> =
            before.iter().map(|(id, v)| (*id, v.version)).collect();
        let mut retracted = Vec::new();
        let mut applied_count = 0;
        let mut conflicts_resolved = 0;

        for mut version in ordered {
            let header = version.header()?.clone();

            // Simultaneous local versions lose against a smaller client id:
            // they are retracted to DIRTY and replaced by the winner.
            let mut retracted_now = false;
            for local in local_branch.headers() {
                if header.client >= local.client || retracted.contains(&local.vector_clock) {
                    continue;
                }
                if VectorClock::compare(&local.vector_clock, &header.vector_clock)
                    == ClockComparison::Simultaneous
                {
                    info!(loser = %local, winner = %header, "retracting conflicting local version");
                    self.store.mark_dirty(&local.vector_clock)?;
                    retracted.push(local.vector_clock.clone());
                    retracted_now = true;
                    conflicts_resolved += 1;
                }
            }
            if retracted_now {
                current_max = self
                    .store
                    .newest_file_versions()?
                    .iter()
                    .map(|(id, v)| (*id, v.version))
                    .collect();
            }

            // Any remaining history collision means this version lost a
            // conflict; its colliding histories become conflict copies.
            let colliding: Vec<FileHistoryId> = version
                .file_histories()
                .filter(|history| {
                    let first = history.versions().first().map(|v| v.version).unwrap_or(0);
                    current_max.get(&history.id).is_some_and(|max| first <= *max)
                })
                .map(|history| history.id)
                .collect();
            for id in &colliding {
                let history = version
                    .file_histories()
                    .find(|h| h.id == *id)
                    .cloned()
                    .context("colliding history disappeared")?;
                let renamed = conflict_copy_history(&history, &header.client)?;
                info!(
                    original = %id,
                    copy = %renamed.id,
                    client = %header.client,
                    "rewriting conflicting history as conflict copy"
                );
                version.rename_file_history(id, renamed);
                conflicts_resolved += 1;
            }

            for history in version.file_histories() {
                if let Some(max) = history.max_version_number() {
                    current_max.insert(history.id, max);
                }
            }

            self.store
                .persist(&version, DatabaseVersionStatus::Master)
                .with_context(|| format!("Failed to apply version {header}"))?;
            applied_count += 1;
        }

        let after = self.store.newest_file_versions()?;
        let changeset = diff_changeset(&before, &after);
        info!(
            applied_count,
            conflicts_resolved,
            added = changeset.added.len(),
            changed = changeset.changed.len(),
            deleted = changeset.deleted.len(),
            "reconciliation complete"
        );

        Ok(DownResult {
            status: DownStatus::Applied,
            changeset,
            applied_count,
            conflicts_resolved,
            local_versions_to_upload,
        })
    }
}

/// Local MASTER headers of this replica that the remote does not hold.
fn local_divergence(
    local_branch: &DatabaseBranch,
    machine_name: &str,
    remote_databases: &[RemoteFile],
) -> Vec<DatabaseVersionHeader> {
    let remote_max = remote_databases
        .iter()
        .filter_map(|remote| match remote {
            RemoteFile::Database {
                client,
                logical_time,
            } if client == machine_name => Some(*logical_time),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    local_branch
        .headers()
        .iter()
        .filter(|header| {
            header.client == machine_name && header.own_logical_time() > remote_max
        })
        .cloned()
        .collect()
}

/// Order versions so that every version follows all of its causal ancestors.
/// Ties between simultaneous versions go to the lexicographically smaller
/// client id, then the smaller logical time.
fn topological_order(remaining: Vec<DatabaseVersion>) -> Result<Vec<DatabaseVersion>> {
    let mut items: Vec<(DatabaseVersionHeader, DatabaseVersion)> = remaining
        .into_iter()
        .map(|v| Ok((v.header()?.clone(), v)))
        .collect::<Result<_>>()?;

    let mut ordered = Vec::with_capacity(items.len());
    while !items.is_empty() {
        let mut best: Option<usize> = None;
        for i in 0..items.len() {
            let candidate = &items[i].0;
            let ready = items.iter().enumerate().all(|(j, (other, _))| {
                j == i
                    || VectorClock::compare(&other.vector_clock, &candidate.vector_clock)
                        != ClockComparison::Smaller
            });
            if !ready {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let current = &items[b].0;
                    let candidate_key = (&candidate.client, candidate.own_logical_time());
                    let current_key = (&current.client, current.own_logical_time());
                    if candidate_key < current_key {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        match best {
            Some(i) => ordered.push(items.remove(i).1),
            None => bail!("cycle in database version ordering"),
        }
    }
    Ok(ordered)
}

/// Rebuild a losing history as a conflict copy: derived id, renamed paths,
/// versions renumbered from 1. Both replicas derive the identical copy.
fn conflict_copy_history(
    history: &PartialFileHistory,
    losing_client: &str,
) -> Result<PartialFileHistory> {
    let mut renamed = PartialFileHistory::new(FileHistoryId::conflict_copy(
        &history.id,
        losing_client,
    ));
    for (i, version) in history.versions().iter().enumerate() {
        let mut copy = version.clone();
        copy.version = (i + 1) as u64;
        copy.path = conflict_copy_path(&version.path, losing_client);
        if i == 0 {
            copy.status = FileStatus::New;
        }
        renamed
            .append(copy)
            .map_err(|e| anyhow::anyhow!("conflict copy renumbering failed: {e}"))?;
    }
    Ok(renamed)
}

fn diff_changeset(
    before: &BTreeMap<FileHistoryId, FileVersion>,
    after: &BTreeMap<FileHistoryId, FileVersion>,
) -> Changeset {
    let mut changeset = Changeset::default();

    for (id, now) in after {
        match before.get(id) {
            None => {
                if !now.is_deleted() {
                    changeset.added.push(now.path.clone());
                }
            }
            // A conflict winner can replace a retracted loser under the same
            // version number, so the whole version is compared, not just the
            // number.
            Some(was) if was != now => {
                if now.is_deleted() && !was.is_deleted() {
                    changeset.deleted.push(was.path.clone());
                } else if !now.is_deleted() {
                    changeset.changed.push(now.path.clone());
                }
            }
            Some(_) => {}
        }
    }
    for (id, was) in before {
        if !after.contains_key(id) && !was.is_deleted() {
            changeset.deleted.push(was.path.clone());
        }
    }

    changeset.added.sort();
    changeset.changed.sort();
    changeset.deleted.sort();
    changeset
}
