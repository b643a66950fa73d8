//! Remote storage access.
//!
//! The remote is a dumb file store: no locks, no server-side logic. All
//! coordination happens through file naming and the version vector clocks.
//! `TransferManager` is the seam between operations and storage backends;
//! the local-directory backend doubles as the test backend, and the
//! unreliable wrapper injects deterministic failures for crash testing.

use crate::model::MultiChunkId;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DATABASES_DIR: &str = "databases";
const MULTICHUNKS_DIR: &str = "multichunks";
const REPO_FILE: &str = "repo";
const MASTER_FILE: &str = "master";

/// Category of remote file, used to scope listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileKind {
    Database,
    MultiChunk,
    Repo,
    Master,
}

/// A file on the remote, identified purely by its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RemoteFile {
    /// One replica's database file: `db-<client>-<logical time>`.
    Database { client: String, logical_time: u64 },
    /// A packed multichunk container: `multichunk-<hex id>`.
    MultiChunk { id: MultiChunkId },
    /// Repository marker, written once at init.
    Repo,
    /// Master marker for password-protected repositories.
    Master,
}

impl RemoteFile {
    pub fn database(client: impl Into<String>, logical_time: u64) -> Self {
        RemoteFile::Database {
            client: client.into(),
            logical_time,
        }
    }

    pub fn multichunk(id: MultiChunkId) -> Self {
        RemoteFile::MultiChunk { id }
    }

    pub fn kind(&self) -> RemoteFileKind {
        match self {
            RemoteFile::Database { .. } => RemoteFileKind::Database,
            RemoteFile::MultiChunk { .. } => RemoteFileKind::MultiChunk,
            RemoteFile::Repo => RemoteFileKind::Repo,
            RemoteFile::Master => RemoteFileKind::Master,
        }
    }

    /// Remote file name. Logical time is zero-padded so lexicographic and
    /// numeric order agree.
    pub fn name(&self) -> String {
        match self {
            RemoteFile::Database {
                client,
                logical_time,
            } => format!("db-{client}-{logical_time:010}"),
            RemoteFile::MultiChunk { id } => format!("multichunk-{}", id.to_hex()),
            RemoteFile::Repo => REPO_FILE.to_string(),
            RemoteFile::Master => MASTER_FILE.to_string(),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        if name == REPO_FILE {
            return Ok(RemoteFile::Repo);
        }
        if name == MASTER_FILE {
            return Ok(RemoteFile::Master);
        }
        if let Some(rest) = name.strip_prefix("db-") {
            let (client, time) = rest
                .rsplit_once('-')
                .with_context(|| format!("malformed database file name {name:?}"))?;
            if client.is_empty() {
                bail!("malformed database file name {name:?}");
            }
            let logical_time: u64 = time
                .parse()
                .with_context(|| format!("malformed logical time in {name:?}"))?;
            return Ok(RemoteFile::Database {
                client: client.to_string(),
                logical_time,
            });
        }
        if let Some(hex) = name.strip_prefix("multichunk-") {
            let id = MultiChunkId::from_hex(hex)
                .map_err(|e| anyhow::anyhow!("malformed multichunk name {name:?}: {e}"))?;
            return Ok(RemoteFile::MultiChunk { id });
        }
        bail!("unrecognized remote file name {name:?}")
    }
}

/// Outcome of probing a remote target before init or connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageTestResult {
    pub can_connect: bool,
    pub target_exists: bool,
    pub target_can_write: bool,
    pub target_can_create: bool,
    pub repo_file_exists: bool,
}

impl StorageTestResult {
    /// Whether an init against this target would succeed.
    pub fn can_create_repo(&self) -> bool {
        self.can_connect
            && !self.repo_file_exists
            && (self.target_can_write || self.target_can_create)
    }

    /// Whether a connect against this target would succeed.
    pub fn can_connect_to_repo(&self) -> bool {
        self.can_connect && self.repo_file_exists
    }
}

/// Blocking access to one remote storage target.
pub trait TransferManager {
    /// Create the remote layout (subdirectories); idempotent.
    fn init(&self) -> Result<()>;

    /// List remote files of one kind, sorted by name.
    fn list(&self, kind: RemoteFileKind) -> Result<Vec<RemoteFile>>;

    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()>;

    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()>;

    fn delete(&self, remote: &RemoteFile) -> Result<()>;

    /// Probe the target without modifying it, except optionally creating the
    /// target directory when `create_if_needed` is set.
    fn test(&self, create_if_needed: bool) -> Result<StorageTestResult>;
}

/// Remote storage in a local directory, the reference backend.
pub struct LocalTransferManager {
    root: PathBuf,
}

impl LocalTransferManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, remote: &RemoteFile) -> PathBuf {
        match remote.kind() {
            RemoteFileKind::Database => self.root.join(DATABASES_DIR).join(remote.name()),
            RemoteFileKind::MultiChunk => self.root.join(MULTICHUNKS_DIR).join(remote.name()),
            RemoteFileKind::Repo | RemoteFileKind::Master => self.root.join(remote.name()),
        }
    }

    fn list_dir(&self, dir: &Path, kind: RemoteFileKind) -> Result<Vec<RemoteFile>> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(dir).context("Failed to list remote directory")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match RemoteFile::parse(&name) {
                Ok(remote) if remote.kind() == kind => files.push(remote),
                Ok(_) => {}
                Err(_) => warn!(name, "ignoring unrecognized remote file"),
            }
        }
        files.sort();
        Ok(files)
    }
}

impl TransferManager for LocalTransferManager {
    fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join(DATABASES_DIR))
            .context("Failed to create remote databases directory")?;
        fs::create_dir_all(self.root.join(MULTICHUNKS_DIR))
            .context("Failed to create remote multichunks directory")?;
        Ok(())
    }

    fn list(&self, kind: RemoteFileKind) -> Result<Vec<RemoteFile>> {
        match kind {
            RemoteFileKind::Database => self.list_dir(&self.root.join(DATABASES_DIR), kind),
            RemoteFileKind::MultiChunk => self.list_dir(&self.root.join(MULTICHUNKS_DIR), kind),
            RemoteFileKind::Repo | RemoteFileKind::Master => {
                let remote = if kind == RemoteFileKind::Repo {
                    RemoteFile::Repo
                } else {
                    RemoteFile::Master
                };
                if self.path_for(&remote).exists() {
                    Ok(vec![remote])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()> {
        let target = self.path_for(remote);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Copy to a temp name first so readers never see a half-written file.
        let tmp = target.with_extension("tmp");
        fs::copy(local, &tmp)
            .with_context(|| format!("Failed to upload {}", remote.name()))?;
        fs::rename(&tmp, &target)?;
        debug!(name = %remote.name(), "uploaded remote file");
        Ok(())
    }

    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()> {
        let source = self.path_for(remote);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, local)
            .with_context(|| format!("Failed to download {}", remote.name()))?;
        debug!(name = %remote.name(), "downloaded remote file");
        Ok(())
    }

    fn delete(&self, remote: &RemoteFile) -> Result<()> {
        let target = self.path_for(remote);
        if target.exists() {
            fs::remove_file(&target)
                .with_context(|| format!("Failed to delete {}", remote.name()))?;
        }
        debug!(name = %remote.name(), "deleted remote file");
        Ok(())
    }

    fn test(&self, create_if_needed: bool) -> Result<StorageTestResult> {
        let mut result = StorageTestResult {
            can_connect: true,
            ..Default::default()
        };

        if !self.root.exists() && create_if_needed {
            if fs::create_dir_all(&self.root).is_ok() {
                result.target_can_create = true;
            }
        } else {
            result.target_can_create = self
                .root
                .parent()
                .map(|p| p.exists())
                .unwrap_or(false);
        }

        result.target_exists = self.root.exists();
        if result.target_exists {
            let probe = self.root.join(".probe");
            result.target_can_write = fs::write(&probe, b"").is_ok();
            if result.target_can_write {
                let _ = fs::remove_file(&probe);
            }
        }
        result.repo_file_exists = self.path_for(&RemoteFile::Repo).exists();
        Ok(result)
    }
}

/// Wraps a transfer manager and fails operations matching configured
/// patterns. Each operation is described as `rel=<n> op=<op> file=<name>`
/// where `rel` counts all operations since construction; a pattern fires
/// when every whitespace-separated token occurs in the description.
/// Matching is deterministic, so crash tests are reproducible.
pub struct UnreliableTransferManager<T> {
    inner: T,
    patterns: Vec<String>,
    operation_count: std::cell::Cell<u64>,
}

impl<T: TransferManager> UnreliableTransferManager<T> {
    pub fn new(inner: T, patterns: Vec<String>) -> Self {
        Self {
            inner,
            patterns,
            operation_count: std::cell::Cell::new(0),
        }
    }

    fn check(&self, op: &str, file: &str) -> Result<()> {
        let count = self.operation_count.get() + 1;
        self.operation_count.set(count);
        let description = format!("rel={count} op={op} file={file}");

        for pattern in &self.patterns {
            if pattern
                .split_whitespace()
                .all(|token| description.contains(token))
            {
                warn!(%description, %pattern, "injected operation failure");
                bail!("operation failed (simulated): {description}");
            }
        }
        Ok(())
    }
}

impl<T: TransferManager> TransferManager for UnreliableTransferManager<T> {
    fn init(&self) -> Result<()> {
        self.check("init", "-")?;
        self.inner.init()
    }

    fn list(&self, kind: RemoteFileKind) -> Result<Vec<RemoteFile>> {
        self.check("list", &format!("{kind:?}"))?;
        self.inner.list(kind)
    }

    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()> {
        self.check("upload", &remote.name())?;
        self.inner.upload(local, remote)
    }

    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()> {
        self.check("download", &remote.name())?;
        self.inner.download(remote, local)
    }

    fn delete(&self, remote: &RemoteFile) -> Result<()> {
        self.check("delete", &remote.name())?;
        self.inner.delete(remote)
    }

    fn test(&self, create_if_needed: bool) -> Result<StorageTestResult> {
        self.check("test", "-")?;
        self.inner.test(create_if_needed)
    }
}

/// Transformation applied to database files before upload and after
/// download. Multichunks are already opaque containers and pass through
/// their own framing.
pub trait Cipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Identity transform for unencrypted repositories.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl Cipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_remote_file_names_roundtrip() {
        let id = MultiChunkId::from_data(b"mc");
        let files = [
            RemoteFile::database("A", 7),
            RemoteFile::multichunk(id),
            RemoteFile::Repo,
            RemoteFile::Master,
        ];
        for file in &files {
            assert_eq!(&RemoteFile::parse(&file.name()).unwrap(), file);
        }
        assert_eq!(RemoteFile::database("A", 7).name(), "db-A-0000000007");
        assert!(RemoteFile::parse("db-A-notanumber").is_err());
        assert!(RemoteFile::parse("multichunk-xyz").is_err());
        assert!(RemoteFile::parse("garbage").is_err());
    }

    #[test]
    fn test_database_names_sort_by_logical_time() {
        let mut names: Vec<String> = [2u64, 10, 1]
            .iter()
            .map(|t| RemoteFile::database("A", *t).name())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["db-A-0000000001", "db-A-0000000002", "db-A-0000000010"]
        );
    }

    #[test]
    fn test_local_upload_list_download_delete() {
        let remote_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let tm = LocalTransferManager::new(remote_dir.path());
        tm.init().unwrap();

        let local = work_dir.path().join("db");
        fs::write(&local, b"payload").unwrap();
        let remote = RemoteFile::database("A", 1);
        tm.upload(&local, &remote).unwrap();

        assert_eq!(tm.list(RemoteFileKind::Database).unwrap(), vec![remote.clone()]);
        assert!(tm.list(RemoteFileKind::MultiChunk).unwrap().is_empty());

        let fetched = work_dir.path().join("fetched");
        tm.download(&remote, &fetched).unwrap();
        assert_eq!(fs::read(&fetched).unwrap(), b"payload");

        tm.delete(&remote).unwrap();
        assert!(tm.list(RemoteFileKind::Database).unwrap().is_empty());
    }

    #[test]
    fn test_storage_test_result_transitions() {
        let parent = TempDir::new().unwrap();
        let target = parent.path().join("repo");
        let tm = LocalTransferManager::new(&target);

        let before = tm.test(false).unwrap();
        assert!(before.can_connect);
        assert!(!before.target_exists);
        assert!(!before.repo_file_exists);
        assert!(before.can_create_repo());
        assert!(!before.can_connect_to_repo());

        tm.init().unwrap();
        fs::write(target.join(REPO_FILE), b"").unwrap();
        let after = tm.test(false).unwrap();
        assert!(after.target_exists);
        assert!(after.repo_file_exists);
        assert!(!after.can_create_repo());
        assert!(after.can_connect_to_repo());
    }

    #[test]
    fn test_unreliable_fails_matching_operations_only() {
        let remote_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let tm = UnreliableTransferManager::new(
            LocalTransferManager::new(remote_dir.path()),
            vec!["op=upload file=multichunk".to_string()],
        );
        tm.init().unwrap();

        let local = work_dir.path().join("f");
        fs::write(&local, b"data").unwrap();

        tm.upload(&local, &RemoteFile::database("A", 1)).unwrap();
        let err = tm
            .upload(&local, &RemoteFile::multichunk(MultiChunkId::from_data(b"x")))
            .unwrap_err();
        assert!(err.to_string().contains("simulated"));
        // Unmatched operations keep working after a failure.
        tm.upload(&local, &RemoteFile::database("A", 2)).unwrap();
    }

    #[test]
    fn test_unreliable_fails_nth_operation() {
        let remote_dir = TempDir::new().unwrap();
        let tm = UnreliableTransferManager::new(
            LocalTransferManager::new(remote_dir.path()),
            vec!["rel=2".to_string()],
        );
        tm.init().unwrap(); // rel=1
        assert!(tm.list(RemoteFileKind::Database).is_err()); // rel=2
        assert!(tm.list(RemoteFileKind::Database).is_ok()); // rel=3
    }
}
