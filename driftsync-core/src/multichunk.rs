//! Multichunk container files.
//!
//! Chunks are packed in order into a single compressed container, the unit
//! of remote storage. The container id is derived from the ordered chunk
//! list, so repacking the same chunks in the same order reproduces the same
//! file name on the remote.

use crate::model::{ChunkChecksum, MultiChunkEntry, MultiChunkId};
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zstd::stream::{decode_all as zstd_decode, encode_all as zstd_encode};

/// Multichunk container format version.
pub const MULTICHUNK_VERSION: u32 = 1;

/// Default target size of a packed multichunk, in bytes.
pub const DEFAULT_MULTICHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Accumulates chunks in order and writes one container file.
pub struct MultiChunkWriter {
    chunks: Vec<(ChunkChecksum, Vec<u8>)>,
    raw_size: u64,
    max_size: u64,
}

impl MultiChunkWriter {
    pub fn new(max_size: u64) -> Self {
        Self {
            chunks: Vec::new(),
            raw_size: 0,
            max_size,
        }
    }

    /// Add a chunk; order of addition is the container order.
    pub fn add_chunk(&mut self, checksum: ChunkChecksum, data: Vec<u8>) {
        self.raw_size += data.len() as u64;
        self.chunks.push((checksum, data));
    }

    /// Whether the accumulated raw size has reached the target size.
    pub fn is_full(&self) -> bool {
        self.raw_size >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The entry this writer will produce, without writing anything.
    pub fn entry(&self) -> MultiChunkEntry {
        MultiChunkEntry::new(self.chunks.iter().map(|(c, _)| *c).collect())
    }

    /// Write the container to disk and return its metadata entry.
    pub fn write(&self, path: &Path) -> Result<MultiChunkEntry> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create multichunk directory")?;
        }

        let mut file = File::create(path).context("Failed to create multichunk file")?;
        file.write_all(&MULTICHUNK_VERSION.to_le_bytes())
            .context("Failed to write header")?;
        file.write_all(&(self.chunks.len() as u32).to_le_bytes())
            .context("Failed to write chunk count")?;

        for (checksum, data) in &self.chunks {
            let compressed = zstd_encode(&data[..], 0).context("Failed to compress chunk")?;
            file.write_all(checksum.as_bytes())
                .context("Failed to write chunk checksum")?;
            file.write_all(&(data.len() as u32).to_le_bytes())
                .context("Failed to write chunk size")?;
            file.write_all(&(compressed.len() as u32).to_le_bytes())
                .context("Failed to write compressed size")?;
            file.write_all(&compressed)
                .context("Failed to write compressed chunk")?;
        }

        Ok(self.entry())
    }
}

struct ReaderEntry {
    checksum: ChunkChecksum,
    offset: usize,
    compressed_size: usize,
}

/// Reads chunks back out of a container file.
pub struct MultiChunkReader {
    entries: Vec<ReaderEntry>,
    data: Vec<u8>,
}

impl MultiChunkReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).context("Failed to open multichunk file")?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .context("Failed to read multichunk file")?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < 8 {
            bail!("multichunk file too short");
        }

        let version = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if version != MULTICHUNK_VERSION {
            bail!("unknown multichunk version: {version}");
        }
        let chunk_count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;

        let mut entries = Vec::with_capacity(chunk_count);
        let mut pos = 8;
        for _ in 0..chunk_count {
            if pos + 40 > data.len() {
                bail!("multichunk file truncated");
            }
            let checksum = ChunkChecksum::from_slice(&data[pos..pos + 32])
                .map_err(|e| anyhow::anyhow!("bad chunk checksum: {e}"))?;
            pos += 36; // checksum + raw size (size is re-derived on read)
            let compressed_size =
                u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + compressed_size > data.len() {
                bail!("multichunk file truncated");
            }
            entries.push(ReaderEntry {
                checksum,
                offset: pos,
                compressed_size,
            });
            pos += compressed_size;
        }

        Ok(Self { entries, data })
    }

    /// The id this container carries, derived from its ordered chunk list.
    pub fn id(&self) -> MultiChunkId {
        MultiChunkId::from_chunks(&self.chunk_checksums())
    }

    pub fn chunk_checksums(&self) -> Vec<ChunkChecksum> {
        self.entries.iter().map(|e| e.checksum).collect()
    }

    /// Decompress one chunk by checksum.
    pub fn get_chunk(&self, checksum: &ChunkChecksum) -> Result<Option<Vec<u8>>> {
        let entry = match self.entries.iter().find(|e| e.checksum == *checksum) {
            Some(e) => e,
            None => return Ok(None),
        };
        let compressed = &self.data[entry.offset..entry.offset + entry.compressed_size];
        let decompressed = zstd_decode(compressed).context("Failed to decompress chunk")?;
        Ok(Some(decompressed))
    }

    /// Decompress every chunk, in container order.
    pub fn read_all(&self) -> Result<Vec<(ChunkChecksum, Vec<u8>)>> {
        self.entries
            .iter()
            .map(|entry| {
                let compressed = &self.data[entry.offset..entry.offset + entry.compressed_size];
                let decompressed =
                    zstd_decode(compressed).context("Failed to decompress chunk")?;
                Ok((entry.checksum, decompressed))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_multichunk_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.mc");

        let mut writer = MultiChunkWriter::new(DEFAULT_MULTICHUNK_SIZE);
        writer.add_chunk(ChunkChecksum::from_data(b"first"), b"first".to_vec());
        writer.add_chunk(ChunkChecksum::from_data(b"second"), b"second".to_vec());
        let entry = writer.write(&path).unwrap();

        assert_eq!(entry.chunks.len(), 2);
        assert_eq!(entry.id, MultiChunkId::from_chunks(&entry.chunks));

        let reader = MultiChunkReader::open(&path).unwrap();
        assert_eq!(reader.id(), entry.id);
        assert_eq!(
            reader
                .get_chunk(&ChunkChecksum::from_data(b"first"))
                .unwrap()
                .unwrap(),
            b"first"
        );
        assert!(reader
            .get_chunk(&ChunkChecksum::from_data(b"missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_multichunk_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.mc");

        let chunks: Vec<Vec<u8>> = (0..5).map(|i| format!("chunk-{i}").into_bytes()).collect();
        let mut writer = MultiChunkWriter::new(DEFAULT_MULTICHUNK_SIZE);
        for data in &chunks {
            writer.add_chunk(ChunkChecksum::from_data(data), data.clone());
        }
        writer.write(&path).unwrap();

        let reader = MultiChunkReader::open(&path).unwrap();
        let all = reader.read_all().unwrap();
        assert_eq!(all.len(), 5);
        for (i, (checksum, data)) in all.iter().enumerate() {
            assert_eq!(data, &chunks[i]);
            assert_eq!(*checksum, ChunkChecksum::from_data(&chunks[i]));
        }
    }

    #[test]
    fn test_multichunk_is_full() {
        let mut writer = MultiChunkWriter::new(10);
        assert!(!writer.is_full());
        writer.add_chunk(ChunkChecksum::from_data(b"0123456789ab"), b"0123456789ab".to_vec());
        assert!(writer.is_full());
    }

    #[test]
    fn test_multichunk_rejects_garbage() {
        assert!(MultiChunkReader::from_bytes(b"xx".to_vec()).is_err());
        assert!(MultiChunkReader::from_bytes(vec![9, 0, 0, 0, 1, 0, 0, 0]).is_err());
    }
}
