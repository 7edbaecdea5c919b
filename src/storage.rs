//! Piece storage.
//!
//! The engine is storage-agnostic: everything it needs from disk is the
//! [`PieceStore`] trait, random-access chunk I/O plus a whole-piece hash.
//! [`FileStore`] is the standard implementation, laying content files out
//! under a data directory the way the metainfo declares them.
//! [`MemoryStore`] backs tests and throwaway swarms.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::torrent::TorrentMeta;

/// Errors from the storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Read or write outside the declared torrent length.
    #[error("offset {0} out of range")]
    OutOfRange(u64),

    /// A declared file path escapes the data directory.
    #[error("unsafe file path: {0}")]
    PathTraversal(String),

    /// File lengths do not add up to the declared total.
    #[error("declared files do not cover the torrent length")]
    BadLayout,
}

/// Random-access chunk storage for one torrent.
///
/// Implementations must tolerate concurrent disjoint writes or serialize
/// internally; the engine issues writes for distinct chunks in parallel.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Writes a chunk at `(piece, begin)`.
    async fn write_chunk(&self, piece: u32, begin: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Reads `length` bytes at `(piece, begin)`.
    async fn read_at(&self, piece: u32, begin: u32, length: u32) -> Result<Bytes, StorageError>;

    /// SHA-1 of the full piece, honoring the short last piece.
    async fn hash_piece(&self, piece: u32) -> Result<[u8; 20], StorageError>;
}

fn piece_size(piece_length: u32, total_length: u64, piece: u32, num_pieces: usize) -> u32 {
    if piece as usize + 1 == num_pieces {
        let rem = total_length % piece_length as u64;
        if rem != 0 {
            return rem as u32;
        }
    }
    piece_length
}

// --- file-backed store --------------------------------------------------

struct FileSlot {
    path: PathBuf,
    /// Absolute offset of this file within the torrent byte stream.
    offset: u64,
    length: u64,
    handle: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

/// Content files on disk, created and truncated to their declared length on
/// first use. Pieces may span file boundaries.
pub struct FileStore {
    piece_length: u32,
    total_length: u64,
    num_pieces: usize,
    slots: Vec<FileSlot>,
}

fn validate_relative(path: &Path) -> Result<(), StorageError> {
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

impl FileStore {
    /// Lays out the store under `data_dir` per the descriptor. No files are
    /// touched until the first read or write reaches them.
    pub fn new(data_dir: &Path, meta: &TorrentMeta) -> Result<Arc<Self>, StorageError> {
        let root = data_dir.join(&meta.name);
        let mut slots = Vec::with_capacity(meta.files.len());
        let mut offset = 0u64;
        for file in &meta.files {
            validate_relative(&file.path)?;
            slots.push(FileSlot {
                path: root.join(&file.path),
                offset,
                length: file.length,
                handle: tokio::sync::Mutex::new(None),
            });
            offset += file.length;
        }
        if offset != meta.total_length {
            return Err(StorageError::BadLayout);
        }
        Ok(Arc::new(Self {
            piece_length: meta.piece_length,
            total_length: meta.total_length,
            num_pieces: meta.num_pieces(),
            slots,
        }))
    }

    fn abs_offset(&self, piece: u32, begin: u32, len: u32) -> Result<u64, StorageError> {
        let size = piece_size(self.piece_length, self.total_length, piece, self.num_pieces);
        if piece as usize >= self.num_pieces || begin as u64 + len as u64 > size as u64 {
            return Err(StorageError::OutOfRange(
                piece as u64 * self.piece_length as u64 + begin as u64,
            ));
        }
        Ok(piece as u64 * self.piece_length as u64 + begin as u64)
    }

    /// File regions overlapping `[offset, offset+len)`, as
    /// `(slot index, offset within file, offset within buffer, span length)`.
    fn spans(&self, offset: u64, len: u64) -> Result<Vec<(usize, u64, usize, usize)>, StorageError> {
        let mut out = Vec::new();
        let mut cursor = offset;
        let end = offset + len;
        for (i, slot) in self.slots.iter().enumerate() {
            if cursor >= end {
                break;
            }
            let slot_end = slot.offset + slot.length;
            if cursor >= slot_end || slot.length == 0 {
                continue;
            }
            let within = cursor - slot.offset;
            let take = ((slot_end - cursor).min(end - cursor)) as usize;
            out.push((i, within, (cursor - offset) as usize, take));
            cursor += take as u64;
        }
        if cursor < end {
            return Err(StorageError::OutOfRange(cursor));
        }
        Ok(out)
    }

    async fn open(&self, slot: &FileSlot) -> Result<tokio::fs::File, StorageError> {
        if let Some(parent) = slot.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&slot.path)
            .await?;
        if file.metadata().await?.len() < slot.length {
            file.set_len(slot.length).await?;
        }
        Ok(file)
    }
}

#[async_trait]
impl PieceStore for FileStore {
    async fn write_chunk(&self, piece: u32, begin: u32, data: &[u8]) -> Result<(), StorageError> {
        let offset = self.abs_offset(piece, begin, data.len() as u32)?;
        for (i, within, at, take) in self.spans(offset, data.len() as u64)? {
            let slot = &self.slots[i];
            let mut guard = slot.handle.lock().await;
            // On error the handle stays closed and reopens on the next use.
            let mut file = match guard.take() {
                Some(file) => file,
                None => self.open(slot).await?,
            };
            file.seek(SeekFrom::Start(within)).await?;
            file.write_all(&data[at..at + take]).await?;
            *guard = Some(file);
        }
        Ok(())
    }

    async fn read_at(&self, piece: u32, begin: u32, length: u32) -> Result<Bytes, StorageError> {
        let offset = self.abs_offset(piece, begin, length)?;
        let mut buf = vec![0u8; length as usize];
        for (i, within, at, take) in self.spans(offset, length as u64)? {
            let slot = &self.slots[i];
            let mut guard = slot.handle.lock().await;
            let mut file = match guard.take() {
                Some(file) => file,
                None => self.open(slot).await?,
            };
            file.seek(SeekFrom::Start(within)).await?;
            file.read_exact(&mut buf[at..at + take]).await?;
            *guard = Some(file);
        }
        Ok(Bytes::from(buf))
    }

    async fn hash_piece(&self, piece: u32) -> Result<[u8; 20], StorageError> {
        let size = piece_size(self.piece_length, self.total_length, piece, self.num_pieces);
        let data = self.read_at(piece, 0, size).await?;
        let mut hasher = Sha1::new();
        hasher.update(&data);
        Ok(hasher.finalize().into())
    }
}

// --- in-memory store ----------------------------------------------------

/// A torrent's bytes in one flat buffer. Test and scratch use only.
pub struct MemoryStore {
    piece_length: u32,
    total_length: u64,
    num_pieces: usize,
    data: Mutex<Vec<u8>>,
}

impl MemoryStore {
    pub fn new(piece_length: u32, total_length: u64) -> Arc<Self> {
        let num_pieces = total_length.div_ceil(piece_length as u64) as usize;
        Arc::new(Self {
            piece_length,
            total_length,
            num_pieces,
            data: Mutex::new(vec![0; total_length as usize]),
        })
    }

    /// A store already holding `content`, e.g. a seeder's payload.
    pub fn seeded(piece_length: u32, content: Vec<u8>) -> Arc<Self> {
        let total_length = content.len() as u64;
        let num_pieces = total_length.div_ceil(piece_length as u64) as usize;
        Arc::new(Self {
            piece_length,
            total_length,
            num_pieces,
            data: Mutex::new(content),
        })
    }

    /// Snapshot of the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn range(&self, piece: u32, begin: u32, len: u32) -> Result<std::ops::Range<usize>, StorageError> {
        let size = piece_size(self.piece_length, self.total_length, piece, self.num_pieces);
        if piece as usize >= self.num_pieces || begin as u64 + len as u64 > size as u64 {
            return Err(StorageError::OutOfRange(
                piece as u64 * self.piece_length as u64 + begin as u64,
            ));
        }
        let start = piece as usize * self.piece_length as usize + begin as usize;
        Ok(start..start + len as usize)
    }
}

#[async_trait]
impl PieceStore for MemoryStore {
    async fn write_chunk(&self, piece: u32, begin: u32, data: &[u8]) -> Result<(), StorageError> {
        let range = self.range(piece, begin, data.len() as u32)?;
        self.data.lock()[range].copy_from_slice(data);
        Ok(())
    }

    async fn read_at(&self, piece: u32, begin: u32, length: u32) -> Result<Bytes, StorageError> {
        let range = self.range(piece, begin, length)?;
        Ok(Bytes::copy_from_slice(&self.data.lock()[range]))
    }

    async fn hash_piece(&self, piece: u32) -> Result<[u8; 20], StorageError> {
        let size = piece_size(self.piece_length, self.total_length, piece, self.num_pieces);
        let data = self.read_at(piece, 0, size).await?;
        let mut hasher = Sha1::new();
        hasher.update(&data);
        Ok(hasher.finalize().into())
    }
}
