use std::collections::BTreeSet;

use sha1_smol::Sha1;
use thiserror::Error;

use crate::prelude::*;
use crate::torrent::{empty_bitfield, Bitfield};
use crate::{BlockLength, BlockOffset, PieceIndex, PieceLength};

pub type PieceHash = [u8; 20];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(PieceIndex),

    #[error("piece {piece} has length {expected}, got {got} bytes")]
    LengthMismatch {
        piece: PieceIndex,
        expected: usize,
        got: usize,
    },

    #[error("piece {0} already stored")]
    AlreadyHave(PieceIndex),
}

/// counters surfaced in the status report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// pieces found intact on disk at startup
    pub numfound: usize,
    /// pieces downloaded and verified this session
    pub numdownloaded: usize,
    /// pieces that failed the hash check
    pub numflunked: usize,
    /// pieces whose delivered data did not verify and that still wait for a good copy
    pub dirty: usize,
    /// pieces with a download under way
    pub active: usize,
}

/// where piece bytes live. only ever touched from the event loop thread.
pub trait Storage {
    /// `None` when the requested range is not available.
    fn get_piece(&self, index: PieceIndex, begin: BlockOffset, length: BlockLength) -> Option<Vec<u8>>;

    fn do_i_have_anything(&self) -> bool;

    fn get_have_list(&self) -> Bitfield;

    fn stats(&self) -> StorageStats;

    /// bytes still missing, per file.
    fn files_left(&self) -> Vec<u64>;

    fn files_allocated(&self) -> Vec<bool>;

    /// total bytes still missing.
    fn left(&self) -> u64;

    fn total_length(&self) -> u64;
}

/// the write side of storage, used when a downloaded piece comes in.
pub trait PieceStore: Storage {
    /// verifies and stores a whole piece. `Ok(false)` means the hash did not match and the
    /// data was dropped.
    fn write_piece(&mut self, index: PieceIndex, data: Vec<u8>) -> Result<bool, StorageError>;

    /// a download of `index` got under way. it stays active until data for it is written.
    fn piece_started(&mut self, index: PieceIndex);

    fn piece_size(&self, index: PieceIndex) -> usize;
}

/// a single file torrent held in memory and checked against SHA-1 piece hashes.
#[derive(Debug)]
pub struct MemoryStorage {
    piece_length: PieceLength,
    total_length: u64,
    hashes: Vec<PieceHash>,
    pieces: Vec<Option<Vec<u8>>>,
    stats: StorageStats,
    // pieces that flunked and are not stored yet
    dirty: BTreeSet<PieceIndex>,
    active: BTreeSet<PieceIndex>,
}

impl MemoryStorage {
    pub fn new(piece_length: PieceLength, hashes: Vec<PieceHash>, total_length: u64) -> Self {
        let pieces = vec![None; hashes.len()];
        Self {
            piece_length,
            total_length,
            hashes,
            pieces,
            stats: StorageStats::default(),
            dirty: BTreeSet::new(),
            active: BTreeSet::new(),
        }
    }

    /// storage that already holds all of `data`, as a seed would after its startup check.
    pub fn seeded(piece_length: PieceLength, data: &[u8]) -> Self {
        let mut storage = Self::new(piece_length, Self::hash_pieces(piece_length, data), data.len() as u64);
        for (index, chunk) in data.chunks(piece_length as usize).enumerate() {
            storage.pieces[index] = Some(chunk.to_vec());
        }
        storage.stats.numfound = storage.pieces.len();
        storage
    }

    pub fn hash_pieces(piece_length: PieceLength, data: &[u8]) -> Vec<PieceHash> {
        data.chunks(piece_length as usize)
            .map(|chunk| Sha1::from(chunk).digest().bytes())
            .collect()
    }

    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }

    pub fn has(&self, index: PieceIndex) -> bool {
        self.pieces.get(index).is_some_and(Option::is_some)
    }
}

impl Storage for MemoryStorage {
    fn get_piece(&self, index: PieceIndex, begin: BlockOffset, length: BlockLength) -> Option<Vec<u8>> {
        let piece = self.pieces.get(index)?.as_ref()?;
        let begin = begin as usize;
        let end = begin.checked_add(length as usize)?;
        piece.get(begin..end).map(<[u8]>::to_vec)
    }

    fn do_i_have_anything(&self) -> bool {
        self.pieces.iter().any(Option::is_some)
    }

    fn get_have_list(&self) -> Bitfield {
        let mut bitfield = empty_bitfield(self.pieces.len());
        for (index, piece) in self.pieces.iter().enumerate() {
            bitfield.set(index, piece.is_some());
        }
        bitfield
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            dirty: self.dirty.len(),
            active: self.active.len(),
            ..self.stats
        }
    }

    fn files_left(&self) -> Vec<u64> {
        vec![self.left()]
    }

    fn files_allocated(&self) -> Vec<bool> {
        vec![true]
    }

    fn left(&self) -> u64 {
        (0..self.num_pieces())
            .filter(|&index| !self.has(index))
            .map(|index| self.piece_size(index) as u64)
            .sum()
    }

    fn total_length(&self) -> u64 {
        self.total_length
    }
}

impl PieceStore for MemoryStorage {
    fn write_piece(&mut self, index: PieceIndex, data: Vec<u8>) -> Result<bool, StorageError> {
        let expected_hash = *self
            .hashes
            .get(index)
            .ok_or(StorageError::InvalidPieceIndex(index))?;
        if self.has(index) {
            return Err(StorageError::AlreadyHave(index));
        }
        let expected = self.piece_size(index);
        if data.len() != expected {
            return Err(StorageError::LengthMismatch {
                piece: index,
                expected,
                got: data.len(),
            });
        }

        self.active.remove(&index);
        if Sha1::from(&data).digest().bytes() != expected_hash {
            warn!(piece = index, "piece failed hash check");
            self.stats.numflunked += 1;
            self.dirty.insert(index);
            return Ok(false);
        }

        self.dirty.remove(&index);
        self.pieces[index] = Some(data);
        self.stats.numdownloaded += 1;
        Ok(true)
    }

    fn piece_started(&mut self, index: PieceIndex) {
        if index < self.num_pieces() && !self.has(index) {
            self.active.insert(index);
        }
    }

    fn piece_size(&self, index: PieceIndex) -> usize {
        let start = index as u64 * self.piece_length as u64;
        (self.total_length.saturating_sub(start)).min(self.piece_length as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn seeded_storage_serves_blocks() {
        let bytes = data(40_000);
        let storage = MemoryStorage::seeded(16_384, &bytes);
        assert_eq!(storage.num_pieces(), 3);
        assert!(storage.do_i_have_anything());
        assert_eq!(storage.get_have_list().count_ones(), 3);
        assert_eq!(storage.left(), 0);
        assert_eq!(storage.stats().numfound, 3);

        let block = storage.get_piece(1, 100, 50).unwrap();
        assert_eq!(block, bytes[16_384 + 100..16_384 + 150]);
        assert_eq!(storage.piece_size(2), 40_000 - 2 * 16_384);
    }

    #[test]
    fn out_of_range_blocks_are_unavailable() {
        let storage = MemoryStorage::seeded(1024, &data(2048));
        assert!(storage.get_piece(0, 1000, 100).is_none());
        assert!(storage.get_piece(5, 0, 10).is_none());
        assert!(storage.get_piece(0, u32::MAX, u32::MAX).is_none());
    }

    #[test]
    fn write_piece_checks_hashes() {
        let bytes = data(3000);
        let hashes = MemoryStorage::hash_pieces(1024, &bytes);
        let mut storage = MemoryStorage::new(1024, hashes, 3000);
        assert!(!storage.do_i_have_anything());
        assert_eq!(storage.left(), 3000);

        storage.piece_started(0);
        storage.piece_started(1);
        assert_eq!(storage.stats().active, 2);

        let mut corrupt = bytes[..1024].to_vec();
        corrupt[3] ^= 0xff;
        assert!(!storage.write_piece(0, corrupt).unwrap());
        assert_eq!(storage.stats().numflunked, 1);
        assert_eq!(storage.stats().dirty, 1);
        assert_eq!(storage.stats().active, 1);

        assert!(storage.write_piece(0, bytes[..1024].to_vec()).unwrap());
        assert_eq!(storage.stats().dirty, 0);
        assert!(storage.write_piece(2, bytes[2048..].to_vec()).unwrap());
        assert_eq!(storage.stats().numdownloaded, 2);
        assert_eq!(storage.files_left(), vec![1024]);

        assert!(matches!(
            storage.write_piece(0, bytes[..1024].to_vec()),
            Err(StorageError::AlreadyHave(0))
        ));
        assert!(matches!(
            storage.write_piece(1, vec![0; 10]),
            Err(StorageError::LengthMismatch { piece: 1, .. })
        ));
        assert!(matches!(
            storage.write_piece(9, vec![]),
            Err(StorageError::InvalidPieceIndex(9))
        ));
    }
}
