use crate::common::PeerId;
use crate::error::{LeakError, Result};
use crate::peer::BlockInfo;
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::time::Instant;

/// Piece geometry of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    pub piece_length: u64,
    pub total_length: u64,
}

impl PieceLayout {
    pub fn new(piece_length: u64, total_length: u64) -> Result<Self> {
        if piece_length == 0 || total_length == 0 {
            return Err(LeakError::PieceError(
                "Piece and total length must be positive".to_string(),
            ));
        }
        if piece_length > u32::MAX as u64 {
            return Err(LeakError::PieceError("Piece length too large".to_string()));
        }

        Ok(Self {
            piece_length,
            total_length,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.total_length.div_ceil(self.piece_length) as usize
    }

    /// Length of a piece; the last one might be smaller
    pub fn piece_size(&self, index: usize) -> u32 {
        if index + 1 == self.piece_count() {
            let remainder = self.total_length % self.piece_length;
            if remainder != 0 {
                return remainder as u32;
            }
        }
        self.piece_length as u32
    }
}

/// Lifecycle of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No block reserved or received
    Missing,
    /// Some blocks reserved or received
    Reserved,
    /// Every block received, awaiting hash verification
    PendingVerification,
    /// Verified by storage; terminal
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    Missing,
    Reserved { peer: PeerId, since: Instant },
    Received,
}

/// An assembled piece handed over for verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceData {
    pub index: u32,
    pub data: Bytes,
}

pub(crate) struct PieceEntry {
    pub index: u32,
    pub length: u32,
    pub state: PieceState,
    pub blocks: Vec<BlockState>,
    pub buffer: Option<BytesMut>,
    pub contributors: HashSet<PeerId>,
    block_size: u32,
}

impl PieceEntry {
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let count = length.div_ceil(block_size) as usize;
        Self {
            index,
            length,
            state: PieceState::Missing,
            blocks: vec![BlockState::Missing; count],
            buffer: None,
            contributors: HashSet::new(),
            block_size,
        }
    }

    pub fn block_info(&self, block_index: usize) -> BlockInfo {
        let offset = block_index as u32 * self.block_size;
        let length = std::cmp::min(self.block_size, self.length - offset);
        BlockInfo::new(self.index, offset, length)
    }

    /// Index of the block starting at `offset`, if such a block exists
    pub fn block_at(&self, offset: u32) -> Option<usize> {
        if offset % self.block_size != 0 {
            return None;
        }
        let index = (offset / self.block_size) as usize;
        (index < self.blocks.len()).then_some(index)
    }

    pub fn is_selectable(&self) -> bool {
        matches!(self.state, PieceState::Missing | PieceState::Reserved)
            && self.blocks.iter().any(|b| *b == BlockState::Missing)
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) {
        let length = self.length as usize;
        let buffer = self
            .buffer
            .get_or_insert_with(|| BytesMut::zeroed(length));

        let offset = offset as usize;
        buffer[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn is_fully_received(&self) -> bool {
        self.blocks.iter().all(|b| *b == BlockState::Received)
    }

    /// Recompute Missing/Reserved after blocks changed
    pub fn refresh_state(&mut self) {
        if matches!(
            self.state,
            PieceState::PendingVerification | PieceState::Verified
        ) {
            return;
        }

        self.state = if self.blocks.iter().all(|b| *b == BlockState::Missing) {
            PieceState::Missing
        } else {
            PieceState::Reserved
        };
    }

    /// Forget all progress; the piece becomes reservable again
    pub fn reset(&mut self) -> Vec<PeerId> {
        self.blocks.iter_mut().for_each(|b| *b = BlockState::Missing);
        self.buffer = None;
        self.state = PieceState::Missing;
        self.contributors.drain().collect()
    }
}
