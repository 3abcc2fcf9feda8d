//! Per-file block reservation engine.
//!
//! The omnibus owns which pieces are verified, what every peer has, and which
//! block is reserved to which peer. A block is reserved to at most one peer at
//! a time; a reservation ends when the peer delivers the block, when it
//! expires, or when the peer disconnects.
//!
//! Selection is rarest first: candidate pieces are ordered by how many
//! connected peers advertise them, ties broken by the lowest index.

mod events;
mod piece;
mod service;

pub use events::{OmnibusEvent, OmnibusListener};
pub use piece::{PieceData, PieceLayout, PieceState};
pub use service::OmnibusService;

use crate::bitfield::Bitfield;
use crate::common::{FileHash, PeerId};
use crate::config::OmnibusConfig;
use crate::peer::BlockInfo;
use piece::{BlockState, PieceEntry};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Result of handing a received block to the omnibus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored; the piece still misses blocks
    Accepted,
    /// Stored and the piece is complete; `PieceReady` was emitted
    PieceCompleted,
    /// Not reserved to this peer; discarded
    Unsolicited,
}

struct PeerEntry {
    bitfield: Bitfield,
    outstanding: usize,
}

pub struct Omnibus {
    hash: FileHash,
    config: OmnibusConfig,
    pieces: Vec<PieceEntry>,
    completed: Bitfield,
    availability: Vec<u32>,
    peers: HashMap<PeerId, PeerEntry>,
    file_completed: bool,
    events: mpsc::UnboundedSender<OmnibusEvent>,
}

impl Omnibus {
    pub fn new(
        hash: FileHash,
        layout: PieceLayout,
        config: OmnibusConfig,
        events: mpsc::UnboundedSender<OmnibusEvent>,
    ) -> Self {
        let piece_count = layout.piece_count();
        let block_size = config.block_size.max(1);
        let pieces = (0..piece_count)
            .map(|index| PieceEntry::new(index as u32, layout.piece_size(index), block_size))
            .collect();

        Self {
            hash,
            config,
            pieces,
            completed: Bitfield::new(piece_count),
            availability: vec![0; piece_count],
            peers: HashMap::new(),
            file_completed: false,
            events,
        }
    }

    /// Create an omnibus together with the queue its events land on
    pub fn channel(
        hash: FileHash,
        layout: PieceLayout,
        config: OmnibusConfig,
    ) -> (Self, mpsc::UnboundedReceiver<OmnibusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(hash, layout, config, sender), receiver)
    }

    pub fn hash(&self) -> FileHash {
        self.hash
    }

    pub fn config(&self) -> &OmnibusConfig {
        &self.config
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_state(&self, index: usize) -> Option<PieceState> {
        self.pieces.get(index).map(|p| p.state)
    }

    /// Locally verified pieces
    pub fn bitfield(&self) -> &Bitfield {
        &self.completed
    }

    pub fn is_complete(&self) -> bool {
        self.completed.is_complete()
    }

    /// Number of blocks currently reserved to `peer`
    pub fn outstanding(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |p| p.outstanding)
    }

    /// Who holds the reservation of `block`, if anyone
    pub fn reservation(&self, block: &BlockInfo) -> Option<PeerId> {
        let piece = self.pieces.get(block.piece_index as usize)?;
        match piece.blocks.get(piece.block_at(block.offset)?)? {
            BlockState::Reserved { peer, .. } => Some(*peer),
            _ => None,
        }
    }

    /// Merge an advertised bitfield into what `peer` is known to have
    pub fn register_bitfield(&mut self, peer: PeerId, bitfield: &Bitfield) {
        let piece_count = self.pieces.len();
        let entry = self.peers.entry(peer).or_insert_with(|| PeerEntry {
            bitfield: Bitfield::new(piece_count),
            outstanding: 0,
        });

        let added = entry.bitfield.merge(bitfield);
        for index in &added {
            self.availability[*index] += 1;
        }
        trace!("Peer {} advertised {} new pieces", peer, added.len());
    }

    pub fn register_have(&mut self, peer: PeerId, piece_index: u32) {
        let piece_count = self.pieces.len();
        let entry = self.peers.entry(peer).or_insert_with(|| PeerEntry {
            bitfield: Bitfield::new(piece_count),
            outstanding: 0,
        });

        let index = piece_index as usize;
        if entry.bitfield.set(index) {
            self.availability[index] += 1;
        }
    }

    /// Whether `peer` has any piece we still need
    pub fn is_interesting(&self, peer: &PeerId) -> bool {
        let Some(entry) = self.peers.get(peer) else {
            return false;
        };

        self.pieces.iter().any(|piece| {
            entry.bitfield.has(piece.index as usize)
                && matches!(piece.state, PieceState::Missing | PieceState::Reserved)
        })
    }

    /// Reserve up to the per-peer budget of blocks `peer` can serve
    pub fn select_and_reserve(&mut self, peer: PeerId, now: Instant) -> Vec<BlockInfo> {
        let Some(entry) = self.peers.get(&peer) else {
            return Vec::new();
        };

        let mut budget = self
            .config
            .max_outstanding_per_peer
            .saturating_sub(entry.outstanding);
        if budget == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<usize> = self
            .pieces
            .iter()
            .filter(|piece| piece.is_selectable() && entry.bitfield.has(piece.index as usize))
            .map(|piece| piece.index as usize)
            .collect();
        candidates.sort_by_key(|&index| (self.availability[index], index));

        let mut granted = Vec::new();
        for index in candidates {
            let piece = &mut self.pieces[index];
            for block_index in 0..piece.blocks.len() {
                if budget == 0 {
                    break;
                }
                if piece.blocks[block_index] == BlockState::Missing {
                    piece.blocks[block_index] = BlockState::Reserved { peer, since: now };
                    granted.push(piece.block_info(block_index));
                    budget -= 1;
                }
            }
            piece.refresh_state();

            if budget == 0 {
                break;
            }
        }

        if !granted.is_empty() {
            if let Some(entry) = self.peers.get_mut(&peer) {
                entry.outstanding += granted.len();
            }
            debug!("Reserved {} blocks to {}", granted.len(), peer);
            self.emit(OmnibusEvent::BlockReserved {
                peer,
                blocks: granted.clone(),
            });
        }

        granted
    }

    /// Resolve the reservation matching a received block
    pub fn piece_received(
        &mut self,
        peer: PeerId,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> BlockOutcome {
        let Some(piece) = self.pieces.get_mut(piece_index as usize) else {
            return BlockOutcome::Unsolicited;
        };
        let Some(block_index) = piece.block_at(offset) else {
            return BlockOutcome::Unsolicited;
        };

        match piece.blocks[block_index] {
            BlockState::Reserved { peer: owner, .. } if owner == peer => {}
            _ => {
                debug!(
                    "Discarding unsolicited block {}:{} from {}",
                    piece_index, offset, peer
                );
                return BlockOutcome::Unsolicited;
            }
        }

        if piece.block_info(block_index).length as usize != data.len() {
            debug!(
                "Discarding block {}:{} from {} with length {}",
                piece_index,
                offset,
                peer,
                data.len()
            );
            return BlockOutcome::Unsolicited;
        }

        piece.write(offset, data);
        piece.blocks[block_index] = BlockState::Received;
        piece.contributors.insert(peer);

        let ready = if piece.is_fully_received() {
            piece.state = PieceState::PendingVerification;
            piece.buffer.take().map(|buffer| PieceData {
                index: piece_index,
                data: buffer.freeze(),
            })
        } else {
            piece.refresh_state();
            None
        };

        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.outstanding = entry.outstanding.saturating_sub(1);
        }

        match ready {
            Some(piece) => {
                debug!("Piece {} assembled, awaiting verification", piece_index);
                self.emit(OmnibusEvent::PieceReady { piece });
                BlockOutcome::PieceCompleted
            }
            None => BlockOutcome::Accepted,
        }
    }

    /// Release every reservation older than the configured timeout
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let timeout = self.config.reservation_timeout;
        self.release_where(|_, since| now.saturating_duration_since(since) >= timeout)
    }

    /// Forget a disconnected peer and free its reservations immediately
    pub fn remove_peer(&mut self, peer: &PeerId) -> usize {
        let target = *peer;
        let released = self.release_where(|owner, _| owner == target);

        if let Some(entry) = self.peers.remove(peer) {
            for (index, count) in self.availability.iter_mut().enumerate() {
                if entry.bitfield.has(index) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        released
    }

    /// Storage confirmed the piece hash
    pub fn mark_verified(&mut self, piece_index: u32) -> bool {
        let index = piece_index as usize;
        let Some(piece) = self.pieces.get_mut(index) else {
            return false;
        };
        if piece.state == PieceState::Verified {
            return false;
        }

        let mut released = Vec::new();
        for block in piece.blocks.iter_mut() {
            if let BlockState::Reserved { peer, .. } = *block {
                released.push(peer);
            }
            *block = BlockState::Received;
        }
        piece.state = PieceState::Verified;
        piece.buffer = None;
        piece.contributors.clear();

        for peer in released {
            if let Some(entry) = self.peers.get_mut(&peer) {
                entry.outstanding = entry.outstanding.saturating_sub(1);
            }
        }

        self.completed.set(index);
        info!(
            "Piece {} verified ({}/{})",
            piece_index,
            self.completed.count(),
            self.pieces.len()
        );
        self.emit(OmnibusEvent::ProgressChanged {
            bitfield: self.completed.clone(),
        });

        if self.completed.is_complete() && !self.file_completed {
            self.file_completed = true;
            info!("File {} completed", self.hash);
            self.emit(OmnibusEvent::FileCompleted);
        }
        true
    }

    /// Storage rejected the piece hash; all of its blocks become reservable again
    pub fn mark_invalid(&mut self, piece_index: u32) -> bool {
        let Some(piece) = self.pieces.get_mut(piece_index as usize) else {
            return false;
        };
        if piece.state != PieceState::PendingVerification {
            return false;
        }

        let contributors = piece.reset();
        info!("Piece {} failed verification", piece_index);
        self.emit(OmnibusEvent::PieceRejected {
            piece: piece_index,
            contributors,
        });
        true
    }

    fn release_where<F>(&mut self, mut expired: F) -> usize
    where
        F: FnMut(PeerId, Instant) -> bool,
    {
        let mut released = Vec::new();

        for piece in self.pieces.iter_mut() {
            if piece.state != PieceState::Reserved {
                continue;
            }
            for block_index in 0..piece.blocks.len() {
                if let BlockState::Reserved { peer, since } = piece.blocks[block_index] {
                    if expired(peer, since) {
                        piece.blocks[block_index] = BlockState::Missing;
                        released.push((peer, piece.block_info(block_index)));
                    }
                }
            }
            piece.refresh_state();
        }

        for (peer, block) in &released {
            if let Some(entry) = self.peers.get_mut(peer) {
                entry.outstanding = entry.outstanding.saturating_sub(1);
            }
            debug!(
                "Reservation of {}:{} by {} released",
                block.piece_index, block.offset, peer
            );
        }

        let count = released.len();
        for (peer, block) in released {
            self.emit(OmnibusEvent::BlockExpired { peer, block });
        }
        count
    }

    fn emit(&self, event: OmnibusEvent) {
        // A closed queue only means nobody listens any more
        let _ = self.events.send(event);
    }
}
