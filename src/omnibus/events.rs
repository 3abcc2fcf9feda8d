use super::piece::PieceData;
use crate::bitfield::Bitfield;
use crate::common::{FileHash, PeerId};
use crate::peer::BlockInfo;

/// Notifications produced by the omnibus, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OmnibusEvent {
    BlockReserved { peer: PeerId, blocks: Vec<BlockInfo> },
    BlockExpired { peer: PeerId, block: BlockInfo },
    PieceReady { piece: PieceData },
    PieceRejected { piece: u32, contributors: Vec<PeerId> },
    ProgressChanged { bitfield: Bitfield },
    FileCompleted,
}

impl OmnibusEvent {
    pub fn dispatch<L: OmnibusListener + ?Sized>(self, hash: &FileHash, listener: &L) {
        match self {
            OmnibusEvent::BlockReserved { peer, blocks } => {
                listener.on_block_reserved(hash, peer, &blocks)
            }
            OmnibusEvent::BlockExpired { peer, block } => {
                listener.on_block_expired(hash, peer, block)
            }
            OmnibusEvent::PieceReady { piece } => listener.on_piece_ready(hash, piece),
            OmnibusEvent::PieceRejected {
                piece,
                contributors,
            } => listener.on_piece_rejected(hash, piece, &contributors),
            OmnibusEvent::ProgressChanged { bitfield } => {
                listener.on_progress_changed(hash, &bitfield)
            }
            OmnibusEvent::FileCompleted => listener.on_file_completed(hash),
        }
    }
}

/// Consumer of omnibus events; implement only what you need
pub trait OmnibusListener {
    fn on_block_reserved(&self, _hash: &FileHash, _peer: PeerId, _blocks: &[BlockInfo]) {}

    fn on_block_expired(&self, _hash: &FileHash, _peer: PeerId, _block: BlockInfo) {}

    fn on_piece_ready(&self, _hash: &FileHash, _piece: PieceData) {}

    fn on_piece_rejected(&self, _hash: &FileHash, _piece: u32, _contributors: &[PeerId]) {}

    fn on_progress_changed(&self, _hash: &FileHash, _bitfield: &Bitfield) {}

    fn on_file_completed(&self, _hash: &FileHash) {}
}
