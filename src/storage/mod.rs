use crate::common::FileHash;
use crate::error::{LeakError, Result};
use crate::omnibus::{OmnibusService, PieceData};
use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage collaborator receiving assembled pieces.
///
/// Implementations report the outcome back through
/// `OmnibusService::mark_verified` or `OmnibusService::mark_invalid`.
pub trait Repository: Send + Sync {
    fn verify(&self, hash: &FileHash, piece: PieceData);
}

/// Checks pieces against their expected SHA-1 and keeps the verified ones in memory
#[derive(Clone)]
pub struct HashVerifier {
    hashes: Arc<Vec<[u8; 20]>>,
    omnibus: OmnibusService,
    verified: Arc<Mutex<HashMap<u32, Bytes>>>,
}

impl HashVerifier {
    pub fn new(hashes: Vec<[u8; 20]>, omnibus: OmnibusService) -> Self {
        Self {
            hashes: Arc::new(hashes),
            omnibus,
            verified: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Parse concatenated 20-byte piece hashes
    pub fn from_concatenated(data: &[u8], omnibus: OmnibusService) -> Result<Self> {
        if data.len() % 20 != 0 {
            return Err(LeakError::PieceError(
                "Pieces length must be multiple of 20".to_string(),
            ));
        }

        let hashes = data
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(Self::new(hashes, omnibus))
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// Data of a verified piece
    pub fn read_piece(&self, index: u32) -> Option<Bytes> {
        self.verified.lock().get(&index).cloned()
    }

    /// Hash `piece` and record the result; the piece is kept only when it matches
    pub fn check(&self, piece: &PieceData) -> bool {
        let Some(expected) = self.hashes.get(piece.index as usize) else {
            return false;
        };

        let mut hasher = Sha1::new();
        hasher.update(&piece.data);
        if hasher.finalize().as_slice() != expected {
            return false;
        }

        self.verified.lock().insert(piece.index, piece.data.clone());
        true
    }
}

impl Repository for HashVerifier {
    fn verify(&self, hash: &FileHash, piece: PieceData) {
        let verifier = self.clone();
        let hash = *hash;

        tokio::spawn(async move {
            if verifier.check(&piece) {
                debug!("Piece {} of {} matches its hash", piece.index, hash);
                verifier.omnibus.mark_verified(piece.index).await;
            } else {
                warn!("Piece {} of {} failed verification", piece.index, hash);
                verifier.omnibus.mark_invalid(piece.index).await;
            }
        });
    }
}
