use super::{BlockOutcome, Omnibus, PieceState};
use crate::bitfield::Bitfield;
use crate::common::{FileHash, PeerId};
use crate::peer::BlockInfo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

/// Shared handle to an omnibus; every operation runs under the per-file lock
#[derive(Clone)]
pub struct OmnibusService {
    hash: FileHash,
    sweep_interval: Duration,
    inner: Arc<Mutex<Omnibus>>,
}

impl OmnibusService {
    pub fn new(omnibus: Omnibus) -> Self {
        Self {
            hash: omnibus.hash(),
            sweep_interval: omnibus.config().sweep_interval,
            inner: Arc::new(Mutex::new(omnibus)),
        }
    }

    pub fn hash(&self) -> FileHash {
        self.hash
    }

    /// How often expired reservations are reclaimed
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Direct access for several operations in one critical section
    pub async fn lock(&self) -> MutexGuard<'_, Omnibus> {
        self.inner.lock().await
    }

    pub async fn register_bitfield(&self, peer: PeerId, bitfield: &Bitfield) {
        self.inner.lock().await.register_bitfield(peer, bitfield);
    }

    pub async fn register_have(&self, peer: PeerId, piece_index: u32) {
        self.inner.lock().await.register_have(peer, piece_index);
    }

    pub async fn is_interesting(&self, peer: &PeerId) -> bool {
        self.inner.lock().await.is_interesting(peer)
    }

    pub async fn select_and_reserve(&self, peer: PeerId) -> Vec<BlockInfo> {
        self.inner
            .lock()
            .await
            .select_and_reserve(peer, Instant::now())
    }

    pub async fn piece_received(
        &self,
        peer: PeerId,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> BlockOutcome {
        self.inner
            .lock()
            .await
            .piece_received(peer, piece_index, offset, data)
    }

    pub async fn sweep_expired(&self) -> usize {
        self.inner.lock().await.sweep_expired(Instant::now())
    }

    pub async fn remove_peer(&self, peer: &PeerId) -> usize {
        self.inner.lock().await.remove_peer(peer)
    }

    pub async fn mark_verified(&self, piece_index: u32) -> bool {
        self.inner.lock().await.mark_verified(piece_index)
    }

    pub async fn mark_invalid(&self, piece_index: u32) -> bool {
        self.inner.lock().await.mark_invalid(piece_index)
    }

    pub async fn piece_state(&self, index: usize) -> Option<PieceState> {
        self.inner.lock().await.piece_state(index)
    }

    pub async fn bitfield(&self) -> Bitfield {
        self.inner.lock().await.bitfield().clone()
    }

    pub async fn is_complete(&self) -> bool {
        self.inner.lock().await.is_complete()
    }

    /// Reclaim expired reservations every `sweep_interval` until the task is aborted
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let released = service.sweep_expired().await;
                if released > 0 {
                    debug!("Sweeper released {} reservations of {}", released, service.hash);
                }
            }
        })
    }
}
