//! Glue between connections, the omnibus and storage.
//!
//! A retriever is a serial executor for one file: a single task consumes the
//! `PeerEvent` queue fed by every connection of the file, the `OmnibusEvent`
//! queue, the reservation sweep and a periodic tick. Shared state lives behind the omnibus lock,
//! which is never held across a call into the collector or the repository.

mod collector;

pub use collector::{Collector, PeerCollector};

use crate::bitfield::Bitfield;
use crate::common::{FileHash, PeerId};
use crate::config::RetrieverConfig;
use crate::omnibus::{BlockOutcome, OmnibusEvent, OmnibusListener, OmnibusService, PieceData};
use crate::peer::{BlockInfo, PeerEvent, PeerMessage};
use crate::storage::Repository;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Receives file-level progress; implement only what you need
pub trait RetrieverCallback: Send + Sync {
    fn on_file_changed(&self, _hash: &FileHash, _bitfield: &Bitfield) {}

    fn on_file_completed(&self, _hash: &FileHash) {}
}

pub struct Retriever<C, R, B> {
    hash: FileHash,
    omnibus: OmnibusService,
    collector: Arc<C>,
    repository: Arc<R>,
    callback: Arc<B>,
    config: RetrieverConfig,
}

impl<C, R, B> Retriever<C, R, B>
where
    C: Collector,
    R: Repository,
    B: RetrieverCallback,
{
    pub fn new(
        omnibus: OmnibusService,
        collector: Arc<C>,
        repository: Arc<R>,
        callback: Arc<B>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            hash: omnibus.hash(),
            omnibus,
            collector,
            repository,
            callback,
            config,
        }
    }

    pub fn hash(&self) -> FileHash {
        self.hash
    }

    pub fn collector(&self) -> &Arc<C> {
        &self.collector
    }

    /// Process both queues until every connection handle is gone
    pub async fn run(
        self,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut omnibus_events: mpsc::UnboundedReceiver<OmnibusEvent>,
    ) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.omnibus.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Retriever started for {}", self.hash);

        loop {
            tokio::select! {
                event = peer_events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(event) = omnibus_events.recv() => self.handle_omnibus_event(event),
                _ = sweep.tick() => self.sweep().await,
                _ = interval.tick() => self.tick().await,
            }
        }

        info!("Retriever stopped for {}", self.hash);
    }

    /// React to something a connection reported
    pub async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                peer,
                connection,
                communicator,
            } => {
                let bitfield = self.omnibus.bitfield().await;
                if !bitfield.is_empty() {
                    if let Err(err) = communicator.send_bitfield(&bitfield) {
                        trace!("Could not send bitfield to {}: {}", peer, err);
                    }
                }

                // What the peer had and was asked for belongs to the replaced connection
                if self.collector.register(peer, communicator) {
                    let released = self.omnibus.remove_peer(&peer).await;
                    debug!(
                        "Peer {} reconnected on {}, {} reservations released",
                        peer, connection, released
                    );
                }
            }
            PeerEvent::Message { peer, message } => self.handle_message(peer, message).await,
            PeerEvent::Disconnected { peer, connection } => {
                if !self.collector.remove(&peer, connection) {
                    debug!("Ignoring disconnect of replaced connection {} of {}", connection, peer);
                    return;
                }
                let released = self.omnibus.remove_peer(&peer).await;
                debug!("Peer {} left, {} reservations released", peer, released);
            }
        }
    }

    pub fn handle_omnibus_event(&self, event: OmnibusEvent) {
        event.dispatch(&self.hash, self);
    }

    /// Reclaim reservations older than the omnibus timeout
    pub async fn sweep(&self) {
        let released = self.omnibus.sweep_expired().await;
        if released > 0 {
            debug!("Swept {} expired reservations of {}", released, self.hash);
        }
    }

    /// Hand out work to every serving peer
    pub async fn tick(&self) {
        for peer in self.collector.unchoked_peers() {
            self.schedule(peer).await;
        }
    }

    /// Reserve blocks for `peer` if it currently serves us
    pub async fn schedule(&self, peer: PeerId) -> Vec<BlockInfo> {
        if self.collector.is_choked(&peer) {
            return Vec::new();
        }
        self.omnibus.select_and_reserve(peer).await
    }

    async fn handle_message(&self, peer: PeerId, message: PeerMessage) {
        match message {
            PeerMessage::Bitfield { bitfield } => {
                self.omnibus.register_bitfield(peer, &bitfield).await;
                self.update_interest(peer).await;
            }
            PeerMessage::Have { piece_index } => {
                self.omnibus.register_have(peer, piece_index).await;
                self.update_interest(peer).await;
            }
            PeerMessage::Choke => {
                debug!("Peer {} choked us", peer);
                self.collector.set_choked(&peer, true);
            }
            PeerMessage::Unchoke => {
                debug!("Peer {} unchoked us", peer);
                self.collector.set_choked(&peer, false);
                self.schedule(peer).await;
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let outcome = self
                    .omnibus
                    .piece_received(peer, piece_index, offset, &data)
                    .await;
                if outcome != BlockOutcome::Unsolicited {
                    self.schedule(peer).await;
                }
            }
            other => trace!("Ignoring {} from {}", other.kind(), peer),
        }
    }

    async fn update_interest(&self, peer: PeerId) {
        if self.omnibus.is_interesting(&peer).await && self.collector.send_interested(&peer) {
            debug!("Interested in {}", peer);
        }
        self.schedule(peer).await;
    }
}

impl<C, R, B> OmnibusListener for Retriever<C, R, B>
where
    C: Collector,
    R: Repository,
    B: RetrieverCallback,
{
    fn on_block_reserved(&self, _hash: &FileHash, peer: PeerId, blocks: &[BlockInfo]) {
        self.collector.send_piece_request(&peer, blocks);

        let penalty = self.config.reserved_penalty.saturating_mul(blocks.len() as u32);
        self.collector.decrease(&peer, penalty);
    }

    fn on_block_expired(&self, _hash: &FileHash, peer: PeerId, block: BlockInfo) {
        trace!(
            "Block {}:{} expired at {}",
            block.piece_index,
            block.offset,
            peer
        );
        self.collector.decrease(&peer, self.config.expired_penalty);
    }

    fn on_piece_ready(&self, hash: &FileHash, piece: PieceData) {
        self.repository.verify(hash, piece);
    }

    fn on_piece_rejected(&self, _hash: &FileHash, piece: u32, contributors: &[PeerId]) {
        if let Some(penalty) = self.config.invalid_piece_penalty {
            debug!(
                "Penalizing {} contributors of piece {}",
                contributors.len(),
                piece
            );
            for peer in contributors {
                self.collector.decrease(peer, penalty);
            }
        }
    }

    fn on_progress_changed(&self, hash: &FileHash, bitfield: &Bitfield) {
        self.callback.on_file_changed(hash, bitfield);
    }

    fn on_file_completed(&self, hash: &FileHash) {
        self.callback.on_file_completed(hash);
    }
}
