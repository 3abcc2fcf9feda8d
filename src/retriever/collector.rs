use crate::common::{ConnectionId, PeerId};
use crate::peer::{BlockInfo, Communicator};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace};

/// The set of connected peers of one file, as seen by the retriever
pub trait Collector: Send + Sync {
    /// Track `communicator` as the live connection of `peer`; returns whether
    /// an earlier connection of the same peer was replaced
    fn register(&self, peer: PeerId, communicator: Communicator) -> bool;

    /// Forget `peer` if `connection` is still its live connection
    fn remove(&self, peer: &PeerId, connection: ConnectionId) -> bool;

    /// Send `interested` unless it was already sent; returns whether it was sent now
    fn send_interested(&self, peer: &PeerId) -> bool;

    fn send_piece_request(&self, peer: &PeerId, blocks: &[BlockInfo]);

    fn decrease(&self, peer: &PeerId, amount: u32);

    fn set_choked(&self, peer: &PeerId, choked: bool);

    fn is_choked(&self, peer: &PeerId) -> bool;

    /// Peers that currently serve us, best score first
    fn unchoked_peers(&self) -> Vec<PeerId>;
}

#[derive(Debug)]
struct PeerState {
    communicator: Communicator,
    choked: bool,
    interested: bool,
    score: i64,
}

/// Registry of connected peers with their outbound side and score
#[derive(Debug, Default)]
pub struct PeerCollector {
    peers: Mutex<HashMap<PeerId, PeerState>>,
}

impl PeerCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn score(&self, peer: &PeerId) -> Option<i64> {
        self.peers.lock().get(peer).map(|state| state.score)
    }

    pub fn connection(&self, peer: &PeerId) -> Option<ConnectionId> {
        self.peers
            .lock()
            .get(peer)
            .map(|state| state.communicator.connection())
    }
}

impl Collector for PeerCollector {
    fn register(&self, peer: PeerId, communicator: Communicator) -> bool {
        debug!("Collected peer {} on {}", peer, communicator.connection());
        let previous = self.peers.lock().insert(
            peer,
            PeerState {
                communicator,
                choked: true,
                interested: false,
                score: 0,
            },
        );
        previous.is_some()
    }

    fn remove(&self, peer: &PeerId, connection: ConnectionId) -> bool {
        let mut peers = self.peers.lock();
        match peers.get(peer) {
            Some(state) if state.communicator.connection() == connection => {
                peers.remove(peer);
                debug!("Released peer {} on {}", peer, connection);
                true
            }
            _ => false,
        }
    }

    fn send_interested(&self, peer: &PeerId) -> bool {
        let mut peers = self.peers.lock();
        let Some(state) = peers.get_mut(peer) else {
            return false;
        };
        if state.interested {
            return false;
        }

        state.interested = true;
        if let Err(err) = state.communicator.send_interested() {
            trace!("Could not send interested to {}: {}", peer, err);
        }
        true
    }

    fn send_piece_request(&self, peer: &PeerId, blocks: &[BlockInfo]) {
        let peers = self.peers.lock();
        if let Some(state) = peers.get(peer) {
            if let Err(err) = state.communicator.send_piece_request(blocks) {
                trace!("Could not request {} blocks from {}: {}", blocks.len(), peer, err);
            }
        }
    }

    fn decrease(&self, peer: &PeerId, amount: u32) {
        if let Some(state) = self.peers.lock().get_mut(peer) {
            state.score -= i64::from(amount);
        }
    }

    fn set_choked(&self, peer: &PeerId, choked: bool) {
        if let Some(state) = self.peers.lock().get_mut(peer) {
            state.choked = choked;
        }
    }

    fn is_choked(&self, peer: &PeerId) -> bool {
        self.peers.lock().get(peer).map_or(true, |state| state.choked)
    }

    fn unchoked_peers(&self) -> Vec<PeerId> {
        let peers = self.peers.lock();
        let mut ranked: Vec<(i64, PeerId)> = peers
            .iter()
            .filter(|(_, state)| !state.choked)
            .map(|(peer, state)| (state.score, *peer))
            .collect();

        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, peer)| peer).collect()
    }
}
