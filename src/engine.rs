//! Wiring of one local peer from an `EngineConfig`.
//!
//! An `Engine` owns the negotiator; every file it retrieves gets its own
//! omnibus, verifier, collector and retriever task, all configured from the
//! same document.

use crate::common::{FileHash, PeerId};
use crate::config::{EngineConfig, LoopConfig};
use crate::error::{LeakError, Result};
use crate::negotiator::{HandshakeCompleted, Negotiator};
use crate::omnibus::{Omnibus, OmnibusService, PieceLayout};
use crate::peer::{self, ChannelHandler, PeerConnection, PeerEvent};
use crate::retriever::{PeerCollector, Retriever, RetrieverCallback};
use crate::storage::HashVerifier;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Engine {
    config: EngineConfig,
    negotiator: Negotiator,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_peer_id(PeerId::generate(), config)
    }

    pub fn with_peer_id(peer_id: PeerId, config: EngineConfig) -> Self {
        info!("Engine initialized with peer_id: {}", peer_id);
        let negotiator = Negotiator::new(peer_id, config.negotiator.clone());
        Self { config, negotiator }
    }

    pub fn peer_id(&self) -> PeerId {
        self.negotiator.peer_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handshakes for both directions, using the configured encryption mode
    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// Start retrieving one file; must be called inside a tokio runtime
    pub fn start_file<B>(
        &self,
        hash: FileHash,
        layout: PieceLayout,
        piece_hashes: Vec<[u8; 20]>,
        callback: Arc<B>,
    ) -> Result<FileTask>
    where
        B: RetrieverCallback + 'static,
    {
        if piece_hashes.len() != layout.piece_count() {
            return Err(LeakError::PieceError(format!(
                "Expected {} piece hashes, got {}",
                layout.piece_count(),
                piece_hashes.len()
            )));
        }

        let (omnibus, omnibus_events) = Omnibus::channel(hash, layout, self.config.omnibus.clone());
        let omnibus = OmnibusService::new(omnibus);
        let verifier = HashVerifier::new(piece_hashes, omnibus.clone());
        let collector = Arc::new(PeerCollector::new());

        let retriever = Retriever::new(
            omnibus.clone(),
            collector.clone(),
            Arc::new(verifier.clone()),
            callback,
            self.config.retriever.clone(),
        );
        let (events, peer_events) = mpsc::unbounded_channel();
        let retriever = tokio::spawn(retriever.run(peer_events, omnibus_events));

        info!("Started retrieving {} ({} pieces)", hash, verifier.piece_count());
        Ok(FileTask {
            hash,
            omnibus,
            verifier,
            collector,
            events,
            connection: self.config.connection.clone(),
            retriever,
        })
    }
}

/// One file being retrieved: its shared state and the running retriever
pub struct FileTask {
    hash: FileHash,
    omnibus: OmnibusService,
    verifier: HashVerifier,
    collector: Arc<PeerCollector>,
    events: mpsc::UnboundedSender<PeerEvent>,
    connection: LoopConfig,
    retriever: JoinHandle<()>,
}

impl FileTask {
    pub fn hash(&self) -> FileHash {
        self.hash
    }

    pub fn omnibus(&self) -> &OmnibusService {
        &self.omnibus
    }

    pub fn verifier(&self) -> &HashVerifier {
        &self.verifier
    }

    pub fn collector(&self) -> &Arc<PeerCollector> {
        &self.collector
    }

    /// Feed a negotiated connection of this file to its retriever
    pub fn attach<S>(&self, completed: HandshakeCompleted<S>) -> Result<PeerConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if completed.hash != self.hash {
            return Err(LeakError::InfoHashMismatch);
        }

        Ok(peer::spawn(
            completed.remote,
            completed.stream,
            ChannelHandler::new(self.events.clone()),
            &self.connection,
        ))
    }

    pub fn is_stopped(&self) -> bool {
        self.retriever.is_finished()
    }

    /// Stop the retriever; attached connections keep running until closed
    pub fn stop(&self) {
        info!("Stopping retrieval of {}", self.hash);
        self.retriever.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptionMode, NegotiatorConfig, OmnibusConfig};
    use std::time::Duration;

    struct Quiet;

    impl RetrieverCallback for Quiet {}

    fn config() -> EngineConfig {
        EngineConfig {
            negotiator: NegotiatorConfig {
                encryption: EncryptionMode::Disabled,
                ..NegotiatorConfig::default()
            },
            omnibus: OmnibusConfig {
                block_size: 8,
                sweep_interval: Duration::from_millis(7),
                max_outstanding_per_peer: 2,
                ..OmnibusConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_file_components_follow_engine_config() {
        let peer_id = PeerId::new([3; 20]);
        let engine = Engine::with_peer_id(peer_id, config());
        assert_eq!(engine.peer_id(), peer_id);
        assert_eq!(engine.negotiator().peer_id(), peer_id);

        let layout = PieceLayout::new(32, 64).unwrap();
        let file = engine
            .start_file(FileHash::new([1; 20]), layout, vec![[0; 20]; 2], Arc::new(Quiet))
            .unwrap();

        assert_eq!(file.omnibus().sweep_interval(), Duration::from_millis(7));
        assert_eq!(file.verifier().piece_count(), 2);
        {
            let omnibus = file.omnibus().lock().await;
            assert_eq!(omnibus.config(), &engine.config().omnibus);
            assert_eq!(omnibus.piece_count(), 2);
        }

        assert!(!file.is_stopped());
        file.stop();
    }

    #[tokio::test]
    async fn test_start_file_checks_hash_count() {
        let engine = Engine::new(config());
        let layout = PieceLayout::new(32, 64).unwrap();

        let result = engine.start_file(FileHash::new([1; 20]), layout, vec![[0; 20]; 3], Arc::new(Quiet));
        assert!(matches!(result, Err(LeakError::PieceError(_))));
    }

    #[tokio::test]
    async fn test_attach_rejects_connection_of_other_file() {
        let local = Engine::new(config());
        let remote = Engine::new(config());
        let layout = PieceLayout::new(32, 32).unwrap();
        let file = local
            .start_file(FileHash::new([1; 20]), layout, vec![[0; 20]], Arc::new(Quiet))
            .unwrap();

        let other = FileHash::new([2; 20]);
        let (a, b) = tokio::io::duplex(1024);
        let accepting = tokio::spawn(async move { remote.negotiator().accept(b, &[other]).await });
        let connected = local.negotiator().connect(a, other).await.unwrap();
        let _accepted = accepting.await.unwrap().unwrap();

        assert!(matches!(file.attach(connected), Err(LeakError::InfoHashMismatch)));
        file.stop();
    }
}
