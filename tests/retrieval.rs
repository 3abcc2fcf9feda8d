use bytes::Bytes;
use leak::bitfield::Bitfield;
use leak::config::{EncryptionMode, EngineConfig, LoopConfig, NegotiatorConfig, OmnibusConfig, RetrieverConfig};
use leak::omnibus::PieceLayout;
use leak::peer::{self, BlockInfo, Communicator, MessageHandler, PeerConnection};
use leak::retriever::RetrieverCallback;
use leak::{Engine, FileHash, FileTask, Negotiator, PeerId};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const PIECE_LENGTH: usize = 32;
const FILE_LENGTH: usize = 80;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn file_data() -> Bytes {
    (0..FILE_LENGTH).map(|i| (i * 7 % 251) as u8).collect::<Vec<_>>().into()
}

fn piece_hashes(data: &[u8]) -> Vec<[u8; 20]> {
    data.chunks(PIECE_LENGTH)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect()
}

fn negotiator(encryption: EncryptionMode) -> Negotiator {
    Negotiator::new(
        PeerId::generate(),
        NegotiatorConfig {
            encryption,
            timeout: Duration::from_secs(5),
            max_padding: 64,
        },
    )
}

/// Remote peer serving the pieces it owns to whoever asks
struct Seeder {
    data: Bytes,
    owned: Bitfield,
    answers: bool,
    communicator: Option<Communicator>,
}

impl MessageHandler for Seeder {
    fn on_connected(&mut self, _peer: PeerId, communicator: &Communicator) {
        communicator.send_bitfield(&self.owned).unwrap();
        communicator.send_unchoke().unwrap();
        self.communicator = Some(communicator.clone());
    }

    fn on_request(&mut self, _peer: PeerId, block: BlockInfo) {
        if !self.answers || !self.owned.has(block.piece_index as usize) {
            return;
        }
        let start = block.piece_index as usize * PIECE_LENGTH + block.offset as usize;
        let end = start + block.length as usize;
        if let Some(communicator) = &self.communicator {
            let _ = communicator.send_piece(
                block.piece_index,
                block.offset,
                self.data.slice(start..end),
            );
        }
    }
}

#[derive(Default)]
struct Completion {
    done: Mutex<Option<oneshot::Sender<()>>>,
    changes: Mutex<usize>,
}

impl RetrieverCallback for Completion {
    fn on_file_changed(&self, _hash: &FileHash, _bitfield: &Bitfield) {
        *self.changes.lock() += 1;
    }

    fn on_file_completed(&self, _hash: &FileHash) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(());
        }
    }
}

struct Leecher {
    file: FileTask,
    completion: Arc<Completion>,
    done: oneshot::Receiver<()>,
}

fn start_leecher(hash: FileHash, data: &[u8]) -> Leecher {
    let config = EngineConfig {
        omnibus: OmnibusConfig {
            block_size: 16,
            max_outstanding_per_peer: 3,
            ..OmnibusConfig::default()
        },
        retriever: RetrieverConfig {
            tick_interval: Duration::from_millis(50),
            ..RetrieverConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);

    let (done_tx, done) = oneshot::channel();
    let completion = Arc::new(Completion::default());
    *completion.done.lock() = Some(done_tx);

    let layout = PieceLayout::new(PIECE_LENGTH as u64, data.len() as u64).unwrap();
    let file = engine
        .start_file(hash, layout, piece_hashes(data), completion.clone())
        .unwrap();

    Leecher {
        file,
        completion,
        done,
    }
}

/// Handshake a leecher connection with a seeder owning `owned`
async fn attach_seeder(
    leecher: &Leecher,
    data: Bytes,
    owned: Bitfield,
    answers: bool,
    outbound: EncryptionMode,
    inbound: EncryptionMode,
) -> (PeerConnection, PeerConnection, bool) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let hash = leecher.file.hash();

    let listener = negotiator(inbound);
    let accepted = tokio::spawn(async move { listener.accept(remote, &[hash]).await });
    let connected = negotiator(outbound).connect(local, hash).await.unwrap();
    let accepted = accepted.await.unwrap().unwrap();
    let encrypted = connected.is_encrypted();
    assert_eq!(encrypted, accepted.is_encrypted());

    let seeder = Seeder {
        data,
        owned,
        answers,
        communicator: None,
    };
    let seeding = peer::spawn(accepted.remote, accepted.stream, seeder, &LoopConfig::default());
    let leeching = leecher.file.attach(connected).unwrap();
    (seeding, leeching, encrypted)
}

#[tokio::test]
async fn test_file_retrieved_over_encrypted_connection() {
    init_tracing();
    let data = file_data();
    let hash = FileHash::random();
    let mut leecher = start_leecher(hash, &data);

    let (_seeding, _leeching, encrypted) = attach_seeder(
        &leecher,
        data.clone(),
        Bitfield::full(3),
        true,
        EncryptionMode::Required,
        EncryptionMode::Preferred,
    )
    .await;
    assert!(encrypted);

    tokio::time::timeout(Duration::from_secs(5), &mut leecher.done)
        .await
        .expect("file did not complete")
        .unwrap();

    let mut retrieved = Vec::new();
    for index in 0..3 {
        retrieved.extend_from_slice(&leecher.file.verifier().read_piece(index).unwrap());
    }
    assert_eq!(Bytes::from(retrieved), data);
    assert!(leecher.file.omnibus().is_complete().await);
    assert_eq!(*leecher.completion.changes.lock(), 3);

    leecher.file.stop();
}

#[tokio::test]
async fn test_pieces_collected_from_several_peers() {
    init_tracing();
    let data = file_data();
    let hash = FileHash::random();
    let mut leecher = start_leecher(hash, &data);

    let mut first = Bitfield::new(3);
    first.set(0);
    first.set(2);
    let mut second = Bitfield::new(3);
    second.set(1);

    let (_a, _b, plain) = attach_seeder(
        &leecher,
        data.clone(),
        first,
        true,
        EncryptionMode::Disabled,
        EncryptionMode::Preferred,
    )
    .await;
    assert!(!plain);
    let (_c, _d, encrypted) = attach_seeder(
        &leecher,
        data.clone(),
        second,
        true,
        EncryptionMode::Preferred,
        EncryptionMode::Required,
    )
    .await;
    assert!(encrypted);

    tokio::time::timeout(Duration::from_secs(5), &mut leecher.done)
        .await
        .expect("file did not complete")
        .unwrap();

    assert_eq!(leecher.file.verifier().read_piece(1).unwrap(), data.slice(32..64));
    assert_eq!(leecher.file.verifier().read_piece(2).unwrap(), data.slice(64..80));

    leecher.file.stop();
}

#[tokio::test]
async fn test_lost_peer_blocks_move_to_another_peer() {
    init_tracing();
    let data = file_data();
    let hash = FileHash::random();
    let mut leecher = start_leecher(hash, &data);

    // Advertises everything but never answers a request
    let (_silent_seeding, silent_leeching, _) = attach_seeder(
        &leecher,
        data.clone(),
        Bitfield::full(3),
        false,
        EncryptionMode::Disabled,
        EncryptionMode::Disabled,
    )
    .await;
    let silent = silent_leeching.peer();

    tokio::time::timeout(Duration::from_secs(5), async {
        while leecher.file.omnibus().lock().await.outstanding(&silent) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("silent peer never got reservations");

    // Giving up on the peer locally must release what it was asked for
    silent_leeching.close();

    let (_seeding, _leeching, _) = attach_seeder(
        &leecher,
        data.clone(),
        Bitfield::full(3),
        true,
        EncryptionMode::Preferred,
        EncryptionMode::Preferred,
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), &mut leecher.done)
        .await
        .expect("file did not complete")
        .unwrap();
    assert!(leecher.file.omnibus().bitfield().await.is_complete());
    assert_eq!(leecher.file.omnibus().lock().await.outstanding(&silent), 0);
    assert!(leecher.file.collector().score(&silent).is_none());

    leecher.file.stop();
}
