mod communicator;
mod connection;
mod message;
mod protocol;

pub use communicator::Communicator;
pub use connection::{ConnectionLoop, MessageHandler};
pub use message::{BlockInfo, PeerMessage};
pub use protocol::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};

use crate::common::{ConnectionId, PeerId};
use crate::config::LoopConfig;
use crate::error::{LeakError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Event pushed by a running connection onto the retriever's queue.
///
/// `Connected` and `Disconnected` carry the connection identity so a late
/// disconnect of a replaced connection can be told apart from the live one.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        peer: PeerId,
        connection: ConnectionId,
        communicator: Communicator,
    },
    Message {
        peer: PeerId,
        message: PeerMessage,
    },
    Disconnected {
        peer: PeerId,
        connection: ConnectionId,
    },
}

/// Forwards everything a connection produces onto an event queue
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<PeerEvent>,
    connection: Option<ConnectionId>,
}

impl ChannelHandler {
    pub fn new(sender: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            sender,
            connection: None,
        }
    }
}

impl MessageHandler for ChannelHandler {
    fn on_connected(&mut self, peer: PeerId, communicator: &Communicator) {
        self.connection = Some(communicator.connection());
        let _ = self.sender.send(PeerEvent::Connected {
            peer,
            connection: communicator.connection(),
            communicator: communicator.clone(),
        });
    }

    fn on_message(&mut self, peer: PeerId, message: PeerMessage) {
        let _ = self.sender.send(PeerEvent::Message { peer, message });
    }

    fn on_disconnected(&mut self, peer: PeerId, _error: &LeakError) {
        if let Some(connection) = self.connection.take() {
            let _ = self.sender.send(PeerEvent::Disconnected { peer, connection });
        }
    }
}

/// A running connection: the inbound loop task and the outbound writer task
pub struct PeerConnection {
    peer: PeerId,
    communicator: Communicator,
    closing: Arc<Notify>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
}

impl PeerConnection {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn connection(&self) -> ConnectionId {
        self.communicator.connection()
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Stop the connection locally.
    ///
    /// The inbound loop still reports `on_disconnected` to its handler;
    /// frames not yet written are dropped.
    pub fn close(&self) {
        self.closing.notify_one();
        self.writer.abort();
    }
}

/// Start processing a negotiated stream.
///
/// The handler sees `on_connected` before any message, then every message in
/// arrival order, then exactly one `on_disconnected` when the loop stops.
pub fn spawn<S, H>(peer: PeerId, stream: S, mut handler: H, config: &LoopConfig) -> PeerConnection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: MessageHandler + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (communicator, writer) = Communicator::spawn(peer, writer);
    let mut connection_loop = ConnectionLoop::new(peer, reader, config);

    handler.on_connected(peer, &communicator);
    info!("Started processing peer {} on {}", peer, communicator.connection());

    let closing = Arc::new(Notify::new());
    let close_requested = closing.clone();
    let reader = tokio::spawn(async move {
        let err = tokio::select! {
            err = connection_loop.run(&mut handler) => err,
            _ = close_requested.notified() => {
                debug!("Closing connection to {}", peer);
                LeakError::ConnectionClosed
            }
        };
        match &err {
            LeakError::ConnectionClosed => debug!("Peer {} disconnected", peer),
            err => warn!("Dropping peer {}: {}", peer, err),
        }
        handler.on_disconnected(peer, &err);
    });

    PeerConnection {
        peer,
        communicator,
        closing,
        reader,
        writer,
    }
}
