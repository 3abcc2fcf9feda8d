use super::message::{BlockInfo, PeerMessage};
use crate::bitfield::Bitfield;
use crate::common::{ConnectionId, PeerId};
use crate::error::{LeakError, Result};
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Outbound side of a connection.
///
/// Every send encodes immediately and queues the frame for a single writer
/// task, so frames hit the wire in call order without the caller waiting on
/// the network.
#[derive(Debug, Clone)]
pub struct Communicator {
    peer: PeerId,
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<Bytes>,
}

impl Communicator {
    /// Start the writer task draining into `writer`
    pub fn spawn<W>(peer: PeerId, writer: W) -> (Self, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_frames(peer, writer, receiver));

        let communicator = Self {
            peer,
            connection: ConnectionId::next(),
            sender,
        };
        (communicator, handle)
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Connection this communicator writes to
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Encode and queue a message
    pub fn send(&self, message: &PeerMessage) -> Result<()> {
        trace!("Sending {} to {}", message.kind(), self.peer);
        self.sender
            .send(message.to_bytes())
            .map_err(|_| LeakError::ConnectionClosed)
    }

    pub fn send_keep_alive(&self) -> Result<()> {
        self.send(&PeerMessage::KeepAlive)
    }

    pub fn send_choke(&self) -> Result<()> {
        self.send(&PeerMessage::Choke)
    }

    pub fn send_unchoke(&self) -> Result<()> {
        self.send(&PeerMessage::Unchoke)
    }

    pub fn send_interested(&self) -> Result<()> {
        self.send(&PeerMessage::Interested)
    }

    pub fn send_not_interested(&self) -> Result<()> {
        self.send(&PeerMessage::NotInterested)
    }

    pub fn send_have(&self, piece_index: u32) -> Result<()> {
        self.send(&PeerMessage::Have { piece_index })
    }

    pub fn send_bitfield(&self, bitfield: &Bitfield) -> Result<()> {
        self.send(&PeerMessage::Bitfield {
            bitfield: bitfield.clone(),
        })
    }

    /// Request several blocks, in the given order
    pub fn send_piece_request(&self, blocks: &[BlockInfo]) -> Result<()> {
        for block in blocks {
            self.send(&PeerMessage::Request { block: *block })?;
        }
        Ok(())
    }

    pub fn send_piece(&self, piece_index: u32, offset: u32, data: Bytes) -> Result<()> {
        self.send(&PeerMessage::Piece {
            piece_index,
            offset,
            data,
        })
    }

    pub fn send_cancel(&self, block: BlockInfo) -> Result<()> {
        self.send(&PeerMessage::Cancel { block })
    }

    pub fn send_extended(&self, id: u8, payload: Bytes) -> Result<()> {
        self.send(&PeerMessage::Extended { id, payload })
    }
}

async fn write_frames<W>(
    peer: PeerId,
    mut writer: W,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = receiver.recv().await {
        writer.write_all(&frame).await?;

        // Coalesce whatever is already queued before flushing
        while let Ok(frame) = receiver.try_recv() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
    }

    debug!("Writer for {} finished", peer);
    writer.shutdown().await?;
    Ok(())
}
