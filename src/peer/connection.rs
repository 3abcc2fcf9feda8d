use super::communicator::Communicator;
use super::message::{BlockInfo, PeerMessage};
use crate::bitfield::Bitfield;
use crate::common::PeerId;
use crate::config::LoopConfig;
use crate::error::{LeakError, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const HEADER_LEN: usize = 4;

/// Receives decoded messages of one connection.
///
/// `on_message` dispatches to exactly one typed callback; every callback
/// defaults to a no-op so implementors override only what they consume.
pub trait MessageHandler: Send {
    fn on_connected(&mut self, _peer: PeerId, _communicator: &Communicator) {}

    fn on_message(&mut self, peer: PeerId, message: PeerMessage) {
        match message {
            PeerMessage::KeepAlive => self.on_keep_alive(peer),
            PeerMessage::Choke => self.on_choke(peer),
            PeerMessage::Unchoke => self.on_unchoke(peer),
            PeerMessage::Interested => self.on_interested(peer),
            PeerMessage::NotInterested => self.on_not_interested(peer),
            PeerMessage::Have { piece_index } => self.on_have(peer, piece_index),
            PeerMessage::Bitfield { bitfield } => self.on_bitfield(peer, bitfield),
            PeerMessage::Request { block } => self.on_request(peer, block),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.on_piece(peer, piece_index, offset, data),
            PeerMessage::Cancel { block } => self.on_cancel(peer, block),
            PeerMessage::Extended { id, payload } => self.on_extended(peer, id, payload),
            PeerMessage::Unknown { id, .. } => {
                trace!("Ignoring message {} from {}", id, peer);
            }
        }
    }

    fn on_keep_alive(&mut self, _peer: PeerId) {}
    fn on_choke(&mut self, _peer: PeerId) {}
    fn on_unchoke(&mut self, _peer: PeerId) {}
    fn on_interested(&mut self, _peer: PeerId) {}
    fn on_not_interested(&mut self, _peer: PeerId) {}
    fn on_have(&mut self, _peer: PeerId, _piece_index: u32) {}
    fn on_bitfield(&mut self, _peer: PeerId, _bitfield: Bitfield) {}
    fn on_request(&mut self, _peer: PeerId, _block: BlockInfo) {}
    fn on_piece(&mut self, _peer: PeerId, _piece_index: u32, _offset: u32, _data: Bytes) {}
    fn on_cancel(&mut self, _peer: PeerId, _block: BlockInfo) {}
    fn on_extended(&mut self, _peer: PeerId, _id: u8, _payload: Bytes) {}

    /// Called once when the loop stops, with the error that stopped it
    fn on_disconnected(&mut self, _peer: PeerId, _error: &LeakError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    AwaitingHeader,
    AwaitingBody { length: usize },
}

/// Reads length-prefixed frames off one connection and decodes them in order
pub struct ConnectionLoop<R> {
    peer: PeerId,
    reader: R,
    buffer: BytesMut,
    state: LoopState,
    max_message_size: usize,
}

impl<R: AsyncRead + Unpin> ConnectionLoop<R> {
    pub fn new(peer: PeerId, reader: R, config: &LoopConfig) -> Self {
        Self {
            peer,
            reader,
            buffer: BytesMut::with_capacity(32 * 1024),
            state: LoopState::AwaitingHeader,
            max_message_size: config.max_message_size,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Read the next complete message
    pub async fn next_message(&mut self) -> Result<PeerMessage> {
        loop {
            match self.state {
                LoopState::AwaitingHeader => {
                    self.fill(HEADER_LEN).await?;

                    let length = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]) as usize;
                    if length > self.max_message_size {
                        return Err(LeakError::ProtocolViolation(format!(
                            "Declared message length {} exceeds {}",
                            length, self.max_message_size
                        )));
                    }
                    self.buffer.advance(HEADER_LEN);

                    if length == 0 {
                        return Ok(PeerMessage::KeepAlive);
                    }
                    self.state = LoopState::AwaitingBody { length };
                }
                LoopState::AwaitingBody { length } => {
                    self.fill(length).await?;

                    let body = self.buffer.split_to(length);
                    self.state = LoopState::AwaitingHeader;

                    return PeerMessage::from_body(&body);
                }
            }
        }
    }

    /// Dispatch every message to `handler` until the connection fails
    pub async fn run<H: MessageHandler + ?Sized>(&mut self, handler: &mut H) -> LeakError {
        loop {
            match self.next_message().await {
                Ok(message) => {
                    trace!("Received {} from {}", message.kind(), self.peer);
                    handler.on_message(self.peer, message);
                }
                Err(err) => return err,
            }
        }
    }

    async fn fill(&mut self, needed: usize) -> Result<()> {
        while self.buffer.len() < needed {
            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(LeakError::ConnectionClosed);
            }
        }
        Ok(())
    }
}
