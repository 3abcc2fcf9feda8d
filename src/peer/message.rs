use crate::bitfield::Bitfield;
use crate::error::{LeakError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Information about a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Piece index
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    /// Choke the peer
    Choke,
    /// Unchoke the peer
    Unchoke,
    /// Indicate interest
    Interested,
    /// Indicate lack of interest
    NotInterested,
    /// Indicate possession of a piece
    Have { piece_index: u32 },
    /// Bitfield of available pieces
    Bitfield { bitfield: Bitfield },
    /// Request a block
    Request { block: BlockInfo },
    /// Send a block
    Piece {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a block request
    Cancel { block: BlockInfo },
    /// Extension protocol message
    Extended { id: u8, payload: Bytes },
    /// Message with a type tag this engine does not understand
    Unknown { id: u8, payload: Bytes },
}

impl PeerMessage {
    /// Message type IDs
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const EXTENDED: u8 = 20;

    /// Name of the message kind, as reported to "message received" observers
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Extended { .. } => "extended",
            PeerMessage::Unknown { .. } => "unknown",
        }
    }

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(Self::CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(Self::UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(Self::INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(Self::NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // length = 1 + 4
                buf.put_u8(Self::HAVE);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32((1 + bitfield.as_bytes().len()) as u32);
                buf.put_u8(Self::BITFIELD);
                buf.put_slice(bitfield.as_bytes());
            }
            PeerMessage::Request { block } => {
                buf.put_u32(13); // length = 1 + 4 + 4 + 4
                buf.put_u8(Self::REQUEST);
                put_block(&mut buf, block);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32((9 + data.len()) as u32);
                buf.put_u8(Self::PIECE);
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                buf.put_u32(13);
                buf.put_u8(Self::CANCEL);
                put_block(&mut buf, block);
            }
            PeerMessage::Extended { id, payload } => {
                buf.put_u32((2 + payload.len()) as u32);
                buf.put_u8(Self::EXTENDED);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            PeerMessage::Unknown { id, payload } => {
                buf.put_u32((1 + payload.len()) as u32);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }

    /// Deserialize a complete frame, length prefix included
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        if frame.len() < 4 {
            return Err(LeakError::ProtocolViolation("Message too short".to_string()));
        }

        let mut header = &frame[..4];
        let length = header.get_u32() as usize;
        let body = &frame[4..];

        if body.len() < length {
            return Err(LeakError::ProtocolViolation("Incomplete message".to_string()));
        }

        Self::from_body(&body[..length])
    }

    /// Deserialize a message body, i.e. everything after the length prefix
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = body[0];
        let mut data = &body[1..];

        match message_id {
            Self::CHOKE => Ok(PeerMessage::Choke),
            Self::UNCHOKE => Ok(PeerMessage::Unchoke),
            Self::INTERESTED => Ok(PeerMessage::Interested),
            Self::NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            Self::HAVE => {
                ensure_len(data, 4, "Have")?;
                let piece_index = data.get_u32();
                Ok(PeerMessage::Have { piece_index })
            }
            Self::BITFIELD => Ok(PeerMessage::Bitfield {
                bitfield: Bitfield::from_payload(data),
            }),
            Self::REQUEST => {
                ensure_len(data, 12, "Request")?;
                Ok(PeerMessage::Request {
                    block: get_block(&mut data),
                })
            }
            Self::PIECE => {
                ensure_len(data, 8, "Piece")?;
                let piece_index = data.get_u32();
                let offset = data.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(data),
                })
            }
            Self::CANCEL => {
                ensure_len(data, 12, "Cancel")?;
                Ok(PeerMessage::Cancel {
                    block: get_block(&mut data),
                })
            }
            Self::EXTENDED => {
                ensure_len(data, 1, "Extended")?;
                let id = data.get_u8();
                Ok(PeerMessage::Extended {
                    id,
                    payload: Bytes::copy_from_slice(data),
                })
            }
            id => Ok(PeerMessage::Unknown {
                id,
                payload: Bytes::copy_from_slice(data),
            }),
        }
    }
}

fn ensure_len(data: &[u8], expected: usize, name: &str) -> Result<()> {
    if data.len() < expected {
        return Err(LeakError::ProtocolViolation(format!(
            "Invalid {} message: {} bytes, expected {}",
            name,
            data.len(),
            expected
        )));
    }
    Ok(())
}

fn put_block(buf: &mut BytesMut, block: &BlockInfo) {
    buf.put_u32(block.piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.length);
}

fn get_block(data: &mut &[u8]) -> BlockInfo {
    let piece_index = data.get_u32();
    let offset = data.get_u32();
    let length = data.get_u32();
    BlockInfo::new(piece_index, offset, length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let messages = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have { piece_index: 42 },
            PeerMessage::Bitfield {
                bitfield: Bitfield::from_payload(&[0b1010_0000, 0xFF]),
            },
            PeerMessage::Request {
                block: BlockInfo::new(1, 16384, 16384),
            },
            PeerMessage::Piece {
                piece_index: 3,
                offset: 0,
                data: Bytes::from_static(b"block data"),
            },
            PeerMessage::Cancel {
                block: BlockInfo::new(1, 0, 16384),
            },
            PeerMessage::Extended {
                id: 17,
                payload: Bytes::from_static(&[0, 0]),
            },
        ];

        for message in messages {
            let encoded = message.to_bytes();
            let decoded = PeerMessage::from_bytes(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_keep_alive_is_four_zero_bytes() {
        let encoded = PeerMessage::KeepAlive.to_bytes();
        assert_eq!(&encoded[..], &[0, 0, 0, 0]);
        assert_eq!(PeerMessage::from_bytes(&encoded).unwrap(), PeerMessage::KeepAlive);
    }

    #[test]
    fn test_wire_layout() {
        let encoded = PeerMessage::Have { piece_index: 5 }.to_bytes();
        assert_eq!(&encoded[..], &[0, 0, 0, 5, 4, 0, 0, 0, 5]);

        let encoded = PeerMessage::Extended {
            id: 1,
            payload: Bytes::from_static(b"x"),
        }
        .to_bytes();
        assert_eq!(&encoded[..], &[0, 0, 0, 3, 20, 1, b'x']);
    }

    #[test]
    fn test_twenty_byte_bitfield_covers_160_pieces() {
        let mut frame = vec![0, 0, 0, 21, PeerMessage::BITFIELD];
        frame.extend_from_slice(&[0xFF; 20]);

        match PeerMessage::from_bytes(&frame).unwrap() {
            PeerMessage::Bitfield { bitfield } => {
                assert!(bitfield.len() >= 160);
                assert!(bitfield.has(159));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let frame = [0, 0, 0, 3, 9, 0x1A, 0xE1];
        let decoded = PeerMessage::from_bytes(&frame).unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Unknown {
                id: 9,
                payload: Bytes::from_static(&[0x1A, 0xE1]),
            }
        );
        assert_eq!(decoded.kind(), "unknown");
    }

    #[test]
    fn test_truncated_body_is_a_protocol_violation() {
        let frame = [0, 0, 0, 3, PeerMessage::HAVE, 0, 1];
        assert!(matches!(
            PeerMessage::from_bytes(&frame),
            Err(LeakError::ProtocolViolation(_))
        ));

        let frame = [0, 0, 0, 9, PeerMessage::PIECE];
        assert!(matches!(
            PeerMessage::from_bytes(&frame),
            Err(LeakError::ProtocolViolation(_))
        ));
    }
}
