use crate::common::{FileHash, PeerId};
use crate::error::{LeakError, Result};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Total length of the legacy handshake record
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved bit advertising the extension protocol (byte 5, 0x10)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: FileHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: FileHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;

        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize handshake to bytes
    /// Total: 1 + 19 + 8 + 20 + 20 = 68 bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);

        buf.push(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(self.info_hash.as_bytes());
        buf.extend_from_slice(self.peer_id.as_bytes());

        buf
    }

    /// Deserialize handshake from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(LeakError::HandshakeFailure("Handshake too short".to_string()));
        }

        let pstrlen = data[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(LeakError::HandshakeFailure(
                "Invalid protocol string length".to_string(),
            ));
        }

        if &data[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(LeakError::HandshakeFailure("Invalid protocol string".to_string()));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake {
            reserved,
            info_hash: FileHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialization() {
        let info_hash = FileHash::new([1u8; 20]);
        let peer_id = PeerId::new([2u8; 20]);

        let handshake = Handshake::new(info_hash, peer_id);
        let bytes = handshake.to_bytes();

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING);

        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.supports_extensions());
    }

    #[test]
    fn test_rejects_foreign_protocol() {
        let mut bytes = Handshake::new(FileHash::new([1; 20]), PeerId::new([2; 20])).to_bytes();
        bytes[1] = b'b';
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(LeakError::HandshakeFailure(_))
        ));
        assert!(Handshake::from_bytes(&bytes[..40]).is_err());
    }
}
