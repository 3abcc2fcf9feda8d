use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Client prefix used when generating peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-LK0001-";

/// 20-byte identifier of a remote peer, assigned at handshake completion
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Generate a random peer ID
    /// Format: -LK0001-<12 random chars>
    pub fn generate() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(PEER_ID_PREFIX);

        let mut rng = rand::thread_rng();
        for byte in &mut peer_id[8..] {
            *byte = rng.gen_range(b'0'..=b'z');
        }

        Self(peer_id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// SHA-1 info hash identifying the file being exchanged
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash([u8; 20]);

impl FileHash {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHash({})", self)
    }
}

/// Identity of one connection, distinct even when a peer reconnects
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let peer_id = PeerId::generate();
        assert_eq!(&peer_id.as_bytes()[0..8], PEER_ID_PREFIX);
        assert!(peer_id.as_bytes()[8..].iter().all(|b| (b'0'..=b'z').contains(b)));
    }

    #[test]
    fn test_display_is_hex() {
        let hash = FileHash::new([0xab; 20]);
        assert_eq!(hash.to_string(), "ab".repeat(20));
        assert_eq!(format!("{:?}", PeerId::new([1; 20])), format!("PeerId({})", "01".repeat(20)));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        assert_ne!(first, second);
        assert!(second > first);
    }
}
