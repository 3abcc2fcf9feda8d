//! Connection handshake: optional key exchange and obfuscation, then the
//! legacy `BitTorrent protocol` handshake.
//!
//! An obfuscated exchange starts with an envelope per side: a 2-byte big-endian
//! length followed by a 96-byte public key and random padding. The initiator
//! then proves knowledge of the shared secret, names the file indirectly, and
//! offers crypto methods under RC4; the responder selects one.

mod cipher;
mod credentials;

pub use cipher::{NegotiatedStream, Rc4, StreamCipher};
pub use credentials::{HandshakeCredentials, KEY_LEN, MAX_PADDING};

use crate::common::{FileHash, PeerId};
use crate::config::{EncryptionMode, NegotiatorConfig};
use crate::error::{LeakError, Result};
use crate::peer::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
use credentials::{hash, xor, SECRET_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

/// Smallest recognizable key-exchange message: the envelope length prefix
pub const ENVELOPE_HEADER_LEN: usize = 2;

const VERIFICATION_CONSTANT: [u8; 8] = [0; 8];
const CRYPTO_PLAINTEXT: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// Total size of a key-exchange envelope, header included
pub fn envelope_size(header: [u8; ENVELOPE_HEADER_LEN]) -> usize {
    ENVELOPE_HEADER_LEN + header[0] as usize * 256 + header[1] as usize
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Outcome of a successful handshake, ready for the connection loop
pub struct HandshakeCompleted<S> {
    pub stream: NegotiatedStream<S>,
    pub remote: PeerId,
    pub hash: FileHash,
    pub direction: Direction,
    pub handshake: Handshake,
}

impl<S> HandshakeCompleted<S> {
    pub fn is_encrypted(&self) -> bool {
        self.stream.is_encrypted()
    }
}

/// Performs handshakes on behalf of the local peer
#[derive(Debug, Clone)]
pub struct Negotiator {
    peer_id: PeerId,
    config: NegotiatorConfig,
}

impl Negotiator {
    pub fn new(peer_id: PeerId, config: NegotiatorConfig) -> Self {
        Self { peer_id, config }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Handshake on a connection we opened for `hash`
    pub async fn connect<S>(&self, stream: S, hash: FileHash) -> Result<HandshakeCompleted<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let completed = timeout(self.config.timeout, self.outbound(stream, hash)).await??;
        info!(
            "Handshake completed with {} for {} (encrypted: {})",
            completed.remote,
            completed.hash,
            completed.is_encrypted()
        );
        Ok(completed)
    }

    /// Handshake on a connection a remote peer opened for any of `served`
    pub async fn accept<S>(&self, stream: S, served: &[FileHash]) -> Result<HandshakeCompleted<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let completed = timeout(self.config.timeout, self.inbound(stream, served)).await??;
        info!(
            "Accepted handshake from {} for {} (encrypted: {})",
            completed.remote,
            completed.hash,
            completed.is_encrypted()
        );
        Ok(completed)
    }

    async fn outbound<S>(&self, stream: S, hash: FileHash) -> Result<HandshakeCompleted<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = match self.config.encryption {
            EncryptionMode::Disabled => NegotiatedStream::plain(stream),
            mode => self.initiate(stream, hash, mode).await?,
        };

        let ours = Handshake::new(hash, self.peer_id);
        stream.write_all(&ours.to_bytes()).await?;
        stream.flush().await?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        let theirs = Handshake::from_bytes(&buf)?;

        if theirs.info_hash != hash {
            return Err(LeakError::InfoHashMismatch);
        }

        Ok(HandshakeCompleted {
            stream,
            remote: theirs.peer_id,
            hash,
            direction: Direction::Outbound,
            handshake: theirs,
        })
    }

    async fn inbound<S>(&self, mut stream: S, served: &[FileHash]) -> Result<HandshakeCompleted<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = stream.read_u8().await?;

        let (mut stream, expected) = if first as usize == PROTOCOL_STRING.len() {
            if self.config.encryption == EncryptionMode::Required {
                return Err(LeakError::HandshakeFailure(
                    "Plaintext handshake not allowed".to_string(),
                ));
            }
            (NegotiatedStream::plain(stream), None)
        } else {
            if self.config.encryption == EncryptionMode::Disabled {
                return Err(LeakError::HandshakeFailure(
                    "Encrypted handshake not allowed".to_string(),
                ));
            }
            let (stream, skey) = self.respond(stream, first, served).await?;
            (stream, Some(skey))
        };

        let mut buf = [0u8; HANDSHAKE_LEN];
        let start = match expected {
            None => {
                buf[0] = first;
                1
            }
            Some(_) => 0,
        };
        stream.read_exact(&mut buf[start..]).await?;
        let theirs = Handshake::from_bytes(&buf)?;

        let hash = match expected {
            Some(skey) if skey != theirs.info_hash => return Err(LeakError::InfoHashMismatch),
            _ if !served.contains(&theirs.info_hash) => return Err(LeakError::InfoHashMismatch),
            _ => theirs.info_hash,
        };

        let ours = Handshake::new(hash, self.peer_id);
        stream.write_all(&ours.to_bytes()).await?;
        stream.flush().await?;

        Ok(HandshakeCompleted {
            stream,
            remote: theirs.peer_id,
            hash,
            direction: Direction::Inbound,
            handshake: theirs,
        })
    }

    /// Initiator side of the key exchange
    async fn initiate<S>(
        &self,
        mut stream: S,
        skey: FileHash,
        mode: EncryptionMode,
    ) -> Result<NegotiatedStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let credentials = HandshakeCredentials::generate(self.config.max_padding);
        write_envelope(&mut stream, &credentials).await?;

        let header = read_header(&mut stream).await?;
        let remote_key = read_envelope(&mut stream, header).await?;
        let secret = credentials.shared_secret(&remote_key)?;

        let req1 = hash(&[b"req1", &secret]);
        let req2 = xor(
            &hash(&[b"req2", skey.as_bytes()]),
            &hash(&[b"req3", &secret]),
        );
        stream.write_all(&req1).await?;
        stream.write_all(&req2).await?;

        let provide = match mode {
            EncryptionMode::Required => CRYPTO_RC4,
            _ => CRYPTO_RC4 | CRYPTO_PLAINTEXT,
        };

        let mut cipher = StreamCipher::initiator(&secret, &skey);
        let mut offer = crypto_block(provide);
        cipher.encrypt(&mut offer);
        stream.write_all(&offer).await?;
        stream.flush().await?;

        let mut answer = [0u8; 12];
        stream.read_exact(&mut answer).await?;
        cipher.decrypt(&mut answer);
        let select = parse_crypto_block(&answer)?;

        debug!("Peer selected crypto method {:#x}", select);
        match select {
            CRYPTO_RC4 => Ok(NegotiatedStream::encrypted(stream, cipher)),
            CRYPTO_PLAINTEXT if provide & CRYPTO_PLAINTEXT != 0 => Ok(NegotiatedStream::plain(stream)),
            other => Err(LeakError::HandshakeFailure(format!(
                "Unexpected crypto select {:#x}",
                other
            ))),
        }
    }

    /// Responder side of the key exchange; `first` is the envelope's first byte
    async fn respond<S>(
        &self,
        mut stream: S,
        first: u8,
        served: &[FileHash],
    ) -> Result<(NegotiatedStream<S>, FileHash)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let header = [first, stream.read_u8().await?];
        let remote_key = read_envelope(&mut stream, header).await?;

        let credentials = HandshakeCredentials::generate(self.config.max_padding);
        write_envelope(&mut stream, &credentials).await?;
        stream.flush().await?;
        let secret = credentials.shared_secret(&remote_key)?;

        let mut proof = [0u8; 40];
        stream.read_exact(&mut proof).await?;
        if proof[..20] != hash(&[b"req1", &secret]) {
            return Err(LeakError::HandshakeFailure("Invalid secret proof".to_string()));
        }

        let skey = identify(&proof[20..], &secret, served).ok_or(LeakError::InfoHashMismatch)?;
        let mut cipher = StreamCipher::responder(&secret, &skey);

        let mut offer = [0u8; 12];
        stream.read_exact(&mut offer).await?;
        cipher.decrypt(&mut offer);
        let provide = parse_crypto_block(&offer)?;

        let select = if provide & CRYPTO_RC4 != 0 {
            CRYPTO_RC4
        } else if provide & CRYPTO_PLAINTEXT != 0 && self.config.encryption != EncryptionMode::Required {
            CRYPTO_PLAINTEXT
        } else {
            return Err(LeakError::HandshakeFailure(format!(
                "No acceptable crypto method in {:#x}",
                provide
            )));
        };

        let mut answer = crypto_block(select);
        cipher.encrypt(&mut answer);
        stream.write_all(&answer).await?;
        stream.flush().await?;

        let stream = match select {
            CRYPTO_RC4 => NegotiatedStream::encrypted(stream, cipher),
            _ => NegotiatedStream::plain(stream),
        };
        Ok((stream, skey))
    }
}

fn identify(obfuscated: &[u8], secret: &[u8; SECRET_LEN], served: &[FileHash]) -> Option<FileHash> {
    let req3 = hash(&[b"req3", secret]);
    served
        .iter()
        .find(|candidate| xor(&hash(&[b"req2", candidate.as_bytes()]), &req3)[..] == *obfuscated)
        .copied()
}

fn crypto_block(method: u32) -> [u8; 12] {
    let mut block = [0u8; 12];
    block[..8].copy_from_slice(&VERIFICATION_CONSTANT);
    block[8..].copy_from_slice(&method.to_be_bytes());
    block
}

fn parse_crypto_block(block: &[u8; 12]) -> Result<u32> {
    if block[..8] != VERIFICATION_CONSTANT {
        return Err(LeakError::HandshakeFailure(
            "Invalid verification constant".to_string(),
        ));
    }
    Ok(u32::from_be_bytes([block[8], block[9], block[10], block[11]]))
}

async fn write_envelope<S>(stream: &mut S, credentials: &HandshakeCredentials) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let length = (KEY_LEN + credentials.padding.len()) as u16;
    let mut envelope = Vec::with_capacity(ENVELOPE_HEADER_LEN + length as usize);
    envelope.extend_from_slice(&length.to_be_bytes());
    envelope.extend_from_slice(&credentials.public_key);
    envelope.extend_from_slice(&credentials.padding);

    stream.write_all(&envelope).await?;
    Ok(())
}

async fn read_header<S>(stream: &mut S) -> Result<[u8; ENVELOPE_HEADER_LEN]>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; ENVELOPE_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    Ok(header)
}

/// Read the rest of an envelope and return the remote public key
async fn read_envelope<S>(stream: &mut S, header: [u8; ENVELOPE_HEADER_LEN]) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let length = envelope_size(header) - ENVELOPE_HEADER_LEN;
    if !(KEY_LEN..=KEY_LEN + MAX_PADDING).contains(&length) {
        return Err(LeakError::ProtocolViolation(format!(
            "Invalid key exchange length {}",
            length
        )));
    }

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    body.truncate(KEY_LEN);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn negotiator(mode: EncryptionMode) -> Negotiator {
        Negotiator::new(
            PeerId::generate(),
            NegotiatorConfig {
                encryption: mode,
                timeout: Duration::from_secs(5),
                max_padding: 32,
            },
        )
    }

    async fn pair(
        outbound: EncryptionMode,
        inbound: EncryptionMode,
        wanted: FileHash,
        served: Vec<FileHash>,
    ) -> (
        Result<HandshakeCompleted<tokio::io::DuplexStream>>,
        Result<HandshakeCompleted<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let connector = negotiator(outbound);
        let listener = negotiator(inbound);

        let accepted = tokio::spawn(async move { listener.accept(b, &served).await });
        let connected = connector.connect(a, wanted).await;
        (connected, accepted.await.unwrap())
    }

    #[test]
    fn test_envelope_size() {
        assert_eq!(envelope_size([0, 0]), 2);
        assert_eq!(envelope_size([1, 2]), 2 + 258);
    }

    #[tokio::test]
    async fn test_plaintext_handshake() {
        let hash = FileHash::random();
        let (connected, accepted) =
            pair(EncryptionMode::Disabled, EncryptionMode::Preferred, hash, vec![hash]).await;

        let connected = connected.unwrap();
        let accepted = accepted.unwrap();
        assert!(!connected.is_encrypted());
        assert!(!accepted.is_encrypted());
        assert_eq!(connected.hash, hash);
        assert_eq!(accepted.hash, hash);
        assert_eq!(accepted.direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn test_encrypted_handshake_identifies_file() {
        let hash = FileHash::random();
        let served = vec![FileHash::random(), hash, FileHash::random()];
        let (connected, accepted) =
            pair(EncryptionMode::Required, EncryptionMode::Preferred, hash, served).await;

        let mut connected = connected.unwrap();
        let mut accepted = accepted.unwrap();
        assert!(connected.is_encrypted());
        assert!(accepted.is_encrypted());
        assert_eq!(accepted.hash, hash);
        assert_eq!(accepted.remote, accepted.handshake.peer_id);
        assert_ne!(accepted.remote, connected.remote);

        connected.stream.write_all(b"hello").await.unwrap();
        connected.stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_unknown_file_is_rejected() {
        let (connected, accepted) = pair(
            EncryptionMode::Preferred,
            EncryptionMode::Preferred,
            FileHash::random(),
            vec![FileHash::random()],
        )
        .await;

        assert!(connected.is_err());
        assert!(matches!(accepted, Err(LeakError::InfoHashMismatch)));
    }

    #[tokio::test]
    async fn test_required_listener_refuses_plaintext() {
        let hash = FileHash::random();
        let (connected, accepted) =
            pair(EncryptionMode::Disabled, EncryptionMode::Required, hash, vec![hash]).await;

        assert!(connected.is_err());
        assert!(matches!(accepted, Err(LeakError::HandshakeFailure(_))));
    }

    #[tokio::test]
    async fn test_malformed_envelope_length() {
        let (mut a, b) = tokio::io::duplex(1024);
        let listener = negotiator(EncryptionMode::Preferred);

        a.write_all(&[0x00, 0x10]).await.unwrap();
        let result = listener.accept(b, &[FileHash::random()]).await;
        assert!(matches!(result, Err(LeakError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (_a, b) = tokio::io::duplex(1024);
        let listener = Negotiator::new(
            PeerId::generate(),
            NegotiatorConfig {
                timeout: Duration::from_millis(20),
                ..NegotiatorConfig::default()
            },
        );

        let result = listener.accept(b, &[FileHash::random()]).await;
        assert!(matches!(result, Err(LeakError::Timeout)));
    }
}
