use super::credentials::{hash, SECRET_LEN};
use crate::common::FileHash;
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Keystream bytes dropped after keying
const DISCARD: usize = 1024;

/// RC4 keystream generator
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (index, value) in state.iter_mut().enumerate() {
            *value = index as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Self { state, i: 0, j: 0 }
    }

    /// XOR the keystream into `data`
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);

            let index = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[index as usize];
        }
    }

    fn discard(&mut self, count: usize) {
        let mut sink = vec![0u8; count];
        self.apply(&mut sink);
    }
}

/// Pair of keystreams for one direction each
pub struct StreamCipher {
    encryptor: Rc4,
    decryptor: Rc4,
}

impl StreamCipher {
    pub fn initiator(secret: &[u8; SECRET_LEN], skey: &FileHash) -> Self {
        Self::keyed(
            &hash(&[b"keyA", secret, skey.as_bytes()]),
            &hash(&[b"keyB", secret, skey.as_bytes()]),
        )
    }

    pub fn responder(secret: &[u8; SECRET_LEN], skey: &FileHash) -> Self {
        Self::keyed(
            &hash(&[b"keyB", secret, skey.as_bytes()]),
            &hash(&[b"keyA", secret, skey.as_bytes()]),
        )
    }

    fn keyed(outgoing: &[u8], incoming: &[u8]) -> Self {
        let mut encryptor = Rc4::new(outgoing);
        let mut decryptor = Rc4::new(incoming);
        encryptor.discard(DISCARD);
        decryptor.discard(DISCARD);

        Self {
            encryptor,
            decryptor,
        }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.encryptor.apply(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.decryptor.apply(data);
    }
}

/// Byte stream produced by a successful handshake, plain or RC4-obfuscated
pub struct NegotiatedStream<S> {
    inner: S,
    cipher: Option<StreamCipher>,
    pending: BytesMut,
}

impl<S> NegotiatedStream<S> {
    pub fn plain(inner: S) -> Self {
        Self {
            inner,
            cipher: None,
            pending: BytesMut::new(),
        }
    }

    pub fn encrypted(inner: S, cipher: StreamCipher) -> Self {
        Self {
            inner,
            cipher: Some(cipher),
            pending: BytesMut::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }
}

impl<S: AsyncWrite + Unpin> NegotiatedStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NegotiatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        if let Some(cipher) = this.cipher.as_mut() {
            cipher.decrypt(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NegotiatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.cipher.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        // Ciphertext already produced must go out before new bytes are encrypted
        ready!(this.poll_drain(cx))?;

        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        if let Some(cipher) = this.cipher.as_mut() {
            cipher.encrypt(&mut this.pending[start..]);
        }

        if let Poll::Ready(Err(err)) = this.poll_drain(cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_rc4_known_vector() {
        let mut rc4 = Rc4::new(b"Key");
        let mut data = *b"Plaintext";
        rc4.apply(&mut data);
        assert_eq!(hex::encode(data), "bbf316e8d940af0ad3");
    }

    #[tokio::test]
    async fn test_encrypted_streams_interoperate() {
        let secret = [9u8; SECRET_LEN];
        let skey = FileHash::new([3; 20]);
        let (a, b) = tokio::io::duplex(16);

        let mut initiator = NegotiatedStream::encrypted(a, StreamCipher::initiator(&secret, &skey));
        let mut responder = NegotiatedStream::encrypted(b, StreamCipher::responder(&secret, &skey));

        let payload: Vec<u8> = (0..200u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            initiator.write_all(&payload).await.unwrap();
            initiator.flush().await.unwrap();
            initiator
        });

        let mut received = vec![0u8; expected.len()];
        responder.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let mut initiator = writer.await.unwrap();
        responder.write_all(b"pong").await.unwrap();
        responder.flush().await.unwrap();
        let mut pong = [0u8; 4];
        initiator.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let secret = [1u8; SECRET_LEN];
        let skey = FileHash::new([2; 20]);
        let (a, mut raw) = tokio::io::duplex(64);

        let mut stream = NegotiatedStream::encrypted(a, StreamCipher::initiator(&secret, &skey));
        stream.write_all(&[0u8; 16]).await.unwrap();
        stream.flush().await.unwrap();

        let mut wire = [0u8; 16];
        raw.read_exact(&mut wire).await.unwrap();
        assert_ne!(wire, [0u8; 16]);
    }
}
