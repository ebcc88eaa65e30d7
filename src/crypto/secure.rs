//! Encrypted transport wrap for response and message connections.
//!
//! Both ends write a fresh X25519 public key, derive one ChaCha20-Poly1305
//! key per direction with HKDF-SHA256, then exchange records:
//!
//! ```text
//! <u32 little-endian ciphertext length><ciphertext + 16-byte tag>
//! ```
//!
//! Record nonces are a per-direction counter, so records cannot be
//! reordered, replayed or dropped without the next decryption failing.

use std::io::{self, ErrorKind, Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::wire::MAX_PAYLOAD_LEN;

const LABEL_INITIATOR_KEY: &[u8] = b"ONIONLINK-TRANSPORT-INITIATOR";
const LABEL_RESPONDER_KEY: &[u8] = b"ONIONLINK-TRANSPORT-RESPONDER";

/// Largest plaintext carried in one record.
const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

/// Poly1305 tag size.
const TAG_LEN: usize = 16;

/// An encrypted duplex stream over `S`.
pub struct SecureStream<S> {
    inner: S,
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    send_counter: u64,
    recv_counter: u64,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S: Read + Write> SecureStream<S> {
    /// Wrap the dialing side of a connection.
    pub fn client(inner: S) -> io::Result<Self> {
        Self::handshake(inner, true)
    }

    /// Wrap the accepting side of a connection.
    pub fn server(inner: S) -> io::Result<Self> {
        Self::handshake(inner, false)
    }

    fn handshake(mut inner: S, initiator: bool) -> io::Result<Self> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let ours = PublicKey::from(&secret);
        inner.write_all(ours.as_bytes())?;
        inner.flush()?;

        let mut theirs = [0u8; 32];
        inner.read_exact(&mut theirs)?;
        let theirs = PublicKey::from(theirs);

        let shared = secret.diffie_hellman(&theirs);
        if !shared.was_contributory() {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "peer sent a low-order public key",
            ));
        }

        let (initiator_public, responder_public) = if initiator {
            (ours, theirs)
        } else {
            (theirs, ours)
        };
        let mut info = Vec::with_capacity(64);
        info.extend_from_slice(initiator_public.as_bytes());
        info.extend_from_slice(responder_public.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&info), shared.as_bytes());
        let mut initiator_key = [0u8; 32];
        let mut responder_key = [0u8; 32];
        hk.expand(LABEL_INITIATOR_KEY, &mut initiator_key)
            .and_then(|_| hk.expand(LABEL_RESPONDER_KEY, &mut responder_key))
            .map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))?;

        let ciphers = ChaCha20Poly1305::new_from_slice(&initiator_key).and_then(|i| {
            ChaCha20Poly1305::new_from_slice(&responder_key).map(|r| (i, r))
        });
        initiator_key.zeroize();
        responder_key.zeroize();
        let (initiator_cipher, responder_cipher) =
            ciphers.map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))?;

        let (send_cipher, recv_cipher) = if initiator {
            (initiator_cipher, responder_cipher)
        } else {
            (responder_cipher, initiator_cipher)
        };

        Ok(Self {
            inner,
            send_cipher,
            recv_cipher,
            send_counter: 0,
            recv_counter: 0,
            read_buf: Vec::new(),
            read_pos: 0,
        })
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Reads one record into `read_buf`. Returns false on clean EOF.
    fn fill_record(&mut self) -> io::Result<bool> {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            match self.inner.read(&mut len_bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if !(TAG_LEN..=MAX_PAYLOAD_LEN + TAG_LEN).contains(&len) {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("record length {} out of range", len),
            ));
        }

        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext)?;

        let nonce = counter_nonce(self.recv_counter);
        let plaintext = self
            .recv_cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| io::Error::new(ErrorKind::InvalidData, "record failed authentication"))?;
        self.recv_counter += 1;

        self.read_buf = plaintext;
        self.read_pos = 0;
        Ok(true)
    }
}

impl<S: Read + Write> Read for SecureStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Empty records are legal, so loop until data or EOF.
        while self.read_pos == self.read_buf.len() {
            if !self.fill_record()? {
                return Ok(0);
            }
        }
        let available = &self.read_buf[self.read_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl<S: Read + Write> Write for SecureStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunk = &buf[..buf.len().min(MAX_RECORD_PLAINTEXT)];
        let nonce = counter_nonce(self.send_counter);
        let ciphertext = self
            .send_cipher
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .map_err(|_| io::Error::new(ErrorKind::Other, "record encryption failed"))?;
        self.send_counter += 1;

        let mut record = Vec::with_capacity(4 + ciphertext.len());
        record.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
        record.extend_from_slice(&ciphertext);
        self.inner.write_all(&record)?;
        Ok(chunk.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}
