//! Ring-buffer AEAD framing decoder, the mirror of [`super::encryptor`].
//!
//! Accumulates arbitrary-sized reads into a compacting buffer and emits
//! plaintext as complete chunks become available. A single AEAD
//! failure — a replayed salt or a bad tag — permanently discards the
//! session; there is no resynchronizing a corrupted AEAD stream.
//!
//! Spec-2022 streams carry one extra fixed-size sealed record right
//! after the salt (request/response type, timestamp, body length);
//! [`Decryptor::take_header`] surfaces it to the caller once decoded,
//! separate from the ordinary chunk payload appended to `decrypt`'s
//! output buffer.

use crate::common::{Error, Result};
use bytes::{Buf, BytesMut};
use std::sync::Arc;

use super::method::{AeadInstance, Method};
use super::psk::PreSharedKey;
use super::salt_filter::SaltFilter;
use super::subkey::{derive_subkey, NonceCounter};

const LENGTH_MASK: u16 = 0x3FFF;
const FIXED_HEADER_PLAIN_LEN: usize = 1 + 8 + 2;

/// The parsed spec-2022 fixed header: `request_type`/`response_type`,
/// the peer's unix timestamp, and the length it claims for the body
/// chunk that follows (redundant with that chunk's own length prefix,
/// kept only so callers can check it against their clock and the
/// expected type).
#[derive(Debug, Clone, Copy)]
pub struct FixedHeader {
    pub header_type: u8,
    pub unix_seconds: u64,
    pub body_len: u16,
}

enum State {
    WaitingSalt,
    WaitingFixedHeader,
    WaitingLength,
    WaitingPayload(usize),
    /// The stream is corrupt or a replay was detected; every further
    /// call fails immediately.
    Discarded,
}

pub struct Decryptor {
    method: Method,
    psk: PreSharedKey,
    salt_filter: Option<Arc<SaltFilter>>,
    is_2022: bool,
    cipher: Option<AeadInstance>,
    nonce: NonceCounter,
    buf: BytesMut,
    state: State,
    salt: Vec<u8>,
    pending_header: Option<FixedHeader>,
}

impl Decryptor {
    pub fn new(
        method: Method,
        psk: PreSharedKey,
        salt_filter: Option<Arc<SaltFilter>>,
        is_2022: bool,
    ) -> Self {
        Self {
            method,
            psk,
            salt_filter,
            is_2022,
            cipher: None,
            nonce: NonceCounter::new(method.nonce_len()),
            buf: BytesMut::new(),
            state: State::WaitingSalt,
            salt: Vec::new(),
            pending_header: None,
        }
    }

    /// The salt consumed at the head of the stream, once past
    /// `WaitingSalt`. Used to echo the request salt back in a
    /// spec-2022 response.
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Take the most recently decoded spec-2022 fixed header, if one
    /// has arrived since the last call.
    pub fn take_header(&mut self) -> Option<FixedHeader> {
        self.pending_header.take()
    }

    /// Feed newly-read ciphertext bytes and decode at most one
    /// complete payload chunk into `out`, returning as soon as one is
    /// available (or immediately if none is yet). Callers drive a
    /// multi-phase handshake (fixed header, then address record, then
    /// forwarded payload) one `decrypt` call at a time so a later
    /// phase's bytes never get silently mixed into an earlier one's
    /// output. A spec-2022 fixed header, when present, is parsed out
    /// of band — fetch it with [`Self::take_header`].
    pub fn decrypt(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        self.buf.extend_from_slice(input);
        loop {
            match self.state {
                State::Discarded => {
                    return Err(Error::crypto("session discarded after AEAD failure"));
                }
                State::WaitingSalt => {
                    let salt_len = self.method.salt_len();
                    if self.buf.len() < salt_len {
                        return Ok(());
                    }
                    let salt = self.buf[..salt_len].to_vec();
                    self.buf.advance(salt_len);
                    if let Some(filter) = &self.salt_filter {
                        if filter.check_and_insert(&salt) {
                            self.state = State::Discarded;
                            return Err(Error::crypto("replayed salt detected"));
                        }
                    }
                    let subkey = derive_subkey(self.method, &self.psk, &salt);
                    self.cipher = Some(self.method.new_cipher(&subkey)?);
                    self.salt = salt;
                    self.state = if self.is_2022 {
                        State::WaitingFixedHeader
                    } else {
                        State::WaitingLength
                    };
                }
                State::WaitingFixedHeader => {
                    let sealed_len = FIXED_HEADER_PLAIN_LEN + self.method.tag_len();
                    if self.buf.len() < sealed_len {
                        return Ok(());
                    }
                    let mut header_buf = self.buf[..sealed_len].to_vec();
                    if self.open_in_place(&mut header_buf).is_err() {
                        self.state = State::Discarded;
                        return Err(Error::crypto("AEAD fixed-header authentication failed"));
                    }
                    self.buf.advance(sealed_len);
                    let unix_seconds = u64::from_be_bytes(header_buf[1..9].try_into().unwrap());
                    let body_len = u16::from_be_bytes([header_buf[9], header_buf[10]]);
                    self.pending_header = Some(FixedHeader {
                        header_type: header_buf[0],
                        unix_seconds,
                        body_len,
                    });
                    self.state = State::WaitingLength;
                }
                State::WaitingLength => {
                    let sealed_len = 2 + self.method.tag_len();
                    if self.buf.len() < sealed_len {
                        return Ok(());
                    }
                    let mut len_buf = self.buf[..sealed_len].to_vec();
                    if self.open_in_place(&mut len_buf).is_err() {
                        self.state = State::Discarded;
                        return Err(Error::crypto("AEAD length-chunk authentication failed"));
                    }
                    self.buf.advance(sealed_len);
                    let len = u16::from_be_bytes([len_buf[0], len_buf[1]]) & LENGTH_MASK;
                    self.state = State::WaitingPayload(len as usize);
                }
                State::WaitingPayload(len) => {
                    let sealed_len = len + self.method.tag_len();
                    if self.buf.len() < sealed_len {
                        return Ok(());
                    }
                    let mut payload = self.buf[..sealed_len].to_vec();
                    if self.open_in_place(&mut payload).is_err() {
                        self.state = State::Discarded;
                        return Err(Error::crypto("AEAD payload authentication failed"));
                    }
                    self.buf.advance(sealed_len);
                    out.extend_from_slice(&payload);
                    self.state = State::WaitingLength;
                    return Ok(());
                }
            }
        }
    }

    /// Permanently disable the decryptor, e.g. after an application-level
    /// validation failure (bad timestamp, malformed address) that the
    /// framing layer itself couldn't detect.
    pub fn discard(&mut self) {
        self.state = State::Discarded;
    }

    fn open_in_place(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        let cipher = self
            .cipher
            .as_ref()
            .expect("cipher is set once salt has been consumed");
        cipher.open(self.nonce.current(), buf)?;
        self.nonce.increment();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowsocks::encryptor::{Encryptor, REQUEST_TYPE};

    #[test]
    fn test_roundtrip_single_chunk() {
        let method = Method::Aes256Gcm;
        let psk = PreSharedKey::derive(method, "pw").unwrap();
        let mut enc = Encryptor::new(method, &psk).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(b"hello shadowsocks", &mut wire).unwrap();

        let mut dec = Decryptor::new(method, PreSharedKey::derive(method, "pw").unwrap(), None, false);
        let mut out = BytesMut::new();
        dec.decrypt(&wire, &mut out).unwrap();
        assert_eq!(&out[..], b"hello shadowsocks");
    }

    #[test]
    fn test_roundtrip_fragmented_reads() {
        let method = Method::Chacha20IetfPoly1305;
        let psk = PreSharedKey::derive(method, "pw").unwrap();
        let mut enc = Encryptor::new(method, &psk).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(b"fragmented payload test", &mut wire).unwrap();

        let mut dec = Decryptor::new(
            method,
            PreSharedKey::derive(method, "pw").unwrap(),
            None,
            false,
        );
        let mut out = BytesMut::new();
        for byte_chunk in wire.chunks(3) {
            dec.decrypt(byte_chunk, &mut out).unwrap();
        }
        assert_eq!(&out[..], b"fragmented payload test");
    }

    #[test]
    fn test_tampered_stream_discards_session() {
        let method = Method::Aes128Gcm;
        let psk = PreSharedKey::derive(method, "pw").unwrap();
        let mut enc = Encryptor::new(method, &psk).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(b"data", &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let mut dec = Decryptor::new(method, PreSharedKey::derive(method, "pw").unwrap(), None, false);
        let mut out = BytesMut::new();
        assert!(dec.decrypt(&wire, &mut out).is_err());
        assert!(dec.decrypt(b"anything", &mut out).is_err());
    }

    #[test]
    fn test_replayed_salt_rejected() {
        let method = Method::Aes256Gcm;
        let psk = PreSharedKey::derive(method, "pw").unwrap();
        let mut enc = Encryptor::new(method, &psk).unwrap();
        let mut wire = BytesMut::new();
        enc.encrypt(b"payload", &mut wire).unwrap();

        let filter = Arc::new(SaltFilter::new());
        let mut dec1 = Decryptor::new(
            method,
            PreSharedKey::derive(method, "pw").unwrap(),
            Some(filter.clone()),
            false,
        );
        let mut out = BytesMut::new();
        dec1.decrypt(&wire, &mut out).unwrap();

        let mut dec2 = Decryptor::new(
            method,
            PreSharedKey::derive(method, "pw").unwrap(),
            Some(filter),
            false,
        );
        let mut out2 = BytesMut::new();
        assert!(dec2.decrypt(&wire, &mut out2).is_err());
    }

    #[test]
    fn test_2022_header_then_body_chunk() {
        use base64::Engine;
        let method = Method::Blake3Aes256Gcm;
        let password = base64::engine::general_purpose::STANDARD.encode([3u8; 32]);
        let psk = PreSharedKey::derive(method, &password).unwrap();
        let mut enc = Encryptor::new(method, &psk).unwrap();
        let mut wire = BytesMut::new();
        enc.write_fixed_header_2022(REQUEST_TYPE, 5, &mut wire).unwrap();
        enc.write_payload_chunk(b"hello", &mut wire).unwrap();

        let mut dec = Decryptor::new(
            method,
            PreSharedKey::derive(method, &password).unwrap(),
            None,
            true,
        );
        let mut out = BytesMut::new();
        dec.decrypt(&wire, &mut out).unwrap();
        let header = dec.take_header().expect("header decoded");
        assert_eq!(header.header_type, REQUEST_TYPE);
        assert_eq!(header.body_len, 5);
        assert_eq!(&out[..], b"hello");
    }
}
