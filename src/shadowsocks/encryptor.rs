//! Append-only AEAD framing encoder: turns a stream of plaintext
//! writes into the Shadowsocks wire format (salt, then a sequence of
//! length-prefixed, individually-sealed chunks).
//!
//! Spec-2022 streams additionally open with one fixed-size sealed
//! record (request/response type + timestamp + body length) ahead of
//! the ordinary chunk stream; [`Encryptor::write_fixed_header_2022`]
//! seals that record using the same running cipher and nonce counter
//! as every other chunk on this connection.

use crate::common::Result;
use bytes::BytesMut;
use rand::RngCore;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::method::Method;
use super::psk::PreSharedKey;
use super::salt_filter::SaltFilter;
use super::subkey::{derive_subkey, NonceCounter};

/// Maximum plaintext payload per chunk: the length field is a 14-bit
/// value (top two bits reserved/masked off), so payloads are capped at
/// `0x3FFF` bytes and anything larger is split across chunks.
pub const MAX_CHUNK_LEN: usize = 0x3FFF;
const LENGTH_MASK: u16 = 0x3FFF;
/// `request_type`/`response_type` + unix seconds + body length.
const FIXED_HEADER_LEN: usize = 1 + 8 + 2;

pub const REQUEST_TYPE: u8 = 0;
pub const RESPONSE_TYPE: u8 = 1;

pub struct Encryptor {
    cipher: super::method::AeadInstance,
    nonce: NonceCounter,
    salt: Vec<u8>,
    header_written: bool,
}

impl Encryptor {
    pub fn new(method: Method, psk: &PreSharedKey) -> Result<Self> {
        Self::new_with_filter(method, psk, None)
    }

    /// Construct with a [`SaltFilter`] the fresh salt is unconditionally
    /// recorded into, so an attacker can never later replay this
    /// session's own outbound salt back at us.
    pub fn new_with_filter(
        method: Method,
        psk: &PreSharedKey,
        salt_filter: Option<&Arc<SaltFilter>>,
    ) -> Result<Self> {
        let mut salt = vec![0u8; method.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        if let Some(filter) = salt_filter {
            filter.insert(&salt);
        }
        let subkey = derive_subkey(method, psk, &salt);
        let cipher = method.new_cipher(&subkey)?;
        Ok(Self {
            cipher,
            nonce: NonceCounter::new(method.nonce_len()),
            salt,
            header_written: false,
        })
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    fn ensure_salt_written(&mut self, out: &mut BytesMut) {
        if !self.header_written {
            out.extend_from_slice(&self.salt);
            self.header_written = true;
        }
    }

    /// Encrypt `plaintext`, appending the wire-format bytes to `out`.
    /// Large payloads are split across multiple length-prefixed chunks.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<()> {
        self.ensure_salt_written(out);
        for chunk in plaintext.chunks(MAX_CHUNK_LEN) {
            self.write_payload_chunk(chunk, out)?;
        }
        Ok(())
    }

    /// Seal one `length || payload` chunk. Equivalent to
    /// `start_chunk; push_buffer(payload); finish_chunk` in the
    /// reference implementation's call sequence.
    pub fn write_payload_chunk(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<()> {
        debug_assert!(chunk.len() <= MAX_CHUNK_LEN);
        let len = (chunk.len() as u16) & LENGTH_MASK;
        let mut len_buf = len.to_be_bytes().to_vec();
        self.cipher.seal(self.nonce.current(), &mut len_buf)?;
        self.nonce.increment();
        out.extend_from_slice(&len_buf);

        let mut payload = chunk.to_vec();
        self.cipher.seal(self.nonce.current(), &mut payload)?;
        self.nonce.increment();
        out.extend_from_slice(&payload);
        Ok(())
    }

    /// Seal the spec-2022 fixed header: one AEAD record carrying
    /// `request_type`/`response_type`, the current unix timestamp, and
    /// the length of the body chunk that follows. Writes the salt
    /// first if this is the first thing sealed on the connection.
    pub fn write_fixed_header_2022(
        &mut self,
        header_type: u8,
        body_len: u16,
        out: &mut BytesMut,
    ) -> Result<()> {
        self.ensure_salt_written(out);
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN);
        buf.push(header_type);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        buf.extend_from_slice(&now.to_be_bytes());
        buf.extend_from_slice(&body_len.to_be_bytes());
        self.cipher.seal(self.nonce.current(), &mut buf)?;
        self.nonce.increment();
        out.extend_from_slice(&buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_header_written_once() {
        let psk = PreSharedKey::derive(Method::Aes256Gcm, "pw").unwrap();
        let mut enc = Encryptor::new(Method::Aes256Gcm, &psk).unwrap();
        let mut out = BytesMut::new();
        enc.encrypt(b"first", &mut out).unwrap();
        let after_first = out.len();
        enc.encrypt(b"second", &mut out).unwrap();
        assert!(out.len() > after_first);
        assert_eq!(&out[..32], enc.salt());
    }

    #[test]
    fn test_large_payload_splits_into_chunks() {
        let psk = PreSharedKey::derive(Method::Aes128Gcm, "pw").unwrap();
        let mut enc = Encryptor::new(Method::Aes128Gcm, &psk).unwrap();
        let mut out = BytesMut::new();
        let data = vec![0x41u8; MAX_CHUNK_LEN + 100];
        enc.encrypt(&data, &mut out).unwrap();
        let salt_len = Method::Aes128Gcm.salt_len();
        let expected = salt_len
            + (2 + 16 + MAX_CHUNK_LEN + 16)
            + (2 + 16 + 100 + 16);
        assert_eq!(out.len(), expected);
    }

    #[test]
    fn test_fixed_header_written_before_body() {
        use base64::Engine;
        let password = base64::engine::general_purpose::STANDARD.encode([4u8; 32]);
        let psk = PreSharedKey::derive(Method::Blake3Aes256Gcm, &password).unwrap();
        let mut enc = Encryptor::new(Method::Blake3Aes256Gcm, &psk).unwrap();
        let mut out = BytesMut::new();
        enc.write_fixed_header_2022(REQUEST_TYPE, 5, &mut out).unwrap();
        let after_header = out.len();
        assert_eq!(after_header, 32 + FIXED_HEADER_LEN + 16);
        enc.write_payload_chunk(b"hello", &mut out).unwrap();
        assert!(out.len() > after_header);
    }

    #[test]
    fn test_filter_records_outbound_salt() {
        let psk = PreSharedKey::derive(Method::Aes256Gcm, "pw").unwrap();
        let filter = Arc::new(SaltFilter::new());
        let enc = Encryptor::new_with_filter(Method::Aes256Gcm, &psk, Some(&filter)).unwrap();
        assert!(filter.check_and_insert(enc.salt()));
    }
}
