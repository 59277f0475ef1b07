//! Per-session subkey derivation and the monotonic nonce counter.

use hkdf::Hkdf;
use sha1::Sha1;

use super::method::Method;
use super::psk::PreSharedKey;

const LEGACY_HKDF_INFO: &[u8] = b"ss-subkey";
const BLAKE3_CONTEXT: &str = "shadowsocks 2022 session subkey";

/// Derive the per-connection AEAD key from the PSK and the salt
/// exchanged at the start of the session.
pub fn derive_subkey(method: Method, psk: &PreSharedKey, salt: &[u8]) -> Vec<u8> {
    let key_len = method.key_len();
    if method.is_2022() {
        let mut input = Vec::with_capacity(psk.as_bytes().len() + salt.len());
        input.extend_from_slice(psk.as_bytes());
        input.extend_from_slice(salt);
        let mut out = vec![0u8; key_len];
        let hasher = blake3::Hasher::new_derive_key(BLAKE3_CONTEXT);
        let mut hasher = hasher;
        hasher.update(&input);
        hasher.finalize_xof().fill(&mut out);
        out
    } else {
        let hk = Hkdf::<Sha1>::new(Some(salt), psk.as_bytes());
        let mut out = vec![0u8; key_len];
        hk.expand(LEGACY_HKDF_INFO, &mut out)
            .expect("HKDF output length is always valid for AEAD key sizes");
        out
    }
}

/// A little-endian nonce counter that increments with carry after every
/// AEAD operation, the width matching the cipher's nonce size (96 bits
/// for every method except XChaCha20, which uses 192 bits).
#[derive(Clone)]
pub struct NonceCounter {
    bytes: Vec<u8>,
}

impl NonceCounter {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    pub fn current(&self) -> &[u8] {
        &self.bytes
    }

    /// Increment the counter with carry, little-endian.
    pub fn increment(&mut self) {
        for byte in self.bytes.iter_mut() {
            let (next, carry) = byte.overflowing_add(1);
            *byte = next;
            if !carry {
                return;
            }
        }
    }
}
