//! Cipher method table: the ten AEAD methods this engine speaks, split
//! into the original pre-2022 AEAD construction and the 2022 edition
//! (BLAKE3 key derivation, otherwise the same AEAD primitives).

use crate::common::{Error, Result};
use aead::generic_array::GenericArray;
use aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes192Gcm, Aes256Gcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};

pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    Chacha20IetfPoly1305,
    XChacha20IetfPoly1305,
    Blake3Aes128Gcm,
    Blake3Aes192Gcm,
    Blake3Aes256Gcm,
    Blake3Chacha20Poly1305,
    Blake3XChacha20Poly1305,
}

impl Method {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "aes-128-gcm" => Method::Aes128Gcm,
            "aes-192-gcm" => Method::Aes192Gcm,
            "aes-256-gcm" => Method::Aes256Gcm,
            "chacha20-ietf-poly1305" => Method::Chacha20IetfPoly1305,
            "xchacha20-ietf-poly1305" => Method::XChacha20IetfPoly1305,
            "2022-blake3-aes-128-gcm" => Method::Blake3Aes128Gcm,
            "2022-blake3-aes-192-gcm" => Method::Blake3Aes192Gcm,
            "2022-blake3-aes-256-gcm" => Method::Blake3Aes256Gcm,
            "2022-blake3-chacha20-poly1305" => Method::Blake3Chacha20Poly1305,
            "2022-blake3-xchacha20-poly1305" => Method::Blake3XChacha20Poly1305,
            other => return Err(Error::config(format!("unknown cipher method '{}'", other))),
        })
    }

    pub fn is_2022(self) -> bool {
        matches!(
            self,
            Method::Blake3Aes128Gcm
                | Method::Blake3Aes192Gcm
                | Method::Blake3Aes256Gcm
                | Method::Blake3Chacha20Poly1305
                | Method::Blake3XChacha20Poly1305
        )
    }

    /// Key (and PSK/salt) length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Method::Aes128Gcm | Method::Blake3Aes128Gcm => 16,
            Method::Aes192Gcm | Method::Blake3Aes192Gcm => 24,
            Method::Aes256Gcm
            | Method::Blake3Aes256Gcm
            | Method::Chacha20IetfPoly1305
            | Method::Blake3Chacha20Poly1305
            | Method::XChacha20IetfPoly1305
            | Method::Blake3XChacha20Poly1305 => 32,
        }
    }

    /// Salt length used in the header: equal to the key length for
    /// every method in this table.
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    pub fn nonce_len(self) -> usize {
        match self {
            Method::XChacha20IetfPoly1305 | Method::Blake3XChacha20Poly1305 => 24,
            _ => 12,
        }
    }

    pub fn tag_len(self) -> usize {
        TAG_LEN
    }

    pub fn new_cipher(self, key: &[u8]) -> Result<AeadInstance> {
        if key.len() != self.key_len() {
            return Err(Error::crypto(format!(
                "bad key length for {:?}: expected {} got {}",
                self,
                self.key_len(),
                key.len()
            )));
        }
        Ok(match self {
            Method::Aes128Gcm | Method::Blake3Aes128Gcm => {
                AeadInstance::Aes128Gcm(Aes128Gcm::new_from_slice(key).map_err(cipher_err)?)
            }
            Method::Aes192Gcm | Method::Blake3Aes192Gcm => {
                AeadInstance::Aes192Gcm(Aes192Gcm::new_from_slice(key).map_err(cipher_err)?)
            }
            Method::Aes256Gcm | Method::Blake3Aes256Gcm => {
                AeadInstance::Aes256Gcm(Aes256Gcm::new_from_slice(key).map_err(cipher_err)?)
            }
            Method::Chacha20IetfPoly1305 | Method::Blake3Chacha20Poly1305 => {
                AeadInstance::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key).map_err(cipher_err)?)
            }
            Method::XChacha20IetfPoly1305 | Method::Blake3XChacha20Poly1305 => {
                AeadInstance::XChaCha20Poly1305(XChaCha20Poly1305::new_from_slice(key).map_err(cipher_err)?)
            }
        })
    }
}

fn cipher_err(_: aead::Error) -> Error {
    Error::crypto("cipher initialization failed")
}

/// A constructed AEAD cipher, keyed for one session. Dispatch is a
/// plain match rather than a trait object because each variant's
/// nonce size differs at the type level.
pub enum AeadInstance {
    Aes128Gcm(Aes128Gcm),
    Aes192Gcm(Aes192Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

impl AeadInstance {
    /// Seal `buf` in place, appending the authentication tag.
    pub fn seal(&self, nonce: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        let res = match self {
            AeadInstance::Aes128Gcm(c) => {
                c.encrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::Aes192Gcm(c) => {
                c.encrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::Aes256Gcm(c) => {
                c.encrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::ChaCha20Poly1305(c) => {
                c.encrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::XChaCha20Poly1305(c) => {
                c.encrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
        };
        res.map_err(|_| Error::crypto("AEAD seal failed"))
    }

    /// Open `buf` in place; on success the tag is stripped and `buf`
    /// holds only the plaintext. On failure `buf` is left unspecified
    /// and the caller must treat the session as permanently broken.
    pub fn open(&self, nonce: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        let res = match self {
            AeadInstance::Aes128Gcm(c) => {
                c.decrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::Aes192Gcm(c) => {
                c.decrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::Aes256Gcm(c) => {
                c.decrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::ChaCha20Poly1305(c) => {
                c.decrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
            AeadInstance::XChaCha20Poly1305(c) => {
                c.decrypt_in_place(GenericArray::from_slice(nonce), b"", buf)
            }
        };
        res.map_err(|_| Error::crypto("AEAD open failed (auth tag mismatch)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_legacy() {
        assert_eq!(Method::from_name("aes-256-gcm").unwrap(), Method::Aes256Gcm);
        assert!(!Method::Aes256Gcm.is_2022());
    }

    #[test]
    fn test_from_name_2022() {
        let m = Method::from_name("2022-blake3-aes-256-gcm").unwrap();
        assert_eq!(m, Method::Blake3Aes256Gcm);
        assert!(m.is_2022());
    }

    #[test]
    fn test_unknown_method() {
        assert!(Method::from_name("rot13").is_err());
    }

    #[test]
    fn test_key_lens() {
        assert_eq!(Method::Aes128Gcm.key_len(), 16);
        assert_eq!(Method::XChacha20IetfPoly1305.nonce_len(), 24);
        assert_eq!(Method::Chacha20IetfPoly1305.nonce_len(), 12);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0x42u8; 32];
        let cipher = Method::Aes256Gcm.new_cipher(&key).unwrap();
        let nonce = [0u8; 12];
        let mut buf = b"hello world".to_vec();
        cipher.seal(&nonce, &mut buf).unwrap();
        assert_eq!(buf.len(), "hello world".len() + TAG_LEN);
        cipher.open(&nonce, &mut buf).unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn test_open_rejects_tampered() {
        let key = [0x11u8; 32];
        let cipher = Method::Chacha20IetfPoly1305.new_cipher(&key).unwrap();
        let nonce = [0u8; 12];
        let mut buf = b"payload".to_vec();
        cipher.seal(&nonce, &mut buf).unwrap();
        buf[0] ^= 0xff;
        assert!(cipher.open(&nonce, &mut buf).is_err());
    }
}
