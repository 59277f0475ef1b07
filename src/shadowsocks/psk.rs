//! Pre-shared key derivation.
//!
//! Legacy methods take an arbitrary password string and stretch it into
//! a key via the old OpenSSL `EVP_BytesToKey` scheme (iterated MD5).
//! 2022 methods take the key directly, base64-encoded at the exact
//! length the cipher needs.

use crate::common::{Error, Result};
use base64::Engine;
use md5::{Digest, Md5};

use super::method::Method;

#[derive(Clone)]
pub struct PreSharedKey(Vec<u8>);

impl PreSharedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Derive a PSK from a config-supplied password, per the method's
    /// 2022-ness: base64 for 2022 methods, iterated-MD5 stretching for
    /// legacy ones.
    pub fn derive(method: Method, password: &str) -> Result<Self> {
        if method.is_2022() {
            Self::from_base64(method, password)
        } else {
            Ok(Self::from_password(method, password))
        }
    }

    fn from_base64(method: Method, encoded: &str) -> Result<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::config(format!("invalid base64 PSK: {}", e)))?;
        if key.len() != method.key_len() {
            return Err(Error::config(format!(
                "PSK length {} does not match {:?} key length {}",
                key.len(),
                method,
                method.key_len()
            )));
        }
        Ok(Self(key))
    }

    /// `EVP_BytesToKey` with MD5: repeatedly hash `prev || password`
    /// until enough key material has been produced.
    fn from_password(method: Method, password: &str) -> Self {
        let key_len = method.key_len();
        let mut key = Vec::with_capacity(key_len + Md5::output_size());
        let mut prev: Vec<u8> = Vec::new();
        while key.len() < key_len {
            let mut hasher = Md5::new();
            hasher.update(&prev);
            hasher.update(password.as_bytes());
            let digest = hasher.finalize();
            key.extend_from_slice(&digest);
            prev = digest.to_vec();
        }
        key.truncate(key_len);
        Self(key)
    }
}
