//! Shadowsocks AEAD proxy protocol: server-side handler, client-side
//! connector, and the framing/crypto machinery they share.

pub mod connector;
pub mod decryptor;
pub mod encryptor;
pub mod handler;
pub mod method;
pub mod psk;
pub mod salt_filter;
pub mod subkey;

use crate::common::Result;
use crate::registry::Registry;
use bytes::BytesMut;

pub(crate) fn register(registry: &mut Registry) {
    handler::register(registry);
    connector::register(registry);
}

/// Drain every payload chunk the decryptor already has fully buffered
/// after feeding it `input`, appending each in order to `out`. Plain
/// [`decryptor::Decryptor::decrypt`] stops after one chunk so callers
/// can observe a spec-2022 fixed header between phases; once past the
/// handshake a handler or connector just wants the whole backlog.
pub(crate) fn decrypt_all(
    decryptor: &mut decryptor::Decryptor,
    input: &[u8],
    out: &mut BytesMut,
) -> Result<()> {
    decryptor.decrypt(input, out)?;
    loop {
        let before = out.len();
        decryptor.decrypt(&[], out)?;
        if out.len() == before {
            return Ok(());
        }
    }
}
