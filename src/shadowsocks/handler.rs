//! Server-side Shadowsocks state machine: parses the request handshake
//! (spec-2022 fixed header, address record, padding, initial data) off
//! an accepted stream, dials the target through this handler's own
//! configured downstream connector, and relays in both directions,
//! sealing the spec-2022 response behind the same salt-echo contract
//! the client connector expects.

use crate::common::{Endpoint, Error, Result};
use crate::registry::Registry;
use crate::stream::{BoxDatagram, BoxStream, Connector, Handler};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::decrypt_all;
use super::decryptor::Decryptor;
use super::encryptor::{Encryptor, MAX_CHUNK_LEN, REQUEST_TYPE, RESPONSE_TYPE};
use super::method::Method;
use super::psk::PreSharedKey;
use super::salt_filter::SaltFilter;

/// Spec-2022 request/response timestamps must land within this many
/// seconds of wall clock, guarding against replaying an old handshake.
const TIME_TOLERANCE_SECS: u64 = 30;
const READ_CHUNK: usize = 16 * 1024;
/// Leaves headroom under `MAX_CHUNK_LEN` so the echoed request salt
/// prepended to the first response chunk never pushes it over the
/// per-chunk length limit.
const UPSTREAM_READ_CHUNK: usize = MAX_CHUNK_LEN - 64;

pub(crate) fn register(registry: &mut Registry) {
    registry.register_handler(
        "shadowsocks",
        Arc::new(|extra, registry| {
            let cfg: ShadowsocksHandlerConfig = serde_yaml::from_value(extra.clone())
                .map_err(|e| Error::config(format!("invalid shadowsocks handler config: {}", e)))?;
            let method = Method::from_name(&cfg.method)?;
            let psk = PreSharedKey::derive(method, &cfg.password)?;
            let downstream = registry.connector(cfg.connector.as_deref().unwrap_or(""))?;
            Ok(Arc::new(ShadowsocksHandler {
                method,
                psk,
                salt_filter: Arc::new(SaltFilter::new()),
                downstream,
            }) as Arc<dyn Handler>)
        }),
    );
}

#[derive(Debug, Clone, Deserialize)]
struct ShadowsocksHandlerConfig {
    method: String,
    password: String,
    #[serde(default)]
    connector: Option<String>,
}

pub struct ShadowsocksHandler {
    method: Method,
    psk: PreSharedKey,
    salt_filter: Arc<SaltFilter>,
    downstream: Arc<dyn Connector>,
}

#[async_trait]
impl Handler for ShadowsocksHandler {
    async fn handle_stream(&self, stream: BoxStream, _connector: &dyn Connector) -> Result<()> {
        let (mut client_reader, mut client_writer) = tokio::io::split(stream);
        let is_2022 = self.method.is_2022();
        let mut decryptor = Decryptor::new(
            self.method,
            self.psk.clone(),
            Some(self.salt_filter.clone()),
            is_2022,
        );

        let mut plain = BytesMut::new();
        read_until_nonempty(&mut client_reader, &mut decryptor, &mut plain).await?;

        if is_2022 {
            let header = decryptor
                .take_header()
                .ok_or_else(|| protocol_fail(&mut decryptor, "missing spec-2022 request header"))?;
            if header.header_type != REQUEST_TYPE {
                return Err(protocol_fail(&mut decryptor, "unexpected request_type"));
            }
            if let Err(e) = check_timestamp(header.unix_seconds) {
                decryptor.discard();
                return Err(e);
            }
        }

        let record = plain.split().freeze();
        let (target, consumed) = match Endpoint::decode_from(&record) {
            Ok(v) => v,
            Err(e) => {
                decryptor.discard();
                return Err(e);
            }
        };
        let rest = &record[consumed..];

        let initial_data = if is_2022 {
            if rest.len() < 2 {
                return Err(protocol_fail(&mut decryptor, "truncated padding length"));
            }
            let pad_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let rest = &rest[2..];
            if rest.len() < pad_len {
                return Err(protocol_fail(&mut decryptor, "truncated padding"));
            }
            let initial_data = rest[pad_len..].to_vec();
            if pad_len == 0 && initial_data.is_empty() {
                return Err(protocol_fail(
                    &mut decryptor,
                    "first request must carry padding or initial data",
                ));
            }
            initial_data
        } else {
            rest.to_vec()
        };

        let upstream = self.downstream.connect(&target).await?;
        let (mut up_reader, mut up_writer) = tokio::io::split(upstream);
        if !initial_data.is_empty() {
            up_writer.write_all(&initial_data).await?;
        }

        let mut encryptor = Encryptor::new_with_filter(self.method, &self.psk, Some(&self.salt_filter))?;
        let request_salt = decryptor.salt().to_vec();

        let forward = async {
            let mut buf = [0u8; READ_CHUNK];
            let mut plain = BytesMut::new();
            loop {
                let n = client_reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<(), Error>(());
                }
                decrypt_all(&mut decryptor, &buf[..n], &mut plain)?;
                if !plain.is_empty() {
                    up_writer.write_all(&plain).await?;
                    plain.clear();
                }
            }
        };

        let backward = async {
            let mut buf = vec![0u8; UPSTREAM_READ_CHUNK];
            let mut out = BytesMut::new();
            let mut first = true;
            loop {
                let n = up_reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<(), Error>(());
                }
                if first && is_2022 {
                    let mut payload = Vec::with_capacity(request_salt.len() + n);
                    payload.extend_from_slice(&request_salt);
                    payload.extend_from_slice(&buf[..n]);
                    encryptor.write_fixed_header_2022(RESPONSE_TYPE, payload.len() as u16, &mut out)?;
                    encryptor.write_payload_chunk(&payload, &mut out)?;
                    first = false;
                } else {
                    encryptor.encrypt(&buf[..n], &mut out)?;
                }
                client_writer.write_all(&out).await?;
                out.clear();
            }
        };

        tokio::try_join!(forward, backward)?;
        Ok(())
    }

    async fn handle_datagram(&self, _datagram: BoxDatagram, _connector: &dyn Connector) -> Result<()> {
        Err(Error::unsupported("shadowsocks handler does not support UDP"))
    }
}

/// Keep reading and feeding the decryptor until it yields at least one
/// decoded byte (the address-record chunk), or the peer hangs up.
async fn read_until_nonempty(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    decryptor: &mut Decryptor,
    out: &mut BytesMut,
) -> Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::connection("connection closed before handshake completed"));
        }
        decryptor.decrypt(&buf[..n], out)?;
        if !out.is_empty() {
            return Ok(());
        }
    }
}

fn check_timestamp(unix_seconds: u64) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let diff = now.abs_diff(unix_seconds);
    if diff > TIME_TOLERANCE_SECS {
        return Err(Error::protocol(format!(
            "request timestamp skew {}s exceeds tolerance",
            diff
        )));
    }
    Ok(())
}

fn protocol_fail(decryptor: &mut Decryptor, msg: &str) -> Error {
    decryptor.discard();
    Error::protocol(msg.to_string())
}
