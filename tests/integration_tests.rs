//! End-to-end tests: real listeners bound on loopback, driven with a
//! real TCP client, relaying into a real echo server.

use proxy_engine::common::Endpoint;
use proxy_engine::config::Config;
use proxy_engine::registry::Registry;
use proxy_engine::system::Listener;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if sock.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// Binds a listener on an ephemeral port with the given config text
/// (which must name exactly one `listeners[]` entry) and returns its
/// bound address.
async fn spawn_listener_from_config(yaml: &str) -> SocketAddr {
    let cfg = Config::parse(yaml).unwrap();
    let registry = Registry::new(cfg.clone());
    let handler = registry.handler(&cfg.listeners[0].handler).unwrap();
    let connector = registry
        .connector(cfg.listeners[0].connector.as_deref().unwrap_or(""))
        .unwrap();

    // bind:0 in the config yields an ephemeral port we don't know yet,
    // so bind it ourselves and hand the bound address to the listener.
    let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = tcp.local_addr().unwrap();
    drop(tcp);

    let listener = Listener::new(addr, handler, connector);
    tokio::spawn(listener.run());
    // give the listener a moment to bind before the test dials it
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    addr
}

#[tokio::test]
async fn test_socks5_connect_relays_to_target() {
    let echo_addr = spawn_echo_server().await;
    let proxy_addr = spawn_listener_from_config(
        r#"
listeners:
  - bind: "127.0.0.1:0"
    handler: socks5
"#,
    )
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 1, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00];
    Endpoint::from(echo_addr).encode_into(&mut request).unwrap();
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    client.write_all(b"hello through socks5").await.unwrap();
    let mut buf = vec![0u8; 21];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through socks5");
}

#[tokio::test]
async fn test_socks5_connect_to_unreachable_target_fails_cleanly() {
    let proxy_addr = spawn_listener_from_config(
        r#"
listeners:
  - bind: "127.0.0.1:0"
    handler: socks5
"#,
    )
    .await;

    // Port 1 on loopback is extremely unlikely to accept connections.
    let dead_target: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 1, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00];
    Endpoint::from(dead_target).encode_into(&mut request).unwrap();
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_ne!(reply[1], 0x00);
}

#[tokio::test]
async fn test_shadowsocks_legacy_round_trip_through_listener() {
    use proxy_engine::shadowsocks::decryptor::Decryptor;
    use proxy_engine::shadowsocks::encryptor::Encryptor;
    use proxy_engine::shadowsocks::method::Method;
    use proxy_engine::shadowsocks::psk::PreSharedKey;
    use bytes::BytesMut;

    let echo_addr = spawn_echo_server().await;
    let ss_addr = spawn_listener_from_config(
        r#"
listeners:
  - bind: "127.0.0.1:0"
    handler: ss-in
handlers:
  ss-in:
    type: shadowsocks
    method: "aes-256-gcm"
    password: "integration-test-password"
"#,
    )
    .await;

    let method = Method::Aes256Gcm;
    let psk = PreSharedKey::derive(method, "integration-test-password").unwrap();

    let mut client = TcpStream::connect(ss_addr).await.unwrap();
    let mut encryptor = Encryptor::new(method, &psk).unwrap();
    let mut wire = BytesMut::new();
    let mut record = Vec::new();
    Endpoint::from(echo_addr).encode_into(&mut record).unwrap();
    record.extend_from_slice(b"ping-over-ss");
    encryptor.encrypt(&record, &mut wire).unwrap();
    client.write_all(&wire).await.unwrap();

    let mut decryptor = Decryptor::new(method, psk, None, false);
    let mut out = BytesMut::new();
    let mut buf = [0u8; 1024];
    while out.len() < b"ping-over-ss".len() {
        let n = client.read(&mut buf).await.unwrap();
        decryptor.decrypt(&buf[..n], &mut out).unwrap();
        loop {
            let before = out.len();
            decryptor.decrypt(&[], &mut out).unwrap();
            if out.len() == before {
                break;
            }
        }
    }
    assert_eq!(&out[..], b"ping-over-ss");
}

#[tokio::test]
async fn test_shadowsocks_connector_and_handler_interop() {
    let echo_addr = spawn_echo_server().await;
    let ss_addr = spawn_listener_from_config(
        r#"
listeners:
  - bind: "127.0.0.1:0"
    handler: ss-in
handlers:
  ss-in:
    type: shadowsocks
    method: "2022-blake3-aes-256-gcm"
    password: "k9pUf1b8n0r4s/VQDtbz2Sj1fLApjwx1/D3y5/VNCe0="
"#,
    )
    .await;

    let cfg = Config::parse(&format!(
        r#"
listeners:
  - bind: "127.0.0.1:0"
    handler: echo
connectors:
  ss-out:
    type: shadowsocks
    method: "2022-blake3-aes-256-gcm"
    password: "k9pUf1b8n0r4s/VQDtbz2Sj1fLApjwx1/D3y5/VNCe0="
    servers: ["{}"]
"#,
        ss_addr
    ))
    .unwrap();
    let registry = Registry::new(cfg);
    let connector = registry.connector("ss-out").unwrap();

    let mut stream = connector.connect(&Endpoint::from(echo_addr)).await.unwrap();
    stream.write_all(b"round trip via ss 2022").await.unwrap();
    let mut buf = vec![0u8; "round trip via ss 2022".len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"round trip via ss 2022");
}
