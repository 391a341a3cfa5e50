//! End-to-end bridge scenarios against a real localhost server.
//!
//! The serial side is an in-memory pipe; the network side is TCP, plain or
//! wrapped in mutual TLS.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use picolink::bridge::{Bridge, Inbound};
use picolink::cipher::{CipherLayer, PresharedKeyCipher};
use picolink::config::{DeviceIdentity, Endpoint};
use picolink::connection::{ConnectionManager, TcpConnector, TlsClient};
use picolink::error::Error;
use picolink::indicator::ActivityIndicator;
use picolink::serial::SerialChannel;
use picolink::types::RetryPolicy;

const CA: &[u8] = include_bytes!("data/ca.crt");
const CLIENT_CERT: &[u8] = include_bytes!("data/client.crt");
const CLIENT_KEY: &[u8] = include_bytes!("data/client.key");
const SERVER_CERT: &[u8] = include_bytes!("data/server.crt");
const SERVER_KEY: &[u8] = include_bytes!("data/server.key");
const ROGUE_CERT: &[u8] = include_bytes!("data/rogue.crt");
const ROGUE_KEY: &[u8] = include_bytes!("data/rogue.key");

const POLL: Duration = Duration::from_millis(5);
const PATIENCE: usize = 400;

#[derive(Debug, Default, Clone)]
struct Tally {
    pulses: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
}

impl ActivityIndicator for Tally {
    fn pulse(&mut self) {
        self.pulses.fetch_add(1, Ordering::SeqCst);
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

type TestBridge = Bridge<DuplexStream, TcpConnector, Tally>;

async fn listen(host: &str) -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Endpoint::new(host, port))
}

async fn start(
    connector: TcpConnector,
    endpoint: Endpoint,
    cipher: CipherLayer,
    tally: Tally,
) -> (TestBridge, DuplexStream) {
    let (port, device) = tokio::io::duplex(4096);
    let manager = ConnectionManager::new(connector, endpoint, CancellationToken::new())
        .with_policy(RetryPolicy::fixed(Duration::from_millis(20)));
    let bridge = Bridge::start(
        SerialChannel::new(port),
        manager,
        cipher,
        DeviceIdentity::new("7"),
        tally,
        CancellationToken::new(),
    )
    .await
    .unwrap()
    .with_poll_interval(POLL);
    (bridge, device)
}

/// Iterate until the inbound side reports `want`.
async fn iterate_until(bridge: &mut TestBridge, want: fn(&Inbound) -> bool) -> Inbound {
    for _ in 0..PATIENCE {
        let it = bridge.iterate().await.unwrap();
        if want(&it.inbound) {
            return it.inbound;
        }
    }
    panic!("bridge never reached the expected inbound outcome");
}

async fn read_n<S: tokio::io::AsyncRead + Unpin>(stream: &mut S, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .unwrap();
    buf
}

#[tokio::test]
async fn plain_session_forwards_both_ways() {
    let (listener, endpoint) = listen("127.0.0.1").await;
    let tally = Tally::default();
    let (mut bridge, mut device) =
        start(TcpConnector::plain(), endpoint, CipherLayer::Plain, tally.clone()).await;
    let (mut server, _) = listener.accept().await.unwrap();

    assert_eq!(read_n(&mut server, 6).await, b"pico_7");
    assert!(tally.connected.load(Ordering::SeqCst));

    device.write_all(b"STATUS=OK\r\n").await.unwrap();
    let it = bridge.iterate().await.unwrap();
    assert_eq!(it.outbound, Some(9));
    assert_eq!(read_n(&mut server, 9).await, b"STATUS=OK");

    server.write_all(b"LED=ON").await.unwrap();
    let inbound = iterate_until(&mut bridge, |i| matches!(i, Inbound::Delivered(_))).await;
    assert_eq!(inbound, Inbound::Delivered(6));
    assert_eq!(read_n(&mut device, 6).await, b"LED=ON");
    assert_eq!(tally.pulses.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sealed_session_hello_and_reply() {
    let (listener, endpoint) = listen("127.0.0.1").await;
    let cipher = PresharedKeyCipher::from_passphrase("correct horse");
    let (mut bridge, mut device) = start(
        TcpConnector::plain(),
        endpoint,
        CipherLayer::PresharedKey(cipher.clone()),
        Tally::default(),
    )
    .await;
    let (mut server, _) = listener.accept().await.unwrap();

    let hello = read_n(&mut server, 32).await;
    let opened = cipher.open(&hello).unwrap();
    assert_eq!(&opened[..], b"pico_7");

    server
        .write_all(&cipher.seal(b"RELAY=1"))
        .await
        .unwrap();
    iterate_until(&mut bridge, |i| matches!(i, Inbound::Delivered(_))).await;
    assert_eq!(read_n(&mut device, 7).await, b"RELAY=1");
}

#[tokio::test]
async fn server_close_triggers_reconnect_and_fresh_hello() {
    let (listener, endpoint) = listen("127.0.0.1").await;
    let tally = Tally::default();
    let (mut bridge, mut device) =
        start(TcpConnector::plain(), endpoint, CipherLayer::Plain, tally.clone()).await;

    let (mut first, _) = listener.accept().await.unwrap();
    assert_eq!(read_n(&mut first, 6).await, b"pico_7");
    drop(first);

    iterate_until(&mut bridge, |i| *i == Inbound::Reconnected).await;
    assert_eq!(bridge.manager().established(), 2);
    assert!(tally.connected.load(Ordering::SeqCst));

    let (mut second, _) = listener.accept().await.unwrap();
    assert_eq!(read_n(&mut second, 6).await, b"pico_7");

    device.write_all(b"BACK\n").await.unwrap();
    bridge.iterate().await.unwrap();
    assert_eq!(read_n(&mut second, 4).await, b"BACK");
}

#[tokio::test]
async fn connect_gives_up_when_capped() {
    // Bind then drop to get a port nobody listens on.
    let (listener, endpoint) = listen("127.0.0.1").await;
    drop(listener);

    let mut manager =
        ConnectionManager::new(TcpConnector::plain(), endpoint, CancellationToken::new())
            .with_policy(RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3));
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, Error::ConnectExhausted { attempts: 3, .. }), "{}", err);
}

fn certs(pem: &[u8]) -> Vec<CertificateDer<'static>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn tls_acceptor(cert: &[u8], key: &[u8]) -> TlsAcceptor {
    let mut roots = RootCertStore::empty();
    for ca in certs(CA) {
        roots.add(ca).unwrap();
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .unwrap();
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs(cert), PrivateKeyDer::from_pem_slice(key).unwrap())
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

fn tls_client() -> TcpConnector {
    TcpConnector::with_tls(TlsClient::from_pem(CLIENT_CERT, CLIENT_KEY, CA).unwrap())
}

#[tokio::test]
async fn mutual_tls_session() {
    let (listener, endpoint) = listen("localhost").await;
    let acceptor = tls_acceptor(SERVER_CERT, SERVER_KEY);

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let hello = read_n(&mut tls, 6).await;
        tls.write_all(b"LED=OFF").await.unwrap();
        tls.flush().await.unwrap();
        (hello, tls)
    });

    let (mut bridge, mut device) =
        start(tls_client(), endpoint, CipherLayer::MutualTls, Tally::default()).await;
    let (hello, _tls) = server.await.unwrap();
    assert_eq!(hello, b"pico_7");

    iterate_until(&mut bridge, |i| matches!(i, Inbound::Delivered(_))).await;
    assert_eq!(read_n(&mut device, 7).await, b"LED=OFF");
}

#[tokio::test]
async fn mutual_tls_rejects_untrusted_server() {
    let (listener, endpoint) = listen("localhost").await;
    let acceptor = tls_acceptor(ROGUE_CERT, ROGUE_KEY);

    tokio::spawn(async move {
        if let Ok((tcp, _)) = listener.accept().await {
            let _ = acceptor.accept(tcp).await;
        }
    });

    let mut manager = ConnectionManager::new(tls_client(), endpoint, CancellationToken::new())
        .with_policy(RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(1));
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, Error::ConnectExhausted { .. }), "{}", err);
}

#[tokio::test]
async fn stalled_tls_handshake_times_out_and_retries() {
    let (listener, endpoint) = listen("localhost").await;

    // Accept TCP and hold the sockets without ever answering the ClientHello.
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });

    let connector = tls_client().with_connect_timeout(Duration::from_millis(200));
    let mut manager = ConnectionManager::new(connector, endpoint, CancellationToken::new())
        .with_policy(RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2));

    let err = tokio::time::timeout(Duration::from_secs(5), manager.connect())
        .await
        .expect("connect hung on a silent TLS peer")
        .unwrap_err();
    assert!(matches!(err, Error::ConnectExhausted { attempts: 2, .. }), "{}", err);
    holder.abort();
}
