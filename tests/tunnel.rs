//! End-to-end tunnel scenarios over loopback UDP.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use gametunnel::crypto::{
    derive_direction_keys, HandshakePayload, KeyPair, Role, SessionCrypto,
};
use gametunnel::obfs::{new_obfuscator, Obfuscator};
use gametunnel::packet::{self, Packet, PacketKind};
use gametunnel::{dial, listen, Config, Error, SessionConn};

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Start a listener that forwards every new session view into a channel.
async fn listener_with_conns(
    config: Config,
) -> (gametunnel::Listener, mpsc::UnboundedReceiver<SessionConn>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = listen(loopback(), config, move |conn| {
        let _ = tx.send(conn);
    })
    .await
    .unwrap();
    (listener, rx)
}

/// Drive the handshake by hand from a raw socket, returning the session's
/// CID and the client-role record crypto.
async fn manual_handshake(
    socket: &UdpSocket,
    server: SocketAddr,
    config: &Config,
    obfs: &dyn Obfuscator,
    cid: Bytes,
    psk: &str,
) -> SessionCrypto {
    let keypair = KeyPair::generate();
    let hello = HandshakePayload::new(keypair.public_bytes(), 1_700_000_000);
    let pkt = Packet::handshake(cid.clone(), 0, hello.encode());
    let wire = obfs.wrap(&pkt.encode(config).unwrap()).unwrap();
    socket.send_to(&wire, server).await.unwrap();

    let mut buf = vec![0u8; 64 * 1024];
    let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let unwrapped = obfs.unwrap(&buf[..n]).unwrap();
    let reply = Packet::decode(&unwrapped, config.cid_len()).unwrap();
    assert_eq!(reply.kind, PacketKind::Handshake);
    assert_eq!(reply.connection_id, cid);
    assert_eq!(reply.packet_number, 1);

    let server_hello = HandshakePayload::decode(&reply.payload).unwrap();
    assert_ne!(server_hello.public_key, [0u8; 32]);
    assert_ne!(server_hello.public_key, keypair.public_bytes());

    let shared = keypair.shared_secret(&server_hello.public_key).unwrap();
    let keys = derive_direction_keys(&shared, psk).unwrap();
    SessionCrypto::new(&keys, Role::Client)
}

/// Build one encrypted, wrapped data datagram.
fn seal_data(
    config: &Config,
    obfs: &dyn Obfuscator,
    cid: &Bytes,
    crypto: &SessionCrypto,
    pn: u32,
    payload: &[u8],
) -> Vec<u8> {
    let aad = packet::encode_aad(PacketKind::Data, config.enable_padding, cid);
    let ciphertext = crypto.seal(payload, pn, &aad).unwrap();
    let pkt = Packet::data(cid.clone(), pn, Bytes::from(ciphertext), config.enable_padding);
    obfs.wrap(&pkt.encode(config).unwrap()).unwrap()
}

/// Unwrap and decrypt one server-to-client data datagram.
fn open_data(config: &Config, obfs: &dyn Obfuscator, crypto: &SessionCrypto, wire: &[u8]) -> Vec<u8> {
    let unwrapped = obfs.unwrap(wire).unwrap();
    let pkt = Packet::decode(&unwrapped, config.cid_len()).unwrap();
    assert_eq!(pkt.kind, PacketKind::Data);
    let aad = &unwrapped[..packet::aad_len(config.cid_len())];
    crypto.open(&pkt.payload, pkt.packet_number, aad).unwrap()
}

#[tokio::test]
async fn handshake_then_echo_both_ways() {
    let config = Config {
        psk: "s3cret".into(),
        ..Config::default()
    };
    let (listener, mut conns) = listener_with_conns(config.clone()).await;
    let client = dial(listener.local_addr(), config).await.unwrap();

    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    let msg = b"player_move:x=150.5 y=200.3 z=0 tick=42";
    assert_eq!(client.write(msg).await.unwrap(), msg.len());

    let mut buf = [0u8; 256];
    let n = timeout(WAIT, server_conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], msg);

    server_conn.write(b"state:ok tick=42").await.unwrap();
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"state:ok tick=42");

    let stats = listener.hub_stats();
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.auth_failures, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn large_write_is_chunked_and_reassembled() {
    let config = Config::default();
    let (listener, mut conns) = listener_with_conns(config.clone()).await;
    let client = dial(listener.local_addr(), config.clone()).await.unwrap();
    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    assert!(payload.len() > config.max_payload());
    assert_eq!(client.write(&payload).await.unwrap(), payload.len());

    let mut received = Vec::new();
    let mut buf = [0u8; 2048];
    while received.len() < payload.len() {
        let n = timeout(WAIT, server_conn.read(&mut buf)).await.unwrap().unwrap();
        assert!(n > 0, "stream ended early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);
}

#[tokio::test]
async fn fixed_cid_is_mirrored_by_the_server() {
    let config = Config::default();
    let (listener, mut conns) = listener_with_conns(config.clone()).await;
    let obfs = new_obfuscator(config.obfuscation);

    let socket = UdpSocket::bind(loopback()).await.unwrap();
    let cid = Bytes::from_static(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
    let crypto = manual_handshake(
        &socket,
        listener.local_addr(),
        &config,
        obfs.as_ref(),
        cid.clone(),
        "",
    )
    .await;

    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert_eq!(server_conn.stats().connection_id, "0001020304050607");

    // First client data packet is number 1
    let wire = seal_data(&config, obfs.as_ref(), &cid, &crypto, 1, b"ping");
    socket
        .send_to(&wire, listener.local_addr())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(WAIT, server_conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[tokio::test]
async fn migration_follows_the_client_to_a_new_address() {
    let config = Config::default();
    let (listener, mut conns) = listener_with_conns(config.clone()).await;
    let server = listener.local_addr();
    let obfs = new_obfuscator(config.obfuscation);

    let first = UdpSocket::bind(loopback()).await.unwrap();
    let cid = packet::generate_connection_id(config.cid_len()).unwrap();
    let crypto =
        manual_handshake(&first, server, &config, obfs.as_ref(), cid.clone(), "").await;
    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert_eq!(server_conn.remote_addr(), first.local_addr().unwrap());

    // The same session continues from a rebound socket
    let second = UdpSocket::bind(loopback()).await.unwrap();
    let wire = seal_data(&config, obfs.as_ref(), &cid, &crypto, 1, b"after-rebind");
    second.send_to(&wire, server).await.unwrap();

    let mut buf = [0u8; 128];
    let n = timeout(WAIT, server_conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"after-rebind");
    assert_eq!(server_conn.remote_addr(), second.local_addr().unwrap());
    assert_eq!(listener.hub_stats().active_sessions, 1);

    // Server writes now reach the new endpoint
    server_conn.write(b"welcome back").await.unwrap();
    let mut wire_buf = vec![0u8; 64 * 1024];
    let (n, from) = timeout(WAIT, second.recv_from(&mut wire_buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, server);
    let plaintext = open_data(&config, obfs.as_ref(), &crypto, &wire_buf[..n]);
    assert_eq!(plaintext, b"welcome back");
}

#[tokio::test]
async fn keepalive_probes_flow_when_idle() {
    // Hand-rolled server so the wire is observable
    let server_socket = UdpSocket::bind(loopback()).await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();

    let config = Config {
        keepalive_interval_s: 1,
        ..Config::default()
    };

    let (kind_tx, mut kind_rx) = mpsc::unbounded_channel();
    let server_config = config.clone();
    tokio::spawn(async move {
        let obfs = new_obfuscator(server_config.obfuscation);
        let mut buf = vec![0u8; 64 * 1024];

        // Answer the ClientHello
        let (n, peer) = server_socket.recv_from(&mut buf).await.unwrap();
        let unwrapped = obfs.unwrap(&buf[..n]).unwrap();
        let hello = Packet::decode(&unwrapped, server_config.cid_len()).unwrap();
        let keypair = KeyPair::generate();
        let payload = HandshakePayload::new(keypair.public_bytes(), 1_700_000_000);
        let reply = Packet::handshake(hello.connection_id.clone(), 1, payload.encode());
        let wire = obfs.wrap(&reply.encode(&server_config).unwrap()).unwrap();
        server_socket.send_to(&wire, peer).await.unwrap();

        // Report the kind of everything that follows
        loop {
            let (n, _) = match server_socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            if let Ok(unwrapped) = obfs.unwrap(&buf[..n]) {
                if let Ok(pkt) = Packet::decode(&unwrapped, server_config.cid_len()) {
                    if kind_tx.send(pkt.kind).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let client = dial(server_addr, config).await.unwrap();

    // After ~1.5 s of idle the client emits a keep-alive
    let kind = timeout(Duration::from_secs(4), kind_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kind, PacketKind::KeepAlive);

    drop(client);
}

#[tokio::test]
async fn wrong_psk_drops_data_but_keeps_the_session() {
    let server_config = Config {
        psk: "server-side".into(),
        ..Config::default()
    };
    let (listener, mut conns) = listener_with_conns(server_config.clone()).await;
    let obfs = new_obfuscator(server_config.obfuscation);

    let socket = UdpSocket::bind(loopback()).await.unwrap();
    let cid = packet::generate_connection_id(server_config.cid_len()).unwrap();
    // Handshake completes: the PSK only proves itself on the first record
    let crypto = manual_handshake(
        &socket,
        listener.local_addr(),
        &server_config,
        obfs.as_ref(),
        cid.clone(),
        "client-side",
    )
    .await;
    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    let wire = seal_data(&server_config, obfs.as_ref(), &cid, &crypto, 1, b"unreadable");
    socket
        .send_to(&wire, listener.local_addr())
        .await
        .unwrap();

    // Nothing reaches the reader
    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(400), server_conn.read(&mut buf))
        .await
        .is_err());

    let stats = listener.hub_stats();
    assert_eq!(stats.auth_failures, 1);
    assert_eq!(stats.active_sessions, 1);
}

#[tokio::test]
async fn dial_times_out_against_a_silent_server() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let config = Config {
        handshake_timeout_s: 1,
        ..Config::default()
    };

    let start = Instant::now();
    let err = dial(silent.local_addr().unwrap(), config).await.unwrap_err();
    assert!(matches!(err, Error::HandshakeTimeout(1)));
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn client_close_propagates_to_the_server() {
    let config = Config::default();
    let (listener, mut conns) = listener_with_conns(config.clone()).await;
    let client = dial(listener.local_addr(), config).await.unwrap();
    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    client.close().await.unwrap();

    // The Control-Close removes the session
    let deadline = Instant::now() + WAIT;
    while listener.hub_stats().active_sessions != 0 {
        assert!(Instant::now() < deadline, "session was not removed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let mut buf = [0u8; 16];
    assert_eq!(
        timeout(WAIT, server_conn.read(&mut buf)).await.unwrap().unwrap(),
        0
    );
    assert!(matches!(
        server_conn.write(b"too late").await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn server_close_surfaces_as_eof_to_the_client() {
    let config = Config::default();
    let (listener, mut conns) = listener_with_conns(config.clone()).await;
    let client = dial(listener.local_addr(), config).await.unwrap();
    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    server_conn.close().await;

    let mut buf = [0u8; 16];
    assert_eq!(timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap(), 0);
    assert!(matches!(client.write(b"too late").await, Err(Error::Closed)));
    assert_eq!(listener.hub_stats().active_sessions, 0);
}

#[tokio::test]
async fn webrtc_mimic_tunnel_carries_data() {
    let config = Config {
        obfuscation: gametunnel::ObfuscationMode::WebrtcMimic,
        ..Config::default()
    };
    let (listener, mut conns) = listener_with_conns(config.clone()).await;
    let client = dial(listener.local_addr(), config).await.unwrap();
    let server_conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    client.write(b"over dtls").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, server_conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"over dtls");
}
