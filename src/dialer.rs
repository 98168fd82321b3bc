//! Client endpoint.
//!
//! [`dial`] opens a connected UDP socket, runs the one-round-trip
//! handshake and spawns the receive loop. The returned [`ClientConn`]
//! mirrors the server-side session view: chunked encrypted writes, reads
//! with remainder buffering, and control-plane mirroring (close, pong).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::Config;
use crate::crypto::{
    derive_direction_keys, HandshakePayload, KeyPair, Role, SessionCrypto,
};
use crate::error::{Error, Result};
use crate::hub::{CONTROL_CLOSE, CONTROL_PING, CONTROL_PONG};
use crate::obfs::{new_obfuscator, Obfuscator};
use crate::packet::{self, Packet, PacketKind};
use crate::session::INBOUND_QUEUE_CAPACITY;
use crate::SOCKET_BUFFER_SIZE;

/// Open a UDP socket connected to the server, with enlarged buffers.
fn connected_socket(server: SocketAddr) -> Result<UdpSocket> {
    let bind: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(server),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE).ok();
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE).ok();
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    socket.connect(&server.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Establish a tunnel to `server`.
///
/// Fails with [`Error::HandshakeTimeout`] when no valid ServerHello
/// arrives within the configured deadline; socket and key-derivation
/// failures carry their own kinds.
pub async fn dial(server: SocketAddr, mut config: Config) -> Result<ClientConn> {
    config.validate()?;
    let config = Arc::new(config);

    let socket = Arc::new(connected_socket(server)?);
    let local = socket.local_addr()?;
    let obfs = new_obfuscator(config.obfuscation);

    let cid = packet::generate_connection_id(config.cid_len())?;
    let keypair = KeyPair::generate();

    // ClientHello is packet number 0
    let hello = HandshakePayload::new(keypair.public_bytes(), unix_now());
    let client_hello = Packet::handshake(cid.clone(), 0, hello.encode());
    let wire = obfs.wrap(&client_hello.encode(&config)?)?;
    socket.send(&wire).await?;

    let server_hello = wait_server_hello(&socket, obfs.as_ref(), &config, &cid).await?;

    let shared = keypair.shared_secret(&server_hello.public_key)?;
    let keys = derive_direction_keys(&shared, &config.psk)?;
    let crypto = SessionCrypto::new(&keys, Role::Client);

    debug!(%server, cid = %hex::encode(&cid), "tunnel established");

    let shared_state = Arc::new(ClientShared {
        socket,
        config,
        obfs,
        cid,
        crypto,
        // 0 was consumed by the ClientHello
        send_pn: AtomicU32::new(1),
        recv_pn: AtomicU32::new(0),
        last_send: Mutex::new(Instant::now()),
        closed: AtomicBool::new(false),
    });

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(receive_loop(
        Arc::clone(&shared_state),
        shutdown_rx,
        tx,
    ));

    Ok(ClientConn {
        shared: shared_state,
        shutdown: shutdown_tx,
        read_state: tokio::sync::Mutex::new(ReadState {
            rx,
            pending: Bytes::new(),
        }),
        local,
        peer: server,
    })
}

/// Wait for a ServerHello matching our connection ID, discarding anything
/// else, until the handshake deadline passes.
async fn wait_server_hello(
    socket: &UdpSocket,
    obfs: &dyn Obfuscator,
    config: &Config,
    cid: &Bytes,
) -> Result<HandshakePayload> {
    let deadline = Instant::now() + config.handshake_timeout();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::HandshakeTimeout(config.handshake_timeout_s))?;

        let n = match tokio::time::timeout(remaining, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => continue,
            Err(_) => return Err(Error::HandshakeTimeout(config.handshake_timeout_s)),
        };

        let unwrapped = match obfs.unwrap(&buf[..n]) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let pkt = match Packet::decode(&unwrapped, config.cid_len()) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if pkt.kind != PacketKind::Handshake || &pkt.connection_id != cid {
            continue;
        }
        if let Ok(payload) = HandshakePayload::decode(&pkt.payload) {
            return Ok(payload);
        }
    }
}

/// State shared between the connection handle and its receive loop.
struct ClientShared {
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
    obfs: Arc<dyn Obfuscator>,
    cid: Bytes,
    crypto: SessionCrypto,
    send_pn: AtomicU32,
    recv_pn: AtomicU32,
    last_send: Mutex<Instant>,
    closed: AtomicBool,
}

impl ClientShared {
    /// Allocate the next outgoing packet number, closing the connection
    /// rather than ever reusing a (key, nonce) pair.
    fn next_packet_number(&self) -> Result<u32> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let pn = self.send_pn.fetch_add(1, Ordering::SeqCst);
        if pn == u32::MAX {
            self.closed.store(true, Ordering::SeqCst);
            return Err(Error::Closed);
        }
        Ok(pn)
    }

    async fn send_packet(&self, pkt: &Packet) -> Result<()> {
        let wire = self.obfs.wrap(&pkt.encode(&self.config)?)?;
        self.socket.send(&wire).await?;
        *self.last_send.lock() = Instant::now();
        Ok(())
    }

    async fn send_chunk(&self, chunk: &[u8]) -> Result<()> {
        let pn = self.next_packet_number()?;
        let aad = packet::encode_aad(
            PacketKind::Data,
            self.config.enable_padding,
            &self.cid,
        );
        let ciphertext = self.crypto.seal(chunk, pn, &aad)?;
        let pkt = Packet::data(
            self.cid.clone(),
            pn,
            Bytes::from(ciphertext),
            self.config.enable_padding,
        );
        self.send_packet(&pkt).await
    }

    /// Emit a keep-alive when the configured interval has elapsed since
    /// the last send.
    async fn maybe_keep_alive(&self) {
        let Some(interval) = self.config.keepalive_interval() else {
            return;
        };
        if self.last_send.lock().elapsed() < interval {
            return;
        }
        if let Ok(pn) = self.next_packet_number() {
            let pkt = Packet::keep_alive(self.cid.clone(), pn);
            let _ = self.send_packet(&pkt).await;
        }
    }

    /// Process one datagram from the server. Returns true when the
    /// connection should shut down.
    async fn handle_datagram(&self, data: &[u8], tx: &mpsc::Sender<Bytes>) -> bool {
        let unwrapped = match self.obfs.unwrap(data) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let data = unwrapped.as_slice();
        if data.is_empty() || !packet::is_quic_like(data[0]) {
            return false;
        }
        let Ok((kind, _)) = packet::decode_flags(data[0]) else {
            return false;
        };

        match kind {
            PacketKind::Data => {
                let cid_len = self.config.cid_len();
                let Ok(pkt) = Packet::decode(data, cid_len) else {
                    return false;
                };
                if pkt.connection_id != self.cid {
                    return false;
                }
                let aad = &data[..packet::aad_len(cid_len)];
                let Ok(plaintext) = self.crypto.open(&pkt.payload, pkt.packet_number, aad)
                else {
                    return false;
                };
                self.recv_pn.fetch_max(pkt.packet_number, Ordering::Relaxed);
                // Inbound full means drop, never block the loop
                let _ = tx.try_send(Bytes::from(plaintext));
                false
            }
            // Our keep-alive bounced back, or a late ServerHello retransmit
            PacketKind::KeepAlive | PacketKind::Handshake => false,
            PacketKind::Control => {
                let Ok(pkt) = Packet::decode(data, self.config.cid_len()) else {
                    return false;
                };
                match pkt.payload.first() {
                    Some(&CONTROL_CLOSE) => {
                        self.closed.store(true, Ordering::SeqCst);
                        true
                    }
                    Some(&CONTROL_PING) => {
                        if let Ok(pn) = self.next_packet_number() {
                            let pong = Packet::control(
                                self.cid.clone(),
                                pn,
                                Bytes::from_static(&[CONTROL_PONG]),
                            );
                            let _ = self.send_packet(&pong).await;
                        }
                        false
                    }
                    _ => false,
                }
            }
        }
    }
}

/// Receive loop: waits for datagrams, ticks the keep-alive clock once a
/// second, and exits on shutdown. Dropping `tx` on exit ends the reader's
/// stream.
async fn receive_loop(
    shared: Arc<ClientShared>,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<Bytes>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => shared.maybe_keep_alive().await,
            res = shared.socket.recv(&mut buf) => {
                let n = match res {
                    Ok(n) => n,
                    // Connected UDP sockets surface ICMP errors here;
                    // keep reading unless we are shutting down
                    Err(_) => {
                        if shared.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        continue;
                    }
                };
                if n == 0 {
                    continue;
                }
                if shared.handle_datagram(&buf[..n], &tx).await {
                    break;
                }
            }
        }
    }
}

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

/// Client side of an established tunnel.
pub struct ClientConn {
    shared: Arc<ClientShared>,
    shutdown: watch::Sender<bool>,
    read_state: tokio::sync::Mutex<ReadState>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl ClientConn {
    /// Read decrypted bytes from the server. A chunk larger than `buf`
    /// leaves a remainder for the next read. Returns `Ok(0)` at end of
    /// stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.read_state.lock().await;

        if !state.pending.is_empty() {
            let n = buf.len().min(state.pending.len());
            buf[..n].copy_from_slice(&state.pending[..n]);
            state.pending.advance(n);
            return Ok(n);
        }

        match state.rx.recv().await {
            Some(data) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    state.pending = data.slice(n..);
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Encrypt and send `data`, one datagram per `max_payload` window.
    /// On a mid-stream failure the bytes already sent are reported
    /// instead of the error.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let mut written = 0;
        for chunk in data.chunks(self.shared.config.max_payload()) {
            if let Err(err) = self.shared.send_chunk(chunk).await {
                if written > 0 {
                    return Ok(written);
                }
                return Err(err);
            }
            written += chunk.len();
        }
        Ok(written)
    }

    /// Notify the server and stop the receive loop. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pn = self.shared.send_pn.fetch_add(1, Ordering::SeqCst);
        if pn < u32::MAX {
            let pkt = Packet::control(
                self.shared.cid.clone(),
                pn,
                Bytes::from_static(&[CONTROL_CLOSE]),
            );
            let _ = self.shared.send_packet(&pkt).await;
        }
        let _ = self.shutdown.send(true);
        Ok(())
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Server address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Highest packet number seen from the server (advisory).
    pub fn highest_recv_pn(&self) -> u32 {
        self.shared.recv_pn.load(Ordering::Relaxed)
    }
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
