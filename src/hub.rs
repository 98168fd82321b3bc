//! Server-side session hub.
//!
//! The hub owns the CID-keyed session table and is the single dispatch
//! point for every datagram the listener receives. Packet-level failures
//! are local and silent: this path faces the open internet, and noisy
//! logging would aid adversaries and exhaust operators. Only aggregate
//! counters move.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::Config;
use crate::crypto::{derive_direction_keys, HandshakePayload, KeyPair, Role, SessionCrypto};
use crate::error::{Error, Result};
use crate::obfs::Obfuscator;
use crate::packet::{self, Packet, PacketKind, MIN_PACKET_SIZE};
use crate::priority::PriorityQueue;
use crate::session::{Session, SessionState};

/// Control opcodes carried in the first payload byte of Control packets.
pub const CONTROL_CLOSE: u8 = 0x00;
pub const CONTROL_PING: u8 = 0x01;
pub const CONTROL_PONG: u8 = 0x02;

/// Callback invoked once a new session turns Active.
pub type SessionCallback = Box<dyn Fn(Arc<Session>) + Send + Sync>;

/// Per-listener session table and dispatcher.
pub struct Hub {
    config: Arc<Config>,
    socket: Arc<UdpSocket>,
    obfs: Arc<dyn Obfuscator>,
    queue: Arc<PriorityQueue>,
    sessions: RwLock<HashMap<Bytes, Arc<Session>>>,
    active_sessions: AtomicUsize,
    total_sessions: AtomicU64,
    auth_failures: AtomicU64,
    inbound_drops: AtomicU64,
    on_session: RwLock<Option<SessionCallback>>,
}

impl Hub {
    pub(crate) fn new(
        config: Arc<Config>,
        socket: Arc<UdpSocket>,
        obfs: Arc<dyn Obfuscator>,
        queue: Arc<PriorityQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            socket,
            obfs,
            queue,
            sessions: RwLock::new(HashMap::new()),
            active_sessions: AtomicUsize::new(0),
            total_sessions: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            inbound_drops: AtomicU64::new(0),
            on_session: RwLock::new(None),
        })
    }

    /// Install the new-session callback. Wired by the listener after it
    /// has the hub handle the callback needs.
    pub(crate) fn set_session_callback(&self, callback: SessionCallback) {
        *self.on_session.write() = Some(callback);
    }

    /// Dispatch one unwrapped datagram.
    ///
    /// An unknown CID starts the new-session flow when the packet is a
    /// Handshake and is dropped otherwise. A known CID arriving from a new
    /// address migrates the session before dispatch.
    pub async fn route_packet(&self, data: &[u8], remote: SocketAddr) -> Result<()> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(Error::short(MIN_PACKET_SIZE, data.len()));
        }
        if !packet::is_quic_like(data[0]) {
            return Err(Error::BadFlags(data[0]));
        }

        let cid_len = self.config.cid_len();
        if data.len() < packet::aad_len(cid_len) {
            return Err(Error::short(packet::aad_len(cid_len), data.len()));
        }
        let cid = &data[5..5 + cid_len];
        let (kind, _) = packet::decode_flags(data[0])?;

        let session = self.sessions.read().get(cid).cloned();
        let session = match session {
            Some(session) => session,
            None => {
                if kind != PacketKind::Handshake {
                    return Err(Error::UnknownCid);
                }
                return self.accept_handshake(data, remote).await;
            }
        };

        if let Some(old) = session.migrate(remote) {
            debug!(
                cid = %hex::encode(session.id()),
                %old,
                new = %remote,
                "session migrated"
            );
        }
        session.touch();

        match kind {
            // The client lost our ServerHello; answer again from the
            // retained keypair.
            PacketKind::Handshake => self.send_server_hello(&session).await,
            PacketKind::Data => self.handle_data(&session, data),
            PacketKind::KeepAlive => self.handle_keep_alive(&session).await,
            PacketKind::Control => self.handle_control(&session, data).await,
        }
    }

    /// New-session flow: parse the ClientHello, derive keys, register the
    /// session, answer with a ServerHello and hand the session to the host.
    async fn accept_handshake(&self, data: &[u8], remote: SocketAddr) -> Result<()> {
        let cid_len = self.config.cid_len();
        let pkt = Packet::decode(data, cid_len)?;
        let hello = HandshakePayload::decode(&pkt.payload)?;

        let keypair = KeyPair::generate();
        let shared = keypair.shared_secret(&hello.public_key)?;
        let keys = derive_direction_keys(&shared, &self.config.psk)?;
        let crypto = SessionCrypto::new(&keys, Role::Server);

        let session = Session::new(pkt.connection_id.clone(), remote, crypto, keypair);

        // Two copies of the same ClientHello can race here; only one
        // session may win the CID.
        let existing = {
            let mut sessions = self.sessions.write();
            match sessions.get(&pkt.connection_id) {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    sessions.insert(pkt.connection_id.clone(), Arc::clone(&session));
                    None
                }
            }
        };
        if let Some(existing) = existing {
            return self.send_server_hello(&existing).await;
        }

        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);

        self.send_server_hello(&session).await?;
        session.advance_state(SessionState::Active);

        debug!(
            cid = %hex::encode(session.id()),
            %remote,
            "session established"
        );
        if let Some(callback) = self.on_session.read().as_ref() {
            callback(Arc::clone(&session));
        }
        Ok(())
    }

    async fn send_server_hello(&self, session: &Arc<Session>) -> Result<()> {
        let pn = session.next_packet_number()?;
        let payload = HandshakePayload::new(session.local_keypair().public_bytes(), unix_now());
        let pkt = Packet::handshake(session.id().clone(), pn, payload.encode());
        self.send_direct(&pkt, session.remote()).await
    }

    fn handle_data(&self, session: &Arc<Session>, data: &[u8]) -> Result<()> {
        if session.state() != SessionState::Active {
            return Err(Error::Closed);
        }

        let cid_len = self.config.cid_len();
        let pkt = Packet::decode(data, cid_len)?;
        let aad = &data[..packet::aad_len(cid_len)];

        let plaintext = match session.crypto().open(&pkt.payload, pkt.packet_number, aad) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        session.record_recv(pkt.packet_number, plaintext.len());
        if let Err(err) = session.push_inbound(Bytes::from(plaintext)) {
            self.inbound_drops.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        Ok(())
    }

    async fn handle_keep_alive(&self, session: &Arc<Session>) -> Result<()> {
        let pn = session.next_packet_number()?;
        let pkt = Packet::keep_alive(session.id().clone(), pn);
        self.send_direct(&pkt, session.remote()).await
    }

    async fn handle_control(&self, session: &Arc<Session>, data: &[u8]) -> Result<()> {
        let pkt = Packet::decode(data, self.config.cid_len())?;
        match pkt.payload.first() {
            Some(&CONTROL_CLOSE) => {
                self.remove_session(session.id().clone());
                Ok(())
            }
            Some(&CONTROL_PING) => {
                let pn = session.next_packet_number()?;
                let pong = Packet::control(
                    session.id().clone(),
                    pn,
                    Bytes::from_static(&[CONTROL_PONG]),
                );
                self.send_direct(&pong, session.remote()).await
            }
            // Pong: an RTT sample point, nothing to do
            _ => Ok(()),
        }
    }

    /// Encrypt, frame and enqueue one plaintext chunk toward the peer.
    ///
    /// The chunk is classified by its plaintext size; the finished wire
    /// datagram is what waits in the scheduler. A full queue is a recorded
    /// drop, not an error; UDP semantics.
    pub fn send_to_session(&self, session: &Arc<Session>, chunk: &[u8]) -> Result<()> {
        if session.state() != SessionState::Active {
            return Err(Error::Closed);
        }

        let pn = session.next_packet_number()?;
        let aad = packet::encode_aad(PacketKind::Data, self.config.enable_padding, session.id());
        let ciphertext = session.crypto().seal(chunk, pn, &aad)?;

        let pkt = Packet::data(
            session.id().clone(),
            pn,
            Bytes::from(ciphertext),
            self.config.enable_padding,
        );
        let wire = self.obfs.wrap(&pkt.encode(&self.config)?)?;

        let level = self.queue.classify(chunk.len());
        self.queue
            .enqueue_with_level(Bytes::from(wire), level, session);
        session.record_send(chunk.len());
        Ok(())
    }

    /// Close a session and notify the peer.
    pub async fn close_session(&self, session: &Arc<Session>) {
        if session.is_closed() {
            return;
        }
        session.advance_state(SessionState::Closing);
        if let Ok(pn) = session.next_packet_number() {
            let pkt = Packet::control(
                session.id().clone(),
                pn,
                Bytes::from_static(&[CONTROL_CLOSE]),
            );
            let _ = self.send_direct(&pkt, session.remote()).await;
        }
        self.remove_session(session.id().clone());
    }

    /// Encode, wrap and send one packet, bypassing the scheduler. Used for
    /// control-plane traffic (hellos, keep-alive bounces, pongs).
    async fn send_direct(&self, pkt: &Packet, remote: SocketAddr) -> Result<()> {
        let wire = self.obfs.wrap(&pkt.encode(&self.config)?)?;
        self.socket.send_to(&wire, remote).await?;
        Ok(())
    }

    /// Look up a session by connection ID.
    pub fn session(&self, cid: &[u8]) -> Option<Arc<Session>> {
        self.sessions.read().get(cid).cloned()
    }

    /// Remove and close a session.
    pub fn remove_session(&self, cid: Bytes) {
        let removed = self.sessions.write().remove(cid.as_ref());
        if let Some(session) = removed {
            session.close();
            self.active_sessions.fetch_sub(1, Ordering::Relaxed);
            debug!(cid = %hex::encode(&cid), "session removed");
        }
    }

    /// Remove every session idle past the configured timeout. Called by
    /// the listener's reaper task on its fixed cadence.
    pub fn reap_idle(&self) {
        self.reap_older_than(self.config.session_timeout());
    }

    pub(crate) fn reap_older_than(&self, timeout: Duration) {
        let stale: Vec<Bytes> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.is_idle(timeout))
            .map(|(cid, _)| cid.clone())
            .collect();

        if stale.is_empty() {
            return;
        }

        let mut sessions = self.sessions.write();
        for cid in stale {
            // Re-check under the write lock; a packet may have landed
            if let Some(session) = sessions.get(cid.as_ref()) {
                if session.is_idle(timeout) {
                    session.close();
                    sessions.remove(cid.as_ref());
                    self.active_sessions.fetch_sub(1, Ordering::Relaxed);
                    debug!(cid = %hex::encode(&cid), "idle session reaped");
                }
            }
        }
    }

    /// Close every session. Called on listener shutdown.
    pub(crate) fn shutdown(&self) {
        let mut sessions = self.sessions.write();
        for session in sessions.values() {
            session.close();
        }
        sessions.clear();
        self.active_sessions.store(0, Ordering::Relaxed);
    }

    /// Aggregate hub counters.
    pub fn stats(&self) -> HubStats {
        HubStats {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            inbound_drops: self.inbound_drops.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time hub counters.
#[derive(Debug, Clone)]
pub struct HubStats {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub auth_failures: u64,
    pub inbound_drops: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
