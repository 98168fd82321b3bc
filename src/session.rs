//! Per-connection session state.
//!
//! A session is born when a validated handshake arrives on an unknown
//! connection ID, becomes Active once the ServerHello is on the wire, and
//! dies either through an explicit Control-Close or the hub's idle reaper.
//! All session data lives in memory only.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::crypto::{KeyPair, SessionCrypto};
use crate::error::{Error, Result};

/// Capacity of the per-session inbound queue. Pushes beyond it drop the
/// packet, preserving UDP semantics instead of backpressuring the shared
/// receive loop.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Session lifecycle states. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Waiting for the handshake to complete
    Handshake,
    /// Keys established, data flowing
    Active,
    /// Local close initiated
    Closing,
    /// Inbound queue shut, timers released
    Closed,
}

/// One live connection on the server, keyed by its connection ID.
pub struct Session {
    id: Bytes,
    state: Mutex<SessionState>,
    /// Peer address; mutable to support connection migration
    remote: Mutex<SocketAddr>,
    crypto: SessionCrypto,
    /// Handshake keypair, retained to answer ServerHello retransmits
    local_keypair: KeyPair,
    /// Next outgoing packet number; 1 is the ServerHello, 0 was the
    /// ClientHello
    send_pn: AtomicU32,
    /// Highest received packet number (advisory)
    recv_pn: AtomicU32,
    created_at: Instant,
    last_active: Mutex<Instant>,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    packets_sent: AtomicU64,
    packets_recv: AtomicU64,
    inbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: Bytes,
        remote: SocketAddr,
        crypto: SessionCrypto,
        local_keypair: KeyPair,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let now = Instant::now();

        Arc::new(Self {
            id,
            state: Mutex::new(SessionState::Handshake),
            remote: Mutex::new(remote),
            crypto,
            local_keypair,
            send_pn: AtomicU32::new(1),
            recv_pn: AtomicU32::new(0),
            created_at: now,
            last_active: Mutex::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_recv: AtomicU64::new(0),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Connection ID this session is keyed by.
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Advance the state machine. Backward transitions are ignored.
    pub(crate) fn advance_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
        }
    }

    /// Current peer address.
    pub fn remote(&self) -> SocketAddr {
        *self.remote.lock()
    }

    /// Update the peer address on migration. Returns the previous address
    /// when it actually changed.
    pub(crate) fn migrate(&self, new_remote: SocketAddr) -> Option<SocketAddr> {
        let mut remote = self.remote.lock();
        if *remote != new_remote {
            let old = *remote;
            *remote = new_remote;
            Some(old)
        } else {
            None
        }
    }

    /// Record inbound activity for the idle reaper.
    pub(crate) fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Whether the session has been idle longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_active.lock().elapsed() > timeout
    }

    /// Allocate the next outgoing packet number.
    ///
    /// A (key, nonce) pair must never repeat, so when the counter would
    /// wrap the session is torn down instead of reusing a number.
    pub(crate) fn next_packet_number(&self) -> Result<u32> {
        let pn = self.send_pn.fetch_add(1, Ordering::SeqCst);
        if pn == u32::MAX {
            self.close();
            return Err(Error::Closed);
        }
        Ok(pn)
    }

    pub(crate) fn crypto(&self) -> &SessionCrypto {
        &self.crypto
    }

    pub(crate) fn local_keypair(&self) -> &KeyPair {
        &self.local_keypair
    }

    pub(crate) fn record_recv(&self, packet_number: u32, len: usize) {
        self.recv_pn.fetch_max(packet_number, Ordering::Relaxed);
        self.packets_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_send(&self, len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Queue decrypted bytes for the session reader without blocking.
    pub(crate) fn push_inbound(&self, data: Bytes) -> Result<()> {
        let guard = self.inbound_tx.lock();
        let tx = guard.as_ref().ok_or(Error::Closed)?;
        match tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::InboundFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Closed),
        }
    }

    /// Hand the inbound receiver to the session view. Yields once.
    pub(crate) fn take_inbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.lock().take()
    }

    /// Shut the session down. Idempotent; readers observe end-of-stream
    /// once the queue drains.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.advance_state(SessionState::Closed);
        self.inbound_tx.lock().take();
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Aggregate counters for dashboards. Carries no key material.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connection_id: hex::encode(&self.id),
            remote: self.remote(),
            state: self.state(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_recv: self.packets_recv.load(Ordering::Relaxed),
            highest_recv_pn: self.recv_pn.load(Ordering::Relaxed),
            created_at: self.created_at,
            last_active: *self.last_active.lock(),
        }
    }
}

/// Point-in-time session counters.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub connection_id: String,
    pub remote: SocketAddr,
    pub state: SessionState,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub highest_recv_pn: u32,
    pub created_at: Instant,
    pub last_active: Instant,
}


#[cfg(test)]
mod tests {
    use super::test_support::test_session;
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.5:41000".parse().unwrap()
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let session = test_session(addr());
        assert_eq!(session.state(), SessionState::Handshake);

        session.advance_state(SessionState::Active);
        assert_eq!(session.state(), SessionState::Active);

        // Backward transition is a no-op
        session.advance_state(SessionState::Handshake);
        assert_eq!(session.state(), SessionState::Active);

        session.advance_state(SessionState::Closed);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_packet_numbers_are_monotonic_from_one() {
        let session = test_session(addr());
        assert_eq!(session.next_packet_number().unwrap(), 1);
        assert_eq!(session.next_packet_number().unwrap(), 2);
        assert_eq!(session.next_packet_number().unwrap(), 3);
    }

    #[test]
    fn test_packet_number_overflow_tears_down() {
        let session = test_session(addr());
        session.send_pn.store(u32::MAX, Ordering::SeqCst);

        assert!(matches!(session.next_packet_number(), Err(Error::Closed)));
        assert!(session.is_closed());
    }

    #[test]
    fn test_migration_updates_remote() {
        let session = test_session(addr());
        let new_addr: SocketAddr = "203.0.113.5:41777".parse().unwrap();

        assert_eq!(session.migrate(new_addr), Some(addr()));
        assert_eq!(session.remote(), new_addr);
        // Same address again is not a migration
        assert_eq!(session.migrate(new_addr), None);
    }

    #[tokio::test]
    async fn test_inbound_queue_drops_when_full() {
        let session = test_session(addr());
        for _ in 0..INBOUND_QUEUE_CAPACITY {
            session.push_inbound(Bytes::from_static(b"x")).unwrap();
        }
        assert!(matches!(
            session.push_inbound(Bytes::from_static(b"overflow")),
            Err(Error::InboundFull)
        ));
    }

    #[tokio::test]
    async fn test_close_ends_inbound_stream() {
        let session = test_session(addr());
        let mut rx = session.take_inbound().unwrap();

        session.push_inbound(Bytes::from_static(b"last")).unwrap();
        session.close();
        assert!(matches!(
            session.push_inbound(Bytes::from_static(b"late")),
            Err(Error::Closed)
        ));

        // Queued data still drains, then the stream ends
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"last"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_stats_snapshot() {
        let session = test_session(addr());
        session.record_recv(42, 100);
        session.record_send(50);

        let stats = session.stats();
        assert_eq!(stats.connection_id, "1111111111111111");
        assert_eq!(stats.bytes_recv, 100);
        assert_eq!(stats.bytes_sent, 50);
        assert_eq!(stats.packets_recv, 1);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.highest_recv_pn, 42);
    }
}
