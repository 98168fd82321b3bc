//! Server endpoint.
//!
//! [`listen`] binds the UDP socket, builds the hub and spawns three tasks:
//! the receive loop feeding `Hub::route_packet`, the priority sender
//! draining the scheduler onto the socket, and the idle reaper on a fixed
//! 30-second cadence. Every new session is handed to the host callback as
//! a [`SessionConn`] duplex view.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hub::{Hub, HubStats};
use crate::obfs::new_obfuscator;
use crate::priority::{PriorityQueue, QueueStats};
use crate::session::{Session, SessionStats};
use crate::SOCKET_BUFFER_SIZE;

/// Cadence of the idle-session reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Bind a UDP socket with enlarged buffers, ready for tokio.
///
/// 4 MiB in each direction keeps bursts of gaming traffic from overflowing
/// kernel buffers under load; the OS may clamp the request.
fn bound_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE).ok();
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE).ok();
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Bind and start serving. `on_conn` runs once per established session.
pub async fn listen<F>(addr: SocketAddr, mut config: Config, on_conn: F) -> Result<Listener>
where
    F: Fn(SessionConn) + Send + Sync + 'static,
{
    config.validate()?;
    let config = Arc::new(config);

    let socket = Arc::new(bound_socket(addr)?);
    let local_addr = socket.local_addr()?;

    let obfs = new_obfuscator(config.obfuscation);
    let queue = Arc::new(PriorityQueue::new(config.priority));
    let hub = Hub::new(
        Arc::clone(&config),
        Arc::clone(&socket),
        Arc::clone(&obfs),
        Arc::clone(&queue),
    );

    let cb_hub = Arc::clone(&hub);
    let cb_config = Arc::clone(&config);
    hub.set_session_callback(Box::new(move |session| {
        if let Some(rx) = session.take_inbound() {
            on_conn(SessionConn::new(
                session,
                Arc::clone(&cb_hub),
                Arc::clone(&cb_config),
                local_addr,
                rx,
            ));
        }
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Receive loop
    {
        let socket = Arc::clone(&socket);
        let hub = Arc::clone(&hub);
        let obfs = Arc::clone(&obfs);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    res = socket.recv_from(&mut buf) => {
                        let (n, peer) = match res {
                            Ok(pair) => pair,
                            Err(_) => continue,
                        };
                        if n == 0 {
                            continue;
                        }
                        // Scanners and junk are expected on an open UDP
                        // port; every failure here is a silent drop.
                        let unwrapped = match obfs.unwrap(&buf[..n]) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        if let Err(err) = hub.route_packet(&unwrapped, peer).await {
                            trace!(error = %err, "datagram dropped");
                        }
                    }
                }
            }
        });
    }

    // Priority sender
    {
        let socket = Arc::clone(&socket);
        let queue = Arc::clone(&queue);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    pkt = queue.dequeue_blocking() => {
                        // The session tracks the current remote, so a
                        // migrating peer receives queued packets at its
                        // new address
                        if let Err(err) = socket.send_to(&pkt.data, pkt.session.remote()).await {
                            trace!(error = %err, "send failed");
                        }
                    }
                }
            }
        });
    }

    // Idle reaper
    {
        let hub = Arc::clone(&hub);
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => hub.reap_idle(),
                }
            }
        });
    }

    debug!(%local_addr, "gametunnel listener started");

    Ok(Listener {
        hub,
        queue,
        local_addr,
        shutdown: shutdown_tx,
        closed: AtomicBool::new(false),
    })
}

/// Handle to a running server endpoint.
pub struct Listener {
    hub: Arc<Hub>,
    queue: Arc<PriorityQueue>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Listener {
    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Aggregate hub counters.
    pub fn hub_stats(&self) -> HubStats {
        self.hub.stats()
    }

    /// Scheduler counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Stop the background tasks and close every session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.hub.shutdown();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Session-scoped duplex view handed to the host for each connection.
pub struct SessionConn {
    session: Arc<Session>,
    hub: Arc<Hub>,
    config: Arc<Config>,
    local: SocketAddr,
    read_state: tokio::sync::Mutex<ReadState>,
}

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl SessionConn {
    fn new(
        session: Arc<Session>,
        hub: Arc<Hub>,
        config: Arc<Config>,
        local: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            session,
            hub,
            config,
            local,
            read_state: tokio::sync::Mutex::new(ReadState {
                rx,
                pending: Bytes::new(),
            }),
        }
    }

    /// Read decrypted bytes, blocking until data arrives or the session
    /// closes. A chunk larger than `buf` leaves a remainder for the next
    /// read. Returns `Ok(0)` at end of stream.
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

    /// Encrypt and queue `data` toward the peer, one packet per
    /// `max_payload` window. On a mid-stream failure the bytes already
    /// handed off are reported instead of the error.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.session.is_closed() {
            return Err(Error::Closed);
        }

        let mut written = 0;
        for chunk in data.chunks(self.config.max_payload()) {
            if let Err(err) = self.hub.send_to_session(&self.session, chunk) {
                if written > 0 {
                    return Ok(written);
                }
                return Err(err);
            }
            written += chunk.len();
        }
        Ok(written)
    }

    /// Notify the peer and remove the session from the hub. Idempotent.
    pub async fn close(&self) {
        self.hub.close_session(&self.session).await;
    }

    /// Listener-side socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Current peer address, tracking migration.
    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote()
    }

    /// Counters for this session.
    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }
}
