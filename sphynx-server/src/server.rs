//! The listening endpoint: owns the socket, the long-term keypair, the cookie jar, and
//! the connection map, and drives the handshake state machine for addresses that
//! aren't in the map yet. Structured after the daemon-task-per-concern shape used for
//! the UDP-bind loop and background-tick loop this is grounded on: one task reads the
//! socket and demuxes, a second ticks every live connection on a fixed interval.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sphynx_crypto::curve::KeyPair;
use sphynx_crypto::stream::SessionCipher;
use sphynx_proto::constants::MAGIC;
use sphynx_proto::handshake::{self, HELLO_LEN};
use sphynx_proto::{Connexion, CookieJar, ReceiveOutcome};

use crate::buffer_pool::BufferPool;
use crate::connexion_map::{ConnexionMap, LookupResult};
use crate::settings::Settings;
use crate::worker::WorkerAssigner;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(a) => {
            let mut v = a.ip().octets().to_vec();
            v.extend_from_slice(&a.port().to_be_bytes());
            v
        }
        SocketAddr::V6(a) => {
            let mut v = a.ip().octets().to_vec();
            v.extend_from_slice(&a.port().to_be_bytes());
            v
        }
    }
}

/// A fully reassembled application message delivered from some peer, handed to
/// whatever owns the `Server` (a higher-level application loop, a test harness).
pub struct InboundMessage {
    pub from: SocketAddr,
    pub stream: u8,
    pub payload: Vec<u8>,
}

struct Mutable {
    daemons: Vec<JoinHandle<()>>,
}

pub struct Server {
    socket: Arc<UdpSocket>,
    keypair: KeyPair,
    cookie_jar: CookieJar,
    map: ConnexionMap,
    settings: Settings,
    workers: WorkerAssigner,
    buffers: BufferPool,
    /// Pre-shared out-of-band value both ends fold into the challenge/response MACs.
    /// Never carried on the wire; a mismatch here looks identical to a bad MAC.
    oob: Vec<u8>,
    inbound_tx: tokio::sync::mpsc::UnboundedSender<InboundMessage>,
    state: tokio::sync::Mutex<Mutable>,
}

impl Server {
    /// Binds the listening socket and returns both the running server and the
    /// channel it delivers reassembled application messages on. Callers that want
    /// strictly request/response semantics can just read from the receiver in a loop.
    pub async fn bind(addr: SocketAddr, keypair: KeyPair, settings: Settings) -> std::io::Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<InboundMessage>)> {
        Self::bind_with_oob(addr, keypair, settings, Vec::new()).await
    }

    pub async fn bind_with_oob(addr: SocketAddr, keypair: KeyPair, settings: Settings, oob: Vec<u8>) -> std::io::Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<InboundMessage>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut cookie_secret = [0u8; 32];
        sphynx_crypto::random::fill_secure(&mut cookie_secret).map_err(|_| std::io::Error::other("csprng failure"))?;
        let worker_count = settings.io_workers;
        let buffers = BufferPool::new(settings.io_buffer_count, settings.io_mtu);
        let server = Arc::new(Self {
            socket,
            keypair,
            cookie_jar: CookieJar::new(cookie_secret),
            map: ConnexionMap::new(),
            settings,
            workers: WorkerAssigner::new(worker_count),
            buffers,
            oob,
            inbound_tx: tx,
            state: tokio::sync::Mutex::new(Mutable { daemons: Vec::new() }),
        });
        let mut daemons = vec![tokio::spawn(server.clone().recv_daemon())];
        for worker_id in 0..server.workers.worker_count() {
            daemons.push(tokio::spawn(server.clone().tick_daemon(worker_id)));
        }
        server.state.lock().await.daemons.extend(daemons);
        Ok((server, rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn connexion_count(&self) -> usize {
        self.map.count()
    }

    pub fn public_key(&self) -> sphynx_crypto::curve::PublicKey {
        *self.keypair.public()
    }

    /// Every inbound datagram's bytes live in a pool buffer for the length of one
    /// `handle_datagram` call. When the pool is exhausted, the datagram is still read
    /// off the socket (so the kernel queue keeps draining) but then dropped silently,
    /// per the resource-exhaustion policy for incoming traffic.
    async fn recv_daemon(self: Arc<Self>) {
        let mut scratch = vec![0u8; self.buffers.buffer_size()];
        loop {
            match self.buffers.acquire() {
                Some(mut buffer) => {
                    let (len, from) = match self.socket.recv_from(&mut buffer.data).await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "udp recv failed");
                            self.buffers.release(buffer);
                            continue;
                        }
                    };
                    buffer.len = len;
                    self.handle_datagram(from, buffer.as_slice()).await;
                    self.buffers.release(buffer);
                }
                None => {
                    warn!("buffer pool exhausted, dropping incoming datagram");
                    if let Err(e) = self.socket.recv_from(&mut scratch).await {
                        warn!(error = %e, "udp recv failed");
                    }
                }
            }
        }
    }

    /// Ticks only the connexions assigned to `worker_id`, so a slow peer on one
    /// worker's partition never delays another worker's cadence. Flood-counter decay
    /// is a single shared concern and only runs on worker 0.
    async fn tick_daemon(self: Arc<Self>, worker_id: usize) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.settings.tick_interval_ms));
        let mut flood_decay_counter: u32 = 0;
        let ticks_per_second = (1000 / self.settings.tick_interval_ms.max(1)).max(1);
        loop {
            ticker.tick().await;
            let now = now_ms();
            let mut outgoing = Vec::new();
            let mut dead = Vec::new();
            self.map.for_each_mut(|addr, conn| {
                if conn.worker_id() != Some(worker_id) {
                    return;
                }
                for dg in conn.tick(now) {
                    outgoing.push((*addr, dg.bytes));
                }
                if !conn.is_alive() {
                    dead.push(*addr);
                }
            });
            for (addr, bytes) in outgoing {
                match self.buffers.acquire() {
                    Some(mut buffer) => {
                        let n = bytes.len().min(buffer.data.len());
                        buffer.data[..n].copy_from_slice(&bytes[..n]);
                        buffer.len = n;
                        if let Err(e) = self.socket.send_to(buffer.as_slice(), addr).await {
                            debug!(error = %e, %addr, "send failed");
                        }
                        self.buffers.release(buffer);
                    }
                    None => {
                        warn!(%addr, "buffer pool exhausted, dropping outgoing datagram");
                    }
                }
            }
            for addr in dead {
                self.map.remove(&addr);
                self.workers.release(worker_id);
            }
            if worker_id == 0 {
                flood_decay_counter += 1;
                if flood_decay_counter >= ticks_per_second as u32 {
                    flood_decay_counter = 0;
                    self.map.decay_flood_counters();
                }
            }
        }
    }

    async fn handle_datagram(&self, from: SocketAddr, buf: &[u8]) {
        if self.map.lookup(&from).is_some() {
            self.handle_session_datagram(from, buf).await;
            return;
        }
        if buf.len() >= 4 && u32::from_le_bytes(buf[0..4].try_into().unwrap()) == MAGIC {
            self.handle_handshake_datagram(from, buf).await;
        }
        // Anything else addressed to an unknown peer that isn't a handshake message is
        // silently dropped: never reveal liveness to an unauthenticated sender.
    }

    async fn handle_session_datagram(&self, from: SocketAddr, buf: &[u8]) {
        let now = now_ms();
        let outcome = {
            let mut conn = match self.map.lookup_mut(&from) {
                Some(c) => c,
                None => return,
            };
            conn.receive_datagram(buf, now)
        };
        match outcome {
            ReceiveOutcome::Messages(messages) => {
                for m in messages {
                    let _ = self.inbound_tx.send(InboundMessage { from, stream: m.stream, payload: m.payload });
                }
            }
            ReceiveOutcome::PeerDisconnect(_) | ReceiveOutcome::Dropped | ReceiveOutcome::Ok => {}
        }
        let dead_worker = match self.map.lookup(&from) {
            Some(conn) if !conn.is_alive() => conn.worker_id(),
            _ => None,
        };
        if dead_worker.is_some() {
            self.map.remove(&from);
        }
        if let Some(worker_id) = dead_worker {
            self.workers.release(worker_id);
        }
    }

    async fn handle_handshake_datagram(&self, from: SocketAddr, buf: &[u8]) {
        let now = now_ms();
        let addr = addr_bytes(&from);

        if buf.len() == HELLO_LEN {
            if handshake::parse_hello(buf).is_err() {
                return;
            }
            match self.map.lookup_check_flood(&from) {
                LookupResult::Flooded => {
                    debug!(%from, "dropping HELLO, source is flooding");
                }
                LookupResult::Found(_) => {}
                LookupResult::NotFound => {
                    let cookie = self.cookie_jar.issue(&addr, now);
                    let mut out = Vec::new();
                    handshake::write_cookie_message(&mut out, cookie);
                    let _ = self.socket.send_to(&out, from).await;
                }
            }
            return;
        }

        if let Ok(parsed) = handshake::parse_challenge_message(buf) {
            // Cookie, DH agreement, and MAC are all checked before the map is even
            // consulted: whether the server is full is never a function of what the
            // peer sent, so letting it gate validation would make validation failure
            // and map-full failure distinguishable on the wire — a MAC oracle in all
            // but name.
            let accepted = match handshake::validate_challenge(&self.cookie_jar, &self.keypair, &addr, now, &parsed, &self.oob) {
                Ok(a) => a,
                Err(_) => return,
            };

            if self.map.count() >= sphynx_proto::constants::MAX_POPULATION {
                warn!(%from, "rejecting new connexion, map is full");
                self.send_server_full(from).await;
                return;
            }

            let send_cipher = SessionCipher::new(&accepted.session_keys.server_to_client);
            let recv_cipher = SessionCipher::new(&accepted.session_keys.client_to_server);
            let mut conn = Connexion::new(from, send_cipher, recv_cipher, now);
            let worker_id = self.workers.assign();
            conn.set_worker_id(worker_id);
            if !self.map.insert(from, conn) {
                warn!(%from, "connexion map rejected insert");
                self.workers.release(worker_id);
                self.send_server_full(from).await;
                return;
            }
            let mut answer = Vec::new();
            handshake::write_answer_message(&mut answer, &accepted.server_seed, &accepted.answer_mac);
            let _ = self.socket.send_to(&answer, from).await;
            info!(%from, "connexion established");
        }
    }

    /// ServerFull is the one handshake outcome revealed on the wire rather than
    /// silently dropped: see `handshake::write_server_full_message`.
    async fn send_server_full(&self, from: SocketAddr) {
        let mut out = Vec::new();
        handshake::write_server_full_message(&mut out);
        let _ = self.socket.send_to(&out, from).await;
    }

    /// Enqueue application data for delivery to `peer` on a reliable stream. Errors
    /// if `peer` has no live connexion or the stream index is invalid.
    pub fn send_reliable(&self, peer: &SocketAddr, stream: u8, payload: Vec<u8>) -> Result<(), crate::error::ResourceError> {
        let mut conn = self.map.lookup_mut(peer).ok_or(crate::error::ResourceError::ConnexionMapFull)?;
        conn.write_reliable(stream, payload).map_err(|_| crate::error::ResourceError::WorkerQueueSaturated)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let daemons = loop {
            match self.state.try_lock() {
                Ok(mut guard) => break std::mem::take(&mut guard.daemons),
                Err(_) => std::thread::sleep(Duration::from_millis(2)),
            }
        };
        for daemon in daemons {
            daemon.abort();
        }
    }
}
