//! Client endpoint: drives `sphynx_proto::handshake::ClientHandshake` over a UDP
//! socket connected to one peer, then hands off to a `Connexion` for the life of the
//! session. One socket per outbound connection, matching the original's one-session-
//! per-UDPEndpoint model rather than the server's single shared listening socket.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sphynx_crypto::curve::PublicKey;
use sphynx_crypto::stream::SessionCipher;
use sphynx_proto::handshake::ClientHandshake;
use sphynx_proto::{Connexion, HandshakeError, ReceiveOutcome};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

pub struct Client {
    socket: UdpSocket,
    conn: Connexion,
}

impl Client {
    /// Connects to `server_addr`, retrying HELLO/CHALLENGE per the handshake's own
    /// backoff schedule until either the ANSWER arrives or the attempt budget is
    /// exhausted (`HandshakeError::Timeout`).
    pub async fn connect(server_addr: SocketAddr, server_pub: PublicKey, oob: Vec<u8>) -> Result<Self, HandshakeError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|_| HandshakeError::ServerError)?;
        socket.connect(server_addr).await.map_err(|_| HandshakeError::ServerError)?;

        let start = now_ms();
        let (mut handshake, mut outgoing) = ClientHandshake::new(server_pub, oob, start)?;
        socket.send(&outgoing).await.map_err(|_| HandshakeError::ServerError)?;

        let mut buf = [0u8; 512];
        let session_keys = loop {
            let recv = tokio::time::timeout(Duration::from_millis(250), socket.recv(&mut buf)).await;
            match recv {
                Ok(Ok(len)) => {
                    if sphynx_proto::handshake::is_server_full_message(&buf[..len]) {
                        return Err(HandshakeError::ServerFull);
                    }
                    if let Ok(keys) = handshake.on_answer(&buf[..len]) {
                        break keys;
                    }
                    if let Ok(next) = handshake.on_cookie(&buf[..len], now_ms()) {
                        outgoing = next;
                        socket.send(&outgoing).await.map_err(|_| HandshakeError::ServerError)?;
                    }
                }
                _ => {
                    let now = now_ms();
                    if handshake.due_for_retry(now)? {
                        outgoing = handshake.retry_message(now);
                        socket.send(&outgoing).await.map_err(|_| HandshakeError::ServerError)?;
                    }
                }
            }
        };

        let send_cipher = SessionCipher::new(&session_keys.client_to_server);
        let recv_cipher = SessionCipher::new(&session_keys.server_to_client);
        let conn = Connexion::new(server_addr, send_cipher, recv_cipher, now_ms());
        Ok(Self { socket, conn })
    }

    pub fn write_reliable(&mut self, stream: u8, payload: Vec<u8>) -> Result<(), sphynx_proto::ProtocolError> {
        self.conn.write_reliable(stream, payload)
    }

    pub fn write_unreliable(&mut self, payload: Vec<u8>) {
        self.conn.write_unreliable(payload)
    }

    pub fn disconnect(&mut self, reason: u8) {
        self.conn.disconnect(reason)
    }

    pub fn is_alive(&self) -> bool {
        self.conn.is_alive()
    }

    /// Drives one tick: flushes outbound datagrams, then drains whatever arrived on
    /// the socket without blocking past `tick_interval`. Intended to be called in a
    /// loop by the owning application, matching the explicit-value style favored over
    /// a captured background task per the concurrency model's ownership rules.
    pub async fn run_one_tick(&mut self, tick_interval: Duration, deliveries: &mpsc::UnboundedSender<Vec<u8>>) {
        let now = now_ms();
        for dg in self.conn.tick(now) {
            if let Err(e) = self.socket.send(&dg.bytes).await {
                debug!(error = %e, "client send failed");
            }
        }

        let mut buf = [0u8; 65536];
        let deadline = tokio::time::Instant::now() + tick_interval;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => match self.conn.receive_datagram(&buf[..len], now_ms()) {
                    ReceiveOutcome::Messages(messages) => {
                        for m in messages {
                            let _ = deliveries.send(m.payload);
                        }
                    }
                    ReceiveOutcome::PeerDisconnect(reason) => {
                        warn!(reason, "peer disconnected");
                        break;
                    }
                    ReceiveOutcome::Dropped | ReceiveOutcome::Ok => {}
                },
                Ok(Err(e)) => {
                    debug!(error = %e, "client recv failed");
                    break;
                }
                Err(_) => break,
            }
        }
    }
}
