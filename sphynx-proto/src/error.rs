/// Handshake-specific failures. Only the first three are ever revealed on the wire
/// (`WrongVersion` as nothing, `FloodedIP` and `ServerFull` as the one named exception
/// to the silent-drop policy); the rest are local to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    WrongVersion,
    TamperedData,
    FloodedIP,
    ServerFull,
    ServerError,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongVersion => f.write_str("WrongVersion"),
            Self::TamperedData => f.write_str("TamperedData"),
            Self::FloodedIP => f.write_str("FloodedIP"),
            Self::ServerFull => f.write_str("ServerFull"),
            Self::ServerError => f.write_str("ServerError"),
            Self::Timeout => f.write_str("Timeout"),
            Self::Cancelled => f.write_str("Cancelled"),
        }
    }
}
impl std::error::Error for HandshakeError {}

/// Why a `Connexion` moved to `Failed` or `Dead`, passed to `OnDisconnectReason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    MaxRetriesExceeded,
    DecryptFailureStreak,
    PeerReason(u8),
    LocalDisconnect,
    Cancelled,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("Timeout"),
            Self::MaxRetriesExceeded => f.write_str("MaxRetriesExceeded"),
            Self::DecryptFailureStreak => f.write_str("DecryptFailureStreak"),
            Self::PeerReason(code) => write!(f, "PeerReason({})", code),
            Self::LocalDisconnect => f.write_str("LocalDisconnect"),
            Self::Cancelled => f.write_str("Cancelled"),
        }
    }
}
impl std::error::Error for DisconnectReason {}

/// Malformed or inconsistent wire data. These are folded into the same
/// silent-drop + streak-counting treatment as a `CryptoError`, since a protocol error
/// after successful decryption still shouldn't distinguish itself to a prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    MalformedHeader,
    UnknownKind,
    FragmentInconsistency,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedHeader => f.write_str("MalformedHeader"),
            Self::UnknownKind => f.write_str("UnknownKind"),
            Self::FragmentInconsistency => f.write_str("FragmentInconsistency"),
        }
    }
}
impl std::error::Error for ProtocolError {}

/// Local resource exhaustion. Incoming work hitting this is dropped silently; outgoing
/// application writes instead report back so the application can back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    BufferPoolExhausted,
    ConnexionMapFull,
    WorkerQueueSaturated,
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferPoolExhausted => f.write_str("BufferPoolExhausted"),
            Self::ConnexionMapFull => f.write_str("ConnexionMapFull"),
            Self::WorkerQueueSaturated => f.write_str("WorkerQueueSaturated"),
        }
    }
}
impl std::error::Error for ResourceError {}

/// Result of feeding one received datagram through a `Connexion`.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Nothing the application needs to see (pure ACK, keepalive, duplicate).
    Ok,
    /// One or more fully reassembled messages are ready for delivery.
    Messages(Vec<DeliveredMessage>),
    /// The packet was silently dropped (bad MAC, replay, malformed data). Counted
    /// against the session's decrypt-failure streak by the caller.
    Dropped,
    /// The peer requested disconnection with this reason.
    PeerDisconnect(u8),
}

/// A message delivered to the application, labeled with the stream it arrived on.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub stream: u8,
    pub payload: Vec<u8>,
    /// `Some(offset)` for a huge-fragment delivery, where `payload` is one fragment
    /// rather than the whole message; `None` for a normal fully-reassembled message.
    pub huge_fragment_offset: Option<u32>,
    /// Set on the final huge-fragment delivery of a message.
    pub huge_fragment_last: bool,
}
