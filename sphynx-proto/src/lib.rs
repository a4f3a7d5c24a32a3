// Transport core: handshake, per-connection reliability/ordering/fragmentation, flow
// control, and the wire encoding everything above rides on. Nothing in this crate opens
// a socket or spawns a thread; see `sphynx-server` for the worker/IO model and the
// server-side connection map built on top of these pieces.

pub mod ack;
pub mod connexion;
pub mod constants;
pub mod cookie;
pub mod error;
pub mod flowcontrol;
pub mod handshake;
pub mod reorder;
pub mod replay;
pub mod stream;
pub mod wire;

pub use connexion::{Connexion, ConnexionState, OutboundDatagram};
pub use cookie::CookieJar;
pub use error::{DeliveredMessage, DisconnectReason, HandshakeError, ProtocolError, ReceiveOutcome, ResourceError};
pub use flowcontrol::FlowControl;
pub use handshake::{AcceptedChallenge, ClientHandshake, SessionKeys};
