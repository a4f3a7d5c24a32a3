// Worker/IO concurrency model built on `sphynx-proto`: the server-side connection map
// with flood protection, a buffer pool, settings loading, and the Server/Client
// endpoints that actually own a socket.

pub mod buffer_pool;
pub mod client;
pub mod connexion_map;
pub mod error;
pub mod keys;
pub mod server;
pub mod settings;
pub mod worker;

pub use buffer_pool::{Buffer, BufferPool};
pub use client::Client;
pub use connexion_map::ConnexionMap;
pub use error::{ConfigError, KeyFileError, ResourceError};
pub use keys::KeyFile;
pub use server::{InboundMessage, Server};
pub use settings::{LogLevel, Settings};
pub use worker::WorkerAssigner;
