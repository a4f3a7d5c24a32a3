//! Errors that originate in the server/IO layer itself, as opposed to `sphynx_proto`'s
//! per-session errors. These are the ones that can be fatal at startup (`ConfigError`)
//! or that the worker model needs a name for even though the wire protocol never reveals
//! them (`ResourceError`'s map-full / pool-exhausted cases).

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingFile(String),
    InvalidLine { line_no: usize, text: String },
    UnknownKey(String),
    InvalidValue { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFile(path) => write!(f, "cannot read settings file {path}"),
            Self::InvalidLine { line_no, text } => write!(f, "malformed settings line {line_no}: {text:?}"),
            Self::UnknownKey(key) => write!(f, "unrecognized settings key {key:?}"),
            Self::InvalidValue { key, value } => write!(f, "invalid value for {key:?}: {value:?}"),
        }
    }
}
impl std::error::Error for ConfigError {}

/// Resource exhaustion in the server-side worker/IO model: the connection map is full,
/// the buffer pool is empty, or a worker's inbound queue is saturated. Incoming traffic
/// that hits these is dropped silently; outgoing
/// application writes that hit them are reported to the caller instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    ConnexionMapFull,
    BufferPoolExhausted,
    WorkerQueueSaturated,
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnexionMapFull => f.write_str("connection map is full"),
            Self::BufferPoolExhausted => f.write_str("buffer pool exhausted"),
            Self::WorkerQueueSaturated => f.write_str("worker queue saturated"),
        }
    }
}
impl std::error::Error for ResourceError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFileError {
    WrongSize,
    InvalidKey,
    Io,
}

impl std::fmt::Display for KeyFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongSize => f.write_str("key file has the wrong size"),
            Self::InvalidKey => f.write_str("key file does not contain a valid point"),
            Self::Io => f.write_str("key file could not be read or written"),
        }
    }
}
impl std::error::Error for KeyFileError {}
