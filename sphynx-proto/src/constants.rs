//! Tunable constants. All of these are overridable at runtime via `sphynx_server::Settings`;
//! the values here are the documented defaults.

/// Magic number that begins every handshake packet (HELLO/COOKIE/CHALLENGE/ANSWER), little-endian on the wire.
pub const MAGIC: u32 = 0xC47E_D9AE;

/// Protocol version carried in HELLO.
pub const PROTOCOL_VERSION: u16 = 0;

/// Number of reliable ordered streams. One additional unreliable stream is addressed as `UNRELIABLE_STREAM`.
pub const N_RELIABLE_STREAMS: usize = 4;
pub const UNRELIABLE_STREAM: u8 = N_RELIABLE_STREAMS as u8;
pub const N_STREAMS: usize = N_RELIABLE_STREAMS + 1;

/// Message/session ids are 24 bits on the wire.
pub const ID_WIRE_BITS: u32 = 24;
pub const ID_WIRE_MASK: u32 = (1 << ID_WIRE_BITS) - 1;

/// Default physical MTU (payload budget per datagram after any outer UDP/IP headers).
pub const DEFAULT_MTU: usize = 1350;

/// A fragment's payload is dispatched incrementally, rather than reassembled, once its
/// announced total size exceeds this threshold.
pub const HUGE_THRESHOLD: usize = 64 * 1024;

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 20;
pub const DEFAULT_ACK_DELAY_MS: u64 = 10;
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MAX_RETRIES: u32 = 8;

pub const RTO_FLOOR_MS: u64 = 100;
pub const RTO_CEILING_MS: u64 = 3_000;

/// Sliding window width (in IVs) tolerated for mild receive-side reordering before a
/// datagram is treated as a replay.
pub const IV_WINDOW: u32 = 1024;

/// Width of the out-of-order bitmap carried in an ACK trailer, fixed at a
/// resolution of the "NACK bitmap width" open question.
pub const NACK_BITMAP_BITS: u32 = 64;

pub const DISCONNECT_RETRY_COUNT: u32 = 3;
pub const DISCONNECT_RETRY_INTERVAL_MS: u64 = 200;

/// Consecutive decrypt/MAC failures on a session before it is forced to `Failed`.
pub const MAX_DECRYPT_FAILURE_STREAK: u32 = 32;

/// Handshake client retry schedule.
pub const HELLO_RETRY_START_MS: u64 = 500;
pub const HELLO_RETRY_CAP_MS: u64 = 4_000;
pub const HELLO_MAX_ATTEMPTS: u32 = 8;

/// Cookie epoch ("bin") width and window: EXPIRE_TIME split into BIN_COUNT bins.
pub const COOKIE_BIN_TIME_MS: i64 = 250;
pub const COOKIE_BIN_COUNT: i64 = 16;
pub const COOKIE_EXPIRE_TIME_MS: i64 = COOKIE_BIN_TIME_MS * COOKIE_BIN_COUNT;

/// Server-side connection map sizing.
pub const HASH_TABLE_SIZE: usize = 32_768;
pub const MAX_POPULATION: usize = HASH_TABLE_SIZE / 2;
pub const CONNECTION_FLOOD_THRESHOLD: u8 = 10;

/// Flow control bandwidth bounds, bytes/sec.
pub const DEFAULT_BANDWIDTH_LOW_BPS: u64 = 10_000;
pub const DEFAULT_BANDWIDTH_HIGH_BPS: u64 = 100_000_000;

/// Flow control additive-increase / multiplicative-decrease thresholds.
pub const FC_RTT_DECREASE_THRESHOLD_MS: i64 = 300;
pub const FC_LOSS_RATE_DECREASE_THRESHOLD: f64 = 0.03;
pub const FC_ADDITIVE_INCREASE_BPS: u64 = 1000;
