use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use rand_core::{OsRng, RngCore};

use crate::error::CryptoError;

/// Fill a buffer with cryptographically secure random bytes (ephemeral keys, session
/// IDs, cookie secrets, nonces for anything that must not be predictable).
pub fn fill_secure(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng.try_fill_bytes(buf).map_err(|_| CryptoError::RngFailure)
}

pub fn next_u64_secure() -> u64 {
    OsRng.next_u64()
}

pub fn next_u32_secure() -> u32 {
    OsRng.next_u32()
}

thread_local! {
    static XORSHIFT_STATE: Cell<u64> = Cell::new(0);
}

static XORSHIFT_SEED_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Fast, non-cryptographic PRNG for jitter, retry backoff scatter, and sample indices
/// where unpredictability matters far less than not touching the CSPRNG on a hot path.
/// Never use this for keys, cookies, or anything security-relevant.
pub fn xorshift64_random() -> u64 {
    XORSHIFT_STATE.with(|cell| {
        let mut x = cell.get();
        if x == 0 {
            // Mix in a process-wide counter and the true RNG once per thread so
            // different threads don't produce identical jitter sequences.
            x = next_u64_secure() ^ XORSHIFT_SEED_COUNTER.fetch_add(0x9E3779B97F4A7C15, Ordering::Relaxed);
            if x == 0 {
                x = 0xDEAD_BEEF_CAFE_F00D;
            }
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        cell.set(x);
        x
    })
}
