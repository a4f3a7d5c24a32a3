use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;
use crate::hash::keyed_mac;
use crate::secret::Secret;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 8;
pub const TAG_SIZE: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// One direction of an authenticated stream: a ChaCha20 keystream for confidentiality
/// and a keyed hash (truncated to 64 bits per the wire format) for integrity, combined
/// encrypt-then-MAC. This stands in for whatever authenticated stream cipher a real
/// deployment would swap in; the transport only depends on `seal`/`open` and on the
/// fact that the IV must never repeat for a given key.
pub struct SessionCipher {
    cipher_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl SessionCipher {
    pub fn new(key: &Secret<KEY_SIZE>) -> Self {
        // Deriving independent subkeys for cipher and MAC keeps a MAC-key-recovery bug
        // from also exposing the keystream, and vice versa.
        let cipher_key = blake3::derive_key("sphynx stream cipher key v1", key.as_bytes());
        let mac_key = blake3::derive_key("sphynx stream mac key v1", key.as_bytes());
        Self { cipher_key, mac_key }
    }

    fn nonce(iv: u64) -> [u8; IV_SIZE] {
        iv.to_le_bytes()
    }

    fn tag(&self, iv: u64, aad: &[u8], ciphertext: &[u8]) -> [u8; TAG_SIZE] {
        let nonce = Self::nonce(iv);
        let full = keyed_mac(&self.mac_key, &[&nonce, aad, ciphertext]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&full[..TAG_SIZE]);
        tag
    }

    /// Encrypt `plaintext` in place and return its authentication tag. `iv` must be
    /// strictly greater than every IV previously used with this key in this direction;
    /// the caller (the transport's per-direction send counter) is responsible for that.
    pub fn seal(&self, iv: u64, aad: &[u8], plaintext: &mut [u8]) -> [u8; TAG_SIZE] {
        let tag = self.tag(iv, aad, plaintext);
        let mut c = ChaCha20Legacy::new(&self.cipher_key.into(), &Self::nonce(iv).into());
        c.apply_keystream(plaintext);
        tag
    }

    /// Verify `tag` and decrypt `ciphertext` in place. On authentication failure the
    /// buffer is left untouched and `CryptoError::AuthenticationFailed` is returned;
    /// callers must treat this as a silent drop, not a distinguishable error response.
    pub fn open(&self, iv: u64, aad: &[u8], ciphertext: &mut [u8], tag: &[u8; TAG_SIZE]) -> Result<(), CryptoError> {
        let expected = self.tag(iv, aad, ciphertext);
        if expected.ct_eq(tag).unwrap_u8() != 1 {
            return Err(CryptoError::AuthenticationFailed);
        }
        let mut c = ChaCha20Legacy::new(&self.cipher_key.into(), &Self::nonce(iv).into());
        c.apply_keystream(ciphertext);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = Secret::new([7u8; KEY_SIZE]);
        let cipher = SessionCipher::new(&key);
        let mut buf = b"hello sphynx".to_vec();
        let aad = b"header";
        let tag = cipher.seal(1, aad, &mut buf);
        assert_ne!(buf.as_slice(), b"hello sphynx");
        cipher.open(1, aad, &mut buf, &tag).unwrap();
        assert_eq!(buf.as_slice(), b"hello sphynx");
    }

    #[test]
    fn rejects_tampering() {
        let key = Secret::new([7u8; KEY_SIZE]);
        let cipher = SessionCipher::new(&key);
        let mut buf = b"hello sphynx".to_vec();
        let tag = cipher.seal(1, b"header", &mut buf);
        buf[0] ^= 1;
        assert!(cipher.open(1, b"header", &mut buf, &tag).is_err());
    }

    #[test]
    fn rejects_wrong_iv() {
        let key = Secret::new([7u8; KEY_SIZE]);
        let cipher = SessionCipher::new(&key);
        let mut buf = b"hello sphynx".to_vec();
        let tag = cipher.seal(1, b"header", &mut buf);
        assert!(cipher.open(2, b"header", &mut buf, &tag).is_err());
    }
}
