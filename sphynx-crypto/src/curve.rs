use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand_core::OsRng;

use crate::error::CryptoError;
use crate::secret::Secret;

/// Wire size of a public key blob.
///
/// Only the first 32 bytes hold the compressed twisted Edwards point; the remaining 32
/// are reserved so a future hybrid post-quantum KEM ciphertext/public-key can ride
/// alongside it without changing the handshake message layout, the same extension point
/// ZSSP's JEDI mode uses to carry an optional Kyber1024 component.
pub const PUBLIC_KEY_SIZE: usize = 64;
pub const SECRET_KEY_SIZE: usize = 32;

/// A static or ephemeral twisted Edwards public point, plus whatever reserved extension
/// bytes accompanied it on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    point: CompressedEdwardsY,
    reserved: [u8; PUBLIC_KEY_SIZE - SECRET_KEY_SIZE],
}

impl PublicKey {
    pub fn from_bytes(raw: &[u8; PUBLIC_KEY_SIZE]) -> Option<Self> {
        let mut point_bytes = [0u8; SECRET_KEY_SIZE];
        point_bytes.copy_from_slice(&raw[..SECRET_KEY_SIZE]);
        let point = CompressedEdwardsY(point_bytes);
        // Reject points that don't decompress or that land in the small-order subgroup;
        // a degenerate point here must never reach the scalar multiply.
        let decompressed = point.decompress()?;
        if decompressed.is_small_order() {
            return None;
        }
        let mut reserved = [0u8; PUBLIC_KEY_SIZE - SECRET_KEY_SIZE];
        reserved.copy_from_slice(&raw[SECRET_KEY_SIZE..]);
        Some(Self { point, reserved })
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out[..SECRET_KEY_SIZE].copy_from_slice(self.point.as_bytes());
        out[SECRET_KEY_SIZE..].copy_from_slice(&self.reserved);
        out
    }

    fn decompressed(&self) -> EdwardsPoint {
        // Validated at construction in from_bytes(), so this cannot fail here.
        self.point.decompress().expect("PublicKey constructed from an invalid point")
    }
}

/// A keypair over the twisted Edwards curve used for both long-term identity keys and
/// per-handshake ephemeral keys.
pub struct KeyPair {
    scalar: Scalar,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the system CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        rand_core::RngCore::try_fill_bytes(&mut OsRng, &mut seed).map_err(|_| CryptoError::RngFailure)?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministically derive a keypair from 32 bytes of seed material (used when
    /// loading a persisted KeyPair.bin).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        // Clamp per standard Edwards curve practice so the scalar always lies in the
        // prime-order subgroup and has a fixed bit length for constant-time ladders.
        let mut clamped = *seed;
        clamped[0] &= 248;
        clamped[31] &= 127;
        clamped[31] |= 64;
        let scalar = Scalar::from_bytes_mod_order(clamped);
        let point = &scalar * &ED25519_BASEPOINT_TABLE;
        Self {
            scalar,
            public: PublicKey {
                point: point.compress(),
                reserved: [0u8; PUBLIC_KEY_SIZE - SECRET_KEY_SIZE],
            },
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_scalar_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.scalar.to_bytes()
    }

    /// Constant-time Diffie-Hellman agreement. Returns `None` (never an error variant
    /// that distinguishes *why*) if the remote point is degenerate, so the handshake can
    /// silently drop without revealing anything to a prober.
    pub fn agree(&self, remote: &PublicKey) -> Option<Secret<32>> {
        let shared_point = self.scalar * remote.decompressed();
        if shared_point.is_small_order() {
            return None;
        }
        Some(Secret::new(shared_point.compress().to_bytes()))
    }
}
