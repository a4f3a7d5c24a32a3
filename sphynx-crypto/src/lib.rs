// Cryptographic collaborators for the Sphynx transport.
//
// Everything in this crate is intentionally replaceable: Sphynx's wire protocol only
// depends on the *shapes* described here (a 256-bit twisted Edwards curve with
// constant-time scalar multiply, a 256-bit-keyed authenticated stream cipher with a
// 64-bit tag and a 64-bit IV, a hash usable as KDF/MAC, and a CSPRNG). None of the
// primitive choices below are part of the transport's contract with the rest of the
// workspace.

pub mod curve;
pub mod error;
pub mod hash;
pub mod random;
pub mod secret;
pub mod stream;

pub use curve::{KeyPair, PublicKey, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
pub use error::CryptoError;
pub use secret::Secret;
pub use stream::{Direction, SessionCipher, IV_SIZE, KEY_SIZE, TAG_SIZE};
