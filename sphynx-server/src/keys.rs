//! On-disk persistence for the server's long-term keypair and a peer's public key,
//! mirroring the original's flat `KeyPair.bin` / `PublicKey.bin` files.
//!
//! The secret material in a twisted Edwards keypair is a 32-byte scalar seed, not the
//! full 64-byte `PublicKey` wire shape, so `KeyPair.bin` here is 32 (seed) + 64
//! (public key) = 96 bytes rather than two 64-byte halves; see DESIGN.md for the
//! reasoning. `PublicKey.bin` is the public key's own 64-byte wire form, unchanged.

use std::path::Path;

use sphynx_crypto::curve::{KeyPair, PublicKey, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};

use crate::error::KeyFileError;

const KEYPAIR_FILE_SIZE: usize = SECRET_KEY_SIZE + PUBLIC_KEY_SIZE;

pub struct KeyFile;

impl KeyFile {
    pub fn generate_and_save(path: &Path) -> Result<KeyPair, KeyFileError> {
        let keypair = KeyPair::generate().map_err(|_| KeyFileError::InvalidKey)?;
        Self::save(path, &keypair)?;
        Ok(keypair)
    }

    pub fn save(path: &Path, keypair: &KeyPair) -> Result<(), KeyFileError> {
        let mut bytes = Vec::with_capacity(KEYPAIR_FILE_SIZE);
        bytes.extend_from_slice(&keypair.secret_scalar_bytes());
        bytes.extend_from_slice(&keypair.public().to_bytes());
        std::fs::write(path, bytes).map_err(|_| KeyFileError::Io)
    }

    pub fn load(path: &Path) -> Result<KeyPair, KeyFileError> {
        let bytes = std::fs::read(path).map_err(|_| KeyFileError::Io)?;
        if bytes.len() != KEYPAIR_FILE_SIZE {
            return Err(KeyFileError::WrongSize);
        }
        let mut seed = [0u8; SECRET_KEY_SIZE];
        seed.copy_from_slice(&bytes[..SECRET_KEY_SIZE]);
        let keypair = KeyPair::from_seed(&seed);

        let mut expected_pub = [0u8; PUBLIC_KEY_SIZE];
        expected_pub.copy_from_slice(&bytes[SECRET_KEY_SIZE..]);
        if keypair.public().to_bytes() != expected_pub {
            return Err(KeyFileError::InvalidKey);
        }
        Ok(keypair)
    }

    pub fn save_public(path: &Path, public: &PublicKey) -> Result<(), KeyFileError> {
        std::fs::write(path, public.to_bytes()).map_err(|_| KeyFileError::Io)
    }

    pub fn load_public(path: &Path) -> Result<PublicKey, KeyFileError> {
        let bytes = std::fs::read(path).map_err(|_| KeyFileError::Io)?;
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(KeyFileError::WrongSize);
        }
        let mut raw = [0u8; PUBLIC_KEY_SIZE];
        raw.copy_from_slice(&bytes);
        PublicKey::from_bytes(&raw).ok_or(KeyFileError::InvalidKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("sphynx-keyfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("KeyPair.bin");

        let keypair = KeyFile::generate_and_save(&path).unwrap();
        let loaded = KeyFile::load(&path).unwrap();
        assert_eq!(loaded.public().to_bytes(), keypair.public().to_bytes());

        let pub_path = dir.join("PublicKey.bin");
        KeyFile::save_public(&pub_path, keypair.public()).unwrap();
        let loaded_pub = KeyFile::load_public(&pub_path).unwrap();
        assert_eq!(loaded_pub.to_bytes(), keypair.public().to_bytes());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn wrong_size_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("sphynx-keyfile-test-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("KeyPair.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert_eq!(KeyFile::load(&path).unwrap_err(), KeyFileError::WrongSize);
        std::fs::remove_dir_all(&dir).ok();
    }
}
