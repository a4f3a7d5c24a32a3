use crate::secret::Secret;

/// Plain (unkeyed) hash used to fold several byte strings together, e.g. computing a
/// cookie or a public key fingerprint. Grounded on the same "hash several fields into
/// one 256-bit digest" role SHA384/SHA512 play in ZSSP's KBKDF and challenge MACs.
pub fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    for p in parts {
        h.update(p);
    }
    *h.finalize().as_bytes()
}

/// Keyed hash used as a MAC: the handshake challenge/response authenticators and the
/// per-packet header-check code.
pub fn keyed_mac(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut h = blake3::Hasher::new_keyed(key);
    for p in parts {
        h.update(p);
    }
    *h.finalize().as_bytes()
}

/// NIST-KBKDF-style subkey derivation: one master secret plus a single-byte usage label
/// fans out into as many independent subkeys as the caller needs, mirroring ZSSP's
/// `kbkdf512` split into per-direction cipher keys, header-check key, and ratchet input.
pub fn kbkdf(master: &Secret<32>, usage_label: u8) -> [u8; 32] {
    let context = format!("sphynx session key derivation v1 / usage {:#04x}", usage_label);
    blake3::derive_key(&context, master.as_bytes())
}
