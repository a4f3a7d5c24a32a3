//! HELLO/COOKIE/CHALLENGE/ANSWER wire framing, key derivation, and the client-side
//! retry state machine. Server-side validation is exposed as a pure function
//! (`validate_challenge`) rather than a stateful type: per the data model, the server
//! keeps nothing between COOKIE and CHALLENGE, so there is no server handshake object
//! to own, only the cookie jar and the long-term keypair it already has.

use sphynx_crypto::curve::{KeyPair, PublicKey, PUBLIC_KEY_SIZE};
use sphynx_crypto::hash::{hash, keyed_mac};
use sphynx_crypto::random::fill_secure;
use sphynx_crypto::secret::Secret;

use crate::constants::{HELLO_MAX_ATTEMPTS, HELLO_RETRY_CAP_MS, HELLO_RETRY_START_MS, MAGIC, PROTOCOL_VERSION};
use crate::cookie::CookieJar;
use crate::error::HandshakeError;

const SEED_LEN: usize = 32;
const MAC_LEN: usize = 32;

pub const HELLO_LEN: usize = 4 + 2;
pub const COOKIE_LEN: usize = 4 + 4;
pub const CHALLENGE_LEN: usize = 4 + 4 + PUBLIC_KEY_SIZE + SEED_LEN + MAC_LEN;
pub const ANSWER_LEN: usize = SEED_LEN + MAC_LEN;
pub const SERVER_FULL_LEN: usize = 4 + 1;
const SERVER_FULL_MARKER: u8 = 0xFF;

/// Session material a completed handshake hands off so the caller can construct a
/// `Connexion`. `session_key_index` is the non-secret 32-bit lookup key the server's
/// ConnexionMap uses, not a cryptographic secret.
pub struct SessionKeys {
    pub client_to_server: Secret<32>,
    pub server_to_client: Secret<32>,
    pub session_key_index: u32,
}

fn derive_session_keys(shared: &Secret<32>, client_seed: &[u8; SEED_LEN], server_seed: &[u8; SEED_LEN]) -> SessionKeys {
    let master = Secret::new(hash(&[shared.as_bytes(), client_seed, server_seed]));
    let client_to_server = Secret::new(sphynx_crypto::hash::kbkdf(&master, 0x01));
    let server_to_client = Secret::new(sphynx_crypto::hash::kbkdf(&master, 0x02));
    let index_material = sphynx_crypto::hash::kbkdf(&master, 0x03);
    let session_key_index = u32::from_le_bytes(index_material[..4].try_into().unwrap());
    SessionKeys { client_to_server, server_to_client, session_key_index }
}

/// Key used for both the client-challenge and server-response MACs: binding the shared
/// secret to the client's ephemeral public key and seed stops a MAC computed for one
/// handshake attempt from validating a different one.
fn challenge_mac_key(shared: &Secret<32>, client_seed: &[u8; SEED_LEN], client_pub: &PublicKey) -> [u8; 32] {
    hash(&[shared.as_bytes(), client_seed, &client_pub.to_bytes()])
}

pub fn write_hello(out: &mut Vec<u8>) {
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
}

pub fn parse_hello(buf: &[u8]) -> Result<(), HandshakeError> {
    if buf.len() < HELLO_LEN {
        return Err(HandshakeError::TamperedData);
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(HandshakeError::TamperedData);
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if version != PROTOCOL_VERSION {
        return Err(HandshakeError::WrongVersion);
    }
    Ok(())
}

pub fn write_cookie_message(out: &mut Vec<u8>, cookie: u32) {
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&cookie.to_le_bytes());
}

pub fn parse_cookie_message(buf: &[u8]) -> Result<u32, HandshakeError> {
    if buf.len() < COOKIE_LEN || u32::from_le_bytes(buf[0..4].try_into().unwrap()) != MAGIC {
        return Err(HandshakeError::TamperedData);
    }
    Ok(u32::from_le_bytes(buf[4..8].try_into().unwrap()))
}

pub fn write_challenge_message(out: &mut Vec<u8>, cookie: u32, ephemeral_pub: &PublicKey, client_seed: &[u8; SEED_LEN], mac: &[u8; MAC_LEN]) {
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&cookie.to_le_bytes());
    out.extend_from_slice(&ephemeral_pub.to_bytes());
    out.extend_from_slice(client_seed);
    out.extend_from_slice(mac);
}

pub struct ParsedChallenge {
    pub cookie: u32,
    pub ephemeral_pub: PublicKey,
    pub client_seed: [u8; SEED_LEN],
    pub mac: [u8; MAC_LEN],
}

pub fn parse_challenge_message(buf: &[u8]) -> Result<ParsedChallenge, HandshakeError> {
    if buf.len() < CHALLENGE_LEN || u32::from_le_bytes(buf[0..4].try_into().unwrap()) != MAGIC {
        return Err(HandshakeError::TamperedData);
    }
    let cookie = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let mut pub_bytes = [0u8; PUBLIC_KEY_SIZE];
    pub_bytes.copy_from_slice(&buf[8..8 + PUBLIC_KEY_SIZE]);
    let ephemeral_pub = PublicKey::from_bytes(&pub_bytes).ok_or(HandshakeError::TamperedData)?;
    let seed_start = 8 + PUBLIC_KEY_SIZE;
    let mut client_seed = [0u8; SEED_LEN];
    client_seed.copy_from_slice(&buf[seed_start..seed_start + SEED_LEN]);
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&buf[seed_start + SEED_LEN..seed_start + SEED_LEN + MAC_LEN]);
    Ok(ParsedChallenge { cookie, ephemeral_pub, client_seed, mac })
}

pub fn write_answer_message(out: &mut Vec<u8>, server_seed: &[u8; SEED_LEN], mac: &[u8; MAC_LEN]) {
    out.extend_from_slice(server_seed);
    out.extend_from_slice(mac);
}

pub struct ParsedAnswer {
    pub server_seed: [u8; SEED_LEN],
    pub mac: [u8; MAC_LEN],
}

pub fn parse_answer_message(buf: &[u8]) -> Result<ParsedAnswer, HandshakeError> {
    if buf.len() < ANSWER_LEN {
        return Err(HandshakeError::TamperedData);
    }
    let mut server_seed = [0u8; SEED_LEN];
    server_seed.copy_from_slice(&buf[..SEED_LEN]);
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&buf[SEED_LEN..SEED_LEN + MAC_LEN]);
    Ok(ParsedAnswer { server_seed, mac })
}

/// The one handshake failure deliberately revealed on the wire rather than silently
/// dropped: a full ConnexionMap isn't a function of anything the peer sent (cookie, DH
/// share, MAC), so telling a legitimate client to back off or try elsewhere can't leak
/// anything an attacker could use as a validation oracle.
pub fn write_server_full_message(out: &mut Vec<u8>) {
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(SERVER_FULL_MARKER);
}

pub fn is_server_full_message(buf: &[u8]) -> bool {
    buf.len() == SERVER_FULL_LEN
        && u32::from_le_bytes(buf[0..4].try_into().unwrap()) == MAGIC
        && buf[4] == SERVER_FULL_MARKER
}

/// Outcome of a successful CHALLENGE validation: what the server needs to send the
/// ANSWER and construct the `Connexion`, without yet consulting the ConnexionMap or
/// worker assignment (those are `sphynx_server`'s job).
pub struct AcceptedChallenge {
    pub session_keys: SessionKeys,
    pub server_seed: [u8; SEED_LEN],
    pub answer_mac: [u8; MAC_LEN],
}

/// Server-side CHALLENGE validation, in order: cookie freshness,
/// DH agreement, then MAC. Every failure silently drops (returns the same error variant
/// regardless of *why*, so a prober can't use timing or error shape to distinguish a bad
/// cookie from a bad MAC); callers must not branch on the error beyond logging.
pub fn validate_challenge(
    cookie_jar: &CookieJar,
    server_keypair: &KeyPair,
    addr_bytes: &[u8],
    now_ms: i64,
    challenge: &ParsedChallenge,
    oob: &[u8],
) -> Result<AcceptedChallenge, HandshakeError> {
    if !cookie_jar.verify(addr_bytes, now_ms, challenge.cookie) {
        return Err(HandshakeError::TamperedData);
    }
    let shared = server_keypair.agree(&challenge.ephemeral_pub).ok_or(HandshakeError::TamperedData)?;
    let mac_key = challenge_mac_key(&shared, &challenge.client_seed, &challenge.ephemeral_pub);
    let expected_client_mac = keyed_mac(&mac_key, &[b"client-challenge", oob]);
    if !subtle_eq(&expected_client_mac, &challenge.mac) {
        return Err(HandshakeError::TamperedData);
    }

    let mut server_seed = [0u8; SEED_LEN];
    fill_secure(&mut server_seed).map_err(|_| HandshakeError::ServerError)?;
    let answer_mac_full = keyed_mac(&mac_key, &[b"server-response", &server_seed, oob]);
    let mut answer_mac = [0u8; MAC_LEN];
    answer_mac.copy_from_slice(&answer_mac_full[..MAC_LEN]);

    let session_keys = derive_session_keys(&shared, &challenge.client_seed, &server_seed);
    Ok(AcceptedChallenge { session_keys, server_seed, answer_mac })
}

fn subtle_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).unwrap_u8() == 1
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ClientPhase {
    AwaitingCookie,
    AwaitingAnswer,
    Done,
}

/// Client-side handshake driver: owns the ephemeral keypair, the retry/backoff clocks
/// for both round trips, and (once a COOKIE arrives) the challenge MAC key needed to
/// validate the eventual ANSWER.
pub struct ClientHandshake {
    server_pub: PublicKey,
    ephemeral: KeyPair,
    client_seed: [u8; SEED_LEN],
    oob: Vec<u8>,
    phase: ClientPhase,
    attempts: u32,
    last_send_ms: i64,
    mac_key: Option<[u8; 32]>,
    cookie: Option<u32>,
}

impl ClientHandshake {
    pub fn new(server_pub: PublicKey, oob: Vec<u8>, now_ms: i64) -> Result<(Self, Vec<u8>), HandshakeError> {
        let ephemeral = KeyPair::generate().map_err(|_| HandshakeError::ServerError)?;
        let mut client_seed = [0u8; SEED_LEN];
        fill_secure(&mut client_seed).map_err(|_| HandshakeError::ServerError)?;
        let mut hello = Vec::with_capacity(HELLO_LEN);
        write_hello(&mut hello);
        Ok((
            Self {
                server_pub,
                ephemeral,
                client_seed,
                oob,
                phase: ClientPhase::AwaitingCookie,
                attempts: 1,
                last_send_ms: now_ms,
                mac_key: None,
                cookie: None,
            },
            hello,
        ))
    }

    /// Whether the caller should retransmit the current phase's request now, following
    /// the exponential-backoff schedule (500 ms .. 4 s, capped at `HELLO_MAX_ATTEMPTS`).
    pub fn due_for_retry(&self, now_ms: i64) -> Result<bool, HandshakeError> {
        if self.phase == ClientPhase::Done {
            return Ok(false);
        }
        if self.attempts >= HELLO_MAX_ATTEMPTS {
            return Err(HandshakeError::Timeout);
        }
        let backoff = (HELLO_RETRY_START_MS * (1u64 << self.attempts.min(4))).min(HELLO_RETRY_CAP_MS);
        Ok(now_ms - self.last_send_ms >= backoff as i64)
    }

    /// Build the retransmit for whichever message is currently outstanding.
    pub fn retry_message(&mut self, now_ms: i64) -> Vec<u8> {
        self.attempts += 1;
        self.last_send_ms = now_ms;
        match self.phase {
            ClientPhase::AwaitingCookie => {
                let mut hello = Vec::with_capacity(HELLO_LEN);
                write_hello(&mut hello);
                hello
            }
            ClientPhase::AwaitingAnswer => self.build_challenge(),
            ClientPhase::Done => Vec::new(),
        }
    }

    fn build_challenge(&self) -> Vec<u8> {
        let cookie = self.cookie.unwrap_or(0);
        let mac_key = self.mac_key.expect("challenge built before mac key derived");
        let mac_full = keyed_mac(&mac_key, &[b"client-challenge", &self.oob]);
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&mac_full[..MAC_LEN]);
        let mut out = Vec::with_capacity(CHALLENGE_LEN);
        write_challenge_message(&mut out, cookie, self.ephemeral.public(), &self.client_seed, &mac);
        out
    }

    /// Process an incoming COOKIE message and produce the CHALLENGE to send.
    pub fn on_cookie(&mut self, buf: &[u8], now_ms: i64) -> Result<Vec<u8>, HandshakeError> {
        if self.phase != ClientPhase::AwaitingCookie {
            return Err(HandshakeError::TamperedData);
        }
        let cookie = parse_cookie_message(buf)?;
        let shared = self.ephemeral.agree(&self.server_pub).ok_or(HandshakeError::TamperedData)?;
        self.mac_key = Some(challenge_mac_key(&shared, &self.client_seed, self.ephemeral.public()));
        self.cookie = Some(cookie);
        self.phase = ClientPhase::AwaitingAnswer;
        self.attempts = 1;
        self.last_send_ms = now_ms;
        Ok(self.build_challenge())
    }

    /// Process an incoming ANSWER message. On success, the handshake is complete and
    /// the derived session keys are returned for constructing a `Connexion`.
    pub fn on_answer(&mut self, buf: &[u8]) -> Result<SessionKeys, HandshakeError> {
        if self.phase != ClientPhase::AwaitingAnswer {
            return Err(HandshakeError::TamperedData);
        }
        let answer = parse_answer_message(buf)?;
        let mac_key = self.mac_key.ok_or(HandshakeError::TamperedData)?;
        let expected = keyed_mac(&mac_key, &[b"server-response", &answer.server_seed, &self.oob]);
        let mut expected_truncated = [0u8; MAC_LEN];
        expected_truncated.copy_from_slice(&expected[..MAC_LEN]);
        if !subtle_eq(&expected_truncated, &answer.mac) {
            return Err(HandshakeError::TamperedData);
        }
        let shared = self.ephemeral.agree(&self.server_pub).ok_or(HandshakeError::TamperedData)?;
        self.phase = ClientPhase::Done;
        Ok(derive_session_keys(&shared, &self.client_seed, &answer.server_seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip_and_version_check() {
        let mut buf = Vec::new();
        write_hello(&mut buf);
        assert!(parse_hello(&buf).is_ok());
        buf[4] = 0xff;
        assert_eq!(parse_hello(&buf), Err(HandshakeError::WrongVersion));
    }

    #[test]
    fn full_handshake_derives_matching_keys() {
        let server_keypair = KeyPair::generate().unwrap();
        let cookie_jar = CookieJar::new([1u8; 32]);
        let addr = b"198.51.100.1:4000";
        let now = 1_000i64;

        let (mut client, _hello) = ClientHandshake::new(*server_keypair.public(), b"oob".to_vec(), now).unwrap();
        let cookie = cookie_jar.issue(addr, now);
        let mut cookie_msg = Vec::new();
        write_cookie_message(&mut cookie_msg, cookie);

        let challenge_bytes = client.on_cookie(&cookie_msg, now).unwrap();
        let parsed_challenge = parse_challenge_message(&challenge_bytes).unwrap();

        let accepted = validate_challenge(&cookie_jar, &server_keypair, addr, now, &parsed_challenge, b"oob").unwrap();

        let mut answer_bytes = Vec::new();
        write_answer_message(&mut answer_bytes, &accepted.server_seed, &accepted.answer_mac);
        let client_keys = client.on_answer(&answer_bytes).unwrap();

        assert_eq!(client_keys.client_to_server.as_bytes(), accepted.session_keys.client_to_server.as_bytes());
        assert_eq!(client_keys.server_to_client.as_bytes(), accepted.session_keys.server_to_client.as_bytes());
        assert_eq!(client_keys.session_key_index, accepted.session_keys.session_key_index);
    }

    #[test]
    fn server_full_message_is_distinguishable_from_an_answer() {
        let mut buf = Vec::new();
        write_server_full_message(&mut buf);
        assert!(is_server_full_message(&buf));
        assert_eq!(buf.len(), SERVER_FULL_LEN);

        let mut answer = Vec::new();
        write_answer_message(&mut answer, &[0u8; SEED_LEN], &[0u8; MAC_LEN]);
        assert!(!is_server_full_message(&answer));
    }

    #[test]
    fn tampered_challenge_mac_is_rejected() {
        let server_keypair = KeyPair::generate().unwrap();
        let cookie_jar = CookieJar::new([2u8; 32]);
        let addr = b"198.51.100.2:4000";
        let now = 0i64;

        let (mut client, _hello) = ClientHandshake::new(*server_keypair.public(), Vec::new(), now).unwrap();
        let cookie = cookie_jar.issue(addr, now);
        let mut cookie_msg = Vec::new();
        write_cookie_message(&mut cookie_msg, cookie);
        let mut challenge_bytes = client.on_cookie(&cookie_msg, now).unwrap();
        *challenge_bytes.last_mut().unwrap() ^= 1;

        let parsed = parse_challenge_message(&challenge_bytes).unwrap();
        let result = validate_challenge(&cookie_jar, &server_keypair, addr, now, &parsed, &[]);
        assert!(result.is_err());
    }
}
