//! Key exchange for msgpak sessions.
//!
//! The exchange runs once per connection, right after the credential
//! preamble, as two envelopes composed with the long-lived key alone:
//!
//! ```text
//! server -> client  <KX:OFFER>  "x25519:" + b64(server_pub)
//! client -> server  <KX:REPLY>  seal(b64(client_pub) + ":" + b64(confirm), kx_key(server_pub))
//! ```
//!
//! Both sides derive `secret = HKDF-SHA256(dh, salt = server_pub || client_pub)`
//! and `confirm = SHA-512(secret_hex || server_pub || client_pub)`. The server
//! only completes when the confirmation matches its own computation.
//!
//! [`Handshake`] is a pure state machine: it never touches the socket, so it
//! can be driven with canned messages.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use msgpak_wire::crypto::{open_text, seal_text};
use msgpak_wire::{compose, parse, EnvelopeKeys, ProtocolCommand};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::HandshakeError;

/// Per-connection shared secret, hex encoded, wiped on drop
pub type SharedSecret = Zeroizing<String>;

const SESSION_KDF_INFO: &[u8] = b"msgpak/session/v1";

/// Key agreement groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxGroup {
    /// Curve25519 Diffie-Hellman
    X25519,
}

impl KxGroup {
    /// Identifier carried in the offer
    pub fn id(&self) -> &'static str {
        match self {
            KxGroup::X25519 => "x25519",
        }
    }

    /// Look up a group by identifier
    pub fn from_id(id: &str) -> Option<Self> {
        HIGH_STRENGTH_GROUPS.iter().copied().find(|g| g.id() == id)
    }
}

impl fmt::Display for KxGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Groups a server may offer
pub const HIGH_STRENGTH_GROUPS: &[KxGroup] = &[KxGroup::X25519];

/// Keys and limits the exchange runs with
#[derive(Clone)]
pub struct HandshakeKeys {
    /// Long-lived operator key
    pub long_lived: String,
    /// Envelope size cap
    pub max_message_size: usize,
}

/// Outcome of feeding a peer message into the state machine
pub enum HandshakeStep {
    /// Client side: send `blob`; the secret is final
    Reply {
        /// `<KX:REPLY>` envelope
        blob: String,
        /// Derived shared secret
        secret: SharedSecret,
    },
    /// Server side: exchange confirmed
    Complete {
        /// Derived shared secret
        secret: SharedSecret,
    },
}

enum State {
    ServerAwaitingReply {
        group: KxGroup,
        private: EphemeralSecret,
        public: PublicKey,
    },
    ClientAwaitingOffer,
    Done,
}

/// Key exchange state machine for one connection
pub struct Handshake {
    keys: HandshakeKeys,
    state: State,
}

impl Handshake {
    /// Start as server: pick a group, generate a key pair and produce the offer
    pub fn begin_as_server(keys: HandshakeKeys) -> Result<(Self, String), HandshakeError> {
        let group = *HIGH_STRENGTH_GROUPS
            .choose(&mut OsRng)
            .ok_or_else(|| HandshakeError::ComputeFailed("no key exchange group".into()))?;

        let private = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&private);

        let payload = format!("{}:{}", group.id(), STANDARD.encode(public.as_bytes()));
        let offer = compose(
            ProtocolCommand::KxOffer.as_str(),
            &payload,
            &EnvelopeKeys::pre_handshake(&keys.long_lived),
            keys.max_message_size,
        )
        .map_err(|e| HandshakeError::ComputeFailed(format!("offer: {}", e)))?;

        debug!("Key exchange offer prepared ({})", group);
        Ok((
            Self {
                keys,
                state: State::ServerAwaitingReply {
                    group,
                    private,
                    public,
                },
            },
            offer,
        ))
    }

    /// Start as client: wait for the server's offer
    pub fn begin_as_client(keys: HandshakeKeys) -> Self {
        Self {
            keys,
            state: State::ClientAwaitingOffer,
        }
    }

    /// Feed one peer envelope blob
    pub fn supply_peer_message(&mut self, blob: &str) -> Result<HandshakeStep, HandshakeError> {
        let keys = EnvelopeKeys::pre_handshake(&self.keys.long_lived);
        let envelope = parse(blob, &keys, self.keys.max_message_size)
            .map_err(|e| HandshakeError::Rejected(format!("invalid envelope: {}", e)))?;
        let cmd = ProtocolCommand::parse(&envelope.cmd);

        match std::mem::replace(&mut self.state, State::Done) {
            State::ClientAwaitingOffer => {
                if cmd != Some(ProtocolCommand::KxOffer) {
                    return Err(HandshakeError::Rejected(format!(
                        "expected {}, got {}",
                        ProtocolCommand::KxOffer,
                        envelope.cmd
                    )));
                }
                self.client_reply(&envelope.data)
            }
            State::ServerAwaitingReply {
                group,
                private,
                public,
            } => {
                if cmd != Some(ProtocolCommand::KxReply) {
                    return Err(HandshakeError::Rejected(format!(
                        "expected {}, got {}",
                        ProtocolCommand::KxReply,
                        envelope.cmd
                    )));
                }
                self.server_complete(group, private, public, &envelope.data)
            }
            State::Done => Err(HandshakeError::Rejected(format!(
                "handshake already finished, got {}",
                envelope.cmd
            ))),
        }
    }

    fn client_reply(&self, offer: &str) -> Result<HandshakeStep, HandshakeError> {
        let (group_id, server_pub_b64) = offer
            .split_once(':')
            .ok_or_else(|| HandshakeError::ComputeFailed("malformed offer".into()))?;
        let group = KxGroup::from_id(group_id).ok_or_else(|| {
            HandshakeError::ComputeFailed(format!("unsupported group {}", group_id))
        })?;
        let server_pub = decode_public(server_pub_b64, "server public key")?;

        let private = EphemeralSecret::random_from_rng(OsRng);
        let client_pub = PublicKey::from(&private);
        let dh = private.diffie_hellman(&server_pub);
        if !dh.was_contributory() {
            return Err(HandshakeError::ComputeFailed("degenerate key agreement".into()));
        }

        let secret = derive_secret(dh.as_bytes(), &server_pub, &client_pub)?;
        let confirm = confirmation(&secret, &server_pub, &client_pub);

        let body = format!(
            "{}:{}",
            STANDARD.encode(client_pub.as_bytes()),
            STANDARD.encode(confirm)
        );
        let sealed = seal_text(&body, &self.kx_key(&server_pub))
            .map_err(|e| HandshakeError::ComputeFailed(format!("reply: {}", e)))?;
        let blob = compose(
            ProtocolCommand::KxReply.as_str(),
            &sealed,
            &EnvelopeKeys::pre_handshake(&self.keys.long_lived),
            self.keys.max_message_size,
        )
        .map_err(|e| HandshakeError::ComputeFailed(format!("reply: {}", e)))?;

        debug!("Key exchange reply prepared ({})", group);
        Ok(HandshakeStep::Reply { blob, secret })
    }

    fn server_complete(
        &self,
        group: KxGroup,
        private: EphemeralSecret,
        public: PublicKey,
        reply: &str,
    ) -> Result<HandshakeStep, HandshakeError> {
        let body = open_text(reply, &self.kx_key(&public))
            .map(Zeroizing::new)
            .ok_or_else(|| HandshakeError::ComputeFailed("reply cannot be decrypted".into()))?;

        let (client_pub_b64, confirm_b64) = body
            .split_once(':')
            .ok_or_else(|| HandshakeError::ComputeFailed("malformed reply".into()))?;
        if client_pub_b64.is_empty() || confirm_b64.is_empty() {
            return Err(HandshakeError::ComputeFailed("empty reply field".into()));
        }
        let client_pub = decode_public(client_pub_b64, "client public key")?;
        let received = STANDARD
            .decode(confirm_b64)
            .map_err(|_| HandshakeError::ComputeFailed("malformed exchange value".into()))?;

        let dh = private.diffie_hellman(&client_pub);
        if !dh.was_contributory() {
            return Err(HandshakeError::ComputeFailed("degenerate key agreement".into()));
        }

        let secret = derive_secret(dh.as_bytes(), &public, &client_pub)?;
        let expected = confirmation(&secret, &public, &client_pub);
        if !bool::from(expected.as_slice().ct_eq(received.as_slice())) {
            return Err(HandshakeError::ComputeFailed("exchange value mismatch".into()));
        }

        debug!("Key exchange confirmed ({})", group);
        Ok(HandshakeStep::Complete { secret })
    }

    fn kx_key(&self, server_pub: &PublicKey) -> String {
        format!(
            "{}:{}",
            self.keys.long_lived,
            STANDARD.encode(server_pub.as_bytes())
        )
    }
}

fn decode_public(b64: &str, what: &str) -> Result<PublicKey, HandshakeError> {
    let raw = STANDARD
        .decode(b64.trim())
        .map_err(|_| HandshakeError::ComputeFailed(format!("malformed {}", what)))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| HandshakeError::ComputeFailed(format!("bad {} length", what)))?;
    Ok(PublicKey::from(bytes))
}

fn derive_secret(
    dh: &[u8; 32],
    server_pub: &PublicKey,
    client_pub: &PublicKey,
) -> Result<SharedSecret, HandshakeError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(server_pub.as_bytes());
    salt[32..].copy_from_slice(client_pub.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), dh);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(SESSION_KDF_INFO, okm.as_mut())
        .map_err(|_| HandshakeError::ComputeFailed("key derivation".into()))?;

    Ok(Zeroizing::new(hex::encode(&okm[..])))
}

fn confirmation(secret: &str, server_pub: &PublicKey, client_pub: &PublicKey) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(secret.as_bytes());
    hasher.update(server_pub.as_bytes());
    hasher.update(client_pub.as_bytes());
    hasher.finalize().to_vec()
}
