//! The Couloir crypto engine.
//!
//! Two key families exist:
//!
//! - **Transit keys** are one-time symmetric keys derived per message from
//!   an X25519 exchange between a fresh ephemeral key pair and the
//!   recipient's static public key. Compromise of one message's key never
//!   exposes another message.
//! - **Storage keys** are long-lived symmetric keys derived from the user's
//!   passphrase and used to seal individual fields of persisted records.
//!
//! Both derivations collapse their input through a plain BLAKE3 hash. The
//! transit path intentionally does not use a salted KDF so that both sides
//! derive the same key from the raw shared secret alone.
//!
//! Authenticated encryption is ChaCha20-Poly1305: 256-bit key, 96-bit
//! random nonce per call, 128-bit tag.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::constants::{NONCE_SIZE, PUBKEY_SIZE, TAG_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// An X25519 public key, exported as a fixed-length hex encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub(crate) [u8; PUBKEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBKEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::MalformedInput)?;
        if bytes.len() != PUBKEY_SIZE {
            return Err(CryptoError::MalformedInput);
        }
        let mut arr = [0u8; PUBKEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..8])
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An X25519 key pair.
///
/// The private half never leaves this type unencrypted; see
/// [`crate::identity::Identity::export_sealed`] for the at-rest form.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    fn fresh() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// Generate a long-lived static key pair for an identity.
    pub fn generate_static() -> Self {
        Self::fresh()
    }

    /// Generate a single-use ephemeral key pair.
    ///
    /// One is created per sealed transit message and discarded after the
    /// shared secret is derived.
    pub fn generate_ephemeral() -> Self {
        Self::fresh()
    }

    /// Restore a key pair from raw secret bytes (sealed-export path only).
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Raw secret bytes. Callers must only persist these inside an
    /// [`EncryptedField`].
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// The raw output of an X25519 exchange.
///
/// Not a usable key on its own; collapse it with [`derive_transit_key`].
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// X25519 ECDH. Commutative: `derive_shared_secret(a, b.public())` equals
/// `derive_shared_secret(b, a.public())`.
pub fn derive_shared_secret(own: &KeyPair, other: &PublicKey) -> SharedSecret {
    let their = X25519Public::from(other.0);
    SharedSecret(own.secret.diffie_hellman(&their).to_bytes())
}

/// Collapse a raw shared secret into a transit key.
pub fn derive_transit_key(secret: &SharedSecret) -> SymmetricKey {
    *blake3::hash(&secret.0).as_bytes()
}

/// Collapse a passphrase into the at-rest storage key.
///
/// No per-record salt; every record is sealed under the same derived key.
pub fn derive_storage_key(passphrase: &[u8]) -> SymmetricKey {
    *blake3::hash(passphrase).as_bytes()
}

// ---------------------------------------------------------------------------
// Authenticated encryption
// ---------------------------------------------------------------------------

/// One sealed plaintext field: ciphertext, tag, and nonce kept separate so
/// records can carry them as individual JSON members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedField {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
}

/// A sealed transit message. The ephemeral public key must travel with the
/// payload; it is the only way the recipient can rebuild the transit key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedMessage {
    #[serde(flatten)]
    pub field: EncryptedField,
    pub ephemeral_public_key: PublicKey,
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal one plaintext field under a symmetric key.
pub fn seal_field(key: &SymmetricKey, plaintext: &[u8]) -> Result<EncryptedField, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    // AEAD output is ciphertext || tag; split the tag out.
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(EncryptedField {
        ciphertext: sealed,
        auth_tag: tag,
        iv: nonce_bytes.to_vec(),
    })
}

/// Open one sealed field.
///
/// Fails with [`CryptoError::MalformedInput`] if the nonce or tag shape is
/// wrong, and [`CryptoError::AuthenticationFailed`] if the tag does not
/// verify. Never returns altered plaintext.
pub fn open_field(key: &SymmetricKey, field: &EncryptedField) -> Result<Vec<u8>, CryptoError> {
    if field.iv.len() != NONCE_SIZE || field.auth_tag.len() != TAG_SIZE {
        return Err(CryptoError::MalformedInput);
    }

    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(&field.iv);

    let mut sealed = Vec::with_capacity(field.ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(&field.ciphertext);
    sealed.extend_from_slice(&field.auth_tag);

    cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Seal a transit message for a recipient's static public key.
///
/// A fresh ephemeral key pair is generated per call; the one-time transit
/// key is ECDH(ephemeral secret, recipient static public) collapsed through
/// [`derive_transit_key`].
pub fn seal_transit_message(
    recipient_static: &PublicKey,
    plaintext: &[u8],
) -> Result<SealedMessage, CryptoError> {
    let ephemeral = KeyPair::generate_ephemeral();
    let secret = derive_shared_secret(&ephemeral, recipient_static);
    let key = derive_transit_key(&secret);

    let field = seal_field(&key, plaintext)?;
    Ok(SealedMessage {
        field,
        ephemeral_public_key: ephemeral.public(),
    })
}

/// Mirror of [`seal_transit_message`]: the recipient rebuilds the transit
/// key as ECDH(own static secret, sender ephemeral public).
pub fn open_transit_message(
    own_static: &KeyPair,
    sealed: &SealedMessage,
) -> Result<Vec<u8>, CryptoError> {
    let secret = derive_shared_secret(own_static, &sealed.ephemeral_public_key);
    let key = derive_transit_key(&secret);
    open_field(&key, &sealed.field)
}

pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
