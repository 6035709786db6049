use thiserror::Error;

/// Errors from the crypto engine.
///
/// Authentication failures are always surfaced to the caller; a field that
/// fails to decrypt must never be silently replaced with empty or garbage
/// plaintext.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// The underlying AEAD primitive failed to encrypt.
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The authentication tag did not verify: wrong key, corrupted
    /// ciphertext, or tampering.
    #[error("Authentication failed: wrong key or tampered ciphertext")]
    AuthenticationFailed,

    /// The nonce, tag, or key material is not well-formed.
    #[error("Malformed cryptographic input")]
    MalformedInput,
}

/// Errors around identity import/export.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Key bytes could not be parsed.
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    /// An imported private key does not match the stored public key.
    #[error("Private key does not match the stored public key")]
    KeyMismatch,

    /// The sealed private key could not be opened.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
