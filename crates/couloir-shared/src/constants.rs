/// Application name
pub const APP_NAME: &str = "Couloir";

/// ChaCha20-Poly1305 nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (256 bits)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum accepted signaling envelope size in bytes (64 KiB)
pub const MAX_ENVELOPE_SIZE: usize = 65_536;

/// Default relay listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";
