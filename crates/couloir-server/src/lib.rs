//! # couloir-server
//!
//! The Couloir signaling relay: a WebSocket rendezvous point that tracks
//! connected identities and forwards opaque envelopes between them. It
//! never decrypts payloads and is not a security boundary; all
//! confidentiality comes from the crypto layer on the clients.

pub mod config;
pub mod relay;

pub use config::RelayConfig;
pub use relay::{spawn_relay, RelayError};
