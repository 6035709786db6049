//! # couloir-net
//!
//! Client-side networking for Couloir:
//!
//! - [`channel::SignalingChannel`] — a typed wrapper over one persistent
//!   WebSocket connection to the signaling relay, with per-envelope-type
//!   handler dispatch.
//! - [`manager::PeerConnectionManager`] — the per-remote-identity
//!   connection table and negotiation state machine, at most one transport
//!   per remote id.
//! - [`transport`] — the seam between the manager and whatever negotiated
//!   transport carries the data channel, plus an in-process loopback
//!   implementation.
//!
//! Payload confidentiality is the caller's job: seal application payloads
//! with `couloir_shared::crypto` before handing them to the manager.

pub mod channel;
pub mod manager;
pub mod transport;

mod error;

pub use channel::{HandlerId, SignalingChannel};
pub use error::{ConnError, NegotiationError, PeerError};
pub use manager::{PeerConnectionManager, PeerState, SignalSender};
pub use transport::{LoopbackNetwork, PeerTransport, TransportEvents, TransportFactory};
