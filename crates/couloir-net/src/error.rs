use couloir_shared::types::UserId;
use thiserror::Error;

/// Transport-level failures on the signaling connection. Recoverable: the
/// caller retries with backoff.
#[derive(Error, Debug)]
pub enum ConnError {
    /// The relay could not be reached.
    #[error("Could not reach signaling server: {0}")]
    ConnectFailed(String),

    /// A send was attempted while the transport is not open. The send was
    /// dropped; nothing was transmitted.
    #[error("Signaling connection is not open")]
    NotConnected,
}

/// A malformed or out-of-order negotiation exchange. These are logged and
/// dropped; they never crash the manager.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Malformed session description: {0}")]
    MalformedDescription(String),

    /// An answer arrived that no outstanding offer matches.
    #[error("Answer does not match any outstanding offer")]
    UnexpectedAnswer,

    /// The referenced offer is unknown to the network.
    #[error("Unknown negotiation token: {0}")]
    UnknownToken(String),

    /// The data channel is closed or was never opened.
    #[error("Data channel is not open")]
    ChannelClosed,
}

/// Failures establishing a peer connection.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The remote identity is on the block list; no entry was created.
    #[error("Peer {0} is blocked")]
    Blocked(UserId),

    #[error("Signaling error: {0}")]
    Signaling(#[from] ConnError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),
}
