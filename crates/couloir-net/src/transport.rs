//! The peer transport seam.
//!
//! [`PeerTransport`] models a negotiated bidirectional data channel the way
//! the connection manager consumes one: the local side produces an offer,
//! the remote side turns it into an answer, candidates trickle both ways,
//! and at some later point the channel reports open and starts carrying
//! payloads.
//!
//! Events (`open`, inbound `message`, locally gathered `candidate`) are
//! delivered synchronously on whatever thread drives the transport; event
//! handlers must not re-enter the same transport from inside a callback.
//!
//! [`LoopbackNetwork`] is the in-process implementation used by tests: it
//! links endpoints through the same offer/answer/candidate choreography a
//! real transport performs, with tokens standing in for session
//! descriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::error::NegotiationError;

/// Callbacks a transport fires as negotiation progresses.
pub struct TransportEvents {
    /// The data channel opened; payloads can flow.
    pub on_open: Box<dyn Fn() + Send + Sync>,
    /// An inbound payload arrived on the data channel.
    pub on_message: Box<dyn Fn(Vec<u8>) + Send + Sync>,
    /// A locally gathered candidate to forward to the remote side.
    pub on_candidate: Box<dyn Fn(String) + Send + Sync>,
}

/// One negotiated transport endpoint.
pub trait PeerTransport: Send {
    /// Produce the local session description to send to the remote side.
    fn create_offer(&mut self) -> Result<String, NegotiationError>;

    /// Consume a remote offer and produce the answering description.
    fn handle_offer(&mut self, sdp: &str) -> Result<String, NegotiationError>;

    /// Apply the remote answer to our outstanding offer.
    fn handle_answer(&mut self, sdp: &str) -> Result<(), NegotiationError>;

    /// Apply a candidate gathered by the remote side.
    fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), NegotiationError>;

    /// Transmit a payload over the open data channel.
    fn send(&mut self, payload: &[u8]) -> Result<(), NegotiationError>;

    /// Tear the transport down. Safe to call at any point; later calls on
    /// this endpoint fail with [`NegotiationError::ChannelClosed`].
    fn close(&mut self);
}

/// Builds unconnected transport endpoints for the connection manager.
pub trait TransportFactory: Send + Sync {
    fn create(&self, events: TransportEvents) -> Box<dyn PeerTransport>;
}

// ---------------------------------------------------------------------------
// Loopback implementation
// ---------------------------------------------------------------------------

struct Endpoint {
    events: TransportEvents,
    peer: Mutex<Option<Weak<Endpoint>>>,
    open: AtomicBool,
    closed: AtomicBool,
    remote_candidates: Mutex<Vec<String>>,
}

impl Endpoint {
    fn new(events: TransportEvents) -> Arc<Self> {
        Arc::new(Self {
            events,
            peer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_candidates: Mutex::new(Vec::new()),
        })
    }

    fn linked_peer(&self) -> Option<Arc<Endpoint>> {
        self.peer.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

/// In-process transport network. Clone it and hand the same instance to
/// every endpoint that should be able to reach the others.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    pending: Arc<Mutex<HashMap<String, Arc<Endpoint>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportFactory for LoopbackNetwork {
    fn create(&self, events: TransportEvents) -> Box<dyn PeerTransport> {
        Box::new(LoopbackTransport {
            endpoint: Endpoint::new(events),
            network: self.clone(),
            offer_token: None,
        })
    }
}

pub struct LoopbackTransport {
    endpoint: Arc<Endpoint>,
    network: LoopbackNetwork,
    offer_token: Option<String>,
}

impl LoopbackTransport {
    /// Remote candidates applied to this endpoint so far.
    pub fn remote_candidates(&self) -> Vec<String> {
        self.endpoint.remote_candidates.lock().unwrap().clone()
    }
}

const OFFER_PREFIX: &str = "loopback-offer ";
const ANSWER_PREFIX: &str = "loopback-answer ";

impl PeerTransport for LoopbackTransport {
    fn create_offer(&mut self) -> Result<String, NegotiationError> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::ChannelClosed);
        }

        let token = Uuid::new_v4().to_string();
        self.network
            .pending
            .lock()
            .unwrap()
            .insert(token.clone(), Arc::clone(&self.endpoint));
        self.offer_token = Some(token.clone());

        Ok(format!("{OFFER_PREFIX}{token}"))
    }

    fn handle_offer(&mut self, sdp: &str) -> Result<String, NegotiationError> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::ChannelClosed);
        }

        let token = sdp
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| NegotiationError::MalformedDescription(sdp.to_string()))?;

        let remote = self
            .network
            .pending
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| NegotiationError::UnknownToken(token.to_string()))?;

        // Wire both directions; the channel stays closed until the answer
        // lands back at the offerer.
        *self.endpoint.peer.lock().unwrap() = Some(Arc::downgrade(&remote));
        *remote.peer.lock().unwrap() = Some(Arc::downgrade(&self.endpoint));

        (self.endpoint.events.on_candidate)(format!("loopback-candidate {token}"));

        Ok(format!("{ANSWER_PREFIX}{token}"))
    }

    fn handle_answer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::ChannelClosed);
        }

        let token = sdp
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| NegotiationError::MalformedDescription(sdp.to_string()))?;

        if self.offer_token.as_deref() != Some(token) {
            return Err(NegotiationError::UnexpectedAnswer);
        }

        let peer = self
            .endpoint
            .linked_peer()
            .ok_or(NegotiationError::UnexpectedAnswer)?;

        self.network.pending.lock().unwrap().remove(token);

        (self.endpoint.events.on_candidate)(format!("loopback-candidate {token}"));

        // Both directions are wired; open the channel on each side.
        self.endpoint.open.store(true, Ordering::SeqCst);
        (self.endpoint.events.on_open)();

        peer.open.store(true, Ordering::SeqCst);
        (peer.events.on_open)();

        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), NegotiationError> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::ChannelClosed);
        }
        self.endpoint
            .remote_candidates
            .lock()
            .unwrap()
            .push(candidate.to_string());
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), NegotiationError> {
        if self.endpoint.closed.load(Ordering::SeqCst)
            || !self.endpoint.open.load(Ordering::SeqCst)
        {
            return Err(NegotiationError::ChannelClosed);
        }

        let peer = self
            .endpoint
            .linked_peer()
            .ok_or(NegotiationError::ChannelClosed)?;
        if peer.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::ChannelClosed);
        }

        (peer.events.on_message)(payload.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.endpoint.closed.store(true, Ordering::SeqCst);
        self.endpoint.open.store(false, Ordering::SeqCst);
        *self.endpoint.peer.lock().unwrap() = None;

        if let Some(token) = self.offer_token.take() {
            self.network.pending.lock().unwrap().remove(&token);
        }
    }
}
