//! Per-remote-identity connection management.
//!
//! [`PeerConnectionManager`] owns the connection table: at most one
//! transport per remote identity, keyed by id, insert-if-absent. All
//! mutation goes through the manager's own methods; external code only
//! reads state through accessors. That single-writer discipline is what
//! keeps the one-connection-per-peer invariant intact under concurrent
//! inbound signaling.
//!
//! Lifecycle per remote id:
//!
//! ```text
//! absent ──connect_to_peer/handle_remote_offer──> Negotiating
//! Negotiating ──data channel open──> Ready
//! Negotiating | Ready ──close──> Closed (entry removed, terminal)
//! ```
//!
//! Every entry carries an epoch; callbacks scheduled by the transport
//! capture the epoch at creation and are ignored if the entry has been
//! closed or replaced since. Closing is therefore safe at any point in the
//! state machine, including mid-negotiation.
//!
//! The manager exposes state, not timers: bounding how long `Negotiating`
//! may persist is the caller's job, as is any queue-and-retry for sends to
//! connections that are not ready yet.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use couloir_shared::envelope::{Envelope, EnvelopeKind};
use couloir_shared::types::{PeerEntry, UserId};

use crate::channel::SignalingChannel;
use crate::error::{ConnError, PeerError};
use crate::transport::{PeerTransport, TransportEvents, TransportFactory};

/// Outbound half of the negotiation exchange. [`SignalingChannel`]
/// implements it; tests substitute their own routing.
pub trait SignalSender: Send + Sync {
    fn send_offer(&self, target: &UserId, sdp: String) -> Result<(), ConnError>;
    fn send_answer(&self, target: &UserId, sdp: String) -> Result<(), ConnError>;
    fn send_candidate(&self, target: &UserId, candidate: String) -> Result<(), ConnError>;
}

impl SignalSender for SignalingChannel {
    fn send_offer(&self, target: &UserId, sdp: String) -> Result<(), ConnError> {
        SignalingChannel::send_offer(self, target, sdp)
    }

    fn send_answer(&self, target: &UserId, sdp: String) -> Result<(), ConnError> {
        SignalingChannel::send_answer(self, target, sdp)
    }

    fn send_candidate(&self, target: &UserId, candidate: String) -> Result<(), ConnError> {
        SignalingChannel::send_candidate(self, target, candidate)
    }
}

/// Connection state for one remote id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Offer sent or received; answer and candidates in flight.
    Negotiating,
    /// Data channel open; payloads flow.
    Ready,
    /// Torn down. Terminal for the entry; a fresh connect creates a new one.
    Closed,
}

type MessageHandler = Arc<dyn Fn(&UserId, &[u8]) + Send + Sync>;

struct ConnectionEntry {
    epoch: u64,
    state: PeerState,
    transport: Arc<Mutex<Box<dyn PeerTransport>>>,
    on_message: Option<MessageHandler>,
}

struct ManagerShared {
    factory: Arc<dyn TransportFactory>,
    entries: Mutex<HashMap<UserId, ConnectionEntry>>,
    blocklist: Mutex<HashSet<UserId>>,
    next_epoch: AtomicU64,
}

/// The connection table owner. Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct PeerConnectionManager {
    shared: Arc<ManagerShared>,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                factory,
                entries: Mutex::new(HashMap::new()),
                blocklist: Mutex::new(HashSet::new()),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Start (or return the existing) connection to a peer.
    ///
    /// Idempotent: if an entry already exists for this remote id it is
    /// returned unchanged. Blocked peers are refused outright and no entry
    /// is created. Otherwise a transport is constructed, the local offer
    /// and gathered candidates go out through `signals`, and the entry
    /// flips to [`PeerState::Ready`] when the data channel opens.
    pub fn connect_to_peer(
        &self,
        peer: &PeerEntry,
        signals: Arc<dyn SignalSender>,
    ) -> Result<PeerState, PeerError> {
        let remote = &peer.id;

        if self.is_blocked(remote) {
            warn!(peer = %remote, "refusing connection to blocked peer");
            return Err(PeerError::Blocked(remote.clone()));
        }

        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(Mutex::new(self.build_transport(
            remote.clone(),
            epoch,
            Arc::clone(&signals),
        )));

        {
            let mut entries = self.shared.entries.lock().unwrap();
            if let Some(existing) = entries.get(remote) {
                debug!(peer = %remote, state = ?existing.state, "connection entry already exists");
                return Ok(existing.state);
            }
            entries.insert(
                remote.clone(),
                ConnectionEntry {
                    epoch,
                    state: PeerState::Negotiating,
                    transport: Arc::clone(&transport),
                    on_message: None,
                },
            );
        }

        info!(peer = %remote, "negotiating new peer connection");

        // Bind the result first so the transport guard is released before
        // drop_entry re-locks it on the failure path.
        let offered = transport.lock().unwrap().create_offer();
        let offer = match offered {
            Ok(offer) => offer,
            Err(e) => {
                self.drop_entry(remote, epoch);
                return Err(e.into());
            }
        };

        if let Err(e) = signals.send_offer(remote, offer) {
            self.drop_entry(remote, epoch);
            return Err(e.into());
        }

        Ok(PeerState::Negotiating)
    }

    /// Consume a remote offer: build the answering transport and send the
    /// answer back. Duplicate offers for an existing entry are ignored.
    pub fn handle_remote_offer(&self, from: &UserId, sdp: &str, signals: Arc<dyn SignalSender>) {
        if self.is_blocked(from) {
            debug!(peer = %from, "ignoring offer from blocked peer");
            return;
        }

        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(Mutex::new(self.build_transport(
            from.clone(),
            epoch,
            Arc::clone(&signals),
        )));

        {
            let mut entries = self.shared.entries.lock().unwrap();
            if entries.contains_key(from) {
                debug!(peer = %from, "duplicate offer for existing connection, ignoring");
                return;
            }
            entries.insert(
                from.clone(),
                ConnectionEntry {
                    epoch,
                    state: PeerState::Negotiating,
                    transport: Arc::clone(&transport),
                    on_message: None,
                },
            );
        }

        info!(peer = %from, "answering inbound peer connection");

        // Bind the result first so the transport guard is released before
        // drop_entry re-locks it on the failure path.
        let answered = transport.lock().unwrap().handle_offer(sdp);
        let answer = match answered {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer = %from, error = %e, "rejecting bad offer");
                self.drop_entry(from, epoch);
                return;
            }
        };

        if let Err(e) = signals.send_answer(from, answer) {
            warn!(peer = %from, error = %e, "failed to send answer");
            self.drop_entry(from, epoch);
        }
    }

    /// Apply a remote answer to the outstanding offer for `from`. Stale or
    /// unknown answers are dropped; they never resurrect a closed entry.
    pub fn handle_remote_answer(&self, from: &UserId, sdp: &str) {
        let transport = {
            let entries = self.shared.entries.lock().unwrap();
            match entries.get(from) {
                Some(entry) if entry.state == PeerState::Negotiating => {
                    Arc::clone(&entry.transport)
                }
                Some(entry) => {
                    debug!(peer = %from, state = ?entry.state, "answer for settled connection, ignoring");
                    return;
                }
                None => {
                    debug!(peer = %from, "answer for unknown peer, ignoring");
                    return;
                }
            }
        };

        let result = transport.lock().unwrap().handle_answer(sdp);
        if let Err(e) = result {
            warn!(peer = %from, error = %e, "failed to apply remote answer");
        }
    }

    /// Apply a remote candidate for `from`. Unknown peers are ignored.
    pub fn handle_remote_candidate(&self, from: &UserId, candidate: &str) {
        let transport = {
            let entries = self.shared.entries.lock().unwrap();
            match entries.get(from) {
                Some(entry) => Arc::clone(&entry.transport),
                None => {
                    debug!(peer = %from, "candidate for unknown peer, ignoring");
                    return;
                }
            }
        };

        let result = transport.lock().unwrap().add_ice_candidate(candidate);
        if let Err(e) = result {
            debug!(peer = %from, error = %e, "failed to apply remote candidate");
        }
    }

    /// Register the channel handlers that route negotiation envelopes from
    /// a [`SignalingChannel`] into this manager.
    pub fn attach(&self, channel: &SignalingChannel) {
        let signals: Arc<dyn SignalSender> = Arc::new(channel.clone());

        let manager = self.clone();
        let s = Arc::clone(&signals);
        channel.on(EnvelopeKind::Offer, move |env| {
            if let Envelope::Offer {
                from: Some(from),
                payload,
                ..
            } = env
            {
                if let Some(sdp) = &payload.sdp {
                    manager.handle_remote_offer(from, sdp, Arc::clone(&s));
                }
            }
        });

        let manager = self.clone();
        channel.on(EnvelopeKind::Answer, move |env| {
            if let Envelope::Answer {
                from: Some(from),
                payload,
                ..
            } = env
            {
                if let Some(sdp) = &payload.sdp {
                    manager.handle_remote_answer(from, sdp);
                }
            }
        });

        let manager = self.clone();
        channel.on(EnvelopeKind::Signal, move |env| {
            if let Envelope::Signal {
                from: Some(from),
                payload,
                ..
            } = env
            {
                if let Some(candidate) = &payload.candidate {
                    manager.handle_remote_candidate(from, candidate);
                }
            }
        });

        let manager = self.clone();
        channel.on(EnvelopeKind::Candidate, move |env| {
            if let Envelope::Candidate {
                from: Some(from),
                payload,
                ..
            } = env
            {
                if let Some(candidate) = &payload.candidate {
                    manager.handle_remote_candidate(from, candidate);
                }
            }
        });
    }

    /// Transmit a payload to a ready peer.
    ///
    /// Returns `true` once the payload has been handed to the transport.
    /// Sends to absent or not-ready connections are dropped with a warning
    /// and return `false`; nothing is queued and no entry is created.
    pub fn send(&self, remote: &UserId, payload: &[u8]) -> bool {
        let transport = {
            let entries = self.shared.entries.lock().unwrap();
            match entries.get(remote) {
                Some(entry) if entry.state == PeerState::Ready => Arc::clone(&entry.transport),
                Some(entry) => {
                    warn!(peer = %remote, state = ?entry.state, "connection not ready, dropping payload");
                    return false;
                }
                None => {
                    warn!(peer = %remote, "no connection, dropping payload");
                    return false;
                }
            }
        };

        let result = transport.lock().unwrap().send(payload);
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %remote, error = %e, "transport send failed, dropping payload");
                false
            }
        }
    }

    /// Replace the inbound payload handler for a connection. Valid before
    /// or after readiness. Returns `false` if no entry exists.
    pub fn set_on_message(
        &self,
        remote: &UserId,
        handler: impl Fn(&UserId, &[u8]) + Send + Sync + 'static,
    ) -> bool {
        let mut entries = self.shared.entries.lock().unwrap();
        match entries.get_mut(remote) {
            Some(entry) => {
                entry.on_message = Some(Arc::new(handler));
                true
            }
            None => false,
        }
    }

    /// Tear down the connection to one peer. Idempotent; safe to call at
    /// any point in the state machine.
    pub fn close(&self, remote: &UserId) {
        let entry = self.shared.entries.lock().unwrap().remove(remote);
        if let Some(mut entry) = entry {
            entry.state = PeerState::Closed;
            entry.transport.lock().unwrap().close();
            info!(peer = %remote, "closed peer connection");
        }
    }

    /// Tear down every connection.
    pub fn close_all(&self) {
        let entries: Vec<(UserId, ConnectionEntry)> = {
            let mut map = self.shared.entries.lock().unwrap();
            map.drain().collect()
        };
        for (remote, mut entry) in entries {
            entry.state = PeerState::Closed;
            entry.transport.lock().unwrap().close();
            info!(peer = %remote, "closed peer connection");
        }
    }

    // -- blocklist --

    pub fn block(&self, remote: &UserId) {
        self.shared.blocklist.lock().unwrap().insert(remote.clone());
        // An existing connection to a freshly blocked peer goes away too.
        self.close(remote);
    }

    pub fn unblock(&self, remote: &UserId) {
        self.shared.blocklist.lock().unwrap().remove(remote);
    }

    pub fn is_blocked(&self, remote: &UserId) -> bool {
        self.shared.blocklist.lock().unwrap().contains(remote)
    }

    // -- accessors --

    /// Connection state for one remote id, `None` if absent.
    pub fn state_of(&self, remote: &UserId) -> Option<PeerState> {
        self.shared
            .entries
            .lock()
            .unwrap()
            .get(remote)
            .map(|e| e.state)
    }

    pub fn is_ready(&self, remote: &UserId) -> bool {
        self.state_of(remote) == Some(PeerState::Ready)
    }

    /// Remote ids whose data channel is currently open.
    pub fn ready_peers(&self) -> Vec<UserId> {
        self.shared
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.state == PeerState::Ready)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    // -- internals --

    fn build_transport(
        &self,
        remote: UserId,
        epoch: u64,
        signals: Arc<dyn SignalSender>,
    ) -> Box<dyn PeerTransport> {
        let weak = Arc::downgrade(&self.shared);

        let on_open = {
            let weak = Weak::clone(&weak);
            let remote = remote.clone();
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.mark_ready(&remote, epoch);
                }
            })
        };

        let on_message = {
            let weak = Weak::clone(&weak);
            let remote = remote.clone();
            Box::new(move |payload: Vec<u8>| {
                if let Some(shared) = weak.upgrade() {
                    shared.dispatch_inbound(&remote, epoch, payload);
                }
            })
        };

        let on_candidate = Box::new(move |candidate: String| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !shared.is_current(&remote, epoch) {
                return;
            }
            if let Err(e) = signals.send_candidate(&remote, candidate) {
                warn!(peer = %remote, error = %e, "failed to send local candidate");
            }
        });

        self.shared.factory.create(TransportEvents {
            on_open,
            on_message,
            on_candidate,
        })
    }

    /// Remove an entry only if it is still the one we created (same epoch).
    fn drop_entry(&self, remote: &UserId, epoch: u64) {
        let entry = {
            let mut entries = self.shared.entries.lock().unwrap();
            match entries.get(remote) {
                Some(e) if e.epoch == epoch => entries.remove(remote),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            entry.transport.lock().unwrap().close();
        }
    }
}

impl ManagerShared {
    fn is_current(&self, remote: &UserId, epoch: u64) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(remote)
            .map(|e| e.epoch == epoch)
            .unwrap_or(false)
    }

    fn mark_ready(&self, remote: &UserId, epoch: u64) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(remote) {
            Some(entry) if entry.epoch == epoch && entry.state == PeerState::Negotiating => {
                entry.state = PeerState::Ready;
                info!(peer = %remote, "peer data channel open");
            }
            _ => {
                debug!(peer = %remote, "stale readiness callback, ignoring");
            }
        }
    }

    fn dispatch_inbound(&self, remote: &UserId, epoch: u64, payload: Vec<u8>) {
        let handler = {
            let entries = self.entries.lock().unwrap();
            match entries.get(remote) {
                Some(entry) if entry.epoch == epoch => entry.on_message.clone(),
                _ => {
                    debug!(peer = %remote, "payload for stale connection, dropping");
                    return;
                }
            }
        };

        match handler {
            Some(handler) => handler(remote, &payload),
            None => debug!(peer = %remote, "inbound payload with no handler, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;
    use couloir_shared::crypto::KeyPair;

    #[derive(Default)]
    struct RecordingSender {
        offers: Mutex<Vec<(UserId, String)>>,
        answers: Mutex<Vec<(UserId, String)>>,
        candidates: Mutex<Vec<(UserId, String)>>,
    }

    impl SignalSender for RecordingSender {
        fn send_offer(&self, target: &UserId, sdp: String) -> Result<(), ConnError> {
            self.offers.lock().unwrap().push((target.clone(), sdp));
            Ok(())
        }

        fn send_answer(&self, target: &UserId, sdp: String) -> Result<(), ConnError> {
            self.answers.lock().unwrap().push((target.clone(), sdp));
            Ok(())
        }

        fn send_candidate(&self, target: &UserId, candidate: String) -> Result<(), ConnError> {
            self.candidates
                .lock()
                .unwrap()
                .push((target.clone(), candidate));
            Ok(())
        }
    }

    fn peer(id: &str) -> PeerEntry {
        PeerEntry {
            id: UserId::from(id),
            username: id.to_string(),
            pubkey: KeyPair::generate_static().public(),
        }
    }

    fn manager() -> PeerConnectionManager {
        PeerConnectionManager::new(Arc::new(LoopbackNetwork::new()))
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mgr = manager();
        let sender = Arc::new(RecordingSender::default());
        let bob = peer("bob");

        let first = mgr
            .connect_to_peer(&bob, Arc::clone(&sender) as Arc<dyn SignalSender>)
            .unwrap();
        let second = mgr
            .connect_to_peer(&bob, Arc::clone(&sender) as Arc<dyn SignalSender>)
            .unwrap();

        assert_eq!(first, PeerState::Negotiating);
        assert_eq!(second, PeerState::Negotiating);
        assert_eq!(mgr.connection_count(), 1);
        // Only the first call produced an offer, and nothing else went out.
        assert_eq!(sender.offers.lock().unwrap().len(), 1);
        assert!(sender.answers.lock().unwrap().is_empty());
        assert!(sender.candidates.lock().unwrap().is_empty());
    }

    #[test]
    fn test_blocked_peer_refused_without_entry() {
        let mgr = manager();
        let sender = Arc::new(RecordingSender::default());
        let bob = peer("bob");

        mgr.block(&bob.id);
        let result = mgr.connect_to_peer(&bob, sender.clone() as Arc<dyn SignalSender>);

        assert!(matches!(result, Err(PeerError::Blocked(_))));
        assert_eq!(mgr.connection_count(), 0);
        assert!(sender.offers.lock().unwrap().is_empty());

        mgr.unblock(&bob.id);
        assert!(mgr
            .connect_to_peer(&bob, sender as Arc<dyn SignalSender>)
            .is_ok());
    }

    #[test]
    fn test_send_to_absent_or_not_ready_is_noop() {
        let mgr = manager();
        let sender = Arc::new(RecordingSender::default());
        let bob = peer("bob");

        // Absent: no phantom entry appears.
        assert!(!mgr.send(&bob.id, b"hello"));
        assert_eq!(mgr.connection_count(), 0);

        // Negotiating: dropped, entry unchanged.
        mgr.connect_to_peer(&bob, sender as Arc<dyn SignalSender>)
            .unwrap();
        assert!(!mgr.send(&bob.id, b"hello"));
        assert_eq!(mgr.state_of(&bob.id), Some(PeerState::Negotiating));
    }

    #[test]
    fn test_stale_answer_after_close_is_ignored() {
        let mgr = manager();
        let sender = Arc::new(RecordingSender::default());
        let bob = peer("bob");

        mgr.connect_to_peer(&bob, sender as Arc<dyn SignalSender>)
            .unwrap();
        let offered = mgr.shared.entries.lock().unwrap().get(&bob.id).unwrap().epoch;

        mgr.close(&bob.id);
        assert_eq!(mgr.state_of(&bob.id), None);

        // The answer the remote side eventually produced arrives late.
        mgr.handle_remote_answer(&bob.id, "loopback-answer whatever");
        assert_eq!(mgr.state_of(&bob.id), None);
        assert_eq!(mgr.connection_count(), 0);

        // A fresh connect creates a new entry rather than resurrecting
        // the old one.
        let sender = Arc::new(RecordingSender::default());
        mgr.connect_to_peer(&bob, sender as Arc<dyn SignalSender>)
            .unwrap();
        let fresh = mgr.shared.entries.lock().unwrap().get(&bob.id).unwrap().epoch;
        assert_ne!(offered, fresh);
    }

    #[test]
    fn test_duplicate_offer_keeps_existing_entry() {
        let mgr = manager();
        let network = LoopbackNetwork::new();
        let mgr2 = PeerConnectionManager::new(Arc::new(network));
        let sender = Arc::new(RecordingSender::default());

        mgr2.handle_remote_offer(
            &UserId::from("alice"),
            "loopback-offer nonexistent",
            sender.clone() as Arc<dyn SignalSender>,
        );
        // Bad token: entry rolled back.
        assert_eq!(mgr2.connection_count(), 0);

        // Duplicate offers against an existing entry are ignored.
        let bob = peer("bob");
        mgr.connect_to_peer(&bob, sender.clone() as Arc<dyn SignalSender>)
            .unwrap();
        mgr.handle_remote_offer(
            &bob.id,
            "loopback-offer nonexistent",
            sender as Arc<dyn SignalSender>,
        );
        assert_eq!(mgr.connection_count(), 1);
        assert_eq!(mgr.state_of(&bob.id), Some(PeerState::Negotiating));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mgr = manager();
        let bob = UserId::from("bob");

        mgr.close(&bob);
        mgr.close(&bob);
        mgr.close_all();
        assert_eq!(mgr.connection_count(), 0);
    }

    #[test]
    fn test_set_on_message_requires_entry() {
        let mgr = manager();
        let sender = Arc::new(RecordingSender::default());
        let bob = peer("bob");

        assert!(!mgr.set_on_message(&bob.id, |_, _| {}));

        mgr.connect_to_peer(&bob, sender as Arc<dyn SignalSender>)
            .unwrap();
        assert!(mgr.set_on_message(&bob.id, |_, _| {}));
    }

    #[test]
    fn test_block_closes_existing_connection() {
        let mgr = manager();
        let sender = Arc::new(RecordingSender::default());
        let bob = peer("bob");

        mgr.connect_to_peer(&bob, sender as Arc<dyn SignalSender>)
            .unwrap();
        assert_eq!(mgr.connection_count(), 1);

        mgr.block(&bob.id);
        assert_eq!(mgr.connection_count(), 0);
        assert!(mgr.is_blocked(&bob.id));
    }
}
