//! Typed client channel to the signaling relay.
//!
//! A [`SignalingChannel`] owns at most one live WebSocket connection to the
//! relay. Inbound envelopes are dispatched by type to registered handlers
//! on a single reader task, in registration order; no two handlers of the
//! same channel ever run concurrently. Handler registration is independent
//! of the underlying transport, so handlers survive [`reconnect`].
//!
//! [`reconnect`]: SignalingChannel::reconnect

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use couloir_shared::crypto::PublicKey;
use couloir_shared::envelope::{AckPayload, Envelope, EnvelopeKind, InvitePayload, SignalPayload};
use couloir_shared::types::{Room, UserId};

use crate::error::ConnError;

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Token returned by [`SignalingChannel::on`]; pass it to
/// [`SignalingChannel::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct ChannelShared {
    local_id: UserId,
    username: String,
    pubkey: PublicKey,
    handlers: Mutex<HashMap<EnvelopeKind, Vec<(HandlerId, Handler)>>>,
    next_handler: AtomicU64,
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Client-side handle to the relay connection. Cheap to clone; all clones
/// share the same connection and handler registry.
#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<ChannelShared>,
}

impl SignalingChannel {
    pub fn new(local_id: UserId, username: impl Into<String>, pubkey: PublicKey) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                local_id,
                username: username.into(),
                pubkey,
                handlers: Mutex::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
                open: AtomicBool::new(false),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.shared.local_id
    }

    /// Whether the underlying transport is currently open. Callers that
    /// require delivery must check this before [`send`](Self::send).
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Open the relay connection and announce ourselves.
    ///
    /// Resolves once the transport reports open; the relay's `welcome`
    /// arrives asynchronously through the handler registry. A `join`
    /// envelope with the local id, display name, and static public key is
    /// sent immediately.
    pub async fn connect(&self, url: &str) -> Result<(), ConnError> {
        self.teardown();

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ConnError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        *self.shared.outbound.lock().unwrap() = Some(tx);
        self.shared.open.store(true, Ordering::SeqCst);

        info!(url, id = %self.shared.local_id, "connected to signaling relay");

        let writer_shared = Arc::clone(&self.shared);
        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize outbound envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    writer_shared.open.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match Envelope::from_json(&text) {
                        Ok(envelope) => dispatch(&reader_shared, &envelope),
                        Err(e) => {
                            debug!(error = %e, "ignoring unparseable envelope");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "signaling transport error");
                        break;
                    }
                }
            }
            reader_shared.open.store(false, Ordering::SeqCst);
            debug!("signaling reader task finished");
        });

        self.shared.tasks.lock().unwrap().extend([writer, reader]);

        self.send(Envelope::Join {
            id: self.shared.local_id.clone(),
            username: self.shared.username.clone(),
            pubkey: self.shared.pubkey,
        })
    }

    /// Tear down any existing transport and connect again. Handlers
    /// registered via [`on`](Self::on) remain valid.
    pub async fn reconnect(&self, url: &str) -> Result<(), ConnError> {
        debug!(url, "reconnecting signaling channel");
        self.connect(url).await
    }

    /// Register a handler for one envelope type. Multiple handlers per
    /// type are invoked in registration order.
    pub fn on(
        &self,
        kind: EnvelopeKind,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::SeqCst));
        self.shared
            .handlers
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns `false` if it was not registered.
    pub fn off(&self, kind: EnvelopeKind, id: HandlerId) -> bool {
        let mut handlers = self.shared.handlers.lock().unwrap();
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(hid, _)| *hid != id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Serialize and transmit an envelope.
    ///
    /// If the transport is not open the envelope is dropped and
    /// [`ConnError::NotConnected`] is returned; a failed send is never a
    /// silent success.
    pub fn send(&self, envelope: Envelope) -> Result<(), ConnError> {
        if !self.is_open() {
            debug!(kind = %envelope.kind(), "dropping send on closed signaling channel");
            return Err(ConnError::NotConnected);
        }
        let outbound = self.shared.outbound.lock().unwrap();
        outbound
            .as_ref()
            .ok_or(ConnError::NotConnected)?
            .send(envelope)
            .map_err(|_| ConnError::NotConnected)
    }

    // -- typed envelope builders --

    /// Ask the relay for the current peer list. The reply arrives as a
    /// `peers` envelope (broadcast to every connected client).
    pub fn request_peers(&self) -> Result<(), ConnError> {
        self.send(Envelope::Peers { peers: Vec::new() })
    }

    pub fn send_invite(&self, target: &UserId, payload: InvitePayload) -> Result<(), ConnError> {
        self.send(Envelope::Invite {
            from: None,
            target: Some(target.clone()),
            payload,
        })
    }

    pub fn send_ack(&self, target: &UserId, room: Room) -> Result<(), ConnError> {
        self.send(Envelope::Ack {
            from: None,
            target: Some(target.clone()),
            payload: AckPayload { room },
        })
    }

    pub fn send_offer(&self, target: &UserId, sdp: impl Into<String>) -> Result<(), ConnError> {
        self.send(Envelope::Offer {
            from: None,
            target: Some(target.clone()),
            payload: SignalPayload::sdp(sdp),
        })
    }

    pub fn send_answer(&self, target: &UserId, sdp: impl Into<String>) -> Result<(), ConnError> {
        self.send(Envelope::Answer {
            from: None,
            target: Some(target.clone()),
            payload: SignalPayload::sdp(sdp),
        })
    }

    /// Candidates travel as `signal` envelopes carrying a candidate payload.
    pub fn send_candidate(
        &self,
        target: &UserId,
        candidate: impl Into<String>,
    ) -> Result<(), ConnError> {
        self.send(Envelope::Signal {
            from: None,
            target: Some(target.clone()),
            payload: SignalPayload::candidate(candidate),
        })
    }

    /// Tear down the transport without reconnecting. Handlers remain
    /// registered; a later [`connect`](Self::connect) reuses them.
    pub fn close(&self) {
        self.teardown();
    }

    fn teardown(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        *self.shared.outbound.lock().unwrap() = None;
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

fn dispatch(shared: &ChannelShared, envelope: &Envelope) {
    let handlers: Vec<Handler> = {
        let registry = shared.handlers.lock().unwrap();
        registry
            .get(&envelope.kind())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    };

    if handlers.is_empty() {
        debug!(kind = %envelope.kind(), "no handler registered, ignoring envelope");
        return;
    }

    for handler in handlers {
        handler(envelope);
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use couloir_shared::crypto::KeyPair;

    fn channel() -> SignalingChannel {
        SignalingChannel::new(
            UserId::from("u1"),
            "alice",
            KeyPair::generate_static().public(),
        )
    }

    fn welcome() -> Envelope {
        Envelope::Welcome {
            id: UserId::from("u1"),
            message: "hi".to_string(),
        }
    }

    #[test]
    fn test_send_before_connect_is_observable_failure() {
        let ch = channel();
        assert!(!ch.is_open());
        assert!(matches!(
            ch.send(welcome()),
            Err(ConnError::NotConnected)
        ));
        assert!(matches!(ch.request_peers(), Err(ConnError::NotConnected)));
    }

    #[test]
    fn test_handlers_fire_in_registration_order() {
        let ch = channel();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        ch.on(EnvelopeKind::Welcome, move |_| o1.lock().unwrap().push(1));
        let o2 = Arc::clone(&order);
        ch.on(EnvelopeKind::Welcome, move |_| o2.lock().unwrap().push(2));

        dispatch(&ch.shared, &welcome());
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_off_removes_only_that_handler() {
        let ch = channel();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let first = ch.on(EnvelopeKind::Welcome, move |_| o1.lock().unwrap().push(1));
        let o2 = Arc::clone(&order);
        ch.on(EnvelopeKind::Welcome, move |_| o2.lock().unwrap().push(2));

        assert!(ch.off(EnvelopeKind::Welcome, first));
        assert!(!ch.off(EnvelopeKind::Welcome, first));

        dispatch(&ch.shared, &welcome());
        assert_eq!(*order.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_dispatch_only_matching_kind() {
        let ch = channel();
        let hits = Arc::new(Mutex::new(0));

        let h = Arc::clone(&hits);
        ch.on(EnvelopeKind::Error, move |_| *h.lock().unwrap() += 1);

        dispatch(&ch.shared, &welcome());
        assert_eq!(*hits.lock().unwrap(), 0);

        dispatch(
            &ch.shared,
            &Envelope::Error {
                message: "x".to_string(),
            },
        );
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
