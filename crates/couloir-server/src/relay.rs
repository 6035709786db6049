//! The signaling relay.
//!
//! One tokio task per client connection. Each connection gets an unbounded
//! outbound queue drained by its own writer task, so a slow or closed peer
//! never stalls envelope handling for anyone else; a send to a gone peer
//! fast-fails instead of blocking.
//!
//! The identity table is owned by the relay: connection handlers mutate it
//! only through [`RelayState`] methods. The relay never closes a client
//! connection because of a bad message from that connection; malformed
//! envelopes are logged and ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use couloir_shared::constants::MAX_ENVELOPE_SIZE;
use couloir_shared::crypto::PublicKey;
use couloir_shared::envelope::{Envelope, EnvelopeKind, SignalPayload};
use couloir_shared::types::{PeerEntry, UserId};

use crate::config::RelayConfig;

/// Failures surfaced back to a sender as an `error` envelope. Never a
/// reason to drop the sender's connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Target not found or disconnected")]
    TargetUnavailable,
}

struct ClientEntry {
    tx: mpsc::UnboundedSender<Message>,
    username: String,
    pubkey: PublicKey,
}

/// The relay's registry of connected identities.
#[derive(Clone, Default)]
struct RelayState {
    clients: Arc<Mutex<HashMap<UserId, ClientEntry>>>,
}

impl RelayState {
    /// Register (or overwrite) the entry for an identity.
    fn register(&self, id: UserId, entry: ClientEntry) {
        self.clients.lock().unwrap().insert(id, entry);
    }

    /// Remove an identity, but only if it is still bound to this
    /// connection's queue. A newer `join` for the same id overwrites the
    /// entry, and the stale connection's cleanup must not tear that down.
    fn remove_if_current(&self, id: &UserId, tx: &mpsc::UnboundedSender<Message>) -> bool {
        let mut clients = self.clients.lock().unwrap();
        match clients.get(id) {
            Some(entry) if entry.tx.same_channel(tx) => {
                clients.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Queue an envelope for one identity. `false` if the identity is not
    /// registered or its connection is gone.
    fn send_to(&self, id: &UserId, envelope: &Envelope) -> bool {
        let clients = self.clients.lock().unwrap();
        let Some(entry) = clients.get(id) else {
            return false;
        };
        match envelope.to_json() {
            Ok(text) => entry.tx.send(Message::Text(text)).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to serialize envelope");
                false
            }
        }
    }

    /// Broadcast the full peer list (public data only) to every connected
    /// client.
    fn broadcast_peers(&self) {
        let clients = self.clients.lock().unwrap();
        let peers: Vec<PeerEntry> = clients
            .iter()
            .map(|(id, entry)| PeerEntry {
                id: id.clone(),
                username: entry.username.clone(),
                pubkey: entry.pubkey,
            })
            .collect();

        let envelope = Envelope::Peers { peers };
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize peer list");
                return;
            }
        };

        for entry in clients.values() {
            let _ = entry.tx.send(Message::Text(text.clone()));
        }
        debug!(count = clients.len(), "broadcast peer list");
    }
}

/// Bind the listener and spawn the relay accept loop.
///
/// Returns the bound address (useful with a `:0` port in tests) and the
/// accept-loop task handle.
pub async fn spawn_relay(config: RelayConfig) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, instance = %config.instance_name, "signaling relay listening");

    let state = RelayState::default();
    let instance_name = config.instance_name;

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = state.clone();
                    let instance_name = instance_name.clone();
                    tokio::spawn(handle_connection(stream, peer_addr, state, instance_name));
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                }
            }
        }
    });

    Ok((addr, handle))
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: RelayState,
    instance_name: String,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer_addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    debug!(%peer_addr, "client connected");

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer per client; handlers only ever queue.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut registered: Option<UserId> = None;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_ENVELOPE_SIZE {
                    warn!(%peer_addr, len = text.len(), "oversized envelope, ignoring");
                    continue;
                }
                match Envelope::from_json(&text) {
                    Ok(envelope) => {
                        handle_envelope(&state, &tx, &mut registered, &instance_name, envelope)
                    }
                    Err(e) => {
                        warn!(%peer_addr, error = %e, "ignoring malformed envelope");
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%peer_addr, error = %e, "client transport error");
                break;
            }
        }
    }

    if let Some(id) = registered {
        if state.remove_if_current(&id, &tx) {
            info!(%id, "client disconnected");
            state.broadcast_peers();
        }
    }
    writer.abort();
}

fn handle_envelope(
    state: &RelayState,
    tx: &mpsc::UnboundedSender<Message>,
    registered: &mut Option<UserId>,
    instance_name: &str,
    envelope: Envelope,
) {
    match envelope {
        Envelope::Join {
            id,
            username,
            pubkey,
        } => {
            info!(%id, %username, "peer joined");
            state.register(
                id.clone(),
                ClientEntry {
                    tx: tx.clone(),
                    username,
                    pubkey,
                },
            );
            *registered = Some(id.clone());

            send_direct(
                tx,
                &Envelope::Welcome {
                    id,
                    message: format!("welcome to {instance_name}"),
                },
            );
            state.broadcast_peers();
        }

        Envelope::Invite {
            target, payload, ..
        } => {
            let Some(sender) = registered.as_ref() else {
                warn!("invite from unregistered client, ignoring");
                return;
            };
            let forwarded = Envelope::Invite {
                from: Some(sender.clone()),
                target: None,
                payload,
            };
            relay_if_present(state, sender, target.as_ref(), forwarded);
        }

        Envelope::Ack {
            target, payload, ..
        } => {
            let Some(sender) = registered.as_ref() else {
                warn!("ack from unregistered client, ignoring");
                return;
            };
            let forwarded = Envelope::Ack {
                from: Some(sender.clone()),
                target: None,
                payload,
            };
            relay_if_present(state, sender, target.as_ref(), forwarded);
        }

        Envelope::Peers { .. } => {
            // The reply goes to every connected client, not just the
            // requester; kept for wire compatibility.
            state.broadcast_peers();
        }

        envelope @ (Envelope::Offer { .. } | Envelope::Answer { .. } | Envelope::Signal { .. }) => {
            handle_signal_group(state, tx, registered.as_ref(), envelope);
        }

        other => {
            debug!(kind = %other.kind(), "ignoring unhandled envelope type");
        }
    }
}

/// Invite/ack semantics: forward verbatim if the target is connected,
/// otherwise drop silently. The sender gets no error for a missed invite.
fn relay_if_present(
    state: &RelayState,
    sender: &UserId,
    target: Option<&UserId>,
    forwarded: Envelope,
) {
    let Some(target) = target else {
        debug!(%sender, kind = %forwarded.kind(), "envelope without target, dropping");
        return;
    };
    if state.send_to(target, &forwarded) {
        debug!(%sender, %target, kind = %forwarded.kind(), "relayed envelope");
    } else {
        debug!(%sender, %target, kind = %forwarded.kind(), "target not connected, dropping");
    }
}

/// Negotiation envelopes (offer/answer and candidate-carrying signal
/// messages) share this path: validate the payload, forward to the target,
/// or report back to the sender.
fn handle_signal_group(
    state: &RelayState,
    tx: &mpsc::UnboundedSender<Message>,
    registered: Option<&UserId>,
    envelope: Envelope,
) {
    let Some(sender) = registered else {
        warn!("negotiation envelope from unregistered client, ignoring");
        return;
    };

    let kind = envelope.kind();
    let (target, payload) = match envelope {
        Envelope::Offer {
            target, payload, ..
        }
        | Envelope::Answer {
            target, payload, ..
        }
        | Envelope::Signal {
            target, payload, ..
        } => (target, payload),
        _ => return,
    };

    // Offers and answers must carry a session description.
    if matches!(kind, EnvelopeKind::Offer | EnvelopeKind::Answer) && payload.sdp.is_none() {
        warn!(%sender, %kind, "dropping negotiation envelope without sdp");
        return;
    }
    // Candidate messages must carry a candidate.
    if kind == EnvelopeKind::Candidate && payload.candidate.is_none() {
        warn!(%sender, "dropping candidate envelope without candidate");
        return;
    }

    let forwarded = signal_envelope(kind, sender.clone(), payload);
    let delivered = target
        .as_ref()
        .map(|t| state.send_to(t, &forwarded))
        .unwrap_or(false);

    if !delivered {
        debug!(%sender, target = ?target, %kind, "negotiation target unavailable");
        send_direct(
            tx,
            &Envelope::Error {
                message: RelayError::TargetUnavailable.to_string(),
            },
        );
    }
}

fn signal_envelope(kind: EnvelopeKind, from: UserId, payload: SignalPayload) -> Envelope {
    match kind {
        EnvelopeKind::Offer => Envelope::Offer {
            from: Some(from),
            target: None,
            payload,
        },
        EnvelopeKind::Answer => Envelope::Answer {
            from: Some(from),
            target: None,
            payload,
        },
        _ => Envelope::Signal {
            from: Some(from),
            target: None,
            payload,
        },
    }
}

fn send_direct(tx: &mpsc::UnboundedSender<Message>, envelope: &Envelope) {
    match envelope.to_json() {
        Ok(text) => {
            let _ = tx.send(Message::Text(text));
        }
        Err(e) => warn!(error = %e, "failed to serialize envelope"),
    }
}
