//! One admitted client connection.
//!
//! The [`Connection`] handle is what the hub holds and broadcasts through:
//! sending is a non-blocking push into the outbound queue, safe to call from
//! inside hub locks. The transport itself is driven by [`run_connection`],
//! one task per client, which multiplexes the inbound stream, the outbound
//! queue and the keep-alive timer and serializes all writes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use yrs::Origin;

use crate::hub::NoteHub;
use crate::keepalive::{KeepAlive, TickAction};
use crate::services::User;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Connection {
    id: u64,
    user: User,
    origin: Origin,
    outbound: mpsc::UnboundedSender<Message>,
    synced: AtomicBool,
    alive: AtomicBool,
    awareness_clients: Mutex<HashSet<u64>>,
}

impl Connection {
    /// Create a handle plus the receiving end of its outbound queue, which
    /// [`run_connection`] drains into the transport.
    pub(crate) fn channel(user: User) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            user,
            origin: Origin::from(format!("connection-{id}").as_str()),
            outbound,
            synced: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            awareness_clients: Mutex::new(HashSet::new()),
        });
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Transaction origin under which this connection's updates are applied.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// True once the peer completed the initial STEP1/STEP2 exchange and may
    /// meaningfully receive incremental updates. Never reverts to false.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::AcqRel) {
            debug!(conn = self.id, user = %self.user.username, "initial sync complete");
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue a binary frame. A no-op once the transport is closed; a queue
    /// failure is not an error for the caller, the connection task is
    /// already tearing down.
    pub fn send(&self, frame: Vec<u8>) {
        if !self.is_alive() {
            return;
        }
        if self.outbound.send(Message::Binary(frame.into())).is_err() {
            debug!(conn = self.id, "outbound queue closed, dropping frame");
        }
    }

    /// Idempotently close the transport.
    pub fn disconnect(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Message::Close(None));
        }
    }

    /// Remember awareness client ids announced through this connection, for
    /// cleanup when it goes away.
    pub(crate) fn track_awareness_clients<I: IntoIterator<Item = u64>>(&self, ids: I) {
        let mut tracked = self.awareness_clients.lock().unwrap_or_else(PoisonError::into_inner);
        tracked.extend(ids);
    }

    pub(crate) fn take_awareness_clients(&self) -> Vec<u64> {
        let mut tracked = self.awareness_clients.lock().unwrap_or_else(PoisonError::into_inner);
        tracked.drain().collect()
    }
}

/// Drive one connection until its transport goes away, then detach it from
/// the hub. Inbound frames are processed strictly in arrival order.
pub(crate) async fn run_connection(
    ws: WebSocketStream<TcpStream>,
    hub: Arc<NoteHub>,
    conn: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    ping_interval: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    let mut keepalive = KeepAlive::new();
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match keepalive.on_tick() {
                    TickAction::Ping => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            debug!(conn = conn.id(), "ping failed, closing");
                            break;
                        }
                    }
                    TickAction::Close => {
                        info!(conn = conn.id(), user = %conn.user().username, "keep-alive expired");
                        break;
                    }
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if sink.send(message).await.is_err() {
                            debug!(conn = conn.id(), "write failed, closing");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        dispatch_frame(&hub, &conn, &data).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => keepalive.on_pong(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // The protocol has no text frames; ignore.
                    }
                    Some(Err(e)) => {
                        debug!(conn = conn.id(), error = %e, "transport error");
                        break;
                    }
                }
            }
        }
    }

    conn.disconnect();
    hub.remove(&conn).await;
    debug!(conn = conn.id(), user = %conn.user().username, "connection finished");
}

/// Route one inbound frame into the hub. Handler failures are logged with
/// context and never tear down the connection; only transport errors do.
async fn dispatch_frame(hub: &Arc<NoteHub>, conn: &Arc<Connection>, data: &[u8]) {
    match note_protocol::decode_frame(data) {
        Ok((ty, reader)) => {
            if let Err(e) = hub.handle_incoming(ty, reader, conn).await {
                warn!(
                    conn = conn.id(),
                    note = %hub.note_id(),
                    error = %e,
                    "frame handler failed"
                );
            }
        }
        Err(e) => {
            warn!(conn = conn.id(), error = %e, len = data.len(), "dropping malformed frame");
        }
    }
}
