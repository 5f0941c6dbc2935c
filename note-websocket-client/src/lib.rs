//! # Realtime Note Client
//!
//! Two layers are exposed:
//! - Low-level [`Client`] to exchange raw protocol frames over a WebSocket.
//! - High-level [`NoteClient`] that owns a local replica of the note, runs
//!   the sync handshake, applies inbound updates, sends local edits, and
//!   mirrors the awareness map.
//!
//! High-level example (not run here):
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! #   let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! #   rt.block_on(async move {
//! use note_websocket_client::NoteClient;
//!
//! let client = NoteClient::connect(
//!     "ws://127.0.0.1:9000/realtime/?noteId=demo",
//!     Some("HEDGEDOC_SESSION=s%3Asession-id.signature"),
//! ).await?;
//! client.wait_until_synced(std::time::Duration::from_secs(2)).await;
//! client.insert(0, "hello");
//! #   Ok(())
//! # })
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, Transact, Update};

use note_protocol::{self as protocol, AwarenessEntry, MessageType, SyncKind, CONTENT_CHANNEL};

/// Errors surfaced by both client layers.
#[derive(Debug)]
pub enum ClientError {
    /// The server refused the WebSocket upgrade.
    Rejected(u16),
    /// Underlying WebSocket failure.
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    /// Frame could not be encoded or decoded.
    Protocol(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Rejected(status) => write!(f, "upgrade rejected with status {status}"),
            ClientError::Ws(e) => write!(f, "websocket error: {e}"),
            ClientError::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        if let tokio_tungstenite::tungstenite::Error::Http(response) = &e {
            return ClientError::Rejected(response.status().as_u16());
        }
        ClientError::Ws(Box::new(e))
    }
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open_socket(url: &str, cookie: Option<&str>) -> Result<Ws, ClientError> {
    let mut request = url.into_client_request().map_err(ClientError::from)?;
    if let Some(cookie) = cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| ClientError::Protocol(format!("invalid cookie header: {e}")))?;
        request.headers_mut().insert("Cookie", value);
    }
    let (ws, _response) = connect_async(request).await?;
    Ok(ws)
}

/// A minimal client exchanging raw binary frames.
pub struct Client {
    ws: Ws,
    auto_pong: bool,
}

impl Client {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        Ok(Self { ws: open_socket(url, None).await?, auto_pong: true })
    }

    pub async fn connect_with_cookie(url: &str, cookie: &str) -> Result<Self, ClientError> {
        Ok(Self { ws: open_socket(url, Some(cookie)).await?, auto_pong: true })
    }

    /// Disable the automatic pong reply, to simulate an unresponsive peer.
    pub fn set_auto_pong(&mut self, enabled: bool) {
        self.auto_pong = enabled;
    }

    pub async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.ws.send(Message::Binary(frame.into())).await.map_err(ClientError::from)
    }

    /// Next binary frame, or `None` once the connection is finished (clean
    /// close or transport failure). Control frames are handled inline.
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        while let Some(item) = self.ws.next().await {
            match item {
                Ok(Message::Binary(data)) => return Some(data.to_vec()),
                Ok(Message::Ping(payload)) => {
                    if self.auto_pong && self.ws.send(Message::Pong(payload)).await.is_err() {
                        return None;
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "client transport error");
                    return None;
                }
            }
        }
        None
    }

    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.ws.close(None).await.map_err(ClientError::from)
    }
}

/// Origin under which server-sent updates are applied locally, so the local
/// update observer does not loop them back.
fn server_origin() -> Origin {
    Origin::from("server")
}

/// High-level client owning a local replica of one note.
pub struct NoteClient {
    doc: Doc,
    outbound: mpsc::UnboundedSender<Message>,
    synced: Arc<AtomicBool>,
    awareness: Arc<Mutex<HashMap<u64, AwarenessEntry>>>,
    awareness_clock: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    _update_sub: Subscription,
}

impl NoteClient {
    /// Connect and start syncing. The handshake completes in the background;
    /// use [`NoteClient::wait_until_synced`] to block on it.
    pub async fn connect(url: &str, cookie: Option<&str>) -> Result<Self, ClientError> {
        let ws = open_socket(url, cookie).await?;
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    debug!("client writer finished");
                    break;
                }
            }
        });

        let doc = Doc::new();
        doc.get_or_insert_text(CONTENT_CHANNEL);
        let synced = Arc::new(AtomicBool::new(false));
        let awareness: Arc<Mutex<HashMap<u64, AwarenessEntry>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let update_sub = {
            let outbound = outbound.clone();
            doc.observe_update_v1(move |txn, event| {
                // Remote updates come back tagged with the server origin.
                if txn.origin().is_some() {
                    return;
                }
                let frame = protocol::encode_sync_update(&event.update);
                let _ = outbound.send(Message::Binary(frame.into()));
            })
            .map_err(|e| ClientError::Protocol(format!("cannot observe local updates: {e}")))?
        };

        let reader = {
            let doc = doc.clone();
            let outbound = outbound.clone();
            let synced = synced.clone();
            let awareness = awareness.clone();
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(Message::Binary(data)) => {
                            if let Err(e) =
                                handle_frame(&doc, &outbound, &synced, &awareness, &data)
                            {
                                debug!(error = %e, "client dropped inbound frame");
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = outbound.send(Message::Pong(payload));
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "client transport error");
                            break;
                        }
                    }
                }
            })
        };

        // Open with our state vector so the server sends what we miss.
        let step1 = protocol::encode_sync_step1(&doc.transact().state_vector().encode_v1());
        let _ = outbound.send(Message::Binary(step1.into()));

        Ok(Self {
            doc,
            outbound,
            synced,
            awareness,
            awareness_clock: AtomicU64::new(0),
            reader,
            writer,
            _update_sub: update_sub,
        })
    }

    /// CRDT client id of the local replica, used to key awareness entries.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// True once the initial STEP2 from the server has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub async fn wait_until_synced(&self, timeout: Duration) -> bool {
        wait_for(timeout, || self.is_synced()).await
    }

    /// Current text of the local replica.
    pub fn text(&self) -> String {
        let text = self.doc.get_or_insert_text(CONTENT_CHANNEL);
        text.get_string(&self.doc.transact())
    }

    pub async fn wait_for_text(&self, expected: &str, timeout: Duration) -> bool {
        wait_for(timeout, || self.text() == expected).await
    }

    /// Type into the local replica; the edit propagates automatically.
    pub fn insert(&self, index: u32, chunk: &str) {
        let text = self.doc.get_or_insert_text(CONTENT_CHANNEL);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, chunk);
    }

    /// Publish a presence state (JSON) under the local client id.
    pub fn publish_awareness(&self, state_json: &str) {
        self.send_awareness(Some(state_json.to_string()));
    }

    /// Withdraw the local presence entry.
    pub fn clear_awareness(&self) {
        self.send_awareness(None);
    }

    fn send_awareness(&self, state: Option<String>) {
        let entry = AwarenessEntry {
            client_id: self.client_id(),
            clock: self.awareness_clock.fetch_add(1, Ordering::AcqRel),
            state,
        };
        let frame = protocol::encode_awareness(&[entry]);
        let _ = self.outbound.send(Message::Binary(frame.into()));
    }

    /// Live presence states currently known, keyed by client id.
    pub fn awareness_states(&self) -> HashMap<u64, String> {
        let map = self.awareness.lock().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .filter_map(|(id, entry)| entry.state.clone().map(|state| (*id, state)))
            .collect()
    }

    pub async fn wait_for_awareness<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&HashMap<u64, String>) -> bool,
    {
        wait_for(timeout, || predicate(&self.awareness_states())).await
    }

    /// Ask the server to close; the background tasks wind down on their own.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for NoteClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn wait_for<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn handle_frame(
    doc: &Doc,
    outbound: &mpsc::UnboundedSender<Message>,
    synced: &AtomicBool,
    awareness: &Mutex<HashMap<u64, AwarenessEntry>>,
    data: &[u8],
) -> Result<(), String> {
    let (ty, mut reader) = protocol::decode_frame(data)?;
    match ty {
        MessageType::Sync => {
            let tag = reader.read_var_uint()?;
            let kind =
                SyncKind::from_tag(tag).ok_or_else(|| format!("unknown sync step tag {tag}"))?;
            match kind {
                SyncKind::Step1 => {
                    let state_vector = StateVector::decode_v1(reader.read_var_bytes()?)
                        .map_err(|e| format!("malformed state vector: {e}"))?;
                    let diff = doc.transact().encode_state_as_update_v1(&state_vector);
                    let _ = outbound.send(Message::Binary(protocol::encode_sync_step2(&diff).into()));
                }
                SyncKind::Step2 | SyncKind::Update => {
                    let update = Update::decode_v1(reader.read_var_bytes()?)
                        .map_err(|e| format!("malformed update: {e}"))?;
                    let mut txn = doc.transact_mut_with(server_origin());
                    txn.apply_update(update).map_err(|e| format!("update rejected: {e}"))?;
                    if kind == SyncKind::Step2 {
                        synced.store(true, Ordering::Release);
                    }
                }
            }
        }
        MessageType::Awareness => {
            let entries = protocol::decode_awareness_update(reader.read_var_bytes()?)?;
            let mut map = awareness.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in entries {
                match map.get(&entry.client_id) {
                    Some(known) if known.clock > entry.clock => {}
                    _ => {
                        map.insert(entry.client_id, entry);
                    }
                }
            }
        }
        MessageType::Hedgedoc => {}
    }
    Ok(())
}
