//! Per-note rendezvous.
//!
//! One hub exists per live note. It owns the CRDT replica and the awareness
//! register, tracks the set of connections, fans document updates out to
//! every synced connection except the sender, and echoes awareness changes
//! to everyone. When the last connection leaves, the hub destroys itself
//! exactly once and deregisters from the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use note_protocol::{self as protocol, FrameReader, MessageType};
use tokio::sync::Mutex;
use tracing::debug;

use crate::awareness::AwarenessRegister;
use crate::connection::Connection;
use crate::doc::NoteDoc;

pub(crate) type DestroyCallback = Box<dyn FnOnce() + Send>;

struct HubInner {
    /// `None` once the hub started closing; the replica is released then.
    doc: Option<NoteDoc>,
    awareness: AwarenessRegister,
    conns: HashMap<u64, Arc<Connection>>,
}

pub struct NoteHub {
    note_id: String,
    closing: AtomicBool,
    inner: Mutex<HubInner>,
    on_destroy: StdMutex<Option<DestroyCallback>>,
}

impl std::fmt::Debug for NoteHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteHub").field("note_id", &self.note_id).finish_non_exhaustive()
    }
}

impl NoteHub {
    pub(crate) fn new(note_id: String, doc: NoteDoc, on_destroy: DestroyCallback) -> Self {
        Self {
            note_id,
            closing: AtomicBool::new(false),
            inner: Mutex::new(HubInner {
                doc: Some(doc),
                awareness: AwarenessRegister::new(),
                conns: HashMap::new(),
            }),
            on_destroy: StdMutex::new(Some(on_destroy)),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Register a connection. Fails once the hub started closing.
    pub async fn connect(&self, conn: Arc<Connection>) -> Result<(), String> {
        if self.is_closing() {
            return Err("hub is shutting down".into());
        }
        let mut inner = self.inner.lock().await;
        if inner.doc.is_none() {
            return Err("hub is shutting down".into());
        }
        debug!(note = %self.note_id, conn = conn.id(), user = %conn.user().username, "connection joined");
        inner.conns.insert(conn.id(), conn);
        Ok(())
    }

    /// The initial frames a fresh connection receives, in order: a STEP1
    /// offer of the server state vector, then a snapshot of every known
    /// awareness state (possibly empty). `None` if the hub is closing.
    pub async fn initial_frames(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.lock().await;
        let doc = inner.doc.as_ref()?;
        let step1 = protocol::encode_sync_step1(&doc.state_vector());
        let awareness = protocol::encode_awareness(&inner.awareness.snapshot());
        Some((step1, awareness))
    }

    /// Detach a connection. The last one out triggers destruction.
    pub async fn remove(&self, conn: &Arc<Connection>) {
        let became_empty = {
            let mut inner = self.inner.lock().await;
            if inner.conns.remove(&conn.id()).is_none() {
                return;
            }
            debug!(note = %self.note_id, conn = conn.id(), "connection left");

            // Presence announced through this connection is now stale; tell
            // the remaining participants.
            let stale = conn.take_awareness_clients();
            if !stale.is_empty() && !self.is_closing() {
                let removals = inner.awareness.remove_clients(&stale);
                if !removals.is_empty() {
                    let frame = protocol::encode_awareness(&removals);
                    for other in inner.conns.values() {
                        other.send(frame.clone());
                    }
                }
            }
            inner.conns.is_empty()
        };
        if became_empty && !self.is_closing() {
            self.destroy().await;
        }
    }

    /// Route one inbound frame from `origin`.
    pub async fn handle_incoming(
        &self,
        ty: MessageType,
        mut reader: FrameReader<'_>,
        origin: &Arc<Connection>,
    ) -> Result<(), String> {
        match ty {
            MessageType::Sync => {
                let response = {
                    let inner = self.inner.lock().await;
                    let Some(doc) = inner.doc.as_ref() else {
                        return Ok(());
                    };
                    let response = doc.apply_sync(&mut reader, origin.origin())?;
                    self.broadcast_updates(&inner, doc);
                    response
                };
                match response {
                    Some(frame) => origin.send(frame),
                    None => origin.mark_synced(),
                }
                Ok(())
            }
            MessageType::Awareness => {
                let entries = protocol::decode_awareness_update(reader.read_var_bytes()?)?;
                origin.track_awareness_clients(entries.iter().map(|e| e.client_id));

                let mut inner = self.inner.lock().await;
                if inner.doc.is_none() {
                    return Ok(());
                }
                let change = inner.awareness.apply(entries);
                let touched = change.touched();
                if !touched.is_empty() {
                    // Awareness goes to everyone, the origin included.
                    let frame = protocol::encode_awareness(&inner.awareness.entries_for(&touched));
                    for conn in inner.conns.values() {
                        conn.send(frame.clone());
                    }
                }
                Ok(())
            }
            MessageType::Hedgedoc => {
                debug!(note = %self.note_id, conn = origin.id(), "reserved frame ignored");
                Ok(())
            }
        }
    }

    /// Fan out every mutation the adapter recorded. Synced connections only;
    /// a peer still in its STEP1/STEP2 exchange gets this state through the
    /// diff instead, and an incremental update before that would be wrong.
    fn broadcast_updates(&self, inner: &HubInner, doc: &NoteDoc) {
        let pending = doc.drain_updates();
        if pending.is_empty() || self.is_closing() {
            return;
        }
        for mutation in pending {
            let frame = protocol::encode_sync_update(&mutation.update);
            for conn in inner.conns.values() {
                if mutation.origin.as_ref() == Some(conn.origin()) {
                    continue;
                }
                if !conn.is_synced() {
                    continue;
                }
                conn.send(frame.clone());
            }
        }
    }

    /// Tear the hub down: close every connection, release the replica, and
    /// deregister. Runs its effects exactly once; later calls are no-ops.
    pub async fn destroy(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let conns = {
            let mut inner = self.inner.lock().await;
            inner.doc = None;
            std::mem::take(&mut inner.conns)
        };
        for conn in conns.values() {
            conn.disconnect();
        }
        let callback = {
            let mut slot = self.on_destroy.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        if let Some(callback) = callback {
            callback();
        }
        debug!(note = %self.note_id, "hub destroyed");
    }

    /// Destroy only if no connection ever attached (admission failed after
    /// the hub was created); otherwise leave it to the last-leaver rule.
    pub(crate) async fn destroy_if_idle(&self) {
        let idle = {
            let inner = self.inner.lock().await;
            inner.conns.is_empty() && inner.doc.is_some()
        };
        if idle && !self.is_closing() {
            self.destroy().await;
        }
    }

    /// Current note body. Primarily for persistence callers and tests.
    pub async fn snapshot_text(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.doc.as_ref().map(|d| d.snapshot_text())
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::User;
    use note_protocol::{AwarenessEntry, SyncKind, CONTENT_CHANNEL};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message;
    use yrs::updates::decoder::Decode;
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

    fn hub(initial: &str) -> Arc<NoteHub> {
        Arc::new(NoteHub::new(
            "n1".into(),
            NoteDoc::new(initial).unwrap(),
            Box::new(|| {}),
        ))
    }

    fn user(name: &str) -> User {
        User { username: name.into(), display_name: name.to_uppercase() }
    }

    fn recv_frames(rx: &mut UnboundedReceiver<Message>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Binary(data) = msg {
                frames.push(data.to_vec());
            }
        }
        frames
    }

    /// A local editor replica that can produce handshake and edit frames.
    struct Peer {
        doc: Doc,
    }

    impl Peer {
        fn new() -> Self {
            let doc = Doc::new();
            doc.get_or_insert_text(CONTENT_CHANNEL);
            Self { doc }
        }

        fn step1(&self) -> Vec<u8> {
            protocol::encode_sync_step1(&self.doc.transact().state_vector().encode_v1())
        }

        fn apply_frame(&self, frame: &[u8]) {
            let (ty, mut r) = protocol::decode_frame(frame).unwrap();
            assert_eq!(ty, MessageType::Sync);
            let kind = SyncKind::from_tag(r.read_var_uint().unwrap()).unwrap();
            assert_ne!(kind, SyncKind::Step1);
            let update = Update::decode_v1(r.read_var_bytes().unwrap()).unwrap();
            self.doc.transact_mut().apply_update(update).unwrap();
        }

        fn edit(&self, index: u32, chunk: &str) -> Vec<u8> {
            let text = self.doc.get_or_insert_text(CONTENT_CHANNEL);
            let before = self.doc.transact().state_vector();
            {
                let mut txn = self.doc.transact_mut();
                text.insert(&mut txn, index, chunk);
            }
            let update = self.doc.transact().encode_state_as_update_v1(&before);
            protocol::encode_sync_update(&update)
        }

        fn text(&self) -> String {
            let text = self.doc.get_or_insert_text(CONTENT_CHANNEL);
            text.get_string(&self.doc.transact())
        }
    }

    async fn feed(hub: &Arc<NoteHub>, conn: &Arc<Connection>, frame: &[u8]) {
        let (ty, reader) = protocol::decode_frame(frame).unwrap();
        hub.handle_incoming(ty, reader, conn).await.unwrap();
    }

    /// Admit a connection the way the admitter does: register, then deliver
    /// the initial STEP1 + awareness snapshot through its queue.
    async fn join(hub: &Arc<NoteHub>, name: &str) -> (Arc<Connection>, UnboundedReceiver<Message>) {
        let (conn, rx) = Connection::channel(user(name));
        hub.connect(conn.clone()).await.unwrap();
        let (step1, awareness) = hub.initial_frames().await.unwrap();
        conn.send(step1);
        conn.send(awareness);
        (conn, rx)
    }

    async fn handshake(
        hub: &Arc<NoteHub>,
        conn: &Arc<Connection>,
        rx: &mut UnboundedReceiver<Message>,
        peer: &Peer,
    ) {
        // Server opened with STEP1 + awareness; answer the STEP1 with our
        // STEP2 (empty diff for a fresh peer) and ask for the server state.
        let frames = recv_frames(rx);
        assert_eq!(frames.len(), 2);
        feed(hub, conn, &peer.step1()).await;
        let response = recv_frames(rx);
        peer.apply_frame(&response[0]);
        let step2 = {
            let update = peer
                .doc
                .transact()
                .encode_state_as_update_v1(&StateVector::default());
            protocol::encode_sync_step2(&update)
        };
        feed(hub, conn, &step2).await;
        assert!(conn.is_synced());
    }

    #[tokio::test]
    async fn solo_edit_converges_without_fanout() {
        let hub = hub("# seed\n");
        let (conn, mut rx) = join(&hub, "ada").await;
        let peer = Peer::new();
        handshake(&hub, &conn, &mut rx, &peer).await;
        assert_eq!(peer.text(), "# seed\n");

        let offset = peer.text().len() as u32;
        feed(&hub, &conn, &peer.edit(offset, "hi")).await;
        assert_eq!(hub.snapshot_text().await.unwrap(), "# seed\nhi");

        // The origin is the only participant; nothing may come back.
        assert!(recv_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn update_fans_out_to_synced_peers_only() {
        let hub = hub("");
        let (conn_a, mut rx_a) = join(&hub, "ada").await;
        let peer_a = Peer::new();
        handshake(&hub, &conn_a, &mut rx_a, &peer_a).await;

        let (conn_b, mut rx_b) = join(&hub, "grace").await;
        let peer_b = Peer::new();
        handshake(&hub, &conn_b, &mut rx_b, &peer_b).await;

        // A third connection that never completed its handshake.
        let (_conn_c, mut rx_c) = join(&hub, "lin").await;
        let _ = recv_frames(&mut rx_c);

        feed(&hub, &conn_a, &peer_a.edit(0, "x")).await;

        let to_b = recv_frames(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        peer_b.apply_frame(&to_b[0]);
        assert_eq!(peer_b.text(), "x");

        assert!(recv_frames(&mut rx_a).is_empty(), "origin must not hear its own update");
        assert!(recv_frames(&mut rx_c).is_empty(), "unsynced peer must wait for its STEP2");
    }

    #[tokio::test]
    async fn broadcast_payload_matches_raw_update_bytes() {
        let hub = hub("");
        let (conn_a, mut rx_a) = join(&hub, "ada").await;
        let peer_a = Peer::new();
        handshake(&hub, &conn_a, &mut rx_a, &peer_a).await;
        let (conn_b, mut rx_b) = join(&hub, "grace").await;
        let peer_b = Peer::new();
        handshake(&hub, &conn_b, &mut rx_b, &peer_b).await;

        let sent = peer_a.edit(0, "bytes");
        feed(&hub, &conn_a, &sent).await;
        let received = recv_frames(&mut rx_b);
        assert_eq!(received, vec![sent]);
    }

    #[tokio::test]
    async fn awareness_echoes_to_everyone_and_cleans_up_on_leave() {
        let hub = hub("");
        let (conn_a, mut rx_a) = join(&hub, "ada").await;
        let (conn_b, mut rx_b) = join(&hub, "grace").await;
        let _ = recv_frames(&mut rx_a);
        let _ = recv_frames(&mut rx_b);

        let announce = protocol::encode_awareness(&[AwarenessEntry {
            client_id: 77,
            clock: 0,
            state: Some(r#"{"cursor":0}"#.into()),
        }]);
        feed(&hub, &conn_a, &announce).await;

        assert_eq!(recv_frames(&mut rx_a).len(), 1, "awareness echoes to the origin");
        assert_eq!(recv_frames(&mut rx_b).len(), 1);

        // A leaves; B must see client 77 removed.
        hub.remove(&conn_a).await;
        let frames = recv_frames(&mut rx_b);
        assert_eq!(frames.len(), 1);
        let (_, mut r) = protocol::decode_frame(&frames[0]).unwrap();
        let entries = protocol::decode_awareness_update(r.read_var_bytes().unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].client_id, 77);
        assert!(entries[0].state.is_none());
    }

    #[tokio::test]
    async fn last_leaver_destroys_exactly_once() {
        let destroyed = Arc::new(AtomicBool::new(false));
        let flag = destroyed.clone();
        let hub = Arc::new(NoteHub::new(
            "n1".into(),
            NoteDoc::new("").unwrap(),
            Box::new(move || {
                assert!(!flag.swap(true, Ordering::SeqCst), "destroy callback ran twice");
            }),
        ));

        let (conn_a, _rx_a) = join(&hub, "ada").await;
        let (conn_b, _rx_b) = join(&hub, "grace").await;

        hub.remove(&conn_a).await;
        assert!(!hub.is_closing());

        hub.remove(&conn_b).await;
        assert!(hub.is_closing());
        assert!(destroyed.load(Ordering::SeqCst));
        assert_eq!(hub.connection_count().await, 0);

        // Repeated destruction and late removals are harmless.
        hub.destroy().await;
        hub.remove(&conn_b).await;
    }

    #[tokio::test]
    async fn closing_hub_accepts_no_connections_and_drops_frames() {
        let hub = hub("");
        let (conn, _rx) = join(&hub, "ada").await;
        hub.destroy().await;

        let (late, _rx_late) = Connection::channel(user("grace"));
        assert!(hub.connect(late).await.is_err());
        assert!(hub.initial_frames().await.is_none());

        // Frames from the still-draining connection are swallowed quietly.
        let peer = Peer::new();
        feed(&hub, &conn, &peer.step1()).await;
    }
}
