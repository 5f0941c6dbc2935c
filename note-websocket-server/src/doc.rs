//! CRDT document adapter.
//!
//! Wraps one `yrs::Doc` holding the note body in the shared text named by
//! [`CONTENT_CHANNEL`]. The adapter speaks the SYNC sub-protocol: STEP1
//! produces a STEP2 diff for the sender, STEP2/UPDATE are applied and
//! produce nothing. Every applied mutation is captured by an update observer
//! together with its transaction origin, so the hub can re-broadcast the raw
//! update bytes while suppressing the echo to the sender.

use std::sync::{Arc, Mutex, PoisonError};

use note_protocol::{self as protocol, FrameReader, SyncKind, CONTENT_CHANNEL};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, TextRef, Transact, Update};

/// One document mutation the hub still has to fan out.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    /// Raw CRDT update bytes, broadcast verbatim.
    pub update: Vec<u8>,
    /// Origin of the transaction that applied it; `None` for server-local
    /// mutations.
    pub origin: Option<Origin>,
}

pub struct NoteDoc {
    doc: Doc,
    pending: Arc<Mutex<Vec<PendingUpdate>>>,
    _update_sub: Subscription,
}

impl NoteDoc {
    /// Build a fresh replica seeded with the note's saved content.
    pub fn new(initial_content: &str) -> Result<Self, String> {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_CHANNEL);

        let pending: Arc<Mutex<Vec<PendingUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let queue = pending.clone();
        let update_sub = doc
            .observe_update_v1(move |txn, event| {
                let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                queue.push(PendingUpdate {
                    update: event.update.clone(),
                    origin: txn.origin().cloned(),
                });
            })
            .map_err(|e| format!("cannot observe document updates: {e}"))?;

        if !initial_content.is_empty() {
            let mut txn = doc.transact_mut();
            content.insert(&mut txn, 0, initial_content);
        }
        // The seeding insert is not a client edit; new connections pick it up
        // through the STEP1/STEP2 exchange instead.
        pending.lock().unwrap_or_else(PoisonError::into_inner).clear();

        Ok(Self { doc, pending, _update_sub: update_sub })
    }

    fn content(&self) -> TextRef {
        self.doc.get_or_insert_text(CONTENT_CHANNEL)
    }

    /// Current state vector, encoded for a STEP1 offer.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Apply one SYNC sub-frame. Returns the complete response frame to send
    /// back to the origin, if the sub-protocol calls for one: STEP1 always
    /// answers with a STEP2 diff, STEP2 and UPDATE answer with nothing.
    pub fn apply_sync(
        &self,
        reader: &mut FrameReader<'_>,
        origin: &Origin,
    ) -> Result<Option<Vec<u8>>, String> {
        let tag = reader.read_var_uint()?;
        let kind = SyncKind::from_tag(tag).ok_or_else(|| format!("unknown sync step tag {tag}"))?;
        match kind {
            SyncKind::Step1 => {
                let state_vector = StateVector::decode_v1(reader.read_var_bytes()?)
                    .map_err(|e| format!("malformed state vector: {e}"))?;
                let txn = self.doc.transact();
                let diff = txn.encode_state_as_update_v1(&state_vector);
                Ok(Some(protocol::encode_sync_step2(&diff)))
            }
            SyncKind::Step2 | SyncKind::Update => {
                let update = Update::decode_v1(reader.read_var_bytes()?)
                    .map_err(|e| format!("malformed document update: {e}"))?;
                let mut txn = self.doc.transact_mut_with(origin.clone());
                txn.apply_update(update).map_err(|e| format!("update rejected: {e}"))?;
                Ok(None)
            }
        }
    }

    /// Take the mutations recorded since the last drain, in apply order.
    pub fn drain_updates(&self) -> Vec<PendingUpdate> {
        let mut queue = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *queue)
    }

    /// Flattened text of the note body.
    pub fn snapshot_text(&self) -> String {
        self.content().get_string(&self.doc.transact())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_origin() -> Origin {
        Origin::from("test-peer")
    }

    /// Build the update bytes a peer would send after typing `chunk` at the
    /// given offset, based on what it knows of the server state.
    fn peer_update(server: &NoteDoc, index: u32, chunk: &str) -> Vec<u8> {
        let peer = Doc::new();
        let text = peer.get_or_insert_text(CONTENT_CHANNEL);
        {
            let mut txn = peer.transact_mut();
            txn.apply_update(
                Update::decode_v1(
                    &server
                        .doc
                        .transact()
                        .encode_state_as_update_v1(&StateVector::default()),
                )
                .unwrap(),
            )
            .unwrap();
        }
        let before = peer.transact().state_vector();
        {
            let mut txn = peer.transact_mut();
            text.insert(&mut txn, index, chunk);
        }
        let update = peer.transact().encode_state_as_update_v1(&before);
        update
    }

    fn sync_reader(frame: &[u8]) -> FrameReader<'_> {
        let (ty, reader) = protocol::decode_frame(frame).unwrap();
        assert_eq!(ty, protocol::MessageType::Sync);
        reader
    }

    #[test]
    fn seeded_content_is_visible_and_not_queued() {
        let doc = NoteDoc::new("# seeded\n").unwrap();
        assert_eq!(doc.snapshot_text(), "# seeded\n");
        assert!(doc.drain_updates().is_empty());
    }

    #[test]
    fn step1_yields_step2_that_converges_a_fresh_peer() {
        let doc = NoteDoc::new("hello").unwrap();

        let step1 = protocol::encode_sync_step1(&StateVector::default().encode_v1());
        let mut reader = sync_reader(&step1);
        let response = doc.apply_sync(&mut reader, &remote_origin()).unwrap().unwrap();

        let mut reader = sync_reader(&response);
        assert_eq!(
            SyncKind::from_tag(reader.read_var_uint().unwrap()),
            Some(SyncKind::Step2)
        );
        let diff = reader.read_var_bytes().unwrap();

        let peer = Doc::new();
        let text = peer.get_or_insert_text(CONTENT_CHANNEL);
        {
            let mut txn = peer.transact_mut();
            txn.apply_update(Update::decode_v1(diff).unwrap()).unwrap();
        }
        assert_eq!(text.get_string(&peer.transact()), "hello");
    }

    #[test]
    fn update_applies_and_records_its_origin() {
        let doc = NoteDoc::new("ab").unwrap();
        let origin = remote_origin();
        let update = peer_update(&doc, 2, "c");

        let frame = protocol::encode_sync_update(&update);
        let mut reader = sync_reader(&frame);
        assert!(doc.apply_sync(&mut reader, &origin).unwrap().is_none());
        assert_eq!(doc.snapshot_text(), "abc");

        let pending = doc.drain_updates();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].origin.as_ref(), Some(&origin));
        assert!(doc.drain_updates().is_empty());
    }

    #[test]
    fn reapplying_a_known_update_changes_nothing() {
        let doc = NoteDoc::new("x").unwrap();
        let update = peer_update(&doc, 1, "y");

        for _ in 0..2 {
            let frame = protocol::encode_sync_update(&update);
            let mut reader = sync_reader(&frame);
            doc.apply_sync(&mut reader, &remote_origin()).unwrap();
        }
        assert_eq!(doc.snapshot_text(), "xy");
    }

    #[test]
    fn malformed_sync_payloads_are_rejected() {
        let doc = NoteDoc::new("").unwrap();
        let origin = remote_origin();

        let mut w = note_protocol::FrameWriter::new();
        w.write_var_uint(protocol::MessageType::Sync as u64);
        w.write_var_uint(9); // no such sync step
        let frame = w.finish();
        let mut reader = sync_reader(&frame);
        assert!(doc.apply_sync(&mut reader, &origin).is_err());

        let frame = protocol::encode_sync_update(&[0xff, 0xff, 0xff]);
        let mut reader = sync_reader(&frame);
        assert!(doc.apply_sync(&mut reader, &origin).is_err());
    }
}
