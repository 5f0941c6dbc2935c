//! Frame-level encoders and the inbound frame splitter.
//!
//! Encoders produce complete binary frames ready to hand to the transport.
//! `decode_frame` only consumes the leading message-type tag; the returned
//! reader is positioned on the payload and routed by the caller, so sync
//! payloads stay opaque byte slices here.

use crate::bytes::{FrameReader, FrameWriter};
use crate::protocol::{AwarenessEntry, MessageType, SyncKind};

/// SYNC STEP1 frame offering `state_vector` to the peer.
pub fn encode_sync_step1(state_vector: &[u8]) -> Vec<u8> {
    encode_sync(SyncKind::Step1, state_vector)
}

/// SYNC STEP2 frame carrying the diff a STEP1 asked for.
pub fn encode_sync_step2(update: &[u8]) -> Vec<u8> {
    encode_sync(SyncKind::Step2, update)
}

/// SYNC UPDATE frame wrapping one incremental document update.
pub fn encode_sync_update(update: &[u8]) -> Vec<u8> {
    encode_sync(SyncKind::Update, update)
}

fn encode_sync(kind: SyncKind, payload: &[u8]) -> Vec<u8> {
    let mut w = FrameWriter::new();
    w.write_var_uint(MessageType::Sync as u64);
    w.write_var_uint(kind as u64);
    w.write_var_bytes(payload);
    w.finish()
}

/// AWARENESS frame carrying the given entries. An empty slice is legal and
/// encodes as a zero-length update (sent to fresh connections that join an
/// otherwise empty note).
pub fn encode_awareness(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut w = FrameWriter::new();
    w.write_var_uint(MessageType::Awareness as u64);
    w.write_var_bytes(&encode_awareness_update(entries));
    w.finish()
}

/// Encode the inner awareness update (without the message envelope).
pub fn encode_awareness_update(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut w = FrameWriter::new();
    w.write_var_uint(entries.len() as u64);
    for entry in entries {
        entry.write(&mut w);
    }
    w.finish()
}

/// Decode the inner awareness update read out of an AWARENESS frame.
pub fn decode_awareness_update(payload: &[u8]) -> Result<Vec<AwarenessEntry>, String> {
    let mut r = FrameReader::new(payload);
    let count = usize::try_from(r.read_var_uint()?)
        .map_err(|_| "awareness entry count out of range".to_string())?;
    if count > payload.len() {
        return Err(format!("awareness entry count {count} exceeds payload size"));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(AwarenessEntry::read(&mut r)?);
    }
    Ok(entries)
}

/// Split an inbound frame into its message type and a reader over the rest.
pub fn decode_frame(frame: &[u8]) -> Result<(MessageType, FrameReader<'_>), String> {
    let mut r = FrameReader::new(frame);
    let tag = r.read_var_uint()?;
    let ty = MessageType::from_tag(tag).ok_or_else(|| format!("unknown message type tag {tag}"))?;
    Ok((ty, r))
}
