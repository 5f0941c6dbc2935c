//! Message tags and payload types of the realtime note protocol.
//!
//! Every frame starts with a variable-length integer message-type tag. SYNC
//! frames nest a second tag selecting the sync step; AWARENESS frames carry
//! one length-prefixed awareness update. The byte-level layout of sync
//! payloads (state vectors, document updates) belongs to the CRDT library and
//! passes through this crate untouched.

use crate::bytes::{FrameReader, FrameWriter};

/// Top-level message-type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Document synchronization (STEP1 / STEP2 / UPDATE sub-frames).
    Sync = 0,
    /// Presence state exchange.
    Awareness = 1,
    /// Reserved application channel; receipt is logged and ignored.
    Hedgedoc = 2,
}

impl MessageType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            0 => MessageType::Sync,
            1 => MessageType::Awareness,
            2 => MessageType::Hedgedoc,
            _ => return None,
        })
    }
}

/// Sub-protocol tags nested inside a SYNC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncKind {
    /// Sender offers its state vector and asks for what it is missing.
    Step1 = 0,
    /// Diff answering a STEP1: everything the peer lacked.
    Step2 = 1,
    /// Incremental document update.
    Update = 2,
}

impl SyncKind {
    pub fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            0 => SyncKind::Step1,
            1 => SyncKind::Step2,
            2 => SyncKind::Update,
            _ => return None,
        })
    }
}

/// JSON text a client publishes to announce it went away.
pub const AWARENESS_NULL_STATE: &str = "null";

/// Name of the shared text holding the note body. Fixed on both ends: the
/// server seeds it with the saved note content, editors bind it to their
/// editor buffer.
pub const CONTENT_CHANNEL: &str = "codemirror";

/// One client's entry in an awareness update.
///
/// `state` is an opaque JSON document (cursor, selection, user metadata).
/// `None` encodes the removal of the entry; the clock still increases so
/// replicas can order removal against a concurrent re-announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<String>,
}

impl AwarenessEntry {
    pub fn write(&self, w: &mut FrameWriter) {
        w.write_var_uint(self.client_id);
        w.write_var_uint(self.clock);
        match &self.state {
            Some(json) => w.write_var_string(json),
            None => w.write_var_string(AWARENESS_NULL_STATE),
        }
    }

    pub fn read(r: &mut FrameReader<'_>) -> Result<Self, String> {
        let client_id = r.read_var_uint()?;
        let clock = r.read_var_uint()?;
        let json = r.read_var_string()?;
        let state = if json == AWARENESS_NULL_STATE { None } else { Some(json) };
        Ok(Self { client_id, clock, state })
    }
}
