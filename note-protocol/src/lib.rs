//! # Realtime Note Protocol
//!
//! Encoder/decoder for the binary wire format spoken between the note
//! collaboration server and its editor clients. A frame is a variable-length
//! integer message-type tag followed by a type-specific payload:
//!
//! | tag | meaning                                        |
//! |-----|------------------------------------------------|
//! | 0   | SYNC: STEP1 / STEP2 / UPDATE document exchange |
//! | 1   | AWARENESS: per-client presence update          |
//! | 2   | HEDGEDOC: reserved application channel         |
//!
//! Document payloads (state vectors and updates) are opaque CRDT bytes and
//! are carried verbatim; this crate never interprets them.
//!
//! ## Crate layout
//! - `bytes`: `FrameWriter`/`FrameReader` for the LEB128-based primitives
//! - `protocol`: message tags and the awareness entry type
//! - `encoding`: whole-frame encoders and the inbound frame splitter
//!
//! ## Quick start
//!
//! ```
//! use note_protocol::{decode_frame, encode_sync_update, MessageType, SyncKind};
//!
//! let frame = encode_sync_update(&[1, 2, 3]);
//! let (ty, mut rest) = decode_frame(&frame).unwrap();
//! assert_eq!(ty, MessageType::Sync);
//! assert_eq!(SyncKind::from_tag(rest.read_var_uint().unwrap()), Some(SyncKind::Update));
//! assert_eq!(rest.read_var_bytes().unwrap(), &[1, 2, 3]);
//! ```

pub mod bytes;
pub mod encoding;
pub mod protocol;

pub use bytes::{FrameReader, FrameWriter};
pub use encoding::{
    decode_awareness_update, decode_frame, encode_awareness, encode_awareness_update,
    encode_sync_step1, encode_sync_step2, encode_sync_update,
};
pub use protocol::{AwarenessEntry, MessageType, SyncKind, AWARENESS_NULL_STATE, CONTENT_CHANNEL};
