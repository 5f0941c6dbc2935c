//! Interfaces to the surrounding application.
//!
//! The realtime subsystem does not own accounts, notes or permissions; it
//! resolves them through these traits during admission and never afterwards.
//! Implementations are expected to apply their own timeouts.

use async_trait::async_trait;

/// An authenticated participant. Read-only for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub display_name: String,
}

/// A note as resolved by the surrounding application. `id` is the primary
/// key used by the hub registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: String,
}

/// The latest persisted revision of a note.
#[derive(Debug, Clone)]
pub struct NoteRevision {
    pub content: String,
}

/// Resolves a session id (extracted from the session cookie) to a username.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn username_from_session_id(&self, session_id: &str) -> Result<String, String>;
}

#[async_trait]
pub trait UsersService: Send + Sync {
    async fn by_username(&self, username: &str) -> Result<User, String>;
}

#[async_trait]
pub trait NotesService: Send + Sync {
    async fn by_id_or_alias(&self, id_or_alias: &str) -> Result<Note, String>;

    /// Latest saved content, used to seed a freshly created hub.
    async fn latest_revision(&self, note: &Note) -> Result<NoteRevision, String>;
}

#[async_trait]
pub trait PermissionsService: Send + Sync {
    async fn may_read(&self, user: &User, note: &Note) -> bool;
}
