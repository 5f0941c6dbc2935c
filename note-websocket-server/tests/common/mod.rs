//! In-memory service implementations and server fixtures shared by the
//! integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use note_websocket_server::services::{
    Note, NoteRevision, NotesService, PermissionsService, SessionService, User, UsersService,
};
use note_websocket_server::{RealtimeServer, ServerConfig, SESSION_COOKIE_NAME};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct TestBackend {
    sessions: Mutex<HashMap<String, String>>,
    notes: Mutex<HashMap<String, String>>,
    denied: Mutex<HashSet<(String, String)>>,
    pub revision_unavailable: AtomicBool,
    pub revision_loads: AtomicUsize,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_session(&self, session_id: &str, username: &str) {
        self.sessions.lock().unwrap().insert(session_id.into(), username.into());
    }

    pub fn add_note(&self, note_id: &str, content: &str) {
        self.notes.lock().unwrap().insert(note_id.into(), content.into());
    }

    pub fn deny(&self, username: &str, note_id: &str) {
        self.denied.lock().unwrap().insert((username.into(), note_id.into()));
    }
}

#[async_trait]
impl SessionService for TestBackend {
    async fn username_from_session_id(&self, session_id: &str) -> Result<String, String> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| format!("unknown session {session_id}"))
    }
}

#[async_trait]
impl UsersService for TestBackend {
    async fn by_username(&self, username: &str) -> Result<User, String> {
        Ok(User { username: username.into(), display_name: username.to_uppercase() })
    }
}

#[async_trait]
impl NotesService for TestBackend {
    async fn by_id_or_alias(&self, id_or_alias: &str) -> Result<Note, String> {
        let notes = self.notes.lock().unwrap();
        if notes.contains_key(id_or_alias) {
            Ok(Note { id: id_or_alias.into() })
        } else {
            Err(format!("unknown note {id_or_alias}"))
        }
    }

    async fn latest_revision(&self, note: &Note) -> Result<NoteRevision, String> {
        self.revision_loads.fetch_add(1, Ordering::SeqCst);
        if self.revision_unavailable.load(Ordering::SeqCst) {
            return Err("revision store unavailable".into());
        }
        let notes = self.notes.lock().unwrap();
        notes
            .get(&note.id)
            .map(|content| NoteRevision { content: content.clone() })
            .ok_or_else(|| format!("note {} has no revision", note.id))
    }
}

#[async_trait]
impl PermissionsService for TestBackend {
    async fn may_read(&self, user: &User, note: &Note) -> bool {
        let denied = self.denied.lock().unwrap();
        !denied.contains(&(user.username.clone(), note.id.clone()))
    }
}

pub fn config_for(backend: &Arc<TestBackend>) -> ServerConfig {
    ServerConfig::new(backend.clone(), backend.clone(), backend.clone(), backend.clone())
}

/// Spawn a server on an ephemeral port; returns it with its `ws://` base.
pub async fn start_server(config: ServerConfig) -> (Arc<RealtimeServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp listener");
    let addr = listener.local_addr().expect("local addr");
    let server = Arc::new(RealtimeServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://{addr}"))
}

pub fn note_url(base: &str, note_id: &str) -> String {
    format!("{base}/realtime/?noteId={note_id}")
}

pub fn session_cookie(session_id: &str) -> String {
    format!("{SESSION_COOKIE_NAME}=s%3A{session_id}.unsigned")
}

/// Poll until `predicate` holds, failing the test on timeout.
pub async fn eventually<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !predicate() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
