//! Minimal CLI to run the realtime note server with in-memory services.
//!
//! Usage:
//!   cargo run -p note-websocket-server --example simple-server -- [--host 127.0.0.1] [--port 9000]
//!   cargo run -p note-websocket-server --example simple-server -- --addr 0.0.0.0:9000 --session-secret s3cret
//!
//! Every session id names its user, every note exists and starts empty, and
//! everyone may read. Useful for exercising editor clients against a live
//! server; real deployments wire the service traits to their application.

use std::error::Error;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use note_websocket_server::services::{
    Note, NoteRevision, NotesService, PermissionsService, SessionService, User, UsersService,
};
use note_websocket_server::{RealtimeServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "simple-server", about = "Realtime note server with in-memory services")]
struct Args {
    #[arg(short = 'a', long, value_name = "ADDR", conflicts_with_all = ["host", "port"], help = "Full socket address to bind, e.g. 0.0.0.0:9000")]
    addr: Option<String>,

    #[arg(short = 'H', long, default_value = "127.0.0.1", help = "Host to bind when --addr not provided")]
    host: String,

    #[arg(short = 'p', long, default_value_t = 9000, help = "Port to bind when --addr not provided")]
    port: u16,

    #[arg(long, value_name = "SECRET", help = "Verify session cookie signatures against this secret")]
    session_secret: Option<String>,
}

/// Accepts everyone and remembers note contents for the process lifetime.
#[derive(Default)]
struct OpenBackend {
    notes: Mutex<std::collections::HashMap<String, String>>,
}

#[async_trait]
impl SessionService for OpenBackend {
    async fn username_from_session_id(&self, session_id: &str) -> Result<String, String> {
        Ok(format!("user-{session_id}"))
    }
}

#[async_trait]
impl UsersService for OpenBackend {
    async fn by_username(&self, username: &str) -> Result<User, String> {
        Ok(User { username: username.to_string(), display_name: username.to_string() })
    }
}

#[async_trait]
impl NotesService for OpenBackend {
    async fn by_id_or_alias(&self, id_or_alias: &str) -> Result<Note, String> {
        self.notes.lock().unwrap().entry(id_or_alias.to_string()).or_default();
        Ok(Note { id: id_or_alias.to_string() })
    }

    async fn latest_revision(&self, note: &Note) -> Result<NoteRevision, String> {
        let notes = self.notes.lock().unwrap();
        Ok(NoteRevision { content: notes.get(&note.id).cloned().unwrap_or_default() })
    }
}

#[async_trait]
impl PermissionsService for OpenBackend {
    async fn may_read(&self, _user: &User, _note: &Note) -> bool {
        true
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).compact().init();

    let args = Args::parse();
    let addr = args.addr.unwrap_or_else(|| format!("{}:{}", args.host, args.port));

    let backend = Arc::new(OpenBackend::default());
    let mut config =
        ServerConfig::new(backend.clone(), backend.clone(), backend.clone(), backend);
    config.session_secret = args.session_secret;

    info!(%addr, "starting note-websocket-server");
    info!("Press Ctrl-C to stop.");

    let listener = TcpListener::bind(&addr).await?;
    let server = Arc::new(RealtimeServer::new(config));
    server.serve(listener).await
}
