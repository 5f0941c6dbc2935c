//! # Realtime Note Collaboration Server
//!
//! WebSocket server maintaining one authoritative CRDT replica per note.
//! Clients of the same note edit concurrently; every change is applied to
//! the shared replica and fanned out to every other client, per-client
//! presence is kept in sync, and the per-note hub tears itself down when the
//! last client leaves.
//!
//! Admission is cookie-based: the HTTP upgrade must target
//! `/realtime/?noteId=<id>` and carry a `HEDGEDOC_SESSION` cookie, which is
//! resolved to a user through the injected [`services`] implementations.
//!
//! Example (not run here because it binds a socket):
//! ```no_run
//! # use std::sync::Arc;
//! # use note_websocket_server::{RealtimeServer, ServerConfig};
//! # use note_websocket_server::services::*;
//! # async fn run(
//! #     sessions: Arc<dyn SessionService>,
//! #     users: Arc<dyn UsersService>,
//! #     notes: Arc<dyn NotesService>,
//! #     permissions: Arc<dyn PermissionsService>,
//! # ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = ServerConfig::new(sessions, users, notes, permissions);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9000").await?;
//! let server = Arc::new(RealtimeServer::new(config));
//! server.serve(listener).await
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info};

pub mod admitter;
pub mod awareness;
pub mod connection;
pub mod doc;
pub mod hub;
pub mod keepalive;
pub mod registry;
pub mod services;

pub use note_protocol as protocol;

pub use admitter::{AdmissionError, SESSION_COOKIE_NAME};
pub use connection::Connection;
pub use hub::NoteHub;
pub use keepalive::KEEPALIVE_INTERVAL;
pub use registry::{ContentFuture, ContentLoader, HubRegistry};
pub use services::{NotesService, PermissionsService, SessionService, UsersService};

use admitter::UpgradeInfo;
use connection::run_connection;

/// Wiring of the realtime subsystem into the surrounding application.
#[derive(Clone)]
pub struct ServerConfig {
    pub sessions: Arc<dyn SessionService>,
    pub users: Arc<dyn UsersService>,
    pub notes: Arc<dyn NotesService>,
    pub permissions: Arc<dyn PermissionsService>,
    /// Secret the session cookie signature is verified against. Without it
    /// the cookie is only checked for shape.
    pub session_secret: Option<String>,
    /// Ping period of the per-connection keep-alive.
    pub keepalive_interval: Duration,
}

impl ServerConfig {
    pub fn new(
        sessions: Arc<dyn SessionService>,
        users: Arc<dyn UsersService>,
        notes: Arc<dyn NotesService>,
        permissions: Arc<dyn PermissionsService>,
    ) -> Self {
        Self {
            sessions,
            users,
            notes,
            permissions,
            session_secret: None,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }
}

pub struct RealtimeServer {
    config: ServerConfig,
    registry: HubRegistry,
}

impl RealtimeServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, registry: HubRegistry::new() }
    }

    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    /// Accept connections on `listener` until it fails fatally. One task per
    /// connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(addr = %listener.local_addr()?, "realtime server listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(remote = %peer, "accepted TCP connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_socket(stream).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed; continuing");
                }
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream) {
        // The upgrade callback runs synchronously inside the handshake;
        // stash what admission needs and do the async work afterwards.
        let captured: Arc<StdMutex<Option<UpgradeInfo>>> = Arc::new(StdMutex::new(None));
        let capture = captured.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let target = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| req.uri().path().to_string());
            let cookie = req
                .headers()
                .get("Cookie")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let mut slot = capture.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(UpgradeInfo { target, cookie });
            Ok(resp)
        };

        let mut ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(error = %e, "websocket handshake failed");
                return;
            }
        };
        let info = {
            let mut slot = captured.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        let Some(info) = info else {
            let _ = ws.close(None).await;
            return;
        };

        match admitter::admit(&self.config, &self.registry, &info).await {
            Ok(admitted) => {
                run_connection(
                    ws,
                    admitted.hub,
                    admitted.conn,
                    admitted.outbound,
                    self.config.keepalive_interval,
                )
                .await;
            }
            Err(e) => {
                error!(target_path = %info.target, error = %e, "admission denied");
                let _ = ws.close(None).await;
            }
        }
    }
}

/// Bind `addr` and serve with the given configuration.
pub async fn serve(
    addr: &str,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve_incoming(listener, config).await
}

/// Serve a pre-bound listener. Useful for tests binding port 0.
pub async fn serve_incoming(
    listener: TcpListener,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Arc::new(RealtimeServer::new(config)).serve(listener).await
}
