//! Admission of upgraded transports.
//!
//! One entry point per incoming WebSocket: parse the session cookie, resolve
//! the user, resolve the note from the request path, check read permission,
//! obtain the hub (creating it with lazily loaded content), and register a
//! connection. Every failure closes the transport; no error frame is sent.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::connection::Connection;
use crate::hub::NoteHub;
use crate::registry::{ContentLoader, HubRegistry};
use crate::ServerConfig;

/// Cookie carrying the signed session id.
pub const SESSION_COOKIE_NAME: &str = "HEDGEDOC_SESSION";

/// Only `/realtime/?noteId=<id>` upgrades are admitted.
const REALTIME_PATH_PREFIX: &str = "/realtime/?noteId=";

/// Why an upgraded transport was turned away. Logged at error level and
/// answered by closing the socket.
#[derive(Debug)]
pub enum AdmissionError {
    MissingCookie,
    MalformedSessionCookie,
    BadCookieSignature,
    MalformedPath(String),
    UnknownSession(String),
    UnknownUser(String),
    UnknownNote(String),
    AccessDenied { username: String, note_id: String },
    ContentLoad(String),
    HubClosing(String),
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::MissingCookie => write!(f, "no {SESSION_COOKIE_NAME} cookie"),
            AdmissionError::MalformedSessionCookie => write!(f, "session cookie has no s:<id>.<sig> shape"),
            AdmissionError::BadCookieSignature => write!(f, "session cookie signature mismatch"),
            AdmissionError::MalformedPath(path) => write!(f, "request path {path:?} is not a realtime endpoint"),
            AdmissionError::UnknownSession(e) => write!(f, "session lookup failed: {e}"),
            AdmissionError::UnknownUser(e) => write!(f, "user lookup failed: {e}"),
            AdmissionError::UnknownNote(e) => write!(f, "note lookup failed: {e}"),
            AdmissionError::AccessDenied { username, note_id } => {
                write!(f, "user {username} may not read note {note_id}")
            }
            AdmissionError::ContentLoad(e) => write!(f, "{e}"),
            AdmissionError::HubClosing(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// What the HTTP upgrade callback captured for admission.
#[derive(Debug, Clone)]
pub(crate) struct UpgradeInfo {
    /// Path and query of the request URI.
    pub target: String,
    /// Raw `Cookie` header, if present.
    pub cookie: Option<String>,
}

/// A fully admitted connection, ready to be driven by the transport pump.
pub(crate) struct Admitted {
    pub hub: Arc<NoteHub>,
    pub conn: Arc<Connection>,
    pub outbound: mpsc::UnboundedReceiver<Message>,
}

pub(crate) async fn admit(
    config: &ServerConfig,
    registry: &HubRegistry,
    info: &UpgradeInfo,
) -> Result<Admitted, AdmissionError> {
    let cookie_header = info.cookie.as_deref().ok_or(AdmissionError::MissingCookie)?;
    let session_id = session_id_from_cookie_header(cookie_header, config.session_secret.as_deref())?;

    let username = config
        .sessions
        .username_from_session_id(&session_id)
        .await
        .map_err(AdmissionError::UnknownSession)?;
    let user = config
        .users
        .by_username(&username)
        .await
        .map_err(AdmissionError::UnknownUser)?;

    let note_ref = extract_note_id(&info.target)?;
    let note = config
        .notes
        .by_id_or_alias(note_ref)
        .await
        .map_err(AdmissionError::UnknownNote)?;

    if !config.permissions.may_read(&user, &note).await {
        return Err(AdmissionError::AccessDenied {
            username: user.username.clone(),
            note_id: note.id.clone(),
        });
    }

    let loader: ContentLoader = {
        let notes = config.notes.clone();
        let note = note.clone();
        Box::new(move || {
            Box::pin(async move { notes.latest_revision(&note).await.map(|rev| rev.content) })
        })
    };
    let hub = registry
        .get_or_create(&note.id, loader)
        .await
        .map_err(AdmissionError::ContentLoad)?;

    let (conn, outbound) = Connection::channel(user);
    if let Err(e) = hub.connect(conn.clone()).await {
        // The hub lost its race against a concurrent teardown; a freshly
        // created hub with nobody aboard must not linger.
        hub.destroy_if_idle().await;
        return Err(AdmissionError::HubClosing(e));
    }
    debug!(
        note = %hub.note_id(),
        conn = conn.id(),
        user = %conn.user().username,
        "connection admitted"
    );

    if let Some((step1, awareness)) = hub.initial_frames().await {
        conn.send(step1);
        conn.send(awareness);
    }

    Ok(Admitted { hub, conn, outbound })
}

/// Extract the note id or alias from the upgrade request target.
pub(crate) fn extract_note_id(target: &str) -> Result<&str, AdmissionError> {
    match target.strip_prefix(REALTIME_PATH_PREFIX) {
        Some(note_ref) if !note_ref.is_empty() => Ok(note_ref),
        _ => Err(AdmissionError::MalformedPath(target.to_string())),
    }
}

/// Pull the session id out of the `Cookie` header. The value has the shape
/// `s:<sessionId>.<signature>`; with a configured secret the signature (an
/// HMAC-SHA256 over the session id, base64 without padding) must verify
/// before the id is trusted.
pub(crate) fn session_id_from_cookie_header(
    header: &str,
    secret: Option<&str>,
) -> Result<String, AdmissionError> {
    for parsed in cookie::Cookie::split_parse_encoded(header) {
        let Ok(candidate) = parsed else { continue };
        if candidate.name() != SESSION_COOKIE_NAME {
            continue;
        }
        let value = candidate.value();
        let Some(signed) = value.strip_prefix("s:") else {
            return Err(AdmissionError::MalformedSessionCookie);
        };
        let Some((session_id, signature)) = signed.split_once('.') else {
            return Err(AdmissionError::MalformedSessionCookie);
        };
        if session_id.is_empty() {
            return Err(AdmissionError::MalformedSessionCookie);
        }
        if let Some(secret) = secret {
            if !signature_matches(session_id, signature, secret) {
                return Err(AdmissionError::BadCookieSignature);
            }
        }
        return Ok(session_id.to_string());
    }
    Err(AdmissionError::MissingCookie)
}

fn signature_matches(session_id: &str, signature: &str, secret: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(session_id.as_bytes());
    let Ok(signature) = STANDARD_NO_PAD.decode(signature.trim_end_matches('=')) else {
        return false;
    };
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(session_id: &str, secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(session_id.as_bytes());
        STANDARD_NO_PAD.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn note_id_extraction_accepts_only_the_realtime_path() {
        assert_eq!(extract_note_id("/realtime/?noteId=abc").unwrap(), "abc");
        assert_eq!(extract_note_id("/realtime/?noteId=features").unwrap(), "features");
        assert!(extract_note_id("/realtime/").is_err());
        assert!(extract_note_id("/realtime/?noteId=").is_err());
        assert!(extract_note_id("/other?noteId=abc").is_err());
        assert!(extract_note_id("/").is_err());
    }

    #[test]
    fn session_id_parses_from_an_encoded_cookie() {
        let header = "theme=dark; HEDGEDOC_SESSION=s%3Aabc123.c2ln; lang=en";
        assert_eq!(session_id_from_cookie_header(header, None).unwrap(), "abc123");
    }

    #[test]
    fn missing_or_foreign_cookies_are_rejected() {
        assert!(matches!(
            session_id_from_cookie_header("", None),
            Err(AdmissionError::MissingCookie)
        ));
        assert!(matches!(
            session_id_from_cookie_header("other=s%3Aabc.def", None),
            Err(AdmissionError::MissingCookie)
        ));
    }

    #[test]
    fn unsigned_shapes_are_rejected() {
        for value in ["abc123", "s%3Aabc123", "s%3A.sig"] {
            let header = format!("HEDGEDOC_SESSION={value}");
            assert!(matches!(
                session_id_from_cookie_header(&header, None),
                Err(AdmissionError::MalformedSessionCookie)
            ));
        }
    }

    #[test]
    fn signature_is_enforced_when_a_secret_is_configured() {
        let secret = "keyboard cat";
        let good = sign("abc123", secret);
        let header = format!("HEDGEDOC_SESSION=s%3Aabc123.{good}");
        assert_eq!(
            session_id_from_cookie_header(&header, Some(secret)).unwrap(),
            "abc123"
        );

        let header = "HEDGEDOC_SESSION=s%3Aabc123.AAAA".to_string();
        assert!(matches!(
            session_id_from_cookie_header(&header, Some(secret)),
            Err(AdmissionError::BadCookieSignature)
        ));

        // Signed with another server's secret.
        let foreign = sign("abc123", "other secret");
        let header = format!("HEDGEDOC_SESSION=s%3Aabc123.{foreign}");
        assert!(session_id_from_cookie_header(&header, Some(secret)).is_err());
    }

    #[test]
    fn padded_signatures_verify_too() {
        let secret = "keyboard cat";
        let mut signature = sign("xyz", secret);
        signature.push('=');
        let header = format!("HEDGEDOC_SESSION=s%3Axyz.{signature}");
        assert_eq!(
            session_id_from_cookie_header(&header, Some(secret)).unwrap(),
            "xyz"
        );
    }
}
