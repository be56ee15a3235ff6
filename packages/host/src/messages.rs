//! The panel wire protocol: closed tagged unions, validated at the
//! boundary. Anything that does not parse into [`PanelRequest`] is
//! rejected with a log entry, never a panic.

use opengui_client::Session;
use opengui_error::RecoveryAction;
use opengui_server_manager::ServerEvent;
use serde::{Deserialize, Serialize};

/// Messages the panel sends to the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum PanelRequest {
    /// The panel finished loading and wants the current session.
    Ready,
    SendMessage {
        content: String,
    },
    StopGeneration,
    SwitchSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    ListSessions,
}

/// Messages the host sends to the panel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum PanelUpdate {
    /// The active session, if one exists yet. Sessions are created lazily
    /// on the first send.
    SessionReady {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
    },
    /// Full accumulated content of the in-flight response. Republished on
    /// every delta so the panel renders a snapshot, not a diff.
    MessageUpdate {
        id: String,
        content: String,
    },
    StreamComplete {
        id: String,
    },
    StreamError {
        id: String,
        error: String,
    },
    SessionList {
        sessions: Vec<Session>,
    },
    /// Out-of-band server degradation, with remediation the panel can
    /// offer the user.
    ServerNotice {
        #[serde(flatten)]
        event: ServerEvent,
        actions: Vec<RecoveryAction>,
    },
}
