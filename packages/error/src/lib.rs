use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remediation the presentation layer can offer alongside a failure.
/// User-visible errors always carry at least one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Restart,
    ShowLogs,
    OpenSettings,
    Retry,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("opencode binary not found; set a binary path or install opencode on PATH")]
    BinaryNotFound,

    #[error("server process failed to launch: {message}")]
    SpawnFailed {
        binary: PathBuf,
        message: String,
    },

    #[error("port {port} is in use by a foreign process and could not be freed")]
    PortInUse { port: u16 },

    #[error("server did not become healthy after {attempts} probes")]
    ServerUnhealthy { attempts: usize },

    #[error("failed to create session: {message}")]
    SessionCreate { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("stream error: {message}")]
    Stream { message: String },
}

impl HostError {
    /// Actions the presentation layer should offer for this failure.
    pub fn recovery_actions(&self) -> &'static [RecoveryAction] {
        match self {
            Self::BinaryNotFound => &[RecoveryAction::OpenSettings, RecoveryAction::ShowLogs],
            Self::SpawnFailed { .. } => &[RecoveryAction::ShowLogs, RecoveryAction::Retry],
            Self::PortInUse { .. } => &[RecoveryAction::Restart, RecoveryAction::ShowLogs],
            Self::ServerUnhealthy { .. } => &[RecoveryAction::Restart, RecoveryAction::ShowLogs],
            Self::SessionCreate { .. } => &[RecoveryAction::Retry, RecoveryAction::Restart],
            Self::Transport { .. } => &[RecoveryAction::Retry, RecoveryAction::ShowLogs],
            Self::Stream { .. } => &[RecoveryAction::Retry],
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    pub fn stream(err: impl std::fmt::Display) -> Self {
        Self::Stream {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_offers_a_recovery_action() {
        let errors = [
            HostError::BinaryNotFound,
            HostError::SpawnFailed {
                binary: PathBuf::from("/usr/bin/opencode"),
                message: "exited immediately".to_string(),
            },
            HostError::PortInUse { port: 47339 },
            HostError::ServerUnhealthy { attempts: 10 },
            HostError::SessionCreate {
                message: "503".to_string(),
            },
            HostError::Transport {
                message: "connection refused".to_string(),
            },
            HostError::Stream {
                message: "sse closed".to_string(),
            },
        ];
        for err in errors {
            assert!(!err.recovery_actions().is_empty(), "{err}");
        }
    }
}
