//! Observable connection states.

use serde::{Deserialize, Serialize};

/// Where the connection state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum LinkState {
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open; `hello`, `authenticate` and state rebuild in progress.
    Registering,
    /// Registered and ready for RPCs.
    Connected,
}

/// User-visible connection status.
///
/// Unlike [`LinkState`] this records why the last attempt failed, and it is
/// not updated while the connection is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum ConnectionStatus {
    Unknown,
    Unreachable,
    VersionMismatch,
    AccessDenied,
    ServerMismatch,
    Connected,
}

impl ConnectionStatus {
    /// Status that a failed connection attempt should surface.
    pub fn from_error(error: &crate::HtspError) -> Self {
        use crate::HtspError;
        match error {
            HtspError::VersionMismatch { .. } => ConnectionStatus::VersionMismatch,
            HtspError::AccessDenied { .. } => ConnectionStatus::AccessDenied,
            HtspError::ServerMismatch { .. } | HtspError::Protocol { .. } => {
                ConnectionStatus::ServerMismatch
            }
            _ => ConnectionStatus::Unreachable,
        }
    }
}
