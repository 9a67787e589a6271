//! Error types for the HTSP client.
//!
//! This module provides the error taxonomy shared by every layer of the client.
//! All errors implement `std::error::Error`, carry structured context, and say
//! whether they are worth retrying.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: socket open/read/write failures; the connection is
//!   torn down and a reconnect is scheduled
//! - **Protocol Errors**: truncated frames, unknown field tags, missing
//!   mandatory fields; only the offending frame is dropped
//! - **Server Errors**: the server answered an RPC with `error` or `noaccess`;
//!   the connection stays up
//! - **Handshake Errors**: access denied, protocol version mismatch, or a peer
//!   that does not speak HTSP at all
//! - **Timeouts**: no response within the configured window; escalates to a
//!   full disconnect
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use htsp_client::HtspError;
//!
//! let error = HtspError::transport("connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for HTSP operations.
pub type Result<T, E = HtspError> = std::result::Result<T, E>;

/// Main error type for HTSP operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HtspError {
    #[error("Transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("Server rejected '{method}': {message}")]
    Server { method: String, message: String },

    #[error("Access denied for '{method}'")]
    AccessDenied { method: String },

    #[error("Server protocol version {found} is below the supported minimum {minimum}")]
    VersionMismatch { minimum: u32, found: u32 },

    #[error("Peer is not a compatible HTSP server: {reason}")]
    ServerMismatch { reason: String },

    #[error("No response to '{method}' after {duration:?}")]
    Timeout { method: String, duration: Duration },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Connection not ready after {waited:?}")]
    NotReady { waited: Duration },

    #[error("Invalid state: {context}")]
    InvalidState { context: String },

    #[error("Seek failed: {reason}")]
    Seek { reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Configuration file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HtspError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            HtspError::Transport { .. } => true,
            HtspError::Timeout { .. } => true,
            HtspError::ConnectionLost { .. } => true,
            HtspError::NotReady { .. } => true,
            HtspError::Server { .. } => true,
            HtspError::AccessDenied { .. } => true,
            HtspError::Protocol { .. } => false,
            HtspError::VersionMismatch { .. } => false,
            HtspError::ServerMismatch { .. } => false,
            HtspError::InvalidState { .. } => false,
            HtspError::Seek { .. } => false,
            HtspError::Config { .. } => false,
            HtspError::File { .. } => false,
        }
    }

    /// Whether this error should tear down the current connection epoch.
    ///
    /// Only write failures and missing responses escalate; every other RPC
    /// failure stays local to its caller.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, HtspError::Transport { .. } | HtspError::Timeout { .. })
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            HtspError::Transport { .. } => vec![
                "Check that the server host and HTSP port are reachable",
                "Verify no firewall is blocking the HTSP port",
                "Wait for the automatic reconnect",
            ],
            HtspError::Protocol { .. } => vec![
                "Check that the server speaks a supported HTSP version",
                "Report the offending message to the server maintainers",
            ],
            HtspError::Server { .. } => vec![
                "Inspect the server log for the rejected request",
                "Retry the request once the server state has changed",
            ],
            HtspError::AccessDenied { .. } => vec![
                "Verify the configured username and password",
                "Check the user's access rights on the server",
            ],
            HtspError::VersionMismatch { .. } => vec![
                "Upgrade the server to a supported release",
                "Check the server/client compatibility matrix",
            ],
            HtspError::ServerMismatch { .. } => vec![
                "Verify the configured port is the HTSP port, not the web port",
                "Check the host points at an HTSP server",
            ],
            HtspError::Timeout { .. } => vec![
                "Increase the response timeout",
                "Check server load and network latency",
            ],
            HtspError::ConnectionLost { .. } => vec![
                "Retry the operation after the connection is re-established",
            ],
            HtspError::NotReady { .. } => vec![
                "Wait for the connection to finish registering",
                "Increase the connect timeout",
            ],
            HtspError::InvalidState { .. } => vec![
                "Open the subscription or file before using it",
                "Check the call order of the operation",
            ],
            HtspError::Seek { .. } => vec![
                "Check that timeshift is enabled on the server",
                "Seek to a position inside the timeshift buffer",
            ],
            HtspError::Config { .. } => vec![
                "Fix the reported configuration value",
                "Fall back to the default configuration",
            ],
            HtspError::File { .. } => vec![
                "Check the configuration file exists and is readable",
                "Check file permissions",
            ],
        }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        HtspError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with an I/O source.
    pub fn transport_io(reason: impl Into<String>, source: std::io::Error) -> Self {
        HtspError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        HtspError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for a missing or malformed mandatory field.
    pub fn missing_field(context: impl Into<String>, field: &str) -> Self {
        HtspError::Protocol {
            context: context.into(),
            details: format!("missing or malformed field '{}'", field),
        }
    }

    /// Helper constructor for connection loss.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        HtspError::ConnectionLost { reason: reason.into() }
    }

    /// Helper constructor for invalid state errors.
    pub fn invalid_state(context: impl Into<String>) -> Self {
        HtspError::InvalidState { context: context.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        HtspError::Config { reason: reason.into() }
    }
}

impl From<std::io::Error> for HtspError {
    fn from(err: std::io::Error) -> Self {
        HtspError::Transport { reason: err.kind().to_string(), source: Some(err) }
    }
}
