//! Registration handshake: `hello` followed by `authenticate`.

use bytes::Bytes;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::Connection;
use crate::message::{Message, Value};
use crate::{HtspError, Result};

/// Protocol version this client speaks.
pub const HTSP_CLIENT_VERSION: u32 = 34;

/// Oldest server protocol version accepted.
pub const HTSP_MIN_SERVER_VERSION: u32 = 19;

/// First protocol version reporting structured `subscriptionError` codes.
pub const HTSP_STRUCTURED_ERRORS_VERSION: u32 = 20;

/// What the server told us about itself in its `hello` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: u32,
    pub webroot: String,
    pub capabilities: Vec<String>,
    #[serde(skip)]
    pub challenge: Bytes,
}

impl ServerInfo {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Whether `subscriptionStatus` carries a `subscriptionError` code.
    pub fn has_structured_errors(&self) -> bool {
        self.protocol_version >= HTSP_STRUCTURED_ERRORS_VERSION
    }

    /// Parse a `hello` reply.
    pub fn from_hello(reply: &Message) -> Result<Self> {
        let protocol_version = reply.get_u32("htspversion").ok_or_else(|| {
            HtspError::ServerMismatch { reason: "hello reply lacks htspversion".into() }
        })?;
        let challenge = reply
            .get_bin("challenge")
            .cloned()
            .ok_or_else(|| HtspError::ServerMismatch { reason: "hello reply lacks challenge".into() })?;

        let capabilities = reply
            .get_list("servercapability")
            .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            name: reply.get_str("servername").unwrap_or("unknown").to_string(),
            version: reply.get_str("serverversion").unwrap_or("unknown").to_string(),
            protocol_version,
            webroot: reply.get_str("webroot").unwrap_or_default().to_string(),
            capabilities,
            challenge,
        })
    }
}

/// `SHA1(password ++ challenge)`.
pub fn auth_digest(password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

/// Run `hello` and, when credentials are configured, `authenticate`.
///
/// Uses the forced RPC path: the connection is not ready until this succeeds.
pub(super) async fn register(conn: &Connection) -> Result<ServerInfo> {
    let config = conn.config();
    let timeout = config.response_timeout();

    let hello = Message::new()
        .with("clientname", config.client_name.as_str())
        .with("htspversion", HTSP_CLIENT_VERSION);
    let reply = conn.send_and_wait_forced("hello", hello, timeout).await?;
    let info = ServerInfo::from_hello(&reply)?;

    info!(
        server = %info.name,
        version = %info.version,
        protocol = info.protocol_version,
        "Connected to HTSP server"
    );
    debug!(capabilities = ?info.capabilities, webroot = %info.webroot, "Server details");

    if info.protocol_version < HTSP_MIN_SERVER_VERSION {
        return Err(HtspError::VersionMismatch {
            minimum: HTSP_MIN_SERVER_VERSION,
            found: info.protocol_version,
        });
    }

    if config.username.is_empty() {
        debug!("No username configured, skipping authentication");
        return Ok(info);
    }

    let digest = auth_digest(&config.password, &info.challenge);
    let auth = Message::new()
        .with("username", config.username.as_str())
        .with("digest", digest);
    match conn.send_and_wait_forced("authenticate", auth, timeout).await {
        Ok(_) => {
            debug!(user = %config.username, "Authenticated");
            Ok(info)
        }
        Err(e @ HtspError::AccessDenied { .. }) => {
            warn!(user = %config.username, "Server denied access");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_reply(version: u32) -> Message {
        Message::new()
            .with("servername", "Tvheadend")
            .with("serverversion", "4.3-1234")
            .with("htspversion", version)
            .with("webroot", "/tvh")
            .with("servercapability", vec![Value::from("timeshift"), Value::from("imagecache")])
            .with("challenge", vec![1u8; 32])
    }

    #[test]
    fn parses_full_hello_reply() {
        let info = ServerInfo::from_hello(&hello_reply(34)).unwrap();
        assert_eq!(info.name, "Tvheadend");
        assert_eq!(info.protocol_version, 34);
        assert_eq!(info.webroot, "/tvh");
        assert!(info.has_capability("timeshift"));
        assert!(!info.has_capability("trickplay"));
        assert!(info.has_structured_errors());
        assert_eq!(info.challenge.len(), 32);
    }

    #[test]
    fn legacy_servers_lack_structured_errors() {
        let info = ServerInfo::from_hello(&hello_reply(19)).unwrap();
        assert!(!info.has_structured_errors());
    }

    #[test]
    fn non_htsp_peer_is_a_server_mismatch() {
        let mut reply = hello_reply(34);
        reply.remove("htspversion");
        assert!(matches!(ServerInfo::from_hello(&reply), Err(HtspError::ServerMismatch { .. })));

        let mut reply = hello_reply(34);
        reply.remove("challenge");
        assert!(matches!(ServerInfo::from_hello(&reply), Err(HtspError::ServerMismatch { .. })));
    }

    #[test]
    fn digest_is_sha1_of_password_then_challenge() {
        // SHA1("abc")
        let digest = auth_digest("ab", b"c");
        assert_eq!(
            digest,
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
                0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
        assert_eq!(digest.len(), 20);
    }
}
