//! Async client core for the HTSP streaming protocol.
//!
//! HTSP is a length-prefixed binary RPC/push protocol spoken by media
//! server backends. This crate covers the engine underneath a player
//! front end:
//!
//! - **Codec**: the nested map wire format ([`message`]).
//! - **Connection**: handshake, authentication, request correlation,
//!   reconnect with backoff, suspend/resume ([`connection`]).
//! - **Live streams**: subscriptions and a demuxer that turns `muxpkt`
//!   pushes into timestamped packets ([`subscription`], [`demux`]).
//! - **Recordings**: random-access reads of remote files ([`vfs`]).
//! - **Initial sync**: a phase barrier over the catalog replay ([`async_state`]).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use htsp_client::{ClientConfig, Htsp};
//! use htsp_client::demux::DemuxItem;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> htsp_client::Result<()> {
//!     let config = ClientConfig { host: "tvheadend.local".into(), ..ClientConfig::default() };
//!     let client = Htsp::connect(config)?;
//!     client.wait_until_ready(Duration::from_secs(10)).await?;
//!
//!     let demuxer = client.demuxer();
//!     demuxer.open(1, client.config().default_weight).await?;
//!     while let Some(item) = demuxer.read().await {
//!         if let DemuxItem::Packet(packet) = item {
//!             println!("stream {} pts {:?}", packet.stream_id, packet.pts);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

pub mod config;
pub mod message;
pub mod transport;

pub mod connection;

pub mod async_state;
pub mod client;
pub mod demux;
pub mod subscription;
pub mod vfs;

// Core exports
pub use error::*;

pub use async_state::{AsyncPhase, AsyncState};
pub use client::{Client, GenericPush};
pub use config::{ClientConfig, DemuxConfig, QueuePolicy, ReconnectPolicy, VfsConfig};
pub use connection::{Connection, ConnectionStatus, LinkState, ServerInfo};
pub use demux::{DemuxItem, DemuxPacket, Demuxer, StreamDescriptor};
pub use message::{Message, Value};
pub use subscription::{Subscription, SubscriptionState};
pub use vfs::VfsReader;

/// Unified entry point for HTSP clients.
///
/// # Examples
///
/// ```rust,no_run
/// use htsp_client::Htsp;
///
/// #[tokio::main]
/// async fn main() -> htsp_client::Result<()> {
///     let client = Htsp::connect_with_file("htsp.yaml")?;
///     // Use client...
///     Ok(())
/// }
/// ```
pub struct Htsp;

impl Htsp {
    /// Start a client for `config`.
    ///
    /// Returns immediately; the connection is established in the background.
    /// Use [`Client::wait_until_ready`] to wait for registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn connect(config: ClientConfig) -> Result<Client> {
        Client::connect(config)
    }

    /// Load a YAML configuration file and start a client for it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML does not parse
    /// - The configuration does not validate
    pub fn connect_with_file<P: AsRef<std::path::Path>>(path: P) -> Result<Client> {
        let config = ClientConfig::from_file(path)?;
        Client::connect(config)
    }
}
