//! HTSP connection: socket lifecycle, registration and RPC correlation.
//!
//! A [`Connection`] owns one supervisor task for its whole lifetime. Each
//! pass of the supervisor is a *connection epoch*:
//!
//! 1. **Connecting**: open the TCP socket.
//! 2. **Registering**: a short-lived task sends `hello` and `authenticate`
//!    and then calls [`ConnectionListener::rebuild_state`]. It runs beside the
//!    read loop because the handshake replies arrive through that loop.
//! 3. **Connected**: callers blocked in [`Connection::send_and_wait`] are
//!    released.
//!
//! The read loop classifies every frame: a `seq` with a registered waiter is
//! a response; otherwise a `method` makes it a push, routed to the
//! [`SubscriptionSink`] owning its `subscriptionId` or else to the listener.
//!
//! A socket write failure or an unanswered RPC ends the epoch: pending
//! requests fail, the socket closes, and after a backoff the supervisor starts
//! over. While suspended no attempt is made at all.

mod handshake;
mod pending;
mod push;
mod state;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ClientConfig, ReconnectState};
use crate::message::{Message, decode_payload, encode_frame};
use crate::transport::{self, FrameReader, FrameWriter};
use crate::{HtspError, Result};

pub use handshake::{
    HTSP_CLIENT_VERSION, HTSP_MIN_SERVER_VERSION, HTSP_STRUCTURED_ERRORS_VERSION, ServerInfo,
    auth_digest,
};
pub use pending::PendingRequests;
pub use push::SubscriptionPush;
pub use state::{ConnectionStatus, LinkState};

/// Owner-side hooks the connection calls back into.
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    /// Restore subscriptions and open files after registration.
    ///
    /// Runs before the connection is marked ready, so any RPC issued here
    /// must use [`Connection::send_and_wait_forced`]. An error aborts the
    /// epoch and schedules a reconnect.
    async fn rebuild_state(&self, conn: &Connection) -> Result<()>;

    /// A push that no subscription claimed.
    fn process_push(&self, method: &str, msg: Message);

    fn status_changed(&self, _status: ConnectionStatus) {}

    /// Human-readable notice meant for the user.
    fn user_notice(&self, message: &str) {
        info!(notice = message, "User notice");
    }
}

/// Receiver of pushes for one subscription id.
pub trait SubscriptionSink: Send + Sync {
    fn handle_push(&self, kind: SubscriptionPush, msg: &Message);
}

/// Connection to one HTSP server.
///
/// Once started, the supervisor task holds a strong reference, so dropping
/// the last user handle does not end it. Call [`Connection::stop`];
/// [`Client`](crate::Client) does so when dropped.
pub struct Connection {
    config: Arc<ClientConfig>,
    listener: Weak<dyn ConnectionListener>,
    pending: PendingRequests,
    sinks: Mutex<HashMap<u32, Weak<dyn SubscriptionSink>>>,
    writer: tokio::sync::Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    server: RwLock<Option<ServerInfo>>,
    link_tx: watch::Sender<LinkState>,
    status_tx: watch::Sender<ConnectionStatus>,
    ready_tx: watch::Sender<bool>,
    suspended_tx: watch::Sender<bool>,
    /// Cancelled to end the current epoch.
    epoch: Mutex<CancellationToken>,
    /// Cancelled to stop the supervisor for good.
    shutdown: CancellationToken,
    started: AtomicBool,
    next_subscription_id: AtomicU32,
    registrations: AtomicU64,
}

impl Connection {
    /// Create a connection; nothing happens on the network until [`Connection::start`].
    pub fn new(config: Arc<ClientConfig>, listener: Weak<dyn ConnectionListener>) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            config,
            listener,
            pending: PendingRequests::new(),
            sinks: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(None),
            server: RwLock::new(None),
            link_tx: watch::Sender::new(LinkState::Disconnected),
            status_tx: watch::Sender::new(ConnectionStatus::Unknown),
            ready_tx: watch::Sender::new(false),
            suspended_tx: watch::Sender::new(false),
            epoch: Mutex::new(shutdown.child_token()),
            shutdown,
            started: AtomicBool::new(false),
            next_subscription_id: AtomicU32::new(0),
            registrations: AtomicU64::new(0),
        })
    }

    /// Spawn the supervisor task. Calling it again is a no-op.
    ///
    /// The task keeps the connection alive until [`Connection::stop`].
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.run().await });
    }

    /// Stop the supervisor and close the socket.
    pub fn stop(&self) {
        debug!("Stopping connection");
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn response_timeout(&self) -> Duration {
        self.config.response_timeout()
    }

    // ------------------------------------------------------------------
    // Observable state
    // ------------------------------------------------------------------

    pub fn link_state(&self) -> LinkState {
        *self.link_tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended_tx.borrow()
    }

    /// Stream of user-visible status changes, starting with the current one.
    pub fn status_updates(&self) -> impl Stream<Item = ConnectionStatus> + 'static {
        WatchStream::new(self.status_tx.subscribe())
    }

    /// Stream of link state transitions, starting with the current one.
    pub fn link_updates(&self) -> impl Stream<Item = LinkState> + 'static {
        WatchStream::new(self.link_tx.subscribe())
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server.read().clone()
    }

    pub fn protocol_version(&self) -> u32 {
        self.server.read().as_ref().map(|s| s.protocol_version).unwrap_or(0)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.server.read().as_ref().is_some_and(|s| s.has_capability(capability))
    }

    /// Number of epochs that completed registration.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Wait until registration has completed.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut ready = self.ready_tx.subscribe();
        tokio::select! {
            result = tokio::time::timeout(timeout, ready.wait_for(|r| *r)) => match result {
                Ok(Ok(_)) => Ok(()),
                _ => Err(HtspError::NotReady { waited: timeout }),
            },
            _ = self.shutdown.cancelled() => Err(HtspError::connection_lost("connection stopped")),
        }
    }

    // ------------------------------------------------------------------
    // Suspend / resume
    // ------------------------------------------------------------------

    /// Close the socket and hold off reconnecting until [`Connection::resume`].
    ///
    /// Status notifications are not emitted while suspended.
    pub fn suspend(&self) {
        info!("Suspending connection");
        self.suspended_tx.send_replace(true);
        self.epoch.lock().cancel();
    }

    /// Allow the supervisor to reconnect immediately.
    pub fn resume(&self) {
        info!("Resuming connection");
        self.suspended_tx.send_replace(false);
    }

    /// End the current epoch, unless suspended (the socket is already closed then).
    pub fn disconnect(&self) {
        if self.is_suspended() {
            return;
        }
        debug!("Disconnect requested");
        self.epoch.lock().cancel();
    }

    // ------------------------------------------------------------------
    // Subscription registry
    // ------------------------------------------------------------------

    /// Fresh subscription id, unique for this connection.
    pub fn next_subscription_id(&self) -> u32 {
        self.next_subscription_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Route pushes for `subscription_id` to `sink`.
    ///
    /// The registry never keeps a sink alive.
    pub fn register_sink(&self, subscription_id: u32, sink: Weak<dyn SubscriptionSink>) {
        self.sinks.lock().insert(subscription_id, sink);
    }

    pub fn unregister_sink(&self, subscription_id: u32) {
        self.sinks.lock().remove(&subscription_id);
    }

    pub(crate) fn notify_user(&self, message: &str) {
        match self.listener.upgrade() {
            Some(listener) => listener.user_notice(message),
            None => info!(notice = message, "User notice"),
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Fire-and-forget send.
    pub async fn send(&self, method: &str, mut msg: Message) -> Result<()> {
        msg.set("method", method);
        self.write_message(method, &msg).await
    }

    /// Send a request once the connection is ready and wait for its response.
    pub async fn send_and_wait(
        &self,
        method: &str,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message> {
        self.wait_until_ready(self.config.connect_timeout()).await?;
        self.send_and_wait_forced(method, msg, timeout).await
    }

    /// Send a request without waiting for readiness.
    ///
    /// Only the handshake and the state rebuild use this directly.
    pub async fn send_and_wait_forced(
        &self,
        method: &str,
        mut msg: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let (seq, rx) = self.pending.register();
        msg.set("method", method);
        msg.set("seq", seq);
        debug!(method, seq, "Sending request");

        if let Err(e) = self.write_message(method, &msg).await {
            self.pending.cancel(seq);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(reply))) => match reply.server_failure(method) {
                Some(e) => {
                    debug!(method, seq, error = %e, "Request failed on the server");
                    Err(e)
                }
                None => Ok(reply),
            },
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(HtspError::connection_lost("request abandoned")),
            Err(_) => {
                self.pending.cancel(seq);
                warn!(method, seq, ?timeout, "No response, dropping connection");
                self.disconnect();
                Err(HtspError::Timeout { method: method.to_string(), duration: timeout })
            }
        }
    }

    async fn write_message(&self, method: &str, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(HtspError::connection_lost("not connected"));
        };
        if let Err(e) = w.write_frame(&frame, self.config.response_timeout()).await {
            drop(writer);
            warn!(method, error = %e, "Socket write failed");
            self.disconnect();
            return Err(e);
        }
        trace!(method, bytes = frame.len(), "Frame sent");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        info!(address = %self.config.address(), "Connection supervisor started");
        let mut backoff =
            ReconnectState::new(self.config.reconnect.clone(), self.config.connect_timeout());

        loop {
            if !self.wait_while_suspended().await {
                break;
            }

            let epoch = self.shutdown.child_token();
            *self.epoch.lock() = epoch.clone();
            self.set_link(LinkState::Connecting);

            let address = self.config.address();
            let connect = transport::connect(
                &address,
                self.config.connect_timeout(),
                self.config.max_frame_size,
            );
            let registered = tokio::select! {
                _ = epoch.cancelled() => false,
                result = connect => match result {
                    Ok((reader, writer)) => {
                        *self.writer.lock().await = Some(writer);
                        self.run_epoch(reader, &epoch).await
                    }
                    Err(e) => {
                        warn!(error = %e, "Connection attempt failed");
                        self.set_status(ConnectionStatus::Unreachable);
                        false
                    }
                },
            };

            self.teardown().await;
            if self.shutdown.is_cancelled() {
                break;
            }
            if registered {
                backoff.reset();
            }
            if self.is_suspended() {
                continue;
            }

            let delay = backoff.next_delay();
            info!(?delay, attempt = backoff.attempts(), "Scheduling reconnect");
            let mut suspended = self.suspended_tx.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
                _ = suspended.wait_for(|s| *s) => {}
            }
        }

        self.teardown().await;
        info!("Connection supervisor stopped");
    }

    /// Returns false once the connection is stopped.
    async fn wait_while_suspended(&self) -> bool {
        let mut suspended = self.suspended_tx.subscribe();
        tokio::select! {
            result = suspended.wait_for(|s| !*s) => result.is_ok(),
            _ = self.shutdown.cancelled() => false,
        }
    }

    /// Run registration and the read loop for one socket; true if it registered.
    async fn run_epoch(
        self: &Arc<Self>,
        reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
        epoch: &CancellationToken,
    ) -> bool {
        let registration = {
            let conn = Arc::clone(self);
            let epoch = epoch.clone();
            tokio::spawn(async move { conn.register(&epoch).await })
        };

        self.read_loop(reader, epoch).await;

        epoch.cancel();
        self.ready_tx.send_replace(false);
        self.pending.fail_all("connection closed");
        registration.await.unwrap_or(false)
    }

    async fn register(&self, epoch: &CancellationToken) -> bool {
        self.set_link(LinkState::Registering);

        let result = tokio::select! {
            biased;
            result = self.registration_sequence() => result,
            _ = epoch.cancelled() => return false,
        };

        match result {
            Ok(()) => {
                self.registrations.fetch_add(1, Ordering::SeqCst);
                self.set_link(LinkState::Connected);
                self.ready_tx.send_replace(true);
                self.set_status(ConnectionStatus::Connected);
                info!("Connection ready");
                true
            }
            Err(e) => {
                match &e {
                    HtspError::VersionMismatch { .. } | HtspError::AccessDenied { .. } => {
                        error!(error = %e, "Registration rejected")
                    }
                    _ => warn!(error = %e, "Registration failed"),
                }
                self.set_status(ConnectionStatus::from_error(&e));
                epoch.cancel();
                false
            }
        }
    }

    async fn registration_sequence(&self) -> Result<()> {
        let info = handshake::register(self).await?;
        *self.server.write() = Some(info);

        match self.listener.upgrade() {
            Some(listener) => listener.rebuild_state(self).await,
            None => Err(HtspError::invalid_state("connection owner is gone")),
        }
    }

    async fn read_loop(
        &self,
        mut reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
        epoch: &CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = epoch.cancelled() => break,
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(payload) => match decode_payload(&payload) {
                    Ok(msg) => self.dispatch(msg),
                    Err(e) => warn!(error = %e, len = payload.len(), "Dropping undecodable frame"),
                },
                Err(e) => {
                    if !epoch.is_cancelled() {
                        warn!(error = %e, "Connection lost");
                    }
                    break;
                }
            }
        }
    }

    /// Route one decoded frame.
    fn dispatch(&self, mut msg: Message) {
        if let Some(seq) = msg.seq() {
            match self.pending.complete(seq, msg) {
                None => return,
                Some(unclaimed) => msg = unclaimed,
            }
        }

        let Some(method) = msg.method().map(str::to_owned) else {
            debug!("Dropping frame with neither a pending seq nor a method");
            return;
        };

        if let Some(kind) = SubscriptionPush::lookup(&method) {
            let Some(id) = msg.get_u32("subscriptionId") else {
                warn!(method, "Subscription push without subscriptionId");
                return;
            };
            let sink = self.sinks.lock().get(&id).and_then(Weak::upgrade);
            match sink {
                Some(sink) => sink.handle_push(kind, &msg),
                None => trace!(method, subscription_id = id, "Push for unknown subscription"),
            }
            return;
        }

        match self.listener.upgrade() {
            Some(listener) => listener.process_push(&method, msg),
            None => trace!(method, "No listener for push"),
        }
    }

    async fn teardown(&self) {
        self.ready_tx.send_replace(false);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await;
        }
        self.pending.fail_all("connection closed");
        self.set_link(LinkState::Disconnected);
    }

    fn set_link(&self, state: LinkState) {
        let previous = self.link_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Link state changed");
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.is_suspended() {
            trace!(?status, "Status change suppressed while suspended");
            return;
        }
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(?status, "Connection status changed");
            if let Some(listener) = self.listener.upgrade() {
                listener.status_changed(status);
            }
        }
    }
}
