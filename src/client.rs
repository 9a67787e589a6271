//! Client context: one connection plus everything layered on top of it.
//!
//! [`Client`] replaces a process-wide client singleton. It owns the
//! [`Connection`] and implements its [`ConnectionListener`]: after every
//! registration it rebuilds live demuxers and open files, and it turns
//! catalog pushes into initial-sync progress before forwarding them to
//! whoever consumes [`Client::take_pushes`].

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::{debug, info, trace, warn};

use crate::async_state::{AsyncPhase, AsyncState};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionListener, ConnectionStatus, LinkState, ServerInfo};
use crate::demux::{CodecResolver, DefaultCodecs, Demuxer};
use crate::message::Message;
use crate::vfs::VfsReader;
use crate::{HtspError, Result};

const NOTICE_CAPACITY: usize = 32;

/// A push not owned by any subscription, for the catalog layer.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericPush {
    pub method: String,
    pub message: Message,
}

/// Initial-sync phase that a catalog push implies.
static SYNC_PHASES: LazyLock<HashMap<&'static str, AsyncPhase>> = LazyLock::new(|| {
    let mut table = HashMap::new();
    for method in ["channelAdd", "channelUpdate", "channelDelete", "tagAdd", "tagUpdate", "tagDelete"] {
        table.insert(method, AsyncPhase::Channels);
    }
    for method in [
        "dvrEntryAdd",
        "dvrEntryUpdate",
        "dvrEntryDelete",
        "autorecEntryAdd",
        "autorecEntryUpdate",
        "autorecEntryDelete",
        "timerecEntryAdd",
        "timerecEntryUpdate",
        "timerecEntryDelete",
    ] {
        table.insert(method, AsyncPhase::Dvr);
    }
    for method in ["eventAdd", "eventUpdate", "eventDelete"] {
        table.insert(method, AsyncPhase::Epg);
    }
    table.insert("initialSyncCompleted", AsyncPhase::Done);
    table
});

struct ClientShared {
    config: Arc<ClientConfig>,
    conn: Arc<Connection>,
    resolver: Arc<dyn CodecResolver>,
    demuxers: Mutex<Vec<Weak<Demuxer>>>,
    readers: Mutex<Vec<Weak<VfsReader>>>,
    async_state: AsyncState,
    pushes_tx: mpsc::Sender<GenericPush>,
    pushes_rx: Mutex<Option<mpsc::Receiver<GenericPush>>>,
    notices: broadcast::Sender<String>,
}

/// Errors that end the epoch instead of dropping one restored item.
fn aborts_rebuild(e: &HtspError) -> bool {
    e.is_fatal_to_connection() || matches!(e, HtspError::ConnectionLost { .. })
}

impl ClientShared {
    fn live<T>(registry: &Mutex<Vec<Weak<T>>>) -> Vec<Arc<T>> {
        let mut entries = registry.lock();
        entries.retain(|w| w.strong_count() > 0);
        entries.iter().filter_map(Weak::upgrade).collect()
    }
}

#[async_trait]
impl ConnectionListener for ClientShared {
    async fn rebuild_state(&self, conn: &Connection) -> Result<()> {
        self.async_state.reset();

        let demuxers = Self::live(&self.demuxers);
        let readers = Self::live(&self.readers);
        debug!(demuxers = demuxers.len(), readers = readers.len(), "Rebuilding client state");

        // Subscriptions go back first so their data flows before the catalog replay.
        for demuxer in demuxers {
            if let Err(e) = demuxer.resume(conn).await {
                if aborts_rebuild(&e) {
                    return Err(e);
                }
                let id = demuxer.subscription().id();
                warn!(subscription_id = id, error = %e, "Could not restore subscription");
                demuxer.abort();
                self.user_notice(&format!("Subscription {} was lost on reconnect: {}", id, e));
            }
        }
        for reader in readers {
            if let Err(e) = reader.reopen(conn).await {
                if aborts_rebuild(&e) {
                    return Err(e);
                }
                warn!(error = %e, "Could not reopen remote file");
                reader.discard();
                self.user_notice(&format!("Remote file was lost on reconnect: {}", e));
            }
        }

        if self.config.async_metadata {
            let msg = Message::new().with("epg", 1u32);
            conn.send_and_wait_forced("enableAsyncMetadata", msg, conn.response_timeout()).await?;
            self.async_state.set_state(AsyncPhase::Channels);
        } else {
            self.async_state.set_state(AsyncPhase::Done);
        }
        Ok(())
    }

    fn process_push(&self, method: &str, msg: Message) {
        if let Some(phase) = SYNC_PHASES.get(method) {
            self.async_state.set_state(*phase);
        }

        let push = GenericPush { method: method.to_string(), message: msg };
        match self.pushes_tx.try_send(push) {
            Ok(()) => trace!(method, "Queued push"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(method, capacity = self.config.push_queue_depth, "Push queue full, dropping push")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => trace!(method, "Push consumer gone"),
        }
    }

    fn status_changed(&self, status: ConnectionStatus) {
        debug!(?status, "Client saw status change");
    }

    fn user_notice(&self, message: &str) {
        info!(notice = message, "User notice");
        let _ = self.notices.send(message.to_string());
    }
}

/// Handle to one HTSP server.
///
/// Dropping the client stops its connection.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Build a client without connecting yet.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_resolver(config, Arc::new(DefaultCodecs))
    }

    /// Build a client whose demuxers map codecs with `resolver`.
    pub fn with_resolver(config: ClientConfig, resolver: Arc<dyn CodecResolver>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (pushes_tx, pushes_rx) = mpsc::channel(config.push_queue_depth);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let shared = Arc::new_cyclic(|weak: &Weak<ClientShared>| {
            let listener: Weak<dyn ConnectionListener> = weak.clone();
            ClientShared {
                conn: Connection::new(Arc::clone(&config), listener),
                config,
                resolver,
                demuxers: Mutex::new(Vec::new()),
                readers: Mutex::new(Vec::new()),
                async_state: AsyncState::new(),
                pushes_tx,
                pushes_rx: Mutex::new(Some(pushes_rx)),
                notices,
            }
        });
        Ok(Self { shared })
    }

    /// Build a client and start connecting in the background.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.start();
        Ok(client)
    }

    pub fn start(&self) {
        info!(address = %self.shared.config.address(), "Starting HTSP client");
        self.shared.conn.start();
    }

    pub fn stop(&self) {
        self.shared.conn.stop();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.shared.conn
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        self.shared.conn.wait_until_ready(timeout).await
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.conn.server_info()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.conn.status()
    }

    pub fn status_updates(&self) -> impl Stream<Item = ConnectionStatus> + 'static {
        self.shared.conn.status_updates()
    }

    pub fn link_updates(&self) -> impl Stream<Item = LinkState> + 'static {
        self.shared.conn.link_updates()
    }

    /// Host is going to sleep: close the socket and stop reconnecting.
    pub fn suspend(&self) {
        self.shared.conn.suspend();
    }

    pub fn resume(&self) {
        self.shared.conn.resume();
    }

    /// New demuxer, restored automatically after reconnects while alive.
    pub fn demuxer(&self) -> Arc<Demuxer> {
        let demuxer = Demuxer::new(&self.shared.conn, Arc::clone(&self.shared.resolver));
        self.shared.demuxers.lock().push(Arc::downgrade(&demuxer));
        demuxer
    }

    /// New remote file reader, reopened automatically after reconnects while alive.
    pub fn vfs_reader(&self) -> Arc<VfsReader> {
        let reader = VfsReader::new(&self.shared.conn);
        self.shared.readers.lock().push(Arc::downgrade(&reader));
        reader
    }

    pub fn async_state(&self) -> &AsyncState {
        &self.shared.async_state
    }

    /// Wait for the initial sync to reach `phase`; false on timeout.
    pub async fn wait_for_state(&self, phase: AsyncPhase, timeout: Duration) -> bool {
        self.shared.async_state.wait_for_state(phase, timeout).await
    }

    /// Stream of pushes no subscription claimed. Can be taken once.
    pub fn take_pushes(&self) -> Option<impl Stream<Item = GenericPush> + 'static> {
        self.shared.pushes_rx.lock().take().map(ReceiverStream::new)
    }

    /// Stream of human-readable notices (subscription failures and the like).
    pub fn notices(&self) -> impl Stream<Item = String> + 'static {
        BroadcastStream::new(self.shared.notices.subscribe())
            .filter_map(|notice| futures::future::ready(notice.ok()))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.conn.stop();
    }
}
