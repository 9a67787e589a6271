//! Scripted in-process HTSP server for tests and benchmarks.
//!
//! [`FakeServer`] listens on an ephemeral localhost port, records every
//! request it receives and answers through a [`Handler`]. Tests can also
//! push unsolicited frames and drop the current connection to exercise the
//! reconnect path.

#![cfg(any(test, feature = "benchmark"))]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::connection::HTSP_CLIENT_VERSION;
use crate::message::{Message, Value, decode_payload, encode_frame};
use crate::transport::{FrameReader, FrameWriter};

/// Maps one request to the frames sent back (response first, then any pushes).
pub type Handler = Arc<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

/// Challenge the fake server hands out in `hello`.
pub const FAKE_CHALLENGE: [u8; 32] = [0x5a; 32];

enum Command {
    Send(Message),
    Drop,
}

struct ServerState {
    handler: Mutex<Handler>,
    requests: Mutex<Vec<Message>>,
    request_arrived: Notify,
    connections: AtomicUsize,
    current: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

/// Response to `request` carrying its `seq`.
pub fn response_to(request: &Message, mut body: Message) -> Message {
    if let Some(seq) = request.seq() {
        body.set("seq", seq);
    }
    body
}

/// Reply body a well-behaved server would send for `request`.
pub fn standard_body(request: &Message) -> Message {
    match request.method().unwrap_or_default() {
        "hello" => Message::new()
            .with("htspversion", HTSP_CLIENT_VERSION)
            .with("servername", "FakeServer")
            .with("serverversion", "0.0-test")
            .with("webroot", "")
            .with("servercapability", vec![Value::from("timeshift")])
            .with("challenge", FAKE_CHALLENGE.to_vec()),
        "fileOpen" => Message::new().with("id", 1u32),
        "fileSeek" => Message::new().with("offset", request.get_s64("offset").unwrap_or(0)),
        "fileStat" => Message::new().with("size", 0i64),
        "fileRead" => Message::new().with("data", Vec::<u8>::new()),
        "authenticate" | "enableAsyncMetadata" | "subscribe" | "unsubscribe" | "subscriptionSkip"
        | "subscriptionSpeed" | "subscriptionChangeWeight" | "fileClose" => Message::new(),
        other => Message::new().with("error", format!("unknown method {}", other)),
    }
}

/// Answer every request with [`standard_body`].
pub fn standard_reply(request: &Message) -> Vec<Message> {
    vec![response_to(request, standard_body(request))]
}

impl FakeServer {
    /// Start a server answering with [`standard_reply`].
    pub async fn start() -> Self {
        Self::with_handler(Arc::new(standard_reply)).await
    }

    pub async fn with_handler(handler: Handler) -> Self {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(e) => panic!("fake server failed to bind: {}", e),
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => panic!("fake server has no local address: {}", e),
        };
        let state = Arc::new(ServerState {
            handler: Mutex::new(handler),
            requests: Mutex::new(Vec::new()),
            request_arrived: Notify::new(),
            connections: AtomicUsize::new(0),
            current: Mutex::new(None),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((socket, peer)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                debug!(%peer, "Fake server accepted connection");
                let (tx, rx) = mpsc::unbounded_channel();
                *accept_state.current.lock() = Some(tx);
                let _ = socket.set_nodelay(true);
                tokio::spawn(serve(Arc::clone(&accept_state), socket, rx));
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Client configuration pointing at this server with short timeouts.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            htsp_port: self.port(),
            connect_timeout_ms: 2_000,
            response_timeout_ms: 1_000,
            reconnect: ReconnectPolicy { fast_attempts: 5, fast_interval_ms: 50 },
            ..ClientConfig::default()
        }
    }

    pub fn set_handler(&self, handler: Handler) {
        *self.state.handler.lock() = handler;
    }

    /// Send an unsolicited frame on the current connection.
    pub fn push(&self, msg: Message) {
        if let Some(tx) = self.state.current.lock().as_ref() {
            let _ = tx.send(Command::Send(msg));
        }
    }

    /// Close the current connection from the server side.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.current.lock().take() {
            let _ = tx.send(Command::Drop);
        }
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Every request received for `method`, oldest first.
    pub fn requests(&self, method: &str) -> Vec<Message> {
        self.state.requests.lock().iter().filter(|m| m.method() == Some(method)).cloned().collect()
    }

    /// Method names of every request received, in arrival order.
    pub fn request_log(&self) -> Vec<String> {
        self.state.requests.lock().iter().filter_map(|m| m.method().map(str::to_string)).collect()
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.state.requests.lock().iter().filter(|m| m.method() == Some(method)).count()
    }

    /// Wait until at least `count` requests for `method` arrived.
    pub async fn wait_for_requests(&self, method: &str, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.state.request_arrived.notified();
                if self.request_count(method) >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
        self.drop_connection();
    }
}

async fn serve(
    state: Arc<ServerState>,
    socket: tokio::net::TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (read, write) = socket.into_split();
    let mut reader = FrameReader::new(read, 64 * 1024 * 1024, Duration::from_secs(5));
    let mut writer = FrameWriter::new(write);
    let timeout = Duration::from_secs(5);

    loop {
        let outgoing = tokio::select! {
            frame = reader.read_frame() => {
                let Ok(payload) = frame else { break };
                let request = match decode_payload(&payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Fake server got an undecodable frame");
                        continue;
                    }
                };
                let handler = Arc::clone(&*state.handler.lock());
                let replies = handler(&request);
                state.requests.lock().push(request);
                state.request_arrived.notify_waiters();
                replies
            }
            command = commands.recv() => match command {
                Some(Command::Send(msg)) => vec![msg],
                Some(Command::Drop) | None => break,
            },
        };

        for msg in outgoing {
            let Ok(frame) = encode_frame(&msg) else { continue };
            if writer.write_frame(&frame, timeout).await.is_err() {
                return;
            }
        }
    }
    writer.shutdown().await;
}
