//! The relay core: wires the client and server streams together through the
//! framing pipeline, classifies every message, and exposes the outward
//! request/notification API.
//!
//! Every direction is one reader task feeding one writer task through an
//! ordered channel of complete frames, so frames are never split or merged
//! and arrive in strict per-direction order. Forwarding always uses the
//! original frame bytes; parsing is for classification and inspection only.
//!
//! Interception is modeled as one single-consumer channel per direction
//! carrying [`Intercepted`] events. The consumer decides whether and when to
//! call [`Intercepted::forward`]; [`spawn_passthrough`] installs the default
//! policy of forwarding everything immediately.

use crate::framing::{encode_message, FrameDecoder};
use crate::pending::{PendingRequests, RequestOutcome};
use crate::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde_json::Value;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

const READ_CHUNK_SIZE: usize = 8192;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// The four stream halves the relay is wired between. Boxed so tests can run
/// the same core over in-memory duplex pairs instead of real stdio.
pub struct RelayStreams {
    pub client_reader: Box<dyn AsyncRead + Unpin + Send>,
    pub client_writer: Box<dyn AsyncWrite + Unpin + Send>,
    pub server_reader: Box<dyn AsyncRead + Unpin + Send>,
    pub server_writer: Box<dyn AsyncWrite + Unpin + Send>,
}

pub struct RelayOptions {
    /// Deadline for proxy-originated requests.
    pub request_timeout: Duration,
    /// Identity the request-id prefix is derived from, usually the workspace
    /// root. Ids look like `{hash(workspace)}-{n}` so they can never collide
    /// with ids the client chooses.
    pub workspace_root: String,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            workspace_root: std::env::current_dir()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// One intercepted in-flight message.
///
/// Dropping it without calling [`forward`](Self::forward) suppresses the
/// message; holding it delays the message. Forwarding writes the original
/// frame bytes to the opposite stream, byte-identical to what the sender
/// produced.
pub struct Intercepted {
    /// Parsed body, `None` when the payload was not valid JSON-RPC.
    pub message: Option<JsonRpcMessage>,
    /// The complete frame as it appeared on the wire.
    pub frame: Bytes,
    forward_tx: mpsc::UnboundedSender<Bytes>,
}

impl Intercepted {
    pub fn forward(self) {
        let _ = self.forward_tx.send(self.frame);
    }
}

/// Per-direction observer channels plus the shutdown signal.
pub struct RelayEvents {
    /// Messages the client sent toward the server.
    pub client: mpsc::UnboundedReceiver<Intercepted>,
    /// Messages the server sent toward the client, minus correlated
    /// responses to proxy-originated requests.
    pub server: mpsc::UnboundedReceiver<Intercepted>,
    /// Signalled once when either input stream reaches EOF or fails framing.
    pub closed: mpsc::Receiver<()>,
}

/// Cloneable handle for originating traffic toward either peer.
#[derive(Clone)]
pub struct RelayHandle {
    server_tx: mpsc::UnboundedSender<Bytes>,
    client_tx: mpsc::UnboundedSender<Bytes>,
    pending: PendingRequests,
    id_prefix: Arc<String>,
    next_request_id: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Issues a request toward the server and registers it for correlation.
    ///
    /// Returns the allocated request id and the receiver for its outcome.
    /// Exactly one of a matching response or a timeout error arrives on the
    /// receiver; explicit cancellation closes it instead.
    pub fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(Value, oneshot::Receiver<RequestOutcome>)> {
        let id = Value::String(format!(
            "{}-{}",
            self.id_prefix,
            self.next_request_id.fetch_add(1, Ordering::SeqCst)
        ));

        // Register before writing so a fast response always finds the entry.
        let rx = self.pending.register(id.clone());

        let request = JsonRpcMessage::Request(JsonRpcRequest::new(id.clone(), method, params));
        if self.server_tx.send(encode_message(&request)).is_err() {
            self.pending.discard(&id);
            return Err(anyhow!("server-input stream is closed"));
        }

        debug!("sent proxy request {} ({})", id, method);
        Ok((id, rx))
    }

    /// Issues a request toward the server and waits for its outcome.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<RequestOutcome> {
        let (id, rx) = self.start_request(method, params)?;
        match rx.await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(anyhow!("request {} was cancelled before completion", id)),
        }
    }

    /// Sends a notification to the server.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        self.server_tx
            .send(encode_message(&message))
            .map_err(|_| anyhow!("server-input stream is closed"))
    }

    /// Sends a notification to the client.
    pub fn notify_client(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        self.client_tx
            .send(encode_message(&message))
            .map_err(|_| anyhow!("client-output stream is closed"))
    }

    /// Aborts a specific proxy-originated request before its timeout.
    pub fn cancel(&self, id: &Value) {
        self.pending.cancel(id);
    }
}

/// Spawns the relay over the given streams and returns its handle and the
/// observer channels. Nothing flows until the observer channels are drained;
/// use [`spawn_passthrough`] for the default forward-everything policy.
pub fn spawn_relay(streams: RelayStreams, options: RelayOptions) -> (RelayHandle, RelayEvents) {
    let (server_tx, server_frames_rx) = mpsc::unbounded_channel::<Bytes>();
    let (client_tx, client_frames_rx) = mpsc::unbounded_channel::<Bytes>();
    let (client_events_tx, client_events_rx) = mpsc::unbounded_channel::<Intercepted>();
    let (server_events_tx, server_events_rx) = mpsc::unbounded_channel::<Intercepted>();
    let (closed_tx, closed_rx) = mpsc::channel::<()>(2);

    let pending = PendingRequests::new(server_tx.clone(), options.request_timeout);

    tokio::spawn(write_loop(
        streams.server_writer,
        server_frames_rx,
        "server-input",
    ));
    tokio::spawn(write_loop(
        streams.client_writer,
        client_frames_rx,
        "client-output",
    ));

    // Client → server: every message goes to the observer, pass-through
    // writes to the server input.
    tokio::spawn(read_loop(
        streams.client_reader,
        client_events_tx,
        server_tx.clone(),
        None,
        closed_tx.clone(),
        "client",
    ));

    // Server → client: correlated responses are consumed by the pending
    // table, everything else goes to the observer.
    tokio::spawn(read_loop(
        streams.server_reader,
        server_events_tx,
        client_tx.clone(),
        Some(pending.clone()),
        closed_tx,
        "server",
    ));

    let handle = RelayHandle {
        server_tx,
        client_tx,
        pending,
        id_prefix: Arc::new(workspace_hash(&options.workspace_root)),
        next_request_id: Arc::new(AtomicU64::new(1)),
    };

    let events = RelayEvents {
        client: client_events_rx,
        server: server_events_rx,
        closed: closed_rx,
    };

    (handle, events)
}

/// Installs the default observer policy: forward every intercepted message
/// immediately. Returns the relay's shutdown signal.
pub fn spawn_passthrough(events: RelayEvents) -> mpsc::Receiver<()> {
    let RelayEvents {
        mut client,
        mut server,
        closed,
    } = events;

    tokio::spawn(async move {
        while let Some(intercepted) = client.recv().await {
            intercepted.forward();
        }
    });
    tokio::spawn(async move {
        while let Some(intercepted) = server.recv().await {
            intercepted.forward();
        }
    });

    closed
}

async fn read_loop(
    mut reader: Box<dyn AsyncRead + Unpin + Send>,
    events_tx: mpsc::UnboundedSender<Intercepted>,
    forward_tx: mpsc::UnboundedSender<Bytes>,
    pending: Option<PendingRequests>,
    closed_tx: mpsc::Sender<()>,
    direction: &'static str,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("{} stream reached EOF", direction);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("failed to read from {} stream: {}", direction, e);
                break;
            }
        };

        let frames = match decoder.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                // Fatal for this stream: stop the pipeline rather than guess
                // at message boundaries.
                error!("framing error on {} stream: {}", direction, e);
                break;
            }
        };

        for frame in frames {
            let message = crate::framing::decode_frame(&frame);
            trace!("{} frame: {:?}", direction, message);

            if let (Some(pending), Some(JsonRpcMessage::Response(response))) =
                (pending.as_ref(), message.as_ref())
            {
                // A match consumes the message: it was destined for the
                // proxy, not the client.
                if pending.resolve(&response.id, response.clone()) {
                    continue;
                }
            }

            let intercepted = Intercepted {
                message,
                frame,
                forward_tx: forward_tx.clone(),
            };
            if let Err(unsent) = events_tx.send(intercepted) {
                // Observer receiver is gone; traffic must not stall, so fall
                // back to immediate pass-through.
                unsent.0.forward();
            }
        }
    }

    let _ = closed_tx.try_send(());
}

async fn write_loop(
    mut writer: Box<dyn AsyncWrite + Unpin + Send>,
    mut frames_rx: mpsc::UnboundedReceiver<Bytes>,
    direction: &'static str,
) {
    while let Some(frame) = frames_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            error!("failed to write to {} stream: {}", direction, e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("failed to flush {} stream: {}", direction, e);
            break;
        }
    }
    debug!("{} writer finished", direction);
}

/// Stable hex digest of the proxy identity, namespacing proxy-originated
/// request ids away from anything the client might pick.
fn workspace_hash(workspace_root: &str) -> String {
    let mut hasher = DefaultHasher::new();
    workspace_root.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}
