//! Correlation table for proxy-originated requests.
//!
//! Each request the relay issues toward the server gets exactly one entry
//! here. The entry is resolved by a matching response, rejected by the
//! timeout timer, or dropped by an explicit cancel — whichever removes the
//! entry from the map first wins, and the losing paths become no-ops.

use crate::framing::encode_message;
use crate::protocol::{JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcResponse};
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The single outcome every caller of `request()` observes: the response's
/// result on success, or an error (server-reported or timeout) on failure.
pub type RequestOutcome = Result<Value, JsonRpcError>;

struct PendingEntry {
    resolver: oneshot::Sender<RequestOutcome>,
    timer: JoinHandle<()>,
}

#[derive(Clone)]
pub struct PendingRequests {
    entries: Arc<DashMap<Value, PendingEntry>>,
    /// Frames written here go to the server-input stream.
    server_tx: mpsc::UnboundedSender<Bytes>,
    timeout: Duration,
}

impl PendingRequests {
    pub fn new(server_tx: mpsc::UnboundedSender<Bytes>, timeout: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            server_tx,
            timeout,
        }
    }

    /// Registers a pending request and starts its timeout timer.
    ///
    /// Must be called before the request is written to the server, so a fast
    /// response can never race an absent entry.
    pub fn register(&self, id: Value) -> oneshot::Receiver<RequestOutcome> {
        let (resolver, rx) = oneshot::channel();

        let timer = {
            let table = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(table.timeout).await;
                table.expire(&id);
            })
        };

        self.entries.insert(id, PendingEntry { resolver, timer });
        rx
    }

    /// Resolves a pending request with the server's response.
    ///
    /// Returns whether a match was found; `false` means the caller must treat
    /// the response as unmatched and forward it.
    pub fn resolve(&self, id: &Value, response: JsonRpcResponse) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        entry.timer.abort();

        let outcome = match response.error {
            Some(error) => Err(error),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = entry.resolver.send(outcome);
        true
    }

    /// Timer path: rejects the request with a timeout error and tells the
    /// server to abandon the in-flight work.
    fn expire(&self, id: &Value) {
        let Some((_, entry)) = self.entries.remove(id) else {
            return;
        };
        warn!("request {} timed out after {:?}", id, self.timeout);
        let _ = entry
            .resolver
            .send(Err(JsonRpcError::request_timeout(self.timeout)));
        self.send_cancel(id);
    }

    /// Explicit external cancellation. The caller's receiver is dropped
    /// rather than resolved, and the server is notified as on timeout.
    pub fn cancel(&self, id: &Value) {
        let Some((_, entry)) = self.entries.remove(id) else {
            return;
        };
        debug!("request {} cancelled", id);
        entry.timer.abort();
        drop(entry.resolver);
        self.send_cancel(id);
    }

    /// Removes an entry without notifying anyone. Used when the request could
    /// not be written to the server in the first place.
    pub fn discard(&self, id: &Value) {
        if let Some((_, entry)) = self.entries.remove(id) {
            entry.timer.abort();
        }
    }

    fn send_cancel(&self, id: &Value) {
        let notification = JsonRpcMessage::Notification(JsonRpcNotification::cancel(id));
        let _ = self.server_tx.send(encode_message(&notification));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::decode_frame;
    use crate::protocol::{JSONRPC_VERSION, REQUEST_TIMEOUT_CODE};
    use serde_json::json;

    fn response(id: Value, result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn table(timeout_ms: u64) -> (PendingRequests, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PendingRequests::new(tx, Duration::from_millis(timeout_ms)), rx)
    }

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let (table, mut server_rx) = table(5000);
        let rx = table.register(json!("p-1"));

        assert!(table.resolve(&json!("p-1"), response(json!("p-1"), json!({"ok": true}))));
        assert_eq!(rx.await.unwrap(), Ok(json!({"ok": true})));

        // No cancellation is written on the success path.
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_unmatched() {
        let (table, _server_rx) = table(5000);
        assert!(!table.resolve(&json!(999), response(json!(999), Value::Null)));
    }

    #[tokio::test]
    async fn test_second_resolve_is_noop() {
        let (table, _server_rx) = table(5000);
        let _rx = table.register(json!("p-1"));
        assert!(table.resolve(&json!("p-1"), response(json!("p-1"), Value::Null)));
        assert!(!table.resolve(&json!("p-1"), response(json!("p-1"), Value::Null)));
    }

    #[tokio::test]
    async fn test_expire_fires_exactly_once() {
        let (table, mut server_rx) = table(50);
        let rx = table.register(json!("p-1"));

        let outcome = rx.await.unwrap();
        let error = outcome.unwrap_err();
        assert_eq!(error.code, REQUEST_TIMEOUT_CODE);
        assert!(error.message.contains("50"));

        // Exactly one cancellation notification reaches the server.
        let frame = server_rx.recv().await.unwrap();
        let message = decode_frame(&frame).unwrap();
        match message {
            JsonRpcMessage::Notification(notif) => {
                assert_eq!(notif.method, "$/cancelRequest");
                assert_eq!(notif.params, Some(json!({"id": "p-1"})));
            }
            other => panic!("expected cancellation notification, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_after_expire_is_unmatched() {
        let (table, _server_rx) = table(20);
        let rx = table.register(json!("p-1"));
        assert!(rx.await.unwrap().is_err());

        // A late response for the expired id finds no entry.
        assert!(!table.resolve(&json!("p-1"), response(json!("p-1"), Value::Null)));
    }

    #[tokio::test]
    async fn test_expire_after_resolve_is_noop() {
        let (table, mut server_rx) = table(30);
        let rx = table.register(json!("p-1"));
        assert!(table.resolve(&json!("p-1"), response(json!("p-1"), json!(1))));
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_drops_resolver_and_notifies_server() {
        let (table, mut server_rx) = table(5000);
        let rx = table.register(json!("p-2"));

        table.cancel(&json!("p-2"));

        // The caller observes cancellation as a closed channel, not a result.
        assert!(rx.await.is_err());

        let frame = server_rx.recv().await.unwrap();
        let message = decode_frame(&frame).unwrap();
        assert_eq!(message.method(), Some("$/cancelRequest"));

        // Cancel is idempotent.
        table.cancel(&json!("p-2"));
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_response_resolves_with_error() {
        let (table, _server_rx) = table(5000);
        let rx = table.register(json!("p-3"));

        let response = JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: json!("p-3"),
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "method not found".to_string(),
                data: None,
            }),
        };
        assert!(table.resolve(&json!("p-3"), response));
        assert_eq!(rx.await.unwrap().unwrap_err().code, -32601);
    }
}
