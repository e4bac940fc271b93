//! C2 — the Snapcast JSON-RPC client: connection lifecycle, reconnection,
//! and notification demultiplexing over a persistent framed TCP connection.
//!
//! The pending-request map (`DashMap<u64, oneshot::Sender<_>>`, insert on
//! send, remove on matching response) generalises the SID-keyed lookup of
//! `sonos/gena_store.rs::GenaSubscriptionStore`; the reader loop's
//! has-id/no-id dispatch plays the role `GenaSubscriptionManager` gives
//! NOTIFY vs. subscribe-response handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::policy::{retry, RetryPolicy};
use crate::runtime::TaskSpawner;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Notifications consumed by C3 (SPEC_FULL.md §4.2): the raw method name and
/// params, left undecoded so C3 owns the notification→domain-event mapping.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    ConnectionEstablished,
    ConnectionLost(String),
    Notification { method: String, params: Value },
}

#[derive(serde::Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(serde::Deserialize)]
struct JsonRpcResponse {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    error: Option<JsonRpcError>,
}

#[derive(serde::Deserialize)]
struct JsonRpcError {
    message: String,
}

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

struct Shared {
    host: String,
    port: u16,
    next_id: AtomicU64,
    pending: PendingMap,
    events: broadcast::Sender<RpcEvent>,
    status: RwLock<ConnectionStatus>,
    writer: tokio::sync::Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    cancel: CancellationToken,
}

/// A persistent JSON-RPC 2.0 client over a newline-delimited TCP stream.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> (Self, broadcast::Receiver<RpcEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            host: host.into(),
            port,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            events: tx,
            status: RwLock::new(ConnectionStatus::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        (Self { shared }, rx)
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RpcEvent> {
        self.shared.events.subscribe()
    }

    /// Connects, spawning the reader loop via `spawner`. Does not retry;
    /// callers drive reconnection with [`crate::policy::retry`] using
    /// [`RetryPolicy::reconnect`].
    pub async fn connect(&self, spawner: Arc<dyn TaskSpawner>) -> Result<(), RpcError> {
        *self.shared.status.write() = ConnectionStatus::Connecting;
        let stream = TcpStream::connect((self.shared.host.as_str(), self.shared.port))
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);
        *self.shared.status.write() = ConnectionStatus::Connected;
        let _ = self.shared.events.send(RpcEvent::ConnectionEstablished);

        let shared = self.shared.clone();
        spawner.spawn(async move {
            run_reader_loop(shared, read_half).await;
        });
        Ok(())
    }

    pub async fn close(&self) {
        self.shared.cancel.cancel();
        *self.shared.writer.lock().await = None;
        *self.shared.status.write() = ConnectionStatus::Disconnected;
        let pending_ids: Vec<u64> = self.shared.pending.iter().map(|e| *e.key()).collect();
        for id in pending_ids {
            if let Some((_, waiter)) = self.shared.pending.remove(&id) {
                let _ = waiter.send(Err(RpcError::Cancelled));
            }
        }
    }

    /// Runs `connect` under a reconnect policy, logging each attempt.
    pub async fn connect_with_retry(
        &self,
        spawner: Arc<dyn TaskSpawner>,
        policy: RetryPolicy,
    ) -> Result<(), RpcError> {
        *self.shared.status.write() = ConnectionStatus::Reconnecting;
        retry(
            policy,
            "snapcast-rpc-connect",
            |_err: &RpcError| true,
            |attempt, max, err| {
                tracing::warn!(attempt, max, %err, "snapcast rpc connect attempt failed");
            },
            || {
                let spawner = spawner.clone();
                async move { self.connect(spawner).await }
            },
        )
        .await
    }

    /// Sends a typed request and awaits its response, or a 10s timeout.
    pub async fn send_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let raw = self.send_request_raw(method, params).await?;
        serde_json::from_value(raw).map_err(|e| RpcError::Protocol(e.to_string()))
    }

    async fn send_request_raw(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let line = serde_json::to_string(&request).map_err(|e| RpcError::Protocol(e.to_string()))?;

        {
            let mut guard = self.shared.writer.lock().await;
            let writer = guard.as_mut().ok_or_else(|| {
                RpcError::Transport("not connected".to_string())
            })?;
            use tokio::io::AsyncWriteExt;
            writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?;
        }

        let result = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => {
                self.shared.pending.remove(&id);
                Err(RpcError::Cancelled)
            }
            received = tokio::time::timeout(Duration::from_secs(10), rx) => {
                match received {
                    Ok(Ok(inner)) => inner,
                    Ok(Err(_)) => Err(RpcError::Cancelled),
                    Err(_) => {
                        self.shared.pending.remove(&id);
                        Err(RpcError::Timeout)
                    }
                }
            }
        };
        result
    }
}

async fn run_reader_loop(shared: Arc<Shared>, read_half: tokio::net::tcp::OwnedReadHalf) {
    let mut lines = FramedRead::new(read_half, LinesCodec::new());
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            next = lines.next() => {
                match next {
                    Some(Ok(line)) => handle_line(&shared, &line),
                    Some(Err(err)) => {
                        *shared.status.write() = ConnectionStatus::Reconnecting;
                        let _ = shared.events.send(RpcEvent::ConnectionLost(err.to_string()));
                        return;
                    }
                    None => {
                        *shared.status.write() = ConnectionStatus::Reconnecting;
                        let _ = shared.events.send(RpcEvent::ConnectionLost("peer closed".to_string()));
                        return;
                    }
                }
            }
        }
    }
}

fn handle_line(shared: &Arc<Shared>, line: &str) {
    let parsed: JsonRpcResponse = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(%err, "malformed snapcast rpc frame, dropped");
            return;
        }
    };

    match (parsed.id, parsed.method) {
        (Some(id), _) => {
            if let Some((_, waiter)) = shared.pending.remove(&id) {
                let outcome = match parsed.error {
                    Some(e) => Err(RpcError::Protocol(e.message)),
                    None => Ok(parsed.result),
                };
                let _ = waiter.send(outcome);
            } else {
                tracing::warn!(id, "unknown snapcast rpc response id, dropped");
            }
        }
        (None, Some(method)) => {
            let _ = shared.events.send(RpcEvent::Notification {
                method,
                params: parsed.params,
            });
        }
        (None, None) => {
            tracing::warn!("snapcast rpc frame with neither id nor method, dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_line_routes_response_to_waiter() {
        let (client, _rx) = RpcClient::new("localhost", 1705);
        let (tx, mut rx) = oneshot::channel();
        client.shared.pending.insert(7, tx);

        handle_line(&client.shared, r#"{"id":7,"result":{"ok":true}}"#);

        let received = rx.try_recv().unwrap().unwrap();
        assert_eq!(received, serde_json::json!({"ok": true}));
    }

    #[test]
    fn handle_line_drops_unknown_id() {
        let (client, _rx) = RpcClient::new("localhost", 1705);
        // No pending request for id 99: must not panic.
        handle_line(&client.shared, r#"{"id":99,"result":null}"#);
        assert!(client.shared.pending.is_empty());
    }

    #[test]
    fn handle_line_dispatches_notification() {
        let (client, mut rx) = RpcClient::new("localhost", 1705);
        handle_line(
            &client.shared,
            r#"{"method":"Client.OnVolumeChanged","params":{"id":"ab:cd"}}"#,
        );
        let event = rx.try_recv().unwrap();
        match event {
            RpcEvent::Notification { method, .. } => assert_eq!(method, "Client.OnVolumeChanged"),
            _ => panic!("expected notification"),
        }
    }

    #[test]
    fn handle_line_with_error_maps_to_protocol_error() {
        let (client, _rx) = RpcClient::new("localhost", 1705);
        let (tx, mut rx) = oneshot::channel();
        client.shared.pending.insert(3, tx);

        handle_line(&client.shared, r#"{"id":3,"error":{"message":"bad method"}}"#);

        let received = rx.try_recv().unwrap();
        assert!(matches!(received, Err(RpcError::Protocol(msg)) if msg == "bad method"));
    }

    #[tokio::test]
    async fn close_cancels_all_pending_requests() {
        let (client, _rx) = RpcClient::new("localhost", 1705);
        let (tx, rx) = oneshot::channel();
        client.shared.pending.insert(1, tx);

        client.close().await;

        let received = rx.await.unwrap();
        assert!(matches!(received, Err(RpcError::Cancelled)));
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }
}
