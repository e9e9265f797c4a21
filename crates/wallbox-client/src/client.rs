//! Client facade: connect, property access, shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use wallbox_protocol::{DeviceIdentity, OutgoingMessage};

use crate::error::{ClientError, ClientResult};
use crate::session::Session;
use crate::status::StatusDocument;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device host: name or address, optionally with a port.
    pub host: String,
    /// Outbound message queue capacity.
    pub send_queue: usize,
    /// How long `close` waits for the receive loop to acknowledge the
    /// close handshake before giving up.
    pub shutdown_timeout: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            send_queue: 64,
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    /// WebSocket endpoint for this device.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.host)
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Syncing,
    Ready,
}

/// Client for one wallbox device connection.
///
/// `connect` blocks until the session is authenticated and the status
/// document has completed its first full sync; property access is
/// meaningless before either, and fails with typed errors after.
pub struct WallboxClient {
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    document: Arc<StatusDocument>,
    identity: Arc<RwLock<Option<DeviceIdentity>>>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    request_ids: AtomicU64,
    reader_done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl WallboxClient {
    /// Create a new client for the given device. Does not connect.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            document: Arc::new(StatusDocument::new()),
            identity: Arc::new(RwLock::new(None)),
            outbound: Arc::new(Mutex::new(None)),
            request_ids: AtomicU64::new(0),
            reader_done: Mutex::new(None),
        }
    }

    /// Get the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// True once `connect` has returned successfully.
    pub async fn is_ready(&self) -> bool {
        *self.state.read().await == ConnectionState::Ready
    }

    /// Identity announced by the device in its `hello` message.
    pub async fn device_identity(&self) -> Option<DeviceIdentity> {
        self.identity.read().await.clone()
    }

    /// Connect to the device and block until it is ready for property
    /// access.
    ///
    /// Suspends twice: first on the authentication outcome (a rejection
    /// surfaces as [`ClientError::AuthenticationFailed`]), then on the
    /// first complete status sync. Any transport or decode fault before
    /// readiness aborts with a single terminal error; no partially
    /// authenticated client is ever observable. Calling `connect` on a
    /// client that is not disconnected fails fast with
    /// [`ClientError::AlreadyConnected`].
    pub async fn connect(&self, password: &str) -> ClientResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        info!(url = %self.config.url(), "connecting to device");
        let (ws_stream, _) = match connect_async(self.config.url()).await {
            Ok(conn) => conn,
            Err(e) => {
                self.reset().await;
                return Err(e.into());
            }
        };
        let (mut write, read) = ws_stream.split();

        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(self.config.send_queue);
        *self.outbound.lock().await = Some(msg_tx.clone());

        // Writer task: drains the outbound queue into the sink.
        tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let (auth_tx, auth_rx) = oneshot::channel();
        let (sync_tx, sync_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        *self.reader_done.lock().await = Some(done_rx);

        let session = Session::new(
            password.to_owned(),
            self.document.clone(),
            self.identity.clone(),
            self.state.clone(),
            msg_tx,
            auth_tx,
            sync_tx,
            done_tx,
        );
        tokio::spawn(session.run(read));

        *self.state.write().await = ConnectionState::Authenticating;
        if let Err(error) = await_gate(auth_rx).await {
            self.reset().await;
            return Err(error);
        }

        *self.state.write().await = ConnectionState::Syncing;
        debug!("authenticated, waiting for initial status sync");
        if let Err(error) = await_gate(sync_rx).await {
            self.reset().await;
            return Err(error);
        }

        *self.state.write().await = ConnectionState::Ready;
        info!("device ready");
        Ok(())
    }

    /// Read one property from the status document.
    pub async fn get_property(&self, name: &str) -> ClientResult<Value> {
        self.document.get(name).await
    }

    /// Write one property.
    ///
    /// Validates against the status document, sends a `setValue` message
    /// with a fresh request id, then commits the value locally without
    /// waiting for acknowledgment — the device's next delta or full
    /// status is authoritative and overwrites on disagreement.
    pub async fn set_property(&self, name: &str, value: Value) -> ClientResult<()> {
        self.document.ensure_known(name).await?;

        let request_id = self.request_ids.fetch_add(1, Ordering::SeqCst);
        self.send(OutgoingMessage::SetValue {
            request_id,
            key: name.to_owned(),
            value: value.clone(),
        })
        .await?;

        self.document.commit(name, value).await;
        Ok(())
    }

    /// Snapshot of the full status document.
    pub async fn status(&self) -> ClientResult<Map<String, Value>> {
        self.document.snapshot().await
    }

    /// Close the connection.
    ///
    /// Sends a normal-closure close frame and waits up to the configured
    /// timeout for the receive loop to acknowledge; a timeout is logged,
    /// not escalated — shutdown is best-effort.
    pub async fn close(&self) {
        let sender = self.outbound.lock().await.take();
        let Some(sender) = sender else {
            debug!("close called while not connected");
            return;
        };

        info!("closing device connection");
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        if sender.send(close).await.is_err() {
            debug!("outbound queue already gone");
        }

        let done = self.reader_done.lock().await.take();
        if let Some(done) = done {
            match tokio::time::timeout(self.config.shutdown_timeout, done).await {
                Ok(_) => debug!("receive loop acknowledged close"),
                Err(_) => warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "timed out waiting for receive loop to close"
                ),
            }
        }

        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, message: OutgoingMessage) -> ClientResult<()> {
        let outbound = self.outbound.lock().await;
        let sender = outbound.as_ref().ok_or(ClientError::NotConnected)?;

        let json = message.to_json()?;
        debug!(frame = %json, "sending message");
        sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ClientError::Send(e.to_string()))
    }

    async fn reset(&self) {
        *self.outbound.lock().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

async fn await_gate(gate: oneshot::Receiver<Result<(), ClientError>>) -> ClientResult<()> {
    match gate.await {
        Ok(result) => result,
        // The receive loop died without resolving the gate.
        Err(_) => Err(ClientError::ConnectionClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_url() {
        let config = ClientConfig::new("192.168.1.50");
        assert_eq!(config.url(), "ws://192.168.1.50/ws");

        let with_port = ClientConfig::new("charger.local:8080");
        assert_eq!(with_port.url(), "ws://charger.local:8080/ws");
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("h");
        assert_eq!(config.send_queue, 64);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = WallboxClient::new(ClientConfig::new("h"));
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(!client.is_ready().await);
        assert!(client.device_identity().await.is_none());
    }

    #[tokio::test]
    async fn test_property_access_before_connect_is_not_ready() {
        let client = WallboxClient::new(ClientConfig::new("h"));

        assert!(matches!(
            client.get_property("amp").await,
            Err(ClientError::NotReady)
        ));
        assert!(matches!(
            client.set_property("amp", json!(16)).await,
            Err(ClientError::NotReady)
        ));
        assert!(matches!(client.status().await, Err(ClientError::NotReady)));
    }

    #[tokio::test]
    async fn test_close_when_not_connected_is_a_no_op() {
        let client = WallboxClient::new(ClientConfig::new("h"));
        client.close().await;
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }
}
