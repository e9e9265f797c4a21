//! Receive-loop session state and event dispatch.
//!
//! One [`Session`] lives on the receive-loop task for the lifetime of a
//! connection. It owns the handshake phase, the device identity and the
//! derived session secret, and it resolves the two one-shot readiness
//! gates the connecting caller blocks on. Messages are dispatched
//! strictly in arrival order; there are no concurrent handler runs.

use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use wallbox_handshake::{derive_auth_response, derive_session_secret, SessionSecret};
use wallbox_protocol::{
    AuthChallenge, DeltaStatusPayload, DeviceIdentity, DeviceMessage, FullStatusPayload,
    HelloPayload, OutgoingMessage,
};

use crate::client::ConnectionState;
use crate::error::ClientError;
use crate::status::StatusDocument;

/// One-shot readiness gate resolved by the receive loop.
pub(crate) type Gate = oneshot::Sender<Result<(), ClientError>>;

pub(crate) type SocketReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHello,
    AwaitingAuthOutcome,
    Syncing,
    Ready,
}

/// Whether the receive loop should keep reading after a frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

pub(crate) struct Session {
    password: String,
    phase: Phase,
    secret: Option<SessionSecret>,
    document: Arc<StatusDocument>,
    identity: Arc<RwLock<Option<DeviceIdentity>>>,
    state: Arc<RwLock<ConnectionState>>,
    outbound: mpsc::Sender<Message>,
    authenticated: Option<Gate>,
    synced: Option<Gate>,
    done: Option<oneshot::Sender<()>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        password: String,
        document: Arc<StatusDocument>,
        identity: Arc<RwLock<Option<DeviceIdentity>>>,
        state: Arc<RwLock<ConnectionState>>,
        outbound: mpsc::Sender<Message>,
        authenticated: Gate,
        synced: Gate,
        done: oneshot::Sender<()>,
    ) -> Self {
        Self {
            password,
            phase: Phase::AwaitingHello,
            secret: None,
            document,
            identity,
            state,
            outbound,
            authenticated: Some(authenticated),
            synced: Some(synced),
            done: Some(done),
        }
    }

    /// Read frames until the connection ends, driving the dispatcher for
    /// each text frame in order.
    pub(crate) async fn run(mut self, mut reader: SocketReader) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if self.handle_frame(text.as_str()).await == Flow::Shutdown {
                        break;
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = self.outbound.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    info!("device closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "transport error on receive");
                    self.fail(ClientError::WebSocket(e));
                    break;
                }
            }
        }

        // Unresolved gates drop with the session, which the awaiting
        // caller observes as ConnectionClosed.
        *self.state.write().await = ConnectionState::Disconnected;
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        debug!("receive loop ended");
    }

    /// Decode and dispatch one text frame.
    async fn handle_frame(&mut self, raw: &str) -> Flow {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "ignoring frame that is not valid JSON");
                return Flow::Continue;
            }
        };

        let message = match DeviceMessage::from_value(value) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("ignoring frame without a recognized type");
                return Flow::Continue;
            }
            Err(fault) => {
                if self.phase == Phase::Ready {
                    // After readiness, a single bad message is skipped
                    // rather than ending the session.
                    warn!(error = %fault, "skipping malformed message");
                    return Flow::Continue;
                }
                warn!(error = %fault, "decode fault during handshake");
                self.fail(ClientError::Decode(fault));
                return Flow::Shutdown;
            }
        };

        debug!(kind = message.kind(), "dispatching device message");
        match self.dispatch(message).await {
            Ok(flow) => flow,
            Err(error) => {
                if self.phase == Phase::Ready {
                    warn!(error = %error, "skipping message that failed to apply");
                    Flow::Continue
                } else {
                    self.fail(error);
                    Flow::Shutdown
                }
            }
        }
    }

    async fn dispatch(&mut self, message: DeviceMessage) -> Result<Flow, ClientError> {
        match message {
            DeviceMessage::Hello(hello) => self.on_hello(hello).await,
            DeviceMessage::AuthRequired(challenge) => self.on_auth_required(challenge).await?,
            DeviceMessage::AuthSuccess => self.on_auth_success(),
            DeviceMessage::AuthError => {
                self.on_auth_error();
                return Ok(Flow::Shutdown);
            }
            DeviceMessage::FullStatus(full) => self.on_full_status(full).await,
            DeviceMessage::DeltaStatus(delta) => self.on_delta_status(delta).await,
            DeviceMessage::Response(_) => {
                // Reserved for request correlation.
            }
            DeviceMessage::ClearInverters(payload) | DeviceMessage::UpdateInverter(payload) => {
                debug!(payload = %payload, "inverter lifecycle event");
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_hello(&mut self, hello: HelloPayload) {
        if self.phase != Phase::AwaitingHello {
            debug!("ignoring hello outside of handshake");
            return;
        }

        let identity = DeviceIdentity::from(hello);
        info!(name = identity.name(), serial = %identity.serial, "connected to device");

        // 100k PBKDF2 rounds, once per connection.
        self.secret = Some(derive_session_secret(&self.password, &identity.serial));
        *self.identity.write().await = Some(identity);
        self.phase = Phase::AwaitingAuthOutcome;
    }

    async fn on_auth_required(&mut self, challenge: AuthChallenge) -> Result<(), ClientError> {
        let Some(secret) = &self.secret else {
            debug!("ignoring auth challenge before hello");
            return Ok(());
        };

        let proof = derive_auth_response(&challenge.token1, &challenge.token2, secret)?;
        self.send(OutgoingMessage::Auth {
            token3: proof.token3,
            hash: proof.hash,
        })
        .await
    }

    fn on_auth_success(&mut self) {
        info!("authenticated with device");
        self.phase = Phase::Syncing;
        if let Some(gate) = self.authenticated.take() {
            let _ = gate.send(Ok(()));
        }
    }

    fn on_auth_error(&mut self) {
        warn!("device rejected authentication");
        if let Some(gate) = self.authenticated.take() {
            let _ = gate.send(Err(ClientError::AuthenticationFailed));
        }
    }

    async fn on_full_status(&mut self, full: FullStatusPayload) {
        if !matches!(self.phase, Phase::Syncing | Phase::Ready) {
            debug!("ignoring fullStatus before authentication");
            return;
        }

        self.document.merge(full.status).await;
        if full.partial {
            return;
        }

        self.document.mark_synced().await;
        self.phase = Phase::Ready;
        if let Some(gate) = self.synced.take() {
            info!("initial status sync complete");
            let _ = gate.send(Ok(()));
        }
    }

    async fn on_delta_status(&mut self, delta: DeltaStatusPayload) {
        if !matches!(self.phase, Phase::Syncing | Phase::Ready) {
            debug!("ignoring deltaStatus before authentication");
            return;
        }
        self.document.merge(delta.status).await;
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), ClientError> {
        let json = message.to_json()?;
        debug!(frame = %json, "sending message");
        self.outbound
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ClientError::Send(e.to_string()))
    }

    /// Resolve the pending gate with a handshake-fatal error.
    fn fail(&mut self, error: ClientError) {
        if let Some(gate) = self.authenticated.take() {
            let _ = gate.send(Err(error));
        } else if let Some(gate) = self.synced.take() {
            let _ = gate.send(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wallbox_handshake::auth_hash;

    struct Harness {
        session: Session,
        outbound_rx: mpsc::Receiver<Message>,
        auth_rx: oneshot::Receiver<Result<(), ClientError>>,
        sync_rx: oneshot::Receiver<Result<(), ClientError>>,
        document: Arc<StatusDocument>,
    }

    fn harness(password: &str) -> Harness {
        let document = Arc::new(StatusDocument::new());
        let identity = Arc::new(RwLock::new(None));
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (auth_tx, auth_rx) = oneshot::channel();
        let (sync_tx, sync_rx) = oneshot::channel();
        let (done_tx, _done_rx) = oneshot::channel();

        let session = Session::new(
            password.to_owned(),
            document.clone(),
            identity,
            state,
            outbound_tx,
            auth_tx,
            sync_tx,
            done_tx,
        );

        Harness {
            session,
            outbound_rx,
            auth_rx,
            sync_rx,
            document,
        }
    }

    const HELLO: &str = r#"{"type":"hello","hostname":"wallbox-01","serial":"S1",
        "manufacturer":"M","devicetype":"D","protocol":2.0}"#;

    #[tokio::test]
    async fn test_challenge_produces_verifiable_auth_response() {
        let mut h = harness("secret");

        assert_eq!(h.session.handle_frame(HELLO).await, Flow::Continue);
        assert_eq!(
            h.session
                .handle_frame(r#"{"type":"authRequired","token1":"t1","token2":"t2"}"#)
                .await,
            Flow::Continue
        );

        let Some(Message::Text(text)) = h.outbound_rx.recv().await else {
            panic!("expected an auth frame");
        };
        let auth: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(auth["type"], "auth");

        let token3 = auth["token3"].as_str().unwrap();
        assert_eq!(token3.len(), 32);
        assert!(token3.chars().all(|c| c.is_ascii_hexdigit()));

        // The proof must verify against an independent derivation.
        let secret = derive_session_secret("secret", "S1");
        assert_eq!(
            auth["hash"].as_str().unwrap(),
            auth_hash(token3, "t1", "t2", &secret)
        );
    }

    #[tokio::test]
    async fn test_auth_challenge_before_hello_is_ignored() {
        let mut h = harness("secret");

        let flow = h
            .session
            .handle_frame(r#"{"type":"authRequired","token1":"t1","token2":"t2"}"#)
            .await;

        assert_eq!(flow, Flow::Continue);
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auth_success_resolves_gate() {
        let mut h = harness("secret");

        h.session.handle_frame(r#"{"type":"authSuccess"}"#).await;

        assert!(h.auth_rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_auth_error_resolves_gate_with_failure() {
        let mut h = harness("secret");

        let flow = h.session.handle_frame(r#"{"type":"authError"}"#).await;

        assert_eq!(flow, Flow::Shutdown);
        assert!(matches!(
            h.auth_rx.await.unwrap(),
            Err(ClientError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_partial_full_status_does_not_resolve_sync_gate() {
        let mut h = harness("secret");
        h.session.handle_frame(r#"{"type":"authSuccess"}"#).await;

        h.session
            .handle_frame(r#"{"type":"fullStatus","partial":true,"status":{"amp":6}}"#)
            .await;
        assert!(matches!(
            h.sync_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        h.session
            .handle_frame(r#"{"type":"fullStatus","partial":false,"status":{"amp":16}}"#)
            .await;
        assert!(h.sync_rx.await.unwrap().is_ok());
        assert_eq!(h.document.get("amp").await.unwrap(), json!(16));
    }

    #[tokio::test]
    async fn test_full_status_before_auth_is_ignored() {
        let mut h = harness("secret");

        h.session
            .handle_frame(r#"{"type":"fullStatus","partial":false,"status":{"amp":16}}"#)
            .await;

        assert!(matches!(
            h.sync_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert!(matches!(
            h.document.get("amp").await,
            Err(ClientError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_delta_status_merges_after_sync() {
        let mut h = harness("secret");
        h.session.handle_frame(r#"{"type":"authSuccess"}"#).await;
        h.session
            .handle_frame(r#"{"type":"fullStatus","partial":false,"status":{"amp":16,"fna":"Garage"}}"#)
            .await;

        h.session
            .handle_frame(r#"{"type":"deltaStatus","status":{"amp":8}}"#)
            .await;

        assert_eq!(h.document.get("amp").await.unwrap(), json!(8));
        assert_eq!(h.document.get("fna").await.unwrap(), json!("Garage"));
    }

    #[tokio::test]
    async fn test_malformed_hello_aborts_handshake() {
        let mut h = harness("secret");

        // serial missing: the handshake cannot proceed without it.
        let flow = h
            .session
            .handle_frame(r#"{"type":"hello","manufacturer":"M","devicetype":"D","protocol":2.0}"#)
            .await;

        assert_eq!(flow, Flow::Shutdown);
        assert!(matches!(
            h.auth_rx.await.unwrap(),
            Err(ClientError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_message_after_ready_is_skipped() {
        let mut h = harness("secret");
        h.session.handle_frame(r#"{"type":"authSuccess"}"#).await;
        h.session
            .handle_frame(r#"{"type":"fullStatus","partial":false,"status":{"amp":16}}"#)
            .await;

        let flow = h
            .session
            .handle_frame(r#"{"type":"deltaStatus","status":"not an object"}"#)
            .await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.document.get("amp").await.unwrap(), json!(16));
    }

    #[tokio::test]
    async fn test_unrecognized_and_invalid_frames_are_ignored() {
        let mut h = harness("secret");

        assert_eq!(h.session.handle_frame("not json at all").await, Flow::Continue);
        assert_eq!(
            h.session.handle_frame(r#"{"no":"type"}"#).await,
            Flow::Continue
        );
        assert_eq!(
            h.session
                .handle_frame(r#"{"type":"somethingNew","x":1}"#)
                .await,
            Flow::Continue
        );
        assert_eq!(
            h.session
                .handle_frame(r#"{"type":"updateInverter","id":"inv1"}"#)
                .await,
            Flow::Continue
        );
    }
}
