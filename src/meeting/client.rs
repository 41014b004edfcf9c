//! Reconnecting client for the conferencing application's control socket
//!
//! Maintains a WebSocket connection to the local control API, serializes
//! request-id-correlated outbound messages, and merges inbound partial
//! state updates into the shared snapshot before dispatching them to the
//! registered callback. The endpoint is a local process, so reconnection
//! retries at a short fixed interval with no backoff.

use crate::core::state::{ConnectionState, SharedMeetingState};
use crate::error::{Error, Result};
use crate::meeting::messages::{ClientMessage, MeetingAction, ReactionType, ServerMessage};
use crate::util::{run_loop, RunFlag, SingleFlight};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Fixed reconnect interval; the endpoint is local and comes back quickly.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Bounded receive wait, so the loop stays responsive to shutdown.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep when the send queue is empty.
const SEND_IDLE_SLEEP: Duration = Duration::from_millis(200);

/// Sleep while disconnected, before re-checking.
const DISCONNECTED_SLEEP: Duration = Duration::from_millis(100);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Identity presented to the control API on connect. The token is granted
/// by the user the first time the device is allowed to pair.
#[derive(Debug, Clone)]
pub struct Identifier {
    pub manufacturer: String,
    pub device: String,
    pub app: String,
    pub app_version: String,
    pub token: String,
}

impl Identifier {
    const PROTOCOL_VERSION: &'static str = "2.0.0";

    /// Query string appended to the connect URI.
    pub fn query_string(&self) -> String {
        format!(
            "?protocol-version={}&manufacturer={}&device={}&app={}&app-version={}&token={}",
            Self::PROTOCOL_VERSION,
            self.manufacturer,
            self.device,
            self.app,
            self.app_version,
            self.token,
        )
    }
}

/// Completion handle for one queued message; resolves `true` once the
/// message has been written to the socket.
pub struct SendHandle {
    rx: oneshot::Receiver<Result<bool>>,
}

impl SendHandle {
    pub async fn done(self) -> Result<bool> {
        self.rx.await.map_err(|_| Error::Stopped)?
    }
}

type MessageCallback = Arc<dyn Fn(ServerMessage) + Send + Sync>;

struct QueuedMessage {
    message: ClientMessage,
    done: oneshot::Sender<Result<bool>>,
}

/// Reconnecting, message-correlated control-plane client.
pub struct MeetingClient {
    uri: String,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: tokio::sync::Mutex<Option<SplitStream<WsStream>>>,
    send_tx: mpsc::UnboundedSender<QueuedMessage>,
    send_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    callback: Mutex<Option<MessageCallback>>,
    state: SharedMeetingState,
    run: RunFlag,
    connect_guard: SingleFlight,
    next_request_id: AtomicU64,
}

impl MeetingClient {
    pub fn new(uri: &str, identifier: Identifier, state: SharedMeetingState) -> Self {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        Self {
            uri: format!("{}{}", uri, identifier.query_string()),
            sink: tokio::sync::Mutex::new(None),
            stream: tokio::sync::Mutex::new(None),
            send_tx,
            send_rx: tokio::sync::Mutex::new(send_rx),
            callback: Mutex::new(None),
            state,
            run: RunFlag::new(),
            connect_guard: SingleFlight::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Enqueue a correlated outbound message. Never blocks.
    pub fn send(&self, message: ClientMessage) -> SendHandle {
        let (tx, rx) = oneshot::channel();
        if let Err(rejected) = self.send_tx.send(QueuedMessage { message, done: tx }) {
            let _ = rejected.0.done.send(Err(Error::Stopped));
        }
        SendHandle { rx }
    }

    /// Build and enqueue a message for `action` with the next request id.
    pub fn send_action(&self, action: MeetingAction) -> SendHandle {
        self.send(ClientMessage::new(self.next_id(), action))
    }

    /// Build and enqueue a reaction message with the next request id.
    pub fn send_reaction(&self, reaction: ReactionType) -> SendHandle {
        self.send(ClientMessage::with_reaction(self.next_id(), reaction))
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register the single inbound callback, invoked after each message
    /// has been merged into the shared snapshot.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(ServerMessage) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    pub fn connected(&self) -> bool {
        self.state.read().connection.is_connected()
    }

    /// Run until [`stop`](Self::stop): connect, then the send and receive
    /// loops concurrently.
    pub async fn process(&self) {
        self.connect().await;
        tokio::join!(
            run_loop(&self.run, || self.send_step()),
            run_loop(&self.run, || self.receive_step()),
        );
        info!("control-plane client stopped");
    }

    /// Clear the run flag, drop the connection and fail every queued
    /// message's completion with `Error::Stopped`.
    pub async fn stop(&self) {
        self.run.clear();
        *self.sink.lock().await = None;
        *self.stream.lock().await = None;
        self.state.write().connection = ConnectionState::Disconnected;
        let mut rx = self.send_rx.lock().await;
        while let Ok(queued) = rx.try_recv() {
            let _ = queued.done.send(Err(Error::Stopped));
        }
    }

    /// Single-flight (re)connect: concurrent triggers wait for the one
    /// outstanding attempt instead of racing.
    async fn connect(&self) {
        self.connect_guard
            .run(|| async {
                *self.sink.lock().await = None;
                *self.stream.lock().await = None;
                self.state.write().connection = ConnectionState::Disconnected;

                let mut attempts: u64 = 0;
                while self.run.is_set() {
                    match connect_async(&self.uri).await {
                        Ok((ws, _)) => {
                            let (sink, stream) = ws.split();
                            *self.sink.lock().await = Some(sink);
                            *self.stream.lock().await = Some(stream);
                            self.state.write().connection = ConnectionState::Connected;
                            info!("connected to control API");
                            return;
                        }
                        Err(e) => {
                            attempts += 1;
                            if attempts == 1 {
                                warn!("failed to connect to control API: {}", e);
                            } else {
                                debug!("failed to connect to control API: {}", e);
                            }
                            tokio::time::sleep(RETRY_INTERVAL).await;
                        }
                    }
                }
            })
            .await;
    }

    async fn send_step(&self) {
        // Leave messages queued while disconnected; they are serviced once
        // the connection is back, never dropped.
        if self.sink.lock().await.is_none() {
            tokio::time::sleep(DISCONNECTED_SLEEP).await;
            return;
        }

        let queued = match self.send_rx.lock().await.try_recv() {
            Ok(queued) => queued,
            Err(_) => {
                tokio::time::sleep(SEND_IDLE_SLEEP).await;
                return;
            }
        };

        // Serialization failure fails only this message, no reconnect.
        let json = match serde_json::to_string(&queued.message) {
            Ok(json) => json,
            Err(e) => {
                let _ = queued.done.send(Err(e.into()));
                return;
            }
        };

        let result = {
            let mut guard = self.sink.lock().await;
            match guard.as_mut() {
                None => Err(Error::NotConnected),
                Some(sink) => sink.send(Message::Text(json.into())).await.map_err(Error::from),
            }
        };

        match result {
            Ok(()) => {
                debug!("sent {:?}", queued.message.action);
                let _ = queued.done.send(Ok(true));
            }
            Err(e) => {
                warn!("control-plane send failed: {}", e);
                let _ = queued.done.send(Err(e));
                self.connect().await;
            }
        }
    }

    async fn receive_step(&self) {
        enum Outcome {
            Idle,
            Text(String),
            Dropped(Option<Error>),
        }

        let outcome = {
            let mut guard = self.stream.lock().await;
            match guard.as_mut() {
                None => Outcome::Idle,
                Some(stream) => match tokio::time::timeout(RECEIVE_TIMEOUT, stream.next()).await {
                    Err(_) => return, // bounded wait elapsed, loop again
                    Ok(None) => Outcome::Dropped(None),
                    Ok(Some(Err(e))) => Outcome::Dropped(Some(e.into())),
                    Ok(Some(Ok(Message::Text(text)))) => Outcome::Text(text.to_string()),
                    Ok(Some(Ok(Message::Close(_)))) => Outcome::Dropped(None),
                    Ok(Some(Ok(_))) => return, // binary/ping/pong ignored
                },
            }
        };

        match outcome {
            Outcome::Idle => tokio::time::sleep(DISCONNECTED_SLEEP).await,
            Outcome::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => self.handle_message(message),
                Err(e) => {
                    warn!("undecodable control-plane message: {}", e);
                    self.connect().await;
                }
            },
            Outcome::Dropped(err) => {
                match err {
                    Some(e) => warn!("control-plane receive failed: {}", e),
                    None => info!("control API closed the connection"),
                }
                self.connect().await;
            }
        }
    }

    /// Merge the message into the shared snapshot, then dispatch it.
    fn handle_message(&self, message: ServerMessage) {
        debug!("received {:?}", message);
        {
            let mut snapshot = self.state.write();
            snapshot.state.merge_from(&message);
            snapshot.mark_received();
        }
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::MeetingSnapshot;
    use parking_lot::RwLock;

    fn client() -> MeetingClient {
        let identifier = Identifier {
            manufacturer: "meetpad".into(),
            device: "macropad".into(),
            app: "meetpad-host".into(),
            app_version: "0.1.0".into(),
            token: "tok".into(),
        };
        MeetingClient::new(
            "ws://127.0.0.1:8124",
            identifier,
            Arc::new(RwLock::new(MeetingSnapshot::default())),
        )
    }

    #[test]
    fn identifier_query_string_carries_identity() {
        let c = client();
        assert_eq!(
            c.uri,
            "ws://127.0.0.1:8124?protocol-version=2.0.0&manufacturer=meetpad\
             &device=macropad&app=meetpad-host&app-version=0.1.0&token=tok"
        );
    }

    #[tokio::test]
    async fn request_ids_increase_and_are_never_reused() {
        let c = client();
        let _ = c.send_action(MeetingAction::ToggleMute);
        let _ = c.send_action(MeetingAction::LeaveCall);
        let _ = c.send_reaction(ReactionType::Like);

        let mut rx = c.send_rx.lock().await;
        let ids: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|q| q.message.request_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stop_fails_queued_messages() {
        let c = client();
        let handle = c.send_action(MeetingAction::Mute);
        c.stop().await;
        assert!(matches!(handle.done().await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn merge_happens_before_dispatch() {
        let c = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::clone(&c.state);
        let seen_cb = Arc::clone(&seen);
        c.register_callback(move |msg| {
            // the snapshot already reflects the message when dispatched
            let merged = state.read().state.clone();
            seen_cb.lock().push((msg, merged));
        });

        let message: ServerMessage =
            serde_json::from_str(r#"{"meetingUpdate":{"meetingState":{"isInMeeting":true}}}"#)
                .unwrap();
        c.handle_message(message.clone());

        let entries = seen.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, message);
        assert!(entries[0].1.is_in_meeting());
    }
}
