#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::{Config, ProtocolOptions};
use crate::decode::MessageDecoder;
use crate::error::{Error, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for incoming messages.
const BROADCAST_CAPACITY: usize = 1024;

/// Liveness payload sent on each heartbeat tick. Fire-and-forget; no reply is
/// expected or verified.
const HEARTBEAT_PAYLOAD: &str = "ping";

/// Connection state tracking. Exactly one state is active at a time.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not retrying; awaiting a manual connect
    Idle,
    /// Handshake in progress
    Connecting,
    /// Connection established
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Connection lost; a reconnect is pending
    Closed {
        /// Abnormal closes since the last successful open
        attempt: u32,
    },
    /// Terminal failure; no further automatic retries
    Failed,
}

impl ConnectionState {
    /// Check if the connection is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Check if a handshake is in progress.
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting)
    }
}

/// Point-in-time view of the observable connection surface.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionStatus<M> {
    /// Whether the connection is open
    pub connected: bool,
    /// Whether a handshake is in progress
    pub connecting: bool,
    /// Most recent error, as a human-readable string; cleared on open
    pub error: Option<String>,
    /// Most recently decoded inbound message
    pub last_message: Option<M>,
}

/// Lifecycle requests sent from the public handles to the connection loop.
#[derive(Debug, Clone, Copy)]
enum Command {
    Connect,
    Disconnect,
}

/// How an attempt or an open session ended.
enum SessionEnd {
    /// Local `disconnect()` or a normal close frame from the remote
    Clean,
    /// Handshake failure, transport error, or abnormal close
    Abnormal(Error),
    /// Bad endpoint or protocol options; never retried
    Fatal(Error),
    /// Every manager handle was dropped
    Teardown,
}

/// Outcome of waiting out a reconnect delay.
enum BackoffOutcome {
    Elapsed,
    Disconnected,
    ManualRetry,
    Teardown,
}

/// Observable-state senders owned by the connection loop.
struct Channels<M> {
    state_tx: watch::Sender<ConnectionState>,
    error_tx: watch::Sender<Option<String>>,
    last_message_tx: watch::Sender<Option<M>>,
    broadcast_tx: broadcast::Sender<M>,
}

impl<M> Channels<M> {
    fn set_state(&self, state: ConnectionState) {
        _ = self.state_tx.send(state);
    }

    fn set_error(&self, error: Option<String>) {
        _ = self.error_tx.send(error);
    }
}

/// Manages one logical connection: its lifecycle, reconnection, and heartbeat.
///
/// All connection concerns live in a background task:
/// - Establishing the connection (automatic on creation, manual via [`connect`])
/// - Automatic reconnection with exponential backoff after abnormal closes
/// - A fixed-interval heartbeat ping while the connection is open
/// - Broadcasting decoded inbound messages to multiple subscribers
///
/// Failures never cross the public boundary as errors: they land in the
/// observable [`status`] surface, and [`send`] reports failure as `false`.
///
/// # Type Parameters
///
/// - `M`: Decoded message type
/// - `D`: Decoder implementing [`MessageDecoder<M>`]
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new("wss://example.com", Config::default(), JsonDecoder);
///
/// let mut rx = manager.subscribe();
/// while let Ok(msg) = rx.recv().await {
///     println!("Received: {msg:?}");
/// }
/// ```
///
/// [`connect`]: ConnectionManager::connect
/// [`status`]: ConnectionManager::status
/// [`send`]: ConnectionManager::send
#[derive(Clone)]
pub struct ConnectionManager<M, D>
where
    M: Debug + Clone + Send + Sync + 'static,
    D: MessageDecoder<M>,
{
    /// Watch channel sender for state changes (enables reconnection detection)
    state_tx: watch::Sender<ConnectionState>,
    /// Watch channel receiver for state checks
    state_rx: watch::Receiver<ConnectionState>,
    /// Most recent error string, cleared on successful open
    error_rx: watch::Receiver<Option<String>>,
    /// Most recently decoded inbound message
    last_message_rx: watch::Receiver<Option<M>>,
    /// Lifecycle commands into the connection loop
    command_tx: mpsc::UnboundedSender<Command>,
    /// Sender channel for outgoing messages
    sender_tx: mpsc::UnboundedSender<String>,
    /// Broadcast sender for incoming messages
    broadcast_tx: broadcast::Sender<M>,
    /// Phantom data for unused type parameters
    _phantom: PhantomData<D>,
}

impl<M, D> ConnectionManager<M, D>
where
    M: Debug + Clone + Send + Sync + 'static,
    D: MessageDecoder<M>,
{
    /// Create a new connection manager and start the connection loop.
    ///
    /// The connection is established automatically; the loop runs in a
    /// background task and reconnects according to the config's
    /// [`ReconnectConfig`](crate::ReconnectConfig). An unparseable endpoint is
    /// reported through the observable state (`Failed` plus an error string)
    /// rather than returned here.
    ///
    /// Dropping every clone of the manager tears the loop down: pending
    /// timers are cancelled and the transport is closed.
    pub fn new<S: Into<String>>(endpoint: S, config: Config, decoder: D) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (error_tx, error_rx) = watch::channel(None);
        let (last_message_tx, last_message_rx) = watch::channel(None);

        let channels = Channels {
            state_tx: state_tx.clone(),
            error_tx,
            last_message_tx,
            broadcast_tx: broadcast_tx.clone(),
        };
        let endpoint = endpoint.into();

        tokio::spawn(async move {
            Self::connection_loop(endpoint, config, command_rx, sender_rx, channels, decoder)
                .await;
        });

        Self {
            state_tx,
            state_rx,
            error_rx,
            last_message_rx,
            command_tx,
            sender_tx,
            broadcast_tx,
            _phantom: PhantomData,
        }
    }

    /// Main connection loop: drives sessions, schedules reconnects, and
    /// parks in terminal states until a manual connect arrives.
    async fn connection_loop(
        endpoint: String,
        config: Config,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut sender_rx: mpsc::UnboundedReceiver<String>,
        channels: Channels<M>,
        decoder: D,
    ) {
        let mut attempt = 0_u32;
        let mut backoff: ExponentialBackoff = config.reconnect.clone().into();

        loop {
            let end = Self::run_session(
                &endpoint,
                &config,
                &mut command_rx,
                &mut sender_rx,
                &channels,
                &decoder,
                &mut attempt,
                &mut backoff,
            )
            .await;

            match end {
                SessionEnd::Clean => {
                    channels.set_state(ConnectionState::Idle);
                    attempt = 0;
                    backoff.reset();
                    if !Self::wait_for_connect(&mut command_rx, &channels).await {
                        return;
                    }
                }
                SessionEnd::Fatal(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %e, "fatal configuration error");
                    channels.set_error(Some(e.to_string()));
                    channels.set_state(ConnectionState::Failed);
                    if !Self::wait_for_connect(&mut command_rx, &channels).await {
                        return;
                    }
                    attempt = 0;
                    backoff.reset();
                }
                SessionEnd::Abnormal(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "connection lost");
                    channels.set_error(Some(e.to_string()));
                    attempt = attempt.saturating_add(1);

                    // Give up once the attempt limit is reached; a manual
                    // connect is required from here.
                    if let Some(max) = config.reconnect.max_attempts
                        && attempt >= max
                    {
                        channels.set_error(Some(Error::exhausted().to_string()));
                        channels.set_state(ConnectionState::Failed);
                        if !Self::wait_for_connect(&mut command_rx, &channels).await {
                            return;
                        }
                        attempt = 0;
                        backoff.reset();
                        continue;
                    }

                    channels.set_state(ConnectionState::Closed { attempt });
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(config.reconnect.max_delay);

                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, ?delay, "scheduling reconnect");

                    match Self::wait_backoff(delay, &mut command_rx).await {
                        BackoffOutcome::Elapsed => {}
                        BackoffOutcome::ManualRetry => {
                            attempt = 0;
                            backoff.reset();
                        }
                        BackoffOutcome::Disconnected => {
                            channels.set_state(ConnectionState::Idle);
                            if !Self::wait_for_connect(&mut command_rx, &channels).await {
                                return;
                            }
                            attempt = 0;
                            backoff.reset();
                        }
                        BackoffOutcome::Teardown => {
                            channels.set_state(ConnectionState::Idle);
                            return;
                        }
                    }
                }
                SessionEnd::Teardown => {
                    channels.set_state(ConnectionState::Idle);
                    return;
                }
            }
        }
    }

    /// Run one connection attempt and, if the handshake succeeds, the open
    /// session that follows.
    #[expect(
        clippy::too_many_arguments,
        reason = "Loop-owned state is passed down rather than shared"
    )]
    async fn run_session(
        endpoint: &str,
        config: &Config,
        command_rx: &mut mpsc::UnboundedReceiver<Command>,
        sender_rx: &mut mpsc::UnboundedReceiver<String>,
        channels: &Channels<M>,
        decoder: &D,
        attempt: &mut u32,
        backoff: &mut ExponentialBackoff,
    ) -> SessionEnd {
        let request = match build_request(endpoint, &config.protocol) {
            Ok(request) => request,
            Err(e) => return SessionEnd::Fatal(e),
        };

        channels.set_state(ConnectionState::Connecting);

        // Race the handshake against lifecycle commands so a disconnect
        // during Connecting cancels the attempt.
        let ws_stream = {
            let connecting = connect_async(request);
            tokio::pin!(connecting);
            loop {
                tokio::select! {
                    result = &mut connecting => match result {
                        Ok((stream, _response)) => break stream,
                        Err(e) => return SessionEnd::Abnormal(Transport::Connection(e).into()),
                    },
                    cmd = command_rx.recv() => match cmd {
                        Some(Command::Disconnect) => return SessionEnd::Clean,
                        Some(Command::Connect) => {}
                        None => return SessionEnd::Teardown,
                    },
                }
            }
        };

        // Anything accepted against an earlier session is stale; drop it
        // rather than writing it to the new transport.
        while sender_rx.try_recv().is_ok() {}

        *attempt = 0;
        backoff.reset();
        channels.set_error(None);
        channels.set_state(ConnectionState::Open {
            since: Instant::now(),
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint, "connection open");

        Self::drive_session(ws_stream, config, command_rx, sender_rx, channels, decoder).await
    }

    /// Drive an open connection until it ends.
    async fn drive_session(
        ws_stream: WsStream,
        config: &Config,
        command_rx: &mut mpsc::UnboundedReceiver<Command>,
        sender_rx: &mut mpsc::UnboundedReceiver<String>,
        channels: &Channels<M>,
        decoder: &D,
    ) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();

        // Heartbeat ticks arrive over a channel so all writes stay on this task
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
        let state_rx = channels.state_tx.subscribe();
        let heartbeat_interval = config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            Self::heartbeat_loop(ping_tx, state_rx, heartbeat_interval).await;
        });

        let end = loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        Self::dispatch(text.as_bytes(), decoder, channels);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        Self::dispatch(&bytes, decoder, channels);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        // Only an explicit normal-closure code counts as clean
                        let clean = frame
                            .as_ref()
                            .is_some_and(|f| f.code == CloseCode::Normal);
                        if clean {
                            break SessionEnd::Clean;
                        }
                        let detail = frame.map_or_else(
                            || "no close frame".to_owned(),
                            |f| format!("code {}: {}", u16::from(f.code), f.reason),
                        );
                        break SessionEnd::Abnormal(
                            Transport::ClosedAbnormally(detail).into(),
                        );
                    }
                    Some(Ok(_)) => {
                        // Control frames need no handling here
                    }
                    Some(Err(e)) => {
                        break SessionEnd::Abnormal(Transport::Connection(e).into());
                    }
                    None => {
                        break SessionEnd::Abnormal(
                            Transport::ClosedAbnormally("connection dropped".to_owned()).into(),
                        );
                    }
                },

                cmd = command_rx.recv() => match cmd {
                    Some(Command::Disconnect) => {
                        _ = write
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client disconnect".into(),
                            })))
                            .await;
                        break SessionEnd::Clean;
                    }
                    Some(Command::Connect) => {
                        // Already connected
                    }
                    None => break SessionEnd::Teardown,
                },

                Some(text) = sender_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break SessionEnd::Abnormal(Transport::Connection(e).into());
                    }
                }

                Some(()) = ping_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(HEARTBEAT_PAYLOAD.into())).await {
                        break SessionEnd::Abnormal(Transport::Connection(e).into());
                    }
                }
            }
        };

        heartbeat_handle.abort();
        end
    }

    /// Heartbeat loop: requests a liveness ping at a fixed interval while the
    /// connection is open.
    ///
    /// The state check guards against a tick that fires after the session has
    /// already moved on; such ticks are ignored.
    async fn heartbeat_loop(
        ping_tx: mpsc::UnboundedSender<()>,
        state_rx: watch::Receiver<ConnectionState>,
        period: Duration,
    ) {
        let mut ping_interval = interval(period);
        // The first tick completes immediately; the first ping belongs a full
        // period after open.
        ping_interval.tick().await;

        loop {
            ping_interval.tick().await;

            if !state_rx.borrow().is_open() {
                break;
            }

            if ping_tx.send(()).is_err() {
                // Session loop has terminated
                break;
            }
        }
    }

    /// Decode one inbound frame, record it as the last message, and fan it
    /// out to subscribers.
    fn dispatch(bytes: &[u8], decoder: &D, channels: &Channels<M>) {
        match decoder.decode(bytes) {
            Ok(message) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?message, "inbound message");
                _ = channels.last_message_tx.send(Some(message.clone()));
                _ = channels.broadcast_tx.send(message);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "failed to decode inbound message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    /// Park until a manual connect arrives. Returns `false` when every
    /// manager handle has been dropped and the loop should terminate.
    async fn wait_for_connect(
        command_rx: &mut mpsc::UnboundedReceiver<Command>,
        channels: &Channels<M>,
    ) -> bool {
        loop {
            match command_rx.recv().await {
                Some(Command::Connect) => return true,
                Some(Command::Disconnect) => {
                    // Disconnect from a terminal state lands in Idle
                    channels.set_state(ConnectionState::Idle);
                }
                None => return false,
            }
        }
    }

    /// Wait out a reconnect delay, letting lifecycle commands cut it short.
    async fn wait_backoff(
        delay: Duration,
        command_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> BackoffOutcome {
        tokio::select! {
            () = sleep(delay) => BackoffOutcome::Elapsed,
            cmd = command_rx.recv() => match cmd {
                Some(Command::Disconnect) => BackoffOutcome::Disconnected,
                Some(Command::Connect) => BackoffOutcome::ManualRetry,
                None => BackoffOutcome::Teardown,
            },
        }
    }

    /// Request a (re)connect. Automatic on creation; needed manually only
    /// after a clean disconnect or a terminal failure.
    pub fn connect(&self) {
        _ = self.command_tx.send(Command::Connect);
    }

    /// Disconnect cleanly: cancels any pending reconnect, closes the
    /// transport with a normal closure frame, and never schedules a retry.
    pub fn disconnect(&self) {
        _ = self.command_tx.send(Command::Disconnect);
    }

    /// Send a payload, serialized as JSON.
    ///
    /// Returns `true` only when the connection is open and the payload was
    /// handed to the transport. Otherwise the message is dropped (no
    /// queueing) and `false` is returned.
    pub fn send<R: Serialize>(&self, payload: &R) -> bool {
        match serde_json::to_string(payload) {
            Ok(json) => self.send_text(json),
            Err(_) => false,
        }
    }

    /// Send a raw text payload without serialization. Same open-only
    /// semantics as [`send`](ConnectionManager::send).
    pub fn send_text<S: Into<String>>(&self, payload: S) -> bool {
        if !self.state_rx.borrow().is_open() {
            return false;
        }
        self.sender_tx.send(payload.into()).is_ok()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Snapshot of the observable surface: connected/connecting flags, the
    /// most recent error string, and the last decoded message.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus<M> {
        let state = *self.state_rx.borrow();
        ConnectionStatus {
            connected: state.is_open(),
            connecting: state.is_connecting(),
            error: self.error_rx.borrow().clone(),
            last_message: self.last_message_rx.borrow().clone(),
        }
    }

    /// The most recently decoded inbound message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<M> {
        self.last_message_rx.borrow().clone()
    }

    /// Subscribe to incoming messages.
    ///
    /// Each call returns a new independent receiver. Dropping the receiver is
    /// the unsubscribe.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<M> {
        self.broadcast_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    ///
    /// Useful for detecting reconnections and re-establishing server-side
    /// subscriptions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// Validate the endpoint and assemble the opening handshake request.
fn build_request(endpoint: &str, protocol: &ProtocolOptions) -> crate::Result<Request> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::configuration(format!("invalid endpoint {endpoint:?}: {e}")))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::configuration(format!(
                "unsupported scheme {other:?}, expected \"ws\" or \"wss\""
            )));
        }
    }

    let mut request = endpoint
        .into_client_request()
        .map_err(|e| Error::configuration(format!("invalid endpoint {endpoint:?}: {e}")))?;

    if !protocol.subprotocols.is_empty() {
        let value = HeaderValue::from_str(&protocol.subprotocols.join(", "))
            .map_err(|e| Error::configuration(format!("invalid subprotocol list: {e}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    for (name, value) in &protocol.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::configuration(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::configuration(format!("invalid header value for {name}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}
