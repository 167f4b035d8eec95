//! Streaming session: one WebSocket connection, its subscriptions and its
//! token.
//!
//! # Architecture
//!
//! ```text
//!   SessionHandle (clone per task)
//!        │  mpsc<Command>                  broadcast<SessionEvent>
//!        ▼                                        ▲
//!   ┌──────────────────────── StreamingSession::run ──────────────┐
//!   │  select! { frame | command | REST task done | renewal | idle }│
//!   │     │            │                 │                          │
//!   │  FrameDecoder  MessageRouter ── JoinSet<REST calls>           │
//!   │                    │                                          │
//!   │              Lifecycle (reconnect / stop decisions)           │
//!   └────────────────────┼──────────────────────────────────────────┘
//!                        ▼
//!            mpsc<SubscriptionUpdate> per subscription
//! ```
//!
//! All state lives in the task running [`StreamingSession::run`]. REST calls
//! run concurrently in a [`JoinSet`] so frames keep flowing while a
//! subscription is being created or recreated.
//!
//! # Quick Start
//!
//! ```no_run
//! use saxo_streaming::types::auth::AccessToken;
//! use saxo_streaming::types::subscription::SubscriptionSpec;
//! use saxo_streaming::ws::router::SubscriptionUpdate;
//! use saxo_streaming::ws::session::StreamingSessionBuilder;
//!
//! # #[tokio::main]
//! # async fn main() -> saxo_streaming::error::Result<()> {
//! let (session, handle) = StreamingSessionBuilder::new(AccessToken::new("token"))
//!     .context_id("desk1")
//!     .build()?;
//! tokio::spawn(session.run());
//!
//! let spec = SubscriptionSpec::new(
//!     "/trade/v1/infoprices/subscriptions",
//!     serde_json::json!({ "Uic": 21, "AssetType": "FxSpot" }),
//! );
//! let mut sub = handle.subscribe("eurusd", spec).await?;
//! while let Some(update) = sub.updates.recv().await {
//!     match update {
//!         SubscriptionUpdate::Snapshot(v) => println!("snapshot {v}"),
//!         SubscriptionUpdate::Data(m) => println!("#{} {}", m.message_id, m.payload),
//!         SubscriptionUpdate::Reset => println!("resetting"),
//!         SubscriptionUpdate::Closed { reason } => {
//!             println!("closed: {reason}");
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::client::RestClient;
use crate::constants::limits::COMMAND_CHANNEL_CAPACITY;
use crate::error::{Result, StreamingError};
use crate::types::auth::AccessToken;
use crate::types::control::{ControlMessage, Heartbeat};
use crate::types::subscription::{
    SubscriptionResponse, SubscriptionSpec, validate_context_id, validate_reference_id,
};
use crate::ws::config::StreamingConfig;
use crate::ws::control::{ControlSurface, RestControl};
use crate::ws::frame::FrameDecoder;
use crate::ws::lifecycle::{ConnectionState, DisconnectReason, Lifecycle, Next};
use crate::ws::router::{
    DropReason, FinishStep, MessageRouter, ResetStep, Routed, SubscriptionState, SubscriptionUpdate,
};
use crate::ws::schema::SchemaRegistry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WriterHalf = SplitSink<WsStream, Message>;

/// Produces a fresh access token when the current one is about to expire.
pub type TokenRefresher = Arc<dyn Fn() -> BoxFuture<'static, Result<AccessToken>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Session-level notifications, delivered on a `broadcast` channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// The server reported idle or disabled subscriptions.
    Heartbeat(Vec<Heartbeat>),
    /// A whole frame was discarded because its layout was invalid.
    FramingError(String),
    /// One sub-message was skipped; the rest of its frame was delivered.
    PayloadError(String),
    /// A message arrived for a reference id nobody subscribed to.
    Unroutable {
        /// The unknown reference id.
        reference_id: String,
        /// Id of the message.
        message_id: u64,
    },
    /// A control message with an unrecognised reference id, or a known one
    /// whose payload could not be read.
    UnknownControl(String),
    /// A subscription was recreated after a server reset.
    SubscriptionReset {
        /// The recreated subscription.
        reference_id: String,
    },
    /// Recreating a subscription failed; it has been removed.
    ResubscriptionFailed {
        /// The removed subscription.
        reference_id: String,
        /// Error text of the failed call.
        reason: String,
    },
    /// The connection was re-authorized with a new token.
    TokenRenewed {
        /// Expiry of the new token, if known.
        expires_at: Option<DateTime<Utc>>,
    },
    /// The token is about to expire and no refresher is configured; call
    /// [`SessionHandle::authorize`] with a new one.
    TokenExpiring,
    /// Renewing the token failed; the session is closing.
    RenewalFailed(String),
    /// The transport failed to open or broke.
    TransportError(String),
    /// The session ended.
    Disconnected {
        /// Why it ended.
        reason: DisconnectReason,
        /// Id of the last message received on the context. Pass it to
        /// [`StreamingSessionBuilder::resume_from`] to resume in a new session.
        last_message_id: Option<u64>,
    },
}

// ---------------------------------------------------------------------------
// Commands and task outcomes
// ---------------------------------------------------------------------------

/// A live subscription returned from [`SessionHandle::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    /// The reference id the subscription was created under.
    pub reference_id: String,
    /// Response of the create call.
    pub response: SubscriptionResponse,
    /// Updates for this subscription, starting with the initial snapshot.
    pub updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
}

enum Command {
    Subscribe {
        reference_id: String,
        spec: SubscriptionSpec,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        reference_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        reference_ids: Vec<String>,
    },
    Authorize {
        token: AccessToken,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<SubscriptionState>,
    },
    Reconnect,
    Close,
}

enum TaskOutcome {
    Created {
        reference_id: String,
        epoch: u64,
        spec: SubscriptionSpec,
        result: Result<SubscriptionResponse>,
        reply: oneshot::Sender<Result<Subscription>>,
        updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
    },
    Recreated {
        reference_id: String,
        epoch: u64,
        spec: SubscriptionSpec,
        result: Result<Option<Value>>,
    },
    Removed {
        reference_id: String,
        result: Result<()>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Renewed {
        result: Result<AccessToken>,
        authorized: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`StreamingSession`] and its [`SessionHandle`].
///
/// ```no_run
/// use saxo_streaming::types::auth::AccessToken;
/// use saxo_streaming::ws::session::StreamingSessionBuilder;
///
/// # fn main() -> saxo_streaming::error::Result<()> {
/// let (session, handle) = StreamingSessionBuilder::new(AccessToken::new("token"))
///     .context_id("desk1")
///     .reconnect_delay_ms(500)
///     .max_reconnect_attempts(10)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct StreamingSessionBuilder {
    token: AccessToken,
    config: StreamingConfig,
    refresher: Option<TokenRefresher>,
    schemas: Option<Arc<dyn SchemaRegistry>>,
    resume_from: Option<u64>,
}

impl StreamingSessionBuilder {
    /// A builder with default configuration.
    pub fn new(token: AccessToken) -> Self {
        Self {
            token,
            config: StreamingConfig::default(),
            refresher: None,
            schemas: None,
            resume_from: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: StreamingConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the context id.
    pub fn context_id(mut self, id: impl Into<String>) -> Self {
        self.config.context_id = id.into();
        self
    }

    /// Set the WebSocket connect endpoint.
    pub fn streaming_url(mut self, url: impl Into<String>) -> Self {
        self.config.streaming_url = url.into();
        self
    }

    /// Set the re-authorization endpoint.
    pub fn authorize_url(mut self, url: impl Into<String>) -> Self {
        self.config.authorize_url = url.into();
        self
    }

    /// Set the REST gateway base URL.
    pub fn rest_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.rest_base_url = url.into();
        self
    }

    /// Enable or disable reconnecting. Default: true.
    pub fn auto_reconnect(mut self, enable: bool) -> Self {
        self.config.auto_reconnect = enable;
        self
    }

    /// Limit consecutive reconnect attempts (0 = unlimited). Default: 0.
    pub fn max_reconnect_attempts(mut self, n: u32) -> Self {
        self.config.max_reconnect_attempts = n;
        self
    }

    /// Set the first reconnect delay in milliseconds. Default: 1,000.
    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    /// Cap the reconnect delay in milliseconds. Default: 30,000.
    pub fn max_reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.max_reconnect_delay_ms = ms;
        self
    }

    /// Set the idle timeout in milliseconds (0 disables). Default: 120,000.
    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    /// Renew the token this many seconds before expiry. Default: 60.
    pub fn renewal_margin_secs(mut self, secs: u64) -> Self {
        self.config.renewal_margin_secs = secs;
        self
    }

    /// Fetch new tokens with `f` when the current one is about to expire.
    pub fn token_refresher<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AccessToken>> + Send + 'static,
    {
        let refresher: TokenRefresher = Arc::new(move || f().boxed());
        self.refresher = Some(refresher);
        self
    }

    /// Resume the context from `message_id`, the last message id seen by an
    /// earlier session on the same context id.
    pub fn resume_from(mut self, message_id: u64) -> Self {
        self.resume_from = Some(message_id);
        self
    }

    /// Decode Protobuf payloads with `schemas`.
    pub fn schemas(mut self, schemas: Arc<dyn SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    /// Build a session that talks to the REST gateway with [`RestClient`].
    pub fn build(self) -> Result<(StreamingSession<RestControl>, SessionHandle)> {
        let client = RestClient::with_base_url(&self.token.token, self.config.rest_base_url.clone())?;
        let control = RestControl::new(client, &self.config.authorize_url)?;
        self.build_with(control)
    }

    /// Build a session that issues its REST calls through `control`.
    pub fn build_with<C: ControlSurface>(self, control: C) -> Result<(StreamingSession<C>, SessionHandle)> {
        validate_context_id(&self.config.context_id)?;
        let streaming_url = url::Url::parse(&self.config.streaming_url)?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (message_id_tx, message_id_rx) = watch::channel(self.resume_from);
        let (events, _) = broadcast::channel(self.config.event_channel_capacity.max(1));

        let decoder = match self.schemas {
            Some(schemas) => FrameDecoder::with_schemas(schemas),
            None => FrameDecoder::new(),
        };

        let mut lifecycle = Lifecycle::new(&self.config);
        if let Some(id) = self.resume_from {
            lifecycle.record_message_id(id);
        }

        let mut session = StreamingSession {
            lifecycle,
            config: self.config,
            streaming_url,
            token: self.token,
            refresher: self.refresher,
            control,
            decoder,
            router: MessageRouter::new(),
            tasks: JoinSet::new(),
            commands: command_rx,
            state_tx,
            message_id_tx,
            events: events.clone(),
            renewal_at: None,
        };
        session.schedule_renewal();

        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            last_message_id: message_id_rx,
            events,
        };
        Ok((session, handle))
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Controls a running [`StreamingSession`].
///
/// Clone it freely. The session stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    last_message_id: watch::Receiver<Option<u64>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Create a subscription and return its update channel.
    ///
    /// The first update on the channel is the snapshot from the create call
    /// (when the service returns one).
    pub async fn subscribe(
        &self,
        reference_id: impl Into<String>,
        spec: SubscriptionSpec,
    ) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            reference_id: reference_id.into(),
            spec,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StreamingError::SessionClosed)?
    }

    /// Remove a subscription. Its channel receives `Closed`.
    pub async fn unsubscribe(&self, reference_id: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            reference_id: reference_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StreamingError::SessionClosed)?
    }

    /// Recreate the given subscriptions, or all of them when `reference_ids`
    /// is empty, exactly as if the server had sent `_resetsubscriptions`.
    pub async fn reset_subscriptions(&self, reference_ids: Vec<String>) -> Result<()> {
        self.send(Command::Reset { reference_ids }).await
    }

    /// Re-authorize the connection with `token` and use it from now on.
    ///
    /// While no transport is open the token is only stored for the next
    /// handshake.
    pub async fn authorize(&self, token: AccessToken) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Authorize { token, reply }).await?;
        rx.await.map_err(|_| StreamingError::SessionClosed)?
    }

    /// Drop the current transport and connect again, resuming from the last
    /// received message id.
    pub async fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect).await
    }

    /// Last delivered message id per subscription.
    pub async fn subscription_state(&self) -> Result<SubscriptionState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::State { reply }).await?;
        rx.await.map_err(|_| StreamingError::SessionClosed)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Id of the last message received on the context. Still readable after
    /// the session has ended.
    pub fn last_message_id(&self) -> Option<u64> {
        *self.last_message_id.borrow()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| StreamingError::SessionClosed)
    }

    /// A new receiver for session events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Close the connection and stop the session.
    pub async fn close(&self) -> Result<()> {
        self.send(Command::Close).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| StreamingError::SessionClosed)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The task owning one streaming connection. Drive it with [`run`](Self::run).
pub struct StreamingSession<C: ControlSurface = RestControl> {
    config: StreamingConfig,
    streaming_url: url::Url,
    token: AccessToken,
    refresher: Option<TokenRefresher>,
    control: C,
    decoder: FrameDecoder,
    router: MessageRouter,
    lifecycle: Lifecycle,
    tasks: JoinSet<TaskOutcome>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    message_id_tx: watch::Sender<Option<u64>>,
    events: broadcast::Sender<SessionEvent>,
    renewal_at: Option<Instant>,
}

impl<C: ControlSurface> StreamingSession<C> {
    /// The context id this session connects with.
    pub fn context_id(&self) -> &str {
        &self.config.context_id
    }

    /// Connect and process frames until the session ends.
    ///
    /// Reconnects according to the configured policy. On return every
    /// subscriber has received `Closed` and pending handle calls fail with
    /// [`StreamingError::SessionClosed`].
    pub async fn run(mut self) -> DisconnectReason {
        tracing::info!(context_id = %self.config.context_id, "Streaming session started");

        let reason = loop {
            let resume = self.lifecycle.begin_connect();
            self.publish_state();

            let connected = match self.connect_request(resume) {
                Ok(request) => connect(request).await,
                Err(e) => Err(e),
            };
            let next = match connected {
                Ok(ws) => {
                    self.lifecycle.opened();
                    self.publish_state();
                    tracing::info!(
                        context_id = %self.config.context_id,
                        resume_from = ?resume,
                        "Streaming connection open"
                    );
                    self.drive(ws).await
                }
                Err(e) => {
                    tracing::error!(
                        context_id = %self.config.context_id,
                        error = %e,
                        "Streaming connect failed"
                    );
                    self.emit(SessionEvent::TransportError(e.to_string()));
                    let rejected =
                        e.is_unauthorized() || matches!(e, StreamingError::InvalidArgument(_));
                    self.lifecycle.connect_failed(rejected)
                }
            };

            match next {
                Next::Stop(reason) => break reason,
                Next::Reconnect(delay) => {
                    self.publish_state();
                    tracing::info!(
                        context_id = %self.config.context_id,
                        attempt = self.lifecycle.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting"
                    );
                    if let Some(reason) = self.wait(delay).await {
                        break reason;
                    }
                }
            }
        };

        self.shutdown(reason);
        reason
    }

    fn connect_request(&self, resume: Option<u64>) -> Result<Request> {
        let mut url = self.streaming_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("contextId", &self.config.context_id);
            if let Some(id) = resume {
                query.append_pair("messageid", &id.to_string());
            }
        }

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token.token))
            .map_err(|e| StreamingError::InvalidArgument(format!("invalid access token: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);
        Ok(request)
    }

    /// Process one open transport until it ends.
    async fn drive(&mut self, ws: WsStream) -> Next {
        let (mut write, mut read) = ws.split();
        let idle = (self.config.idle_timeout_ms > 0)
            .then(|| Duration::from_millis(self.config.idle_timeout_ms));
        let mut idle_deadline = idle.map(|d| Instant::now() + d);

        loop {
            tokio::select! {
                frame = read.next() => {
                    idle_deadline = idle.map(|d| Instant::now() + d);
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            if self.on_frame(data) {
                                self.close_transport(&mut write).await;
                                return self.lifecycle.server_disconnect();
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| f.code);
                            tracing::info!(
                                context_id = %self.config.context_id,
                                code = ?code,
                                "Server closed the connection"
                            );
                            return self.lifecycle.transport_closed(code);
                        }
                        Some(Ok(Message::Text(text))) => {
                            tracing::debug!(len = text.len(), "Ignoring text frame");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(
                                context_id = %self.config.context_id,
                                error = %e,
                                "WebSocket read error"
                            );
                            self.emit(SessionEvent::TransportError(e.to_string()));
                            return self.lifecycle.transport_closed(None);
                        }
                        None => {
                            tracing::warn!(context_id = %self.config.context_id, "WebSocket stream ended");
                            return self.lifecycle.transport_closed(None);
                        }
                    }
                }
                _ = sleep_until(idle_deadline) => {
                    tracing::warn!(
                        context_id = %self.config.context_id,
                        idle_timeout_ms = self.config.idle_timeout_ms,
                        "No frames received, dropping connection"
                    );
                    return self.lifecycle.transport_closed(None);
                }
                _ = sleep_until(self.renewal_at) => {
                    self.on_renewal_due();
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if self.on_task(joined) {
                        self.close_transport(&mut write).await;
                        return self.lifecycle.renewal_failed();
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => {
                        self.close_transport(&mut write).await;
                        return self.lifecycle.close();
                    }
                    Some(Command::Reconnect) => {
                        tracing::info!(context_id = %self.config.context_id, "Reconnect requested");
                        self.close_transport(&mut write).await;
                        return self.lifecycle.force_reconnect();
                    }
                    Some(command) => self.on_command(command),
                },
            }
        }
    }

    /// Wait out a reconnect delay while still serving commands and REST
    /// completions. Returns the reason when the session has to stop instead.
    async fn wait(&mut self, delay: Duration) -> Option<DisconnectReason> {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = sleep_until(self.renewal_at) => {
                    self.on_renewal_due();
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if self.on_task(joined) {
                        return terminal(self.lifecycle.renewal_failed());
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return terminal(self.lifecycle.close()),
                    Some(Command::Reconnect) => return None,
                    Some(command) => self.on_command(command),
                },
            }
        }
    }

    async fn close_transport(&mut self, write: &mut WriterHalf) {
        self.lifecycle.closing();
        self.publish_state();
        if let Err(e) = write.send(Message::Close(None)).await {
            tracing::debug!(error = %e, "Close frame not sent");
        }
    }

    fn shutdown(&mut self, reason: DisconnectReason) {
        self.tasks.abort_all();
        for reference_id in self.router.reference_ids() {
            self.router.remove(&reference_id, "session closed");
        }
        self.renewal_at = None;
        self.publish_state();
        let last_message_id = self.lifecycle.last_message_id();
        tracing::info!(
            context_id = %self.config.context_id,
            reason = ?reason,
            last_message_id = ?last_message_id,
            "Streaming session ended"
        );
        self.emit(SessionEvent::Disconnected {
            reason,
            last_message_id,
        });
    }

    // -----------------------------------------------------------------------
    // Frames
    // -----------------------------------------------------------------------

    /// Decode and route one binary frame. Returns `true` when the server
    /// asked the client to disconnect; sub-messages after `_disconnect` are
    /// not processed.
    fn on_frame(&mut self, data: Bytes) -> bool {
        let frame = match self.decoder.decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    context_id = %self.config.context_id,
                    error = %e,
                    "Discarding malformed frame"
                );
                self.emit(SessionEvent::FramingError(e.to_string()));
                return false;
            }
        };

        if let Some(id) = frame.last_message_id {
            self.record_message_id(id);
        }
        for error in &frame.errors {
            self.emit(SessionEvent::PayloadError(error.to_string()));
        }

        for msg in frame.messages {
            match self.router.route(msg) {
                Routed::Delivered {
                    reference_id,
                    message_id,
                } => {
                    tracing::trace!(reference_id, message_id, "Delivered");
                }
                Routed::Control {
                    message_id,
                    control,
                } => {
                    if self.on_control(message_id, control) {
                        self.record_message_id(message_id);
                        return true;
                    }
                }
                Routed::InvalidControl {
                    reference_id,
                    message_id,
                    reason,
                } => {
                    tracing::warn!(reference_id, message_id, reason, "Unreadable control message");
                    self.emit(SessionEvent::UnknownControl(reference_id));
                }
                Routed::Dropped {
                    reference_id,
                    message_id,
                    reason,
                } => self.on_dropped(reference_id, message_id, reason),
            }
        }
        false
    }

    fn record_message_id(&mut self, message_id: u64) {
        self.lifecycle.record_message_id(message_id);
        self.message_id_tx.send_replace(Some(message_id));
    }

    fn on_control(&mut self, message_id: u64, control: ControlMessage) -> bool {
        match control {
            ControlMessage::Heartbeat(beats) => {
                tracing::debug!(message_id, count = beats.len(), "Heartbeat");
                self.emit(SessionEvent::Heartbeat(beats));
            }
            ControlMessage::ResetSubscriptions {
                target_reference_ids,
            } => {
                tracing::info!(message_id, targets = ?target_reference_ids, "Server reset subscriptions");
                self.reset(target_reference_ids);
            }
            ControlMessage::Disconnect => {
                tracing::warn!(
                    context_id = %self.config.context_id,
                    message_id,
                    "Server requested disconnect"
                );
                return true;
            }
            ControlMessage::Unknown(reference_id) => {
                tracing::warn!(reference_id, message_id, "Unknown control message");
                self.emit(SessionEvent::UnknownControl(reference_id));
            }
        }
        false
    }

    fn on_dropped(&mut self, reference_id: String, message_id: u64, reason: DropReason) {
        match reason {
            DropReason::Unregistered => {
                let err = StreamingError::UnroutableReference {
                    reference_id: reference_id.clone(),
                    message_id,
                };
                tracing::debug!(error = %err, "Dropping message");
                self.emit(SessionEvent::Unroutable {
                    reference_id,
                    message_id,
                });
            }
            DropReason::Pending | DropReason::Resubscribing => {
                tracing::debug!(reference_id, message_id, reason = ?reason, "Dropping stale message");
            }
            DropReason::SubscriberGone => {
                tracing::info!(reference_id, "Subscriber gone, removing subscription");
                if let Some(spec) = self.router.remove(&reference_id, "receiver dropped") {
                    self.spawn_remove(reference_id, spec, None);
                }
            }
        }
    }

    fn reset(&mut self, reference_ids: Vec<String>) {
        let reference_ids = if reference_ids.is_empty() {
            self.router.reference_ids()
        } else {
            reference_ids
        };
        for reference_id in reference_ids {
            match self.router.begin_reset(&reference_id) {
                ResetStep::Start { epoch, spec } => self.spawn_recreate(reference_id, epoch, spec),
                ResetStep::Queued => tracing::debug!(reference_id, "Reset queued behind running one"),
                ResetStep::Unknown => tracing::debug!(reference_id, "Reset for unknown subscription"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                reference_id,
                spec,
                reply,
            } => {
                if let Err(e) = validate_reference_id(&reference_id) {
                    let _ = reply.send(Err(e));
                    return;
                }
                if self.router.contains(&reference_id) {
                    let _ = reply.send(Err(StreamingError::InvalidArgument(format!(
                        "reference id {reference_id:?} is already subscribed"
                    ))));
                    return;
                }
                let (tx, updates) = mpsc::unbounded_channel();
                let epoch = self.router.register(reference_id.clone(), spec.clone(), tx);
                self.spawn_create(reference_id, epoch, spec, reply, updates);
            }
            Command::Unsubscribe {
                reference_id,
                reply,
            } => match self.router.remove(&reference_id, "unsubscribed") {
                Some(spec) => self.spawn_remove(reference_id, spec, Some(reply)),
                None => {
                    let _ = reply.send(Err(StreamingError::InvalidArgument(format!(
                        "reference id {reference_id:?} is not subscribed"
                    ))));
                }
            },
            Command::Reset { reference_ids } => self.reset(reference_ids),
            Command::Authorize { token, reply } => {
                self.spawn_renewal(future::ready(Ok(token)).boxed(), Some(reply));
            }
            Command::State { reply } => {
                let _ = reply.send(self.router.state().clone());
            }
            // Handled by the loops.
            Command::Reconnect | Command::Close => {}
        }
    }

    // -----------------------------------------------------------------------
    // REST tasks
    // -----------------------------------------------------------------------

    fn spawn_create(
        &mut self,
        reference_id: String,
        epoch: u64,
        spec: SubscriptionSpec,
        reply: oneshot::Sender<Result<Subscription>>,
        updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
    ) {
        let control = self.control.clone();
        let context_id = self.config.context_id.clone();
        self.tasks.spawn(async move {
            let result = control
                .create_subscription(&context_id, &reference_id, &spec)
                .await;
            TaskOutcome::Created {
                reference_id,
                epoch,
                spec,
                result,
                reply,
                updates,
            }
        });
    }

    fn spawn_recreate(&mut self, reference_id: String, epoch: u64, spec: SubscriptionSpec) {
        tracing::info!(reference_id, epoch, "Recreating subscription");
        let control = self.control.clone();
        let context_id = self.config.context_id.clone();
        self.tasks.spawn(async move {
            let result = async {
                control
                    .remove_subscription(&context_id, &reference_id, &spec)
                    .await?;
                let response = control
                    .create_subscription(&context_id, &reference_id, &spec)
                    .await?;
                Ok::<_, StreamingError>(response.snapshot)
            }
            .await;
            TaskOutcome::Recreated {
                reference_id,
                epoch,
                spec,
                result,
            }
        });
    }

    fn spawn_remove(
        &mut self,
        reference_id: String,
        spec: SubscriptionSpec,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let control = self.control.clone();
        let context_id = self.config.context_id.clone();
        self.tasks.spawn(async move {
            let result = control
                .remove_subscription(&context_id, &reference_id, &spec)
                .await;
            TaskOutcome::Removed {
                reference_id,
                result,
                reply,
            }
        });
    }

    fn spawn_renewal(
        &mut self,
        fetch: BoxFuture<'static, Result<AccessToken>>,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        // Without an open transport the new token is only used for the next
        // handshake.
        let authorized = self.lifecycle.state() == ConnectionState::Open;
        let control = self.control.clone();
        let context_id = self.config.context_id.clone();
        self.tasks.spawn(async move {
            let result = async {
                let token = fetch.await?;
                if authorized {
                    control.authorize(&context_id, &token.token).await?;
                }
                Ok::<_, StreamingError>(token)
            }
            .await;
            TaskOutcome::Renewed {
                result,
                authorized,
                reply,
            }
        });
    }

    /// Apply a finished REST task. Returns `true` when token renewal failed
    /// and the session must stop.
    fn on_task(&mut self, joined: std::result::Result<TaskOutcome, JoinError>) -> bool {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Session task failed");
                return false;
            }
        };

        match outcome {
            TaskOutcome::Created {
                reference_id,
                epoch,
                spec,
                result,
                reply,
                updates,
            } => self.on_created(reference_id, epoch, spec, result, reply, updates),
            TaskOutcome::Recreated {
                reference_id,
                epoch,
                spec,
                result,
            } => self.on_recreated(reference_id, epoch, spec, result),
            TaskOutcome::Removed {
                reference_id,
                result,
                reply,
            } => {
                match &result {
                    Ok(()) => tracing::debug!(reference_id, "Subscription removed"),
                    Err(e) => tracing::error!(reference_id, error = %e, "Failed to remove subscription"),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            TaskOutcome::Renewed {
                result,
                authorized,
                reply,
            } => return self.on_renewed(result, authorized, reply),
        }
        false
    }

    fn on_created(
        &mut self,
        reference_id: String,
        epoch: u64,
        spec: SubscriptionSpec,
        result: Result<SubscriptionResponse>,
        reply: oneshot::Sender<Result<Subscription>>,
        updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(reference_id, error = %e, "Failed to create subscription");
                self.router.remove(&reference_id, &e.to_string());
                let _ = reply.send(Err(e));
                return;
            }
        };

        match self
            .router
            .finish(&reference_id, epoch, Ok(response.snapshot.clone()))
        {
            FinishStep::Done => {
                tracing::info!(reference_id, "Subscribed");
            }
            FinishStep::Again { epoch, spec } => {
                self.spawn_recreate(reference_id.clone(), epoch, spec);
            }
            FinishStep::Failed | FinishStep::Stale => {
                tracing::debug!(reference_id, "Subscription removed while being created");
                self.spawn_remove(reference_id.clone(), spec, None);
                let _ = reply.send(Err(StreamingError::InvalidArgument(format!(
                    "reference id {reference_id:?} was unsubscribed while being created"
                ))));
                return;
            }
        }

        let _ = reply.send(Ok(Subscription {
            reference_id,
            response,
            updates,
        }));
    }

    fn on_recreated(
        &mut self,
        reference_id: String,
        epoch: u64,
        spec: SubscriptionSpec,
        result: Result<Option<Value>>,
    ) {
        let succeeded = result.is_ok();
        let reason = result.as_ref().err().map(ToString::to_string);
        match self
            .router
            .finish(&reference_id, epoch, result.map_err(|e| e.to_string()))
        {
            FinishStep::Done => {
                tracing::info!(reference_id, "Subscription recreated");
                self.emit(SessionEvent::SubscriptionReset { reference_id });
            }
            FinishStep::Again { epoch, spec } => self.spawn_recreate(reference_id, epoch, spec),
            FinishStep::Failed => {
                let reason = reason.unwrap_or_default();
                tracing::error!(reference_id, reason, "Failed to recreate subscription");
                self.emit(SessionEvent::ResubscriptionFailed {
                    reference_id,
                    reason,
                });
            }
            FinishStep::Stale => {
                // Unsubscribed meanwhile: the recreated one must not linger.
                if succeeded && !self.router.contains(&reference_id) {
                    self.spawn_remove(reference_id, spec, None);
                }
            }
        }
    }

    fn on_renewed(
        &mut self,
        result: Result<AccessToken>,
        authorized: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) -> bool {
        let reauthorize = !authorized && self.lifecycle.state() == ConnectionState::Open;
        let result = match result {
            // A transport opened with the old token while fetching.
            Ok(token) if reauthorize => {
                self.spawn_renewal(future::ready(Ok(token)).boxed(), reply);
                return false;
            }
            other => other,
        }
        .and_then(|token| {
            self.control.set_access_token(&token.token)?;
            Ok(token)
        });

        match result {
            Ok(token) => {
                tracing::info!(
                    context_id = %self.config.context_id,
                    expires_at = ?token.expires_at,
                    "Token renewed"
                );
                let expires_at = token.expires_at;
                self.token = token;
                self.schedule_renewal();
                self.emit(SessionEvent::TokenRenewed { expires_at });
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                false
            }
            Err(e) => {
                tracing::error!(context_id = %self.config.context_id, error = %e, "Token renewal failed");
                self.emit(SessionEvent::RenewalFailed(e.to_string()));
                if let Some(reply) = reply {
                    let _ = reply.send(Err(StreamingError::Renewal(e.to_string())));
                }
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Token renewal
    // -----------------------------------------------------------------------

    fn schedule_renewal(&mut self) {
        let margin = Duration::from_secs(self.config.renewal_margin_secs);
        self.renewal_at = self
            .token
            .renewal_delay(margin, Utc::now())
            .map(|delay| Instant::now() + delay);
        if let Some(at) = self.renewal_at {
            tracing::debug!(
                in_secs = at.saturating_duration_since(Instant::now()).as_secs(),
                "Token renewal scheduled"
            );
        }
    }

    fn on_renewal_due(&mut self) {
        self.renewal_at = None;
        match &self.refresher {
            Some(refresher) => {
                tracing::info!(context_id = %self.config.context_id, "Renewing token");
                let fetch = refresher();
                self.spawn_renewal(fetch, None);
            }
            None => {
                tracing::warn!(
                    context_id = %self.config.context_id,
                    "Token about to expire and no refresher configured"
                );
                self.emit(SessionEvent::TokenExpiring);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    fn publish_state(&mut self) {
        let state = self.lifecycle.state();
        if self.state_tx.send_replace(state) != state {
            tracing::debug!(state = %state, "Connection state changed");
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

async fn connect(request: Request) -> Result<WsStream> {
    let (ws, _resp) = connect_async(request).await?;
    Ok(ws)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn terminal(next: Next) -> Option<DisconnectReason> {
    match next {
        Next::Stop(reason) => Some(reason),
        Next::Reconnect(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    /// In-memory control surface recording every call.
    #[derive(Clone, Default)]
    struct FakeControl {
        calls: Arc<Mutex<Vec<String>>>,
        fail_create: Arc<Mutex<bool>>,
    }

    impl FakeControl {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ControlSurface for FakeControl {
        async fn create_subscription(
            &self,
            _context_id: &str,
            reference_id: &str,
            _spec: &SubscriptionSpec,
        ) -> Result<SubscriptionResponse> {
            self.calls.lock().unwrap().push(format!("create {reference_id}"));
            if *self.fail_create.lock().unwrap() {
                return Err(StreamingError::InvalidArgument("rejected".into()));
            }
            Ok(SubscriptionResponse {
                reference_id: Some(reference_id.to_owned()),
                snapshot: Some(json!({"Quote": {"Bid": 1.1}})),
                ..SubscriptionResponse::default()
            })
        }

        async fn remove_subscription(
            &self,
            _context_id: &str,
            reference_id: &str,
            _spec: &SubscriptionSpec,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(format!("remove {reference_id}"));
            Ok(())
        }

        async fn authorize(&self, _context_id: &str, _token: &str) -> Result<()> {
            self.calls.lock().unwrap().push("authorize".into());
            Ok(())
        }

        fn set_access_token(&mut self, _token: &str) -> Result<()> {
            Ok(())
        }
    }

    fn session(control: FakeControl) -> (StreamingSession<FakeControl>, SessionHandle) {
        StreamingSessionBuilder::new(AccessToken::new("t"))
            .context_id("ctx1")
            .build_with(control)
            .unwrap()
    }

    fn spec() -> SubscriptionSpec {
        SubscriptionSpec::new("/trade/v1/infoprices/subscriptions", json!({"Uic": 21}))
    }

    fn frame(parts: &[(u64, &str, Value)]) -> Bytes {
        let mut encoder = crate::ws::frame::FrameEncoder::new();
        for (id, reference_id, payload) in parts {
            encoder = encoder
                .message(
                    *id,
                    reference_id,
                    crate::types::enums::PayloadFormat::Json,
                    payload.to_string().as_bytes(),
                )
                .unwrap();
        }
        encoder.finish()
    }

    async fn settle(session: &mut StreamingSession<FakeControl>) {
        while let Some(joined) = session.tasks.join_next().await {
            session.on_task(joined);
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_snapshot_then_data() {
        let (mut session, handle) = session(FakeControl::default());
        let (reply, rx) = oneshot::channel();
        session.on_command(Command::Subscribe {
            reference_id: "prices".into(),
            spec: spec(),
            reply,
        });
        settle(&mut session).await;
        let mut sub = rx.await.unwrap().unwrap();

        session.on_frame(frame(&[(7, "prices", json!({"Quote": {"Bid": 1.2}}))]));

        assert_eq!(
            sub.updates.recv().await.unwrap(),
            SubscriptionUpdate::Snapshot(json!({"Quote": {"Bid": 1.1}}))
        );
        let SubscriptionUpdate::Data(msg) = sub.updates.recv().await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(msg.message_id, 7);
        assert_eq!(session.lifecycle.last_message_id(), Some(7));
        drop(handle);
    }

    #[tokio::test]
    async fn duplicate_and_control_prefixed_ids_are_rejected() {
        let (mut session, _handle) = session(FakeControl::default());
        let (reply, rx) = oneshot::channel();
        session.on_command(Command::Subscribe {
            reference_id: "_bad".into(),
            spec: spec(),
            reply,
        });
        assert!(matches!(rx.await.unwrap(), Err(StreamingError::InvalidArgument(_))));

        let (reply, _rx) = oneshot::channel();
        session.on_command(Command::Subscribe {
            reference_id: "dup".into(),
            spec: spec(),
            reply,
        });
        let (reply, rx) = oneshot::channel();
        session.on_command(Command::Subscribe {
            reference_id: "dup".into(),
            spec: spec(),
            reply,
        });
        assert!(matches!(rx.await.unwrap(), Err(StreamingError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn reset_control_recreates_once() {
        let control = FakeControl::default();
        let (mut session, handle) = session(control.clone());
        let mut events = handle.events();
        let (reply, rx) = oneshot::channel();
        session.on_command(Command::Subscribe {
            reference_id: "prices".into(),
            spec: spec(),
            reply,
        });
        settle(&mut session).await;
        let _sub = rx.await.unwrap().unwrap();

        let reset = json!({"TargetReferenceIds": ["prices"]});
        session.on_frame(frame(&[
            (1, "_resetsubscriptions", reset.clone()),
            (2, "_resetsubscriptions", reset),
        ]));
        settle(&mut session).await;

        assert_eq!(
            control.calls(),
            vec!["create prices", "remove prices", "create prices", "remove prices", "create prices"]
        );
        assert_eq!(session.router.len(), 1);
        assert!(session.router.is_active("prices"));

        let mut resets = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::SubscriptionReset { .. }) {
                resets += 1;
            }
        }
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn failed_create_reports_error_and_forgets_route() {
        let control = FakeControl::default();
        *control.fail_create.lock().unwrap() = true;
        let (mut session, _handle) = session(control);
        let (reply, rx) = oneshot::channel();
        session.on_command(Command::Subscribe {
            reference_id: "prices".into(),
            spec: spec(),
            reply,
        });
        settle(&mut session).await;
        assert!(rx.await.unwrap().is_err());
        assert!(!session.router.contains("prices"));
    }

    #[tokio::test]
    async fn disconnect_control_is_reported() {
        let (mut session, _handle) = session(FakeControl::default());
        assert!(!session.on_frame(frame(&[(1, "_heartbeat", json!([]))])));
        assert!(session.on_frame(frame(&[(2, "_disconnect", Value::Null)])));
        assert_eq!(session.lifecycle.last_message_id(), Some(2));
    }

    #[tokio::test]
    async fn nothing_after_disconnect_is_processed() {
        let control = FakeControl::default();
        let (mut session, handle) = session(control.clone());
        let (reply, rx) = oneshot::channel();
        session.on_command(Command::Subscribe {
            reference_id: "prices".into(),
            spec: spec(),
            reply,
        });
        settle(&mut session).await;
        let mut sub = rx.await.unwrap().unwrap();
        assert!(matches!(
            sub.updates.try_recv(),
            Ok(SubscriptionUpdate::Snapshot(_))
        ));

        assert!(session.on_frame(frame(&[
            (1, "_disconnect", Value::Null),
            (2, "prices", json!({"Quote": {"Bid": 9.9}})),
            (3, "_resetsubscriptions", json!({"TargetReferenceIds": ["prices"]})),
        ])));
        assert!(session.tasks.is_empty());
        settle(&mut session).await;

        assert!(sub.updates.try_recv().is_err());
        assert_eq!(session.router.state().get("prices"), None);
        assert_eq!(control.calls(), vec!["create prices"]);
        assert_eq!(session.lifecycle.last_message_id(), Some(1));
        assert_eq!(handle.last_message_id(), Some(1));
    }

    #[tokio::test]
    async fn heartbeat_without_body_is_a_heartbeat() {
        let (mut session, handle) = session(FakeControl::default());
        let mut events = handle.events();
        let data =
            crate::ws::frame::encode_message(4, "_heartbeat", crate::types::enums::PayloadFormat::Json, b"")
                .unwrap();
        assert!(!session.on_frame(data));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Heartbeat(vec![]));
    }

    #[test]
    fn resume_id_seeds_first_connect() {
        let (mut session, handle) = StreamingSessionBuilder::new(AccessToken::new("t"))
            .context_id("ctx1")
            .resume_from(42)
            .build_with(FakeControl::default())
            .unwrap();
        assert_eq!(handle.last_message_id(), Some(42));
        let resume = session.lifecycle.begin_connect();
        assert_eq!(resume, Some(42));
        let uri = session.connect_request(resume).unwrap().uri().to_string();
        assert!(uri.contains("messageid=42"), "{uri}");
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_due_during_backoff_refreshes_for_next_handshake() {
        let control = FakeControl::default();
        let (mut session, _handle) =
            StreamingSessionBuilder::new(AccessToken::expiring_in("old", Duration::from_secs(61)))
                .context_id("ctx1")
                .renewal_margin_secs(60)
                .token_refresher(|| async {
                    Ok(AccessToken::expiring_in("fresh", Duration::from_secs(1200)))
                })
                .build_with(control.clone())
                .unwrap();
        assert!(session.renewal_at.is_some());

        session.lifecycle.begin_connect();
        assert!(matches!(session.lifecycle.connect_failed(false), Next::Reconnect(_)));

        assert_eq!(session.wait(Duration::from_secs(30)).await, None);
        assert_eq!(session.token.token, "fresh");
        assert!(control.calls().is_empty());
        let request = session.connect_request(None).unwrap();
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer fresh");
    }

    #[tokio::test]
    async fn malformed_frame_emits_event_and_keeps_resume_id() {
        let (mut session, handle) = session(FakeControl::default());
        let mut events = handle.events();
        session.on_frame(frame(&[(5, "_heartbeat", json!([]))]));
        session.on_frame(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(session.lifecycle.last_message_id(), Some(5));
        let mut saw_framing = false;
        while let Ok(event) = events.try_recv() {
            saw_framing |= matches!(event, SessionEvent::FramingError(_));
        }
        assert!(saw_framing);
    }

    #[tokio::test]
    async fn authorize_swaps_token_and_calls_control() {
        let control = FakeControl::default();
        let (mut session, _handle) = session(control.clone());
        session.lifecycle.begin_connect();
        session.lifecycle.opened();
        let (reply, rx) = oneshot::channel();
        session.on_command(Command::Authorize {
            token: AccessToken::expiring_in("new", Duration::from_secs(1200)),
            reply,
        });
        settle(&mut session).await;
        rx.await.unwrap().unwrap();
        assert_eq!(session.token.token, "new");
        assert!(session.renewal_at.is_some());
        assert_eq!(control.calls(), vec!["authorize"]);
    }

    #[test]
    fn connect_request_carries_context_resume_id_and_bearer() {
        let (session, _handle) = session(FakeControl::default());
        let request = session.connect_request(Some(42)).unwrap();
        let uri = request.uri().to_string();
        assert!(uri.contains("contextId=ctx1"), "{uri}");
        assert!(uri.contains("messageid=42"), "{uri}");
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer t");

        let request = session.connect_request(None).unwrap();
        assert!(!request.uri().to_string().contains("messageid"));
    }

    #[test]
    fn invalid_context_id_is_rejected_at_build() {
        let result = StreamingSessionBuilder::new(AccessToken::new("t"))
            .context_id("has space")
            .build_with(FakeControl::default());
        assert!(result.is_err());
    }
}
