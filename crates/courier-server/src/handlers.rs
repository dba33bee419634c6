//! Connection handling and envelope dispatch.
//!
//! Each live connection runs one task: a `select!` loop over the outbound
//! command channel, the heartbeat interval, and the socket itself.
//! Handlers may block on the durable store or cache without affecting any
//! other connection, and a single bad message never terminates the
//! connection or the process.

use crate::auth::CredentialGate;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use courier_core::store::chat_key;
use courier_core::{
    Cache, ConnectionHandle, DurableStore, MessageOrder, Outbound, PresenceTracker, Registry,
    StoreError, TypingTracker,
};
use courier_protocol::{
    codec, ClientEnvelope, ConnectionStatus, ProtocolError, ServerEnvelope,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The connection registry.
    pub registry: Arc<Registry>,
    /// Presence derivation over the registry and cache.
    pub presence: PresenceTracker,
    /// Typing debounce.
    pub typing: TypingTracker,
    /// The credential gate.
    pub gate: CredentialGate,
    /// The durable store collaborator.
    pub store: Arc<dyn DurableStore>,
    /// The cache collaborator.
    pub cache: Arc<dyn Cache>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn DurableStore>, cache: Arc<dyn Cache>) -> Self {
        let registry = Arc::new(Registry::new());

        Self {
            presence: PresenceTracker::new(Arc::clone(&registry), Arc::clone(&cache)),
            typing: TypingTracker::new(Arc::clone(&registry), config.typing_idle_timeout()),
            gate: CredentialGate::new(
                &config.auth.secret,
                Arc::clone(&store),
                Arc::clone(&cache),
                config.principal_cache_ttl(),
            ),
            registry,
            store,
            cache,
            config,
        }
    }
}

/// Bind and run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the listening socket cannot be bound; this is the
/// only process-fatal condition.
pub async fn run_server(
    config: Config,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn Cache>,
) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.websocket_path
    );

    let state = Arc::new(AppState::new(config, store, cache));
    serve(listener, state).await
}

/// Serve connections on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the accept loop fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler. The bearer credential arrives as a
/// connection-time query parameter.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Close the socket with a distinct machine-readable reason code.
async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Drive one WebSocket connection from authentication to teardown.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let principal = match state.gate.authenticate(token.as_deref()).await {
        Ok(principal) => principal,
        Err(err) => {
            warn!(error = %err, "connection rejected");
            metrics::record_error("auth");
            close_with(socket, err.close_code(), &err.to_string()).await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = ConnectionHandle::new(principal.id.as_str(), outbound_tx);
    let connection_id = handle.connection_id().to_string();

    if let Some(displaced) = state.registry.register(handle.clone()) {
        debug!(user = %principal.id, "closing superseded connection");
        displaced.close();
    }

    info!(user = %principal.id, connection = %connection_id, "connected");

    let (mut sender, mut receiver) = socket.split();

    // Exactly one connection-status envelope after successful auth.
    let connected = ServerEnvelope::connection(ConnectionStatus::Connected, &principal.id);
    if !send_envelope(&mut sender, &connected).await {
        state.presence.disconnect(&principal.id, &connection_id).await;
        return;
    }

    let heartbeat_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms));
    heartbeat.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            biased;

            command = outbound_rx.recv() => match command {
                Some(Outbound::Deliver(envelope)) => {
                    if !send_envelope(&mut sender, &envelope).await {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!(connection = %connection_id, "writer asked to close");
                    break;
                }
            },

            _ = heartbeat.tick() => {
                if handle.is_stale(heartbeat_timeout) {
                    debug!(connection = %connection_id, "pruning stale connection");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let start = Instant::now();
                    dispatch(&state, &handle, &text).await;
                    metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
                }
                Some(Ok(Message::Binary(data))) => {
                    // Treat binary frames as text for client compatibility.
                    match String::from_utf8(data) {
                        Ok(text) => {
                            let start = Instant::now();
                            dispatch(&state, &handle, &text).await;
                            metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
                        }
                        Err(_) => {
                            metrics::record_error("protocol");
                            handle.deliver(ServerEnvelope::error("Invalid message format"));
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    handle.touch();
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %connection_id, "received close frame");
                    break;
                }
                Some(Err(err)) => {
                    warn!(connection = %connection_id, error = %err, "WebSocket error");
                    metrics::record_error("websocket");
                    break;
                }
                None => {
                    debug!(connection = %connection_id, "WebSocket stream ended");
                    break;
                }
            },
        }
    }

    // Teardown: flush trailing typing stops, then write last-seen before
    // the registry entry disappears.
    state.typing.clear_user(&principal.id);
    metrics::set_typing_timers(state.typing.active());
    state.presence.disconnect(&principal.id, &connection_id).await;

    info!(user = %principal.id, connection = %connection_id, "disconnected");
}

/// Serialize and send one envelope. Returns `false` when the transport is
/// gone.
async fn send_envelope(sender: &mut SplitSink<WebSocket, Message>, envelope: &ServerEnvelope) -> bool {
    let text = match codec::encode_server(envelope) {
        Ok(text) => text,
        Err(err) => {
            error!(error = %err, "envelope encoding failed");
            return true;
        }
    };
    metrics::record_envelope("outbound");
    sender.send(Message::Text(text)).await.is_ok()
}

/// The per-handler message used when a known envelope type arrives with an
/// unusable payload.
fn validation_message(kind: &str) -> &'static str {
    match kind {
        "chat" => "Invalid chat message",
        "typing" => "Invalid typing status",
        "join" => "Invalid join request",
        "online" => "Invalid presence query",
        _ => "Invalid message format",
    }
}

/// Decode an inbound frame and route it to its handler.
///
/// Every failure class answers with a single `error` envelope on the
/// originating connection; none of them tear the connection down.
pub async fn dispatch(state: &AppState, conn: &ConnectionHandle, text: &str) {
    metrics::record_envelope("inbound");

    let envelope = match codec::decode_client(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(connection = %conn.connection_id(), error = %err, "rejected inbound frame");
            metrics::record_error("protocol");
            let message = match &err {
                ProtocolError::UnknownType(_) => "Unsupported message type",
                ProtocolError::InvalidPayload { kind, .. } => validation_message(kind),
                _ => "Invalid message format",
            };
            conn.deliver(ServerEnvelope::error(message));
            return;
        }
    };

    let kind = envelope.kind();
    let result = match envelope {
        ClientEnvelope::Chat {
            chat_id,
            content,
            sender_id,
        } => handle_chat(state, conn, &chat_id, &content, &sender_id).await,
        ClientEnvelope::Join { chat_id } => handle_join(state, conn, &chat_id).await,
        ClientEnvelope::Typing {
            chat_id,
            user_id,
            is_typing,
        } => handle_typing(state, conn, &chat_id, &user_id, is_typing).await,
        ClientEnvelope::Online {
            user_id,
            other_user_id,
        } => handle_online(state, conn, &user_id, &other_user_id).await,
    };

    if let Err(err) = result {
        error!(connection = %conn.connection_id(), kind, error = %err, "handler error");
        metrics::record_error("handler");
        conn.deliver(ServerEnvelope::error("Failed to process message"));
    }
}

/// Persist a chat message, deliver it to both participants' live
/// connections, and invalidate the chat's cache entry.
async fn handle_chat(
    state: &AppState,
    conn: &ConnectionHandle,
    chat_id: &str,
    content: &str,
    sender_id: &str,
) -> Result<(), StoreError> {
    if chat_id.is_empty() || content.is_empty() || sender_id.is_empty() {
        conn.deliver(ServerEnvelope::error("Invalid chat message"));
        return Ok(());
    }

    let message = state.store.create_message(chat_id, sender_id, content).await?;
    metrics::record_message_persisted();

    let Some(chat) = state.store.find_chat_by_id(chat_id).await? else {
        // Persisted but undeliverable; an accepted at-most-once gap.
        debug!(chat = %chat_id, "chat not found after persist");
        return Ok(());
    };

    let other = chat.other_participant(sender_id);
    let envelope = ServerEnvelope::chat(chat_id, message);

    // Broadcast to both sides: the recipient, and an echo to the sender's
    // own registered connection. Offline targets are silent no-ops.
    if let Some(recipient) = state.registry.lookup(other) {
        recipient.deliver(envelope.clone());
    }
    if let Some(echo) = state.registry.lookup(sender_id) {
        echo.deliver(envelope);
    }

    if let Err(err) = state.cache.del(&chat_key(chat_id)).await {
        warn!(chat = %chat_id, error = %err, "chat cache invalidation failed");
    }

    Ok(())
}

/// Replay a chat's history to the requesting connection only.
async fn handle_join(
    state: &AppState,
    conn: &ConnectionHandle,
    chat_id: &str,
) -> Result<(), StoreError> {
    if chat_id.is_empty() {
        conn.deliver(ServerEnvelope::error("Invalid join request"));
        return Ok(());
    }

    if state.store.find_chat_by_id(chat_id).await?.is_none() {
        conn.deliver(ServerEnvelope::error("Chat not found"));
        return Ok(());
    }

    // The most recent rows, delivered oldest-first.
    let mut history = state
        .store
        .list_chat_messages(chat_id, MessageOrder::Descending, state.config.limits.history_limit)
        .await?;
    history.reverse();

    metrics::record_history_replayed(history.len());
    debug!(chat = %chat_id, connection = %conn.connection_id(), rows = history.len(), "replaying history");

    for message in history {
        conn.deliver(ServerEnvelope::chat(chat_id, message));
    }

    Ok(())
}

/// Route a typing signal through the debouncer to the other participant.
async fn handle_typing(
    state: &AppState,
    conn: &ConnectionHandle,
    chat_id: &str,
    user_id: &str,
    is_typing: bool,
) -> Result<(), StoreError> {
    if chat_id.is_empty() || user_id.is_empty() {
        conn.deliver(ServerEnvelope::error("Invalid typing status"));
        return Ok(());
    }

    let Some(chat) = state.store.find_chat_by_id(chat_id).await? else {
        return Ok(());
    };
    let other = chat.other_participant(user_id).to_string();

    if is_typing {
        state.typing.keystroke(chat_id, user_id, &other);
    } else {
        state.typing.stop(chat_id, user_id, &other);
    }
    metrics::set_typing_timers(state.typing.active());

    Ok(())
}

/// Answer a presence poll on the polling connection.
async fn handle_online(
    state: &AppState,
    conn: &ConnectionHandle,
    user_id: &str,
    other_user_id: &str,
) -> Result<(), StoreError> {
    if user_id.is_empty() || other_user_id.is_empty() {
        conn.deliver(ServerEnvelope::error("Invalid presence query"));
        return Ok(());
    }

    // Only poll users you actually share a chat with.
    if state
        .store
        .find_chat_between(user_id, other_user_id)
        .await?
        .is_none()
    {
        return Ok(());
    }

    let status = state.presence.query(other_user_id).await;
    conn.deliver(ServerEnvelope::online(status.online, status.last_seen));

    Ok(())
}
