//! Connection handlers for the Parley server.
//!
//! This module handles the connection lifecycle: handshake, frame
//! dispatch, room-event forwarding, and cleanup on disconnect.

use crate::auth::Authenticator;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    error::ChatError,
    events::RoomEvent,
    model::{Identity, NewMessageRequest},
    HubTable, MessageStore, Pipeline, Scheduler, SessionRegistry, Vanisher,
};
use parley_protocol::{codec, codes, version, Frame, MessagePayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared server state.
pub struct AppState {
    pub registry: SessionRegistry,
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Scheduler,
    pub vanisher: Vanisher,
    pub hubs: Arc<HubTable>,
    pub authenticator: Authenticator,
    pub config: Config,
}

impl AppState {
    /// Wire the engine together around a store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let hubs = Arc::new(HubTable::with_capacity(config.limits.hub_capacity));
        let vanisher =
            Vanisher::with_store_timeout(store.clone(), hubs.clone(), config.store_timeout());
        let pipeline = Arc::new(Pipeline::with_store_timeout(
            store.clone(),
            hubs.clone(),
            Arc::new(vanisher.clone()),
            config.store_timeout(),
        ));
        let scheduler = Scheduler::new(pipeline.clone());
        let registry = SessionRegistry::new(hubs.clone(), store);
        let authenticator = Authenticator::new(config.auth.jwt_secret.clone());

        Self {
            registry,
            pipeline,
            scheduler,
            vanisher,
            hubs,
            authenticator,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, store: Arc<dyn MessageStore>) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone(), store));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // The 1 Hz safety nets for both timer tables
    let _scheduler_sweep = state.scheduler.run_sweeper(config.sweep_interval());
    let _vanisher_sweep = state.vanisher.run_sweeper(config.sweep_interval());

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.websocket_path
    );

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

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Handshake: the first frame must be `connect {token}`
    let identity = match handshake(&state, &mut receiver, &mut read_buffer).await {
        Ok(identity) => identity,
        Err(e) => {
            metrics::record_error("handshake");
            let _ = send_frame(&mut sender, &Frame::error(0, e.code(), e.to_string())).await;
            return;
        }
    };

    if let Err(e) = state.registry.register(&connection_id, identity.clone()) {
        let _ = send_frame(&mut sender, &Frame::error(0, e.code(), e.to_string())).await;
        return;
    }

    let connected = Frame::connected(
        &connection_id,
        version::PROTOCOL_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        state.registry.unregister(&connection_id);
        return;
    }

    info!(connection = %connection_id, user = %identity.username, "Connection ready");

    // Per-room forwarding tasks feed one mpsc consumed by this loop
    let mut room_tasks: HashMap<Uuid, tokio::task::JoinHandle<()>> = HashMap::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Arc<RoomEvent>>();

    loop {
        tokio::select! {
            biased;

            // Room events fanned out by the hubs
            Some(event) = event_rx.recv() => {
                if !event.should_deliver_to(&connection_id) {
                    continue;
                }
                let frame = event_frame(&event);
                if let Ok(data) = codec::encode(&frame) {
                    metrics::record_frame(data.len(), "outbound");
                    if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                }
            }

            // Frames from the client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > state.config.limits.max_message_size {
                            let _ = send_frame(
                                &mut sender,
                                &Frame::error(0, codes::PROTOCOL, "frame too large"),
                            ).await;
                            continue;
                        }

                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    metrics::record_frame(data.len(), "inbound");
                                    if let Err(e) = handle_frame(
                                        &frame,
                                        &connection_id,
                                        &identity,
                                        &state,
                                        &mut sender,
                                        &mut room_tasks,
                                        &event_tx,
                                    ).await {
                                        error!(
                                            connection = %connection_id,
                                            error = %e,
                                            "Frame handling error"
                                        );
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Codec error");
                                    metrics::record_error("codec");
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Text(_))) => {
                        // The protocol is binary-only
                        let _ = send_frame(
                            &mut sender,
                            &Frame::error(0, codes::PROTOCOL, "binary frames required"),
                        ).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: stop forwarding, then drop every hub membership
    for (_, handle) in room_tasks {
        handle.abort();
    }
    state.registry.unregister(&connection_id);
    metrics::set_live_rooms(state.hubs.hub_count());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Read frames until a `connect` arrives, then authenticate it.
async fn handshake(
    state: &Arc<AppState>,
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Result<Identity, ChatError> {
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(frame) = codec::decode_from(read_buffer)
            .map_err(|e| ChatError::Auth(format!("bad handshake frame: {e}")))?
        {
            return match frame {
                Frame::Connect { version: v, token } => {
                    if !version::is_supported(v) {
                        return Err(ChatError::Auth(format!("unsupported version {v}")));
                    }
                    state.authenticator.verify(&token)
                }
                other => Err(ChatError::Auth(format!(
                    "expected connect, got {:?}",
                    other.frame_type()
                ))),
            };
        }

        let msg = tokio::time::timeout_at(deadline, receiver.next())
            .await
            .map_err(|_| ChatError::Auth("handshake timed out".into()))?;

        match msg {
            Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => {
                return Err(ChatError::Auth("connection closed during handshake".into()))
            }
        }
    }
}

/// Spawn a task forwarding one room's broadcast receiver into the
/// connection's mpsc.
fn forward_room_events(
    mut rx: broadcast::Receiver<Arc<RoomEvent>>,
    tx: mpsc::UnboundedSender<Arc<RoomEvent>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Room event receiver lagged");
                    continue;
                }
            }
        }
    })
}

/// Handle a decoded client frame.
#[allow(clippy::too_many_lines)]
async fn handle_frame(
    frame: &Frame,
    connection_id: &str,
    identity: &Identity,
    state: &Arc<AppState>,
    sender: &mut WsSender,
    room_tasks: &mut HashMap<Uuid, tokio::task::JoinHandle<()>>,
    event_tx: &mpsc::UnboundedSender<Arc<RoomEvent>>,
) -> Result<()> {
    match frame {
        Frame::JoinRoom { id, room, password } => {
            debug!(connection = %connection_id, room = %room, "Join request");

            let response = match state
                .registry
                .join_room(connection_id, *room, password.as_deref())
                .await
            {
                Ok(rx) => {
                    // Re-join replaces the forwarding task
                    if let Some(old) = room_tasks.insert(*room, forward_room_events(rx, event_tx.clone())) {
                        old.abort();
                    }
                    metrics::set_live_rooms(state.hubs.hub_count());
                    Frame::ack(*id)
                }
                Err(e) => {
                    warn!(connection = %connection_id, room = %room, error = %e, "Join failed");
                    Frame::error(*id, e.code(), e.to_string())
                }
            };
            send_frame(sender, &response).await?;
        }

        Frame::LeaveRoom { id, room } => {
            if let Some(handle) = room_tasks.remove(room) {
                handle.abort();
            }
            // Leaving is idempotent; absent membership is still a success
            state.registry.leave_room(connection_id, *room);
            metrics::set_live_rooms(state.hubs.hub_count());
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::Send {
            id,
            room,
            kind,
            content,
            metadata,
            reply_to,
            vanish_minutes,
        } => {
            let request = NewMessageRequest {
                kind: *kind,
                content: content.clone(),
                metadata: metadata.clone(),
                room_id: *room,
                sender: identity.clone(),
                reply_to: *reply_to,
                vanish_minutes: *vanish_minutes,
            };

            let response = match state.pipeline.submit(request).await {
                // The stored message reaches the sender through the
                // room fan-out; the ack only confirms acceptance.
                Ok(_message) => Frame::ack(*id),
                Err(e) => Frame::error(*id, e.code(), e.to_string()),
            };
            metrics::set_pending_timers(
                state.scheduler.pending_count(),
                state.vanisher.pending_count(),
            );
            send_frame(sender, &response).await?;
        }

        Frame::Schedule {
            id,
            room,
            kind,
            content,
            metadata,
            fire_at,
        } => {
            let response = match state.scheduler.schedule(
                *room,
                identity.clone(),
                *kind,
                content.clone(),
                metadata.clone(),
                *fire_at,
            ) {
                Ok(entry) => Frame::Scheduled { id: *id, entry },
                Err(e) => Frame::error(*id, e.code(), e.to_string()),
            };
            metrics::set_pending_timers(
                state.scheduler.pending_count(),
                state.vanisher.pending_count(),
            );
            send_frame(sender, &response).await?;
        }

        Frame::CancelSchedule { id, entry } => {
            // Cancelling a fired or unknown entry is a quiet no-op
            let cancelled = state.scheduler.cancel(*entry);
            debug!(connection = %connection_id, entry = %entry, cancelled, "Cancel schedule");
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::SetVanish {
            id,
            message,
            ttl_minutes,
        } => {
            let response = match state.vanisher.arm(*message, *ttl_minutes).await {
                // The room hears about it via the VanishSet broadcast
                Ok(_entry) => Frame::ack(*id),
                Err(e) => Frame::error(*id, e.code(), e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::AddReaction { id, message, emoji } => {
            let response = match state.pipeline.add_reaction(*message, emoji, identity).await {
                // applied=false (duplicate) is still an ack: quiet no-op
                Ok(applied) => Frame::ack_applied(*id, applied),
                Err(e) => Frame::error(*id, e.code(), e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::RemoveReaction { id, message, emoji } => {
            let response = match state
                .pipeline
                .remove_reaction(*message, emoji, identity)
                .await
            {
                Ok(applied) => Frame::ack_applied(*id, applied),
                Err(e) => Frame::error(*id, e.code(), e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Pin { id, message } => {
            let response = match state.pipeline.pin_message(*message, identity).await {
                Ok(applied) => Frame::ack_applied(*id, applied),
                Err(e) => Frame::error(*id, e.code(), e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Unpin { id, message } => {
            let response = match state.pipeline.unpin_message(*message, identity).await {
                Ok(applied) => Frame::ack_applied(*id, applied),
                Err(e) => Frame::error(*id, e.code(), e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Typing { room, active, .. } => {
            // Relayed to other live members only, no ack
            if state.hubs.contains(*room, connection_id) {
                state
                    .pipeline
                    .typing(*room, identity, connection_id, *active);
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // Keepalive, nothing to do
        }

        Frame::Connect { .. } => {
            debug!(connection = %connection_id, "Connect frame (already connected)");
        }

        _ => {
            warn!(
                connection = %connection_id,
                frame_type = ?frame.frame_type(),
                "Unexpected frame type"
            );
        }
    }

    Ok(())
}

/// Convert a room event into its outbound frame.
fn event_frame(event: &RoomEvent) -> Frame {
    match event {
        RoomEvent::Message(message) => Frame::message(MessagePayload::from(message)),
        RoomEvent::ReactionAdded {
            message_id,
            emoji,
            user_id,
            username,
        } => Frame::Reaction {
            message: *message_id,
            emoji: emoji.clone(),
            user: *user_id,
            username: username.clone(),
        },
        RoomEvent::ReactionRemoved {
            message_id,
            emoji,
            user_id,
        } => Frame::ReactionRemoved {
            message: *message_id,
            emoji: emoji.clone(),
            user: *user_id,
        },
        RoomEvent::VanishSet {
            message_id,
            vanish_at,
        } => Frame::VanishSet {
            message: *message_id,
            vanish_at: *vanish_at,
        },
        RoomEvent::MessageDeleted { message_id, reason } => Frame::MessageDeleted {
            message: *message_id,
            reason: *reason,
        },
        RoomEvent::Pinned {
            message_id,
            by,
            at,
        } => Frame::Pinned {
            message: *message_id,
            by: *by,
            at: *at,
        },
        RoomEvent::Unpinned { message_id } => Frame::Unpinned {
            message: *message_id,
        },
        RoomEvent::Typing {
            room_id,
            user_id,
            username,
            active,
            ..
        } => Frame::Typing {
            room: *room_id,
            user: Some(*user_id),
            username: Some(username.clone()),
            active: *active,
        },
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::MemoryStore;
    use parley_protocol::{DeleteReason, MessageKind};

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
        ))
    }

    #[tokio::test]
    async fn test_app_state_wiring() {
        let state = test_state();
        assert_eq!(state.registry.connection_count(), 0);
        assert_eq!(state.scheduler.pending_count(), 0);
        assert_eq!(state.vanisher.pending_count(), 0);
    }

    #[test]
    fn test_event_frame_conversion() {
        let message_id = Uuid::new_v4();

        let frame = event_frame(&RoomEvent::MessageDeleted {
            message_id,
            reason: DeleteReason::Vanished,
        });
        assert!(matches!(
            frame,
            Frame::MessageDeleted {
                message,
                reason: DeleteReason::Vanished,
            } if message == message_id
        ));

        let frame = event_frame(&RoomEvent::Typing {
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            active: true,
            source: "conn-1".into(),
        });
        assert!(matches!(frame, Frame::Typing { user: Some(_), .. }));
    }

    #[test]
    fn test_message_event_frame_carries_stored_fields() {
        let message = parley_core::StoredMessage {
            id: Uuid::new_v4(),
            kind: MessageKind::Text,
            content: "hi".into(),
            metadata: None,
            room_id: Uuid::new_v4(),
            sender: Uuid::new_v4(),
            sender_name: "alice".into(),
            created_at: Utc::now(),
            pin: None,
            reactions: Vec::new(),
            reply_to: None,
            vanish_at: None,
        };
        let frame = event_frame(&RoomEvent::Message(message.clone()));
        match frame {
            Frame::Message { message: payload } => {
                assert_eq!(payload.id, message.id);
                assert_eq!(payload.created_at, message.created_at);
                assert_eq!(payload.sender_name, "alice");
            }
            other => panic!("expected Message frame, got {other:?}"),
        }
    }
}
