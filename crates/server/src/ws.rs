//! WebSocket endpoint for real-time presence and messaging.
//!
//! Each connection runs three pieces: a writer task that owns the sink, a
//! keep-alive task that pings and waits for pongs, and the reader loop in
//! `handle_socket`, which processes this connection's commands one at a time
//! in arrival order.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use kinship_shared::{decode_command, ClientCommand, ServerEvent, WsEnvelope};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::error::{DeliveryError, HandshakeError};
use crate::realtime::Session;
use crate::state::AppState;

/// How long the writer gets to flush after the reader loop ends.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// `GET /api/ws?token=…`
///
/// The handshake runs before the upgrade; a refused connection gets a 401
/// problem response and never reaches the registry.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, HandshakeError> {
    let user = state
        .sessions
        .handshake(query.token.as_deref(), &headers)
        .await
        .map_err(|e| {
            tracing::warn!(code = e.code(), "WebSocket handshake refused");
            e
        })?;

    tracing::info!(user_id = %user.id, "WebSocket connection authenticated");
    Ok(ws.on_upgrade(move |socket| async move {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = state.sessions.open_session(&user, event_tx.clone()).await;
        handle_socket(socket, session, event_tx, event_rx, state).await;
    }))
}

async fn handle_socket(
    socket: WebSocket,
    session: Session,
    event_tx: mpsc::UnboundedSender<WsEnvelope<ServerEvent>>,
    event_rx: mpsc::UnboundedReceiver<WsEnvelope<ServerEvent>>,
    state: AppState,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Message>();
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();

    let mut writer = tokio::spawn(writer_task(ws_sender, event_rx, control_rx));
    let mut keepalive = tokio::spawn(keepalive_task(
        control_tx.clone(),
        pong_rx,
        state.config.ping_interval,
        state.config.pong_timeout,
    ));

    let user_id = session.identity.id.clone();
    loop {
        tokio::select! {
            _ = &mut keepalive => {
                tracing::info!(user_id = %user_id, "keep-alive expired");
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &session, &event_tx, text.as_str()).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = pong_tx.send(());
                }
                // Pings are answered by the transport.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    let _ = event_tx.send(WsEnvelope::new(ServerEvent::error(
                        "UNSUPPORTED_FRAME",
                        "binary frames are not supported",
                    )));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(user_id = %user_id, reason = ?frame, "client initiated close");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(user_id = %user_id, error = %e, "WebSocket receive error");
                    break;
                }
                None => break,
            }
        }
    }

    keepalive.abort();
    state.sessions.close_session(&session).await;

    // The registry no longer holds a sender, so once ours are gone the writer
    // drains what is queued and stops.
    drop(event_tx);
    drop(control_tx);
    if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::UnboundedReceiver<WsEnvelope<ServerEvent>>,
    mut control: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(event = event.payload.kind(), error = %e, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Some(msg) = control.recv() => {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            else => break,
        }
    }
}

/// Ping every `every`; if a pong does not come back within `grace`, ask the
/// writer to close and return.
async fn keepalive_task(
    control: mpsc::UnboundedSender<Message>,
    mut pongs: mpsc::UnboundedReceiver<()>,
    every: Duration,
    grace: Duration,
) {
    let mut ticker = interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if control.send(Message::Ping(Bytes::new())).is_err() {
            return;
        }

        match timeout(grace, pongs.recv()).await {
            Ok(Some(())) => {}
            _ => {
                tracing::warn!("pong timeout, closing connection");
                let _ = control.send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: "pong timeout".into(),
                })));
                return;
            }
        }
    }
}

async fn handle_frame(
    state: &AppState,
    session: &Session,
    reply: &mpsc::UnboundedSender<WsEnvelope<ServerEvent>>,
    text: &str,
) {
    let envelope = match decode_command(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(user_id = %session.identity.id, error = %e, "rejected frame");
            let _ = reply.send(WsEnvelope::new(ServerEvent::error(e.code(), e.to_string())));
            return;
        }
    };

    let correlation_id = envelope.id.clone();
    match handle_command(state, session, envelope.payload, &correlation_id).await {
        Ok(Some(event)) => {
            let _ = reply.send(WsEnvelope::correlated(event, correlation_id));
        }
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(user_id = %session.identity.id, code = e.code(), error = %e, "command failed");
            if let DeliveryError::Store(inner) = &e {
                tracing::error!(user_id = %session.identity.id, error = %inner, "store failure");
            }
            let event = e.to_event(Some(correlation_id.clone()));
            let _ = reply.send(WsEnvelope::correlated(event, correlation_id));
        }
    }
}

/// Run one command. `Ok(Some(event))` is a reply for this connection only;
/// anything addressed to other connections is sent by the core itself.
async fn handle_command(
    state: &AppState,
    session: &Session,
    command: ClientCommand,
    correlation_id: &str,
) -> Result<Option<ServerEvent>, DeliveryError> {
    let me = &session.identity;
    let ack = || {
        Some(ServerEvent::Ack {
            nonce: correlation_id.to_string(),
        })
    };

    match command {
        ClientCommand::JoinRoom { room_id } => {
            state.registry.join_room(session.connection_id, &room_id).await;
            Ok(ack())
        }
        ClientCommand::LeaveRoom { room_id } => {
            state.registry.leave_room(session.connection_id, &room_id).await;
            Ok(ack())
        }
        ClientCommand::SendMessage {
            recipient_id,
            message,
        } => {
            state
                .delivery
                .send(me, &recipient_id, message, Some(correlation_id))
                .await?;
            Ok(None)
        }
        ClientCommand::MessageRead { message_id } => {
            state.delivery.mark_read(me, &message_id).await?;
            Ok(ack())
        }
        ClientCommand::TypingStart {
            recipient_id,
            conversation_id,
        } => {
            state
                .delivery
                .typing_start(session.connection_id, me, &recipient_id, &conversation_id)
                .await;
            Ok(None)
        }
        ClientCommand::TypingStop {
            recipient_id,
            conversation_id,
        } => {
            state
                .delivery
                .typing_stop(session.connection_id, me, &recipient_id, &conversation_id)
                .await;
            Ok(None)
        }
        ClientCommand::NotificationRead {
            notification_ids,
            mark_all,
        } => {
            state.notifier.mark_read(&me.id, &notification_ids, mark_all).await?;
            Ok(ack())
        }
        ClientCommand::GetOnlineFriends => {
            let friends = state.router.online_friends(&me.id).await?;
            Ok(Some(ServerEvent::OnlineFriends { friends }))
        }
        ClientCommand::GetOnlineCount => Ok(Some(ServerEvent::OnlineCount {
            count: state.registry.online_count().await,
        })),
        ClientCommand::UpdateLastSeen => {
            state.sessions.update_last_seen(&me.id).await?;
            Ok(ack())
        }
    }
}
