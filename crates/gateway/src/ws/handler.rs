use super::protocol as ws_protocol;
use crate::auth::{self, extract, jwt::TokenVerifier, AuthenticatedIdentity};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope};
use crate::metrics;
use crate::protocol;
use crate::server::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parley_common::protocol::ws::WsMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

pub(crate) const MAX_FRAME_BYTES: u32 = 262_144;

const CODE_AUTH_REJECTED: &str = "AUTH_REJECTED";
const CODE_INVALID_MESSAGE: &str = "CHAT_INVALID_MESSAGE";
const CODE_UNSUPPORTED_MESSAGE: &str = "CHAT_UNSUPPORTED_MESSAGE";
const CODE_MALFORMED_LIMIT: &str = "CHAT_MALFORMED_LIMIT";

pub fn router(state: AppState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

/// Authenticated WebSocket upgrade.
///
/// Authentication runs to completion here, before `on_upgrade`: a rejected
/// credential refuses the handshake and the socket is never accepted. The
/// rejection response is uniform; the cause goes to logs and metrics only.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(version) = protocol_query_param(&uri) {
        if let Err(error) = protocol::require_supported(&version) {
            return error.into_response();
        }
    }

    let identity = match state.authenticator.authenticate(&headers, &uri).await {
        Ok(identity) => identity,
        Err(auth_error) => {
            warn!(reason = auth_error.kind(), "rejected websocket connection attempt");
            metrics::record_auth_rejection(auth_error.kind());
            return auth::rejection().into_response();
        }
    };

    let mut ws = ws.max_frame_size(MAX_FRAME_BYTES as usize);
    // A credential carried via subprotocol requires echoing the selected
    // subprotocol in the handshake response.
    if let Some(value) = extract::bearer_subprotocol_value(&headers) {
        ws = ws.protocols([value.to_owned()]);
    }

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, identity, socket)).await;
    })
    .into_response()
}

fn protocol_query_param(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "protocol")
        .map(|(_, value)| value.into_owned())
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn handle_socket(state: AppState, identity: AuthenticatedIdentity, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let user_id = identity.user_id;

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<WsMessage>();
    if let Err(registry_error) =
        state.registry.register(user_id, connection_id, outbound_sender.clone())
    {
        error!(error = %registry_error, connection_id = %connection_id, "failed to register websocket connection");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    metrics::connection_opened();
    info!(user_id = %user_id, connection_id = %connection_id, "websocket connected");

    // Replay the backlog before live traffic. Events emitted while the flush
    // drains keep routing through the outbox, so the channel observes the
    // backlog and fresh events in order.
    state.outbox.recover(user_id).await;
    let replay = state.outbox.flush(user_id, &outbound_sender).await;
    if replay.delivered > 0 {
        info!(user_id = %user_id, delivered = replay.delivered, "replayed outbox backlog");
    }

    // Heartbeat: server pings every heartbeat_interval, disconnects if no
    // pong arrives within heartbeat_timeout.
    let mut heartbeat_interval = tokio::time::interval(state.heartbeat_interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let mut malformed_count: u32 = 0;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > state.heartbeat_timeout {
                    warn!(
                        user_id = %user_id,
                        connection_id = %connection_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let inbound = match ws_protocol::decode_message(&raw_message) {
                            Ok(inbound) => inbound,
                            Err(_) => {
                                malformed_count += 1;
                                metrics::record_ws_message("malformed", true);
                                if malformed_count >= state.malformed_frame_limit {
                                    warn!(
                                        user_id = %user_id,
                                        connection_id = %connection_id,
                                        malformed_count,
                                        "sustained malformed traffic; closing connection"
                                    );
                                    let _ = ws_protocol::send_ws_message(
                                        &mut socket,
                                        &WsMessage::Error {
                                            code: CODE_MALFORMED_LIMIT.to_string(),
                                            message: "too many malformed frames".to_string(),
                                            retryable: false,
                                        },
                                    )
                                    .await;
                                    let _ = socket.send(Message::Close(None)).await;
                                    break;
                                }
                                // A single malformed frame is dropped; the
                                // connection stays open.
                                if ws_protocol::send_ws_message(
                                    &mut socket,
                                    &WsMessage::Error {
                                        code: CODE_INVALID_MESSAGE.to_string(),
                                        message: "invalid websocket frame payload".to_string(),
                                        retryable: false,
                                    },
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        match inbound {
                            WsMessage::Ping => {
                                metrics::record_ws_message("ping", false);
                                if ws_protocol::send_ws_message(&mut socket, &WsMessage::Pong)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            WsMessage::Pong => {
                                last_pong = Instant::now();
                            }
                            WsMessage::Authenticate { token } => {
                                let reply =
                                    reauthenticate(state.authenticator.verifier(), user_id, &token);
                                let is_error = matches!(reply, WsMessage::Error { .. });
                                metrics::record_ws_message("authenticate", is_error);
                                if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                            }
                            other => {
                                // Lifecycle frames are server -> client only.
                                warn!(
                                    user_id = %user_id,
                                    connection_id = %connection_id,
                                    message_type = other.message_type(),
                                    "unsupported client frame"
                                );
                                if ws_protocol::send_ws_message(
                                    &mut socket,
                                    &WsMessage::Error {
                                        code: CODE_UNSUPPORTED_MESSAGE.to_string(),
                                        message: "message type is not supported on this connection"
                                            .to_string(),
                                        retryable: false,
                                    },
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(socket_error) => {
                        if is_frame_size_violation(&socket_error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    // Dead or departed: future emissions for this user fall through to the
    // outbox via the registry removal.
    state.registry.remove(connection_id);

    // Frames still sitting in the channel never reached the socket; requeue
    // them at the head of the outbox so a reconnect replays instead of
    // losing them. Closing the receiver makes racing sends fail over to the
    // outbox on their own.
    outbound_receiver.close();
    let mut undelivered = Vec::new();
    while let Ok(frame) = outbound_receiver.try_recv() {
        undelivered.push(frame);
    }
    if !undelivered.is_empty() {
        let assigned = state.outbox.requeue_front(user_id, undelivered);
        for (entry_id, frame) in &assigned {
            state.outbox.persist(user_id, *entry_id, frame).await;
        }
        info!(user_id = %user_id, requeued = assigned.len(), "requeued undelivered events after disconnect");
    }

    metrics::connection_closed();
    info!(user_id = %user_id, connection_id = %connection_id, "websocket disconnected");
}

/// Handles a mid-connection `authenticate` frame.
///
/// A valid credential for a *different* user is a cross-user attack attempt:
/// it is rejected and logged as a security event, but only the frame dies,
/// not the system.
pub(crate) fn reauthenticate(
    verifier: &TokenVerifier,
    connection_user: Uuid,
    token: &str,
) -> WsMessage {
    match verifier.validate(token) {
        Ok(claims) if claims.user_id == connection_user => WsMessage::AuthenticateAck {
            user_id: claims.user_id,
            expires_at: claims.expires_at,
        },
        Ok(claims) => {
            error!(
                connection_user = %connection_user,
                token_user = %claims.user_id,
                "credential for a different user presented mid-connection; rejected as an isolation violation"
            );
            uniform_auth_error()
        }
        Err(auth_error) => {
            warn!(reason = auth_error.kind(), "mid-connection re-authentication failed");
            uniform_auth_error()
        }
    }
}

fn uniform_auth_error() -> WsMessage {
    WsMessage::Error {
        code: CODE_AUTH_REJECTED.to_string(),
        message: "connection rejected".to_string(),
        retryable: false,
    }
}
