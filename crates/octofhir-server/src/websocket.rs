//! `GET /websocket`: binds a client to one subscription and forwards
//! `ping <id>` notifications.
//!
//! Text protocol:
//! - client: `bind <subscriptionId> [json|xml]`
//! - server: `bound <subscriptionId>` or `Invalid bind request - <reason>`
//! - server: `ping <subscriptionId>` for each matched write

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use octofhir_subscriptions::{SessionEncoding, SessionHandle, SessionMessage};
use tokio::sync::mpsc;

use crate::server::AppState;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct Bound {
    handle: SessionHandle,
    receiver: mpsc::Receiver<SessionMessage>,
}

#[derive(Debug, PartialEq, Eq)]
struct BindRequest {
    subscription_id: String,
    encoding: SessionEncoding,
}

fn parse_bind(text: &str) -> Result<BindRequest, String> {
    let mut parts = text.split_whitespace();
    match parts.next() {
        Some("bind") => {}
        Some(other) => return Err(format!("unknown command {other}")),
        None => return Err("empty message".to_string()),
    }
    let subscription_id = parts
        .next()
        .ok_or_else(|| "missing subscription id".to_string())?
        .to_string();
    let encoding = match parts.next() {
        Some(code) => {
            SessionEncoding::from_code(code).ok_or_else(|| format!("unsupported encoding {code}"))?
        }
        None => SessionEncoding::Json,
    };
    if parts.next().is_some() {
        return Err("unexpected trailing input".to_string());
    }
    Ok(BindRequest {
        subscription_id,
        encoding,
    })
}

async fn next_session_message(bound: &mut Option<Bound>) -> Option<SessionMessage> {
    match bound {
        Some(b) => b.receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn close_message(reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    }))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let registry = state.engine.websocket().clone();
    let (mut sender, mut receiver) = socket.split();
    let mut bound: Option<Bound> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(previous) = bound.take() {
                            registry.on_session_closed(&previous.handle);
                        }
                        let bind = match parse_bind(text.as_str()) {
                            Ok(request) => state
                                .engine
                                .bind_session(&request.subscription_id, request.encoding)
                                .await
                                .map(|session| (request, session))
                                .map_err(|e| e.to_string()),
                            Err(e) => Err(e),
                        };
                        match bind {
                            Ok((request, (handle, receiver))) => {
                                tracing::info!(
                                    subscription_id = %request.subscription_id,
                                    session_id = handle.session_id,
                                    "WebSocket session bound"
                                );
                                let reply = format!("bound {}", request.subscription_id);
                                bound = Some(Bound { handle, receiver });
                                if sender.send(Message::Text(reply.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(reason) => {
                                tracing::debug!(reason = %reason, "WebSocket bind rejected");
                                let reply = format!("Invalid bind request - {reason}");
                                let _ = sender.send(Message::Text(reply.into())).await;
                                let _ = sender.send(close_message(reason)).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            out = next_session_message(&mut bound) => {
                match out {
                    Some(SessionMessage::Ping { subscription_id }) => {
                        let text = SessionMessage::ping_text(&subscription_id);
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionMessage::Close { reason }) => {
                        let _ = sender.send(close_message(reason)).await;
                        break;
                    }
                    None => {
                        let _ = sender.send(close_message("session closed".to_string())).await;
                        break;
                    }
                }
            }
        }
    }

    if let Some(bound) = bound {
        registry.on_session_closed(&bound.handle);
        tracing::info!(
            subscription_id = %bound.handle.subscription_id,
            session_id = bound.handle.session_id,
            "WebSocket session closed"
        );
    }
}
