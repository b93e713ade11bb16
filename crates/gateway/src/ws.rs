use std::{net::SocketAddr, sync::Arc, time::Instant};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use {
    guildrelay_protocol::{ClientFrame, PROTOCOL_VERSION, ServerFrame, error_codes},
    guildrelay_relay::{Error, Identity},
};

use crate::state::GatewayState;

/// Error code reported to the client for a rejected operation.
fn error_code(error: &Error) -> &'static str {
    match error {
        Error::Validation { .. } | Error::UnknownSession { .. } => error_codes::INVALID_REQUEST,
        Error::NotFound { .. } => error_codes::NOT_FOUND,
        Error::NotSubscribed { .. } => error_codes::NOT_SUBSCRIBED,
        _ => error_codes::UNAVAILABLE,
    }
}

fn reject(state: &GatewayState, session_id: &str, frame: ServerFrame) {
    #[cfg(feature = "metrics")]
    {
        if let ServerFrame::Error { code, .. } = &frame {
            guildrelay_metrics::counter!(
                guildrelay_metrics::websocket::FRAMES_REJECTED_TOTAL,
                guildrelay_metrics::labels::CODE => code.clone()
            )
            .increment(1);
        }
    }
    state.hub.send_to(session_id, &frame);
}

/// Handle an authenticated WebSocket connection through its full lifecycle:
/// register → message loop → cleanup.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    identity: Identity,
    remote_addr: SocketAddr,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    let session_id = match state.hub.connect(identity.clone(), client_tx) {
        Ok(id) => id,
        Err(e) => {
            warn!(remote = %remote_addr, error = %e, "ws: connection refused");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        },
    };
    let connected_at = Instant::now();
    info!(
        session_id = %session_id,
        user_id = %identity.user_id,
        remote = %remote_addr,
        "ws: session opened"
    );

    #[cfg(feature = "metrics")]
    guildrelay_metrics::counter!(guildrelay_metrics::websocket::CONNECTIONS_TOTAL).increment(1);

    // Spawn write loop: forwards queued frames to the WebSocket. It ends once
    // the hub drops the session's sender.
    let write_session = session_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                debug!(session_id = %write_session, "ws: write loop closed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    state.hub.send_to(&session_id, &ServerFrame::Ready {
        session: session_id.clone(),
        protocol: PROTOCOL_VERSION,
    });

    // ── Message loop ─────────────────────────────────────────────────────

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > state.max_payload_bytes {
            warn!(session_id = %session_id, size = text.len(), "ws: payload too large");
            reject(
                &state,
                &session_id,
                ServerFrame::error(
                    error_codes::PAYLOAD_TOO_LARGE,
                    format!("frame exceeds {} bytes", state.max_payload_bytes),
                ),
            );
            continue;
        }

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "ws: invalid frame");
                reject(
                    &state,
                    &session_id,
                    ServerFrame::error(error_codes::INVALID_FRAME, e.to_string()),
                );
                continue;
            },
        };

        dispatch(&state, &session_id, &identity, frame).await;

        if state.hub.is_shut_down() {
            break;
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    state.hub.disconnect(&session_id);
    info!(
        session_id = %session_id,
        duration_secs = connected_at.elapsed().as_secs(),
        "ws: session closed"
    );
    // The write loop drains and closes once the hub's sender is gone.
    if tokio::time::timeout(std::time::Duration::from_secs(1), write_handle)
        .await
        .is_err()
    {
        debug!(session_id = %session_id, "ws: write loop did not finish in time");
    }
}

/// Apply one client frame to the session.
async fn dispatch(state: &GatewayState, session_id: &str, identity: &Identity, frame: ClientFrame) {
    match frame {
        ClientFrame::Sub { channels } => {
            if let Err(e) = state.hub.subscribe(session_id, &channels) {
                reject(state, session_id, ServerFrame::error(error_code(&e), e.to_string()));
            }
        },
        ClientFrame::Ack { channel, cursor } => {
            if let Err(e) = state.hub.acknowledge(session_id, &channel, cursor) {
                reject(
                    state,
                    session_id,
                    ServerFrame::channel_error(error_code(&e), e.to_string(), channel),
                );
            }
        },
        ClientFrame::Resync { channel } => {
            if let Err(e) = state.hub.resync(session_id, &channel) {
                reject(
                    state,
                    session_id,
                    ServerFrame::channel_error(error_code(&e), e.to_string(), channel),
                );
            }
        },
        ClientFrame::Ping => {
            state.hub.send_to(session_id, &ServerFrame::Pong);
        },
        ClientFrame::Send { channel, payload } => {
            if !state.hub.is_subscribed(session_id, &channel) {
                reject(
                    state,
                    session_id,
                    ServerFrame::channel_error(
                        error_codes::NOT_SUBSCRIBED,
                        "subscribe before sending",
                        channel,
                    ),
                );
                return;
            }
            match state.worker.prepare(identity, &channel, payload).await {
                Ok(job) => {
                    debug!(session_id, channel_id = %channel, "ws: relay queued");
                    state.worker.spawn_relay(job);
                },
                Err(e) => {
                    debug!(session_id, channel_id = %channel, error = %e, "ws: send rejected");
                    reject(
                        state,
                        session_id,
                        ServerFrame::channel_error(error_code(&e), e.to_string(), channel),
                    );
                },
            }
        },
    }
}
