use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, Query, State, WebSocketUpgrade},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Json, Response},
        routing::{get, post},
    },
    serde_json::Value,
    tracing::{info, warn},
};

use {
    guildrelay_discord::decode_dispatch,
    guildrelay_relay::{Identity, MirrorOutcome},
};

use crate::{
    auth::{MIRROR_ROLE, bearer_token},
    state::GatewayState,
    ws::handle_connection,
};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/mirror", post(mirror_handler));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(prometheus_metrics_handler));

    router.with_state(state)
}

/// Serve until `shutdown` resolves, then shut the relay hub down so open
/// sessions close and in-flight flush timers are cancelled.
pub async fn start_gateway(
    state: Arc<GatewayState>,
    bind: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let sweeper = state.hub.spawn_sweeper();
    let app = build_gateway_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind((bind, port)).await?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    let hub = state.hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("shutdown requested");
        hub.shutdown();
    })
    .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("gateway stopped");
    Ok(())
}

// ── Auth helpers ─────────────────────────────────────────────────────────────

/// Credential from `?token=` or `Authorization: Bearer`.
fn request_token<'a>(query: &'a HashMap<String, String>, headers: &'a HeaderMap) -> Option<&'a str> {
    query
        .get("token")
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(bearer_token)
        })
}

async fn authenticate(
    state: &GatewayState,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Option<Identity> {
    let token = request_token(query, headers)?;
    state.auth.resolve(token).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "unauthorized" })),
    )
        .into_response()
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.hub.is_shut_down() { "stopping" } else { "ok" },
        "version": state.version,
        "protocol": guildrelay_protocol::PROTOCOL_VERSION,
        "connections": state.connection_count(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let Some(identity) = authenticate(&state, &query, &headers).await else {
        warn!(remote = %addr, "ws: rejected unauthenticated upgrade");
        return unauthorized();
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, identity, addr))
}

/// Accepts platform gateway dispatches (`{"t": ..., "d": ...}`, or an array
/// of them) and feeds them to the mirror reconciler.
async fn mirror_handler(
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> Response {
    let authorized = authenticate(&state, &query, &headers)
        .await
        .is_some_and(|id| id.has_any_role(&[MIRROR_ROLE.to_string()]));
    if !authorized {
        return unauthorized();
    }

    let dispatches = match body {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut events = Vec::new();
    for dispatch in &dispatches {
        match decode_dispatch(dispatch) {
            Ok(decoded) => events.extend(decoded),
            Err(e) => {
                warn!(error = %e, "mirror: undecodable dispatch");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response();
            },
        }
    }

    let (mut discarded, mut ingested, mut ignored, mut failed) = (0usize, 0usize, 0usize, 0usize);
    for event in events {
        let channel_id = event.channel_id().to_string();
        match state.reconciler.reconcile(event).await {
            Ok(MirrorOutcome::Discarded) => discarded += 1,
            Ok(MirrorOutcome::Ingested { .. }) => ingested += 1,
            Ok(MirrorOutcome::Ignored) => ignored += 1,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "mirror: event dropped");
                failed += 1;
            },
        }
    }

    Json(serde_json::json!({
        "discarded": discarded,
        "ingested": ingested,
        "ignored": ignored,
        "failed": failed,
    }))
    .into_response()
}

/// Prometheus text exposition. Unauthenticated so scrapers can reach it.
#[cfg(feature = "prometheus")]
async fn prometheus_metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match state.metrics_handle.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not enabled",
        )
            .into_response(),
    }
}
