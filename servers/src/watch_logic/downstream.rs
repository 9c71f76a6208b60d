use crate::watch_logic::model::{ConfigResponse, ContainersResponse, ErrorResponse, HealthResponse, ResourcesResponse};
use crate::watch_logic::state::AppState;
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use lib_common::core::{ConnectionId, ViewerConnection, ViewerMessage, ViewerRequest};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/config", get(config_handler))
        .route("/api/containers", get(containers_handler))
        .route("/api/containers/{container}/resources", get(resources_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves until `shutdown` fires, over TLS when a certificate pair is configured.
pub async fn run(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = state.settings.listen_addr;
    let tls = state.settings.tls.clone();
    let app = router(state);

    if let Some((cert_path, key_path)) = tls {
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .with_context(|| format!("loading TLS pair {} / {}", cert_path.display(), key_path.display()))?;

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        info!(%addr, "Downstream server listening (TLS)");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("TLS server failed")?;
    } else {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        serve(listener, app, shutdown).await?;
    }
    Ok(())
}

/// Plain HTTP on an already bound listener.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Downstream server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down.");
        })
        .await
        .context("HTTP server failed")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        session: state.session.snapshot(),
        viewers: state.hub.connection_count(),
    })
}

async fn config_handler(State(state): State<AppState>) -> Json<ConfigResponse> {
    let settings = &state.settings;
    let (fixed_container, fixed_resource) = if settings.locked {
        (
            settings.initial_target.container().map(str::to_string),
            settings.initial_target.resource().map(str::to_string),
        )
    } else {
        (None, None)
    };

    Json(ConfigResponse {
        default_format: settings.default_format.clone(),
        default_layout: settings.default_layout.clone(),
        locked: settings.locked,
        fixed_container,
        fixed_resource,
        watching: state.session.snapshot().target,
    })
}

async fn containers_handler(State(state): State<AppState>) -> ApiResult<ContainersResponse> {
    let containers = state.catalog.containers().await.map_err(upstream_error)?;
    Ok(Json(ContainersResponse { containers }))
}

async fn resources_handler(
    State(state): State<AppState>,
    Path(container): Path<String>,
) -> ApiResult<ResourcesResponse> {
    let resources = state.catalog.resources(&container).await.map_err(upstream_error)?;
    Ok(Json(ResourcesResponse { container, resources }))
}

fn upstream_error(err: anyhow::Error) -> (StatusCode, Json<ErrorResponse>) {
    warn!(error = %err, "discovery query failed");
    (StatusCode::BAD_GATEWAY, Json(ErrorResponse { error: err.to_string() }))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let ViewerConnection { id, mut receiver } = state.hub.join();

    loop {
        tokio::select! {
            outbound = receiver.recv() => match outbound {
                Some(message) => match message.to_json() {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break; // viewer disconnected
                        }
                    }
                    Err(e) => warn!(viewer = id, error = %e, "failed to encode viewer message"),
                },
                // Released by the hub: shutdown or too slow.
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => handle_text(&state, id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(viewer = id, error = %e, "viewer socket error");
                    break;
                }
            },
        }
    }

    state.hub.leave(id);
}

fn handle_text(state: &AppState, id: ConnectionId, text: &str) {
    match ViewerRequest::parse(text) {
        Ok(request) => {
            // Refusals are already answered to this viewer by the hub.
            let _ = state.hub.handle_retarget_request(&state.session, id, request.target());
        }
        Err(err) => {
            warn!(viewer = id, error = %err, "dropping malformed viewer request");
            state.hub.send_to(id, ViewerMessage::from(&err));
        }
    }
}
