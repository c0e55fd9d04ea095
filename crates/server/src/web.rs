use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use camcast_protocol::{
    CamcastConfig, IceConfig, IceServerInfo, JPEG_CONTENT_TYPE, SignalingPayload,
    SignalingResponse, TrickleMessage,
};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, warn};

use crate::mjpeg;
use crate::signaling::{Orchestrator, SignalingError};
use crate::source::FrameSource;

/// Shared application state.
pub struct AppState {
    pub config: CamcastConfig,
    pub frames: Arc<dyn FrameSource>,
    pub orchestrator: Orchestrator,
}

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

const HELP_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>camcast</title></head>
<body>
<h1>camcast</h1>
<ul>
<li><a href="/snapshot">/snapshot</a> - a single JPEG image</li>
<li><a href="/mjpeg">/mjpeg</a> - live MJPEG stream</li>
<li><code>POST /webrtc</code> - WebRTC signaling (JSON or raw SDP offer)</li>
</ul>
</body>
</html>
"#;

const SNAPSHOT_ERROR_PAGE: &str =
    "<html><body><h1>Snapshot unavailable</h1><p>The camera did not return an image.</p></body></html>";

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Every signaling response, errors and preflight included, is readable cross-origin.
    let webrtc = Router::new()
        .route(
            "/webrtc",
            post(webrtc_signal)
                .options(webrtc_preflight)
                .fallback(webrtc_bad_method),
        )
        .layer(RequestBodyLimitLayer::new(state.config.server.max_body_bytes))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ));

    Router::new()
        .route("/snapshot", get(snapshot))
        .route("/mjpeg", get(mjpeg_stream))
        .merge(webrtc)
        .fallback(help_page)
        .with_state(state)
}

/// GET /snapshot - one JPEG straight from the frame source
async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    let data = match state.frames.snapshot().await {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => {
            warn!("Snapshot capture returned an empty image");
            return snapshot_error();
        }
        Err(e) => {
            warn!("Snapshot capture failed: {e}");
            return snapshot_error();
        }
    };

    (
        [
            (header::CONTENT_TYPE, JPEG_CONTENT_TYPE.to_string()),
            (header::CONTENT_LENGTH, data.len().to_string()),
            (header::CACHE_CONTROL, NO_CACHE.to_string()),
        ],
        data,
    )
        .into_response()
}

fn snapshot_error() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CACHE_CONTROL, NO_CACHE)],
        Html(SNAPSHOT_ERROR_PAGE),
    )
        .into_response()
}

/// GET /mjpeg - multipart stream, one part per new frame
async fn mjpeg_stream(State(state): State<Arc<AppState>>) -> Response {
    mjpeg::response(Arc::clone(&state.frames), &state.config.stream.boundary)
}

/// OPTIONS /webrtc - CORS preflight
async fn webrtc_preflight() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
        ],
    )
}

async fn webrtc_bad_method() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "Use POST for WebRTC signaling")
}

/// POST /webrtc - trickle-flow messages or a single-shot offer, told apart by shape
async fn webrtc_signal(State(state): State<Arc<AppState>>, body: String) -> Response {
    let payload = match SignalingPayload::parse(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Rejected signaling payload: {e}");
            return (StatusCode::BAD_REQUEST, format!("Bad request: {e}")).into_response();
        }
    };

    let orchestrator = &state.orchestrator;
    match payload {
        SignalingPayload::Trickle(TrickleMessage::Request) => {
            match orchestrator.create_offer().await {
                Ok((id, sdp)) => Json(SignalingResponse::Offer {
                    sdp,
                    id,
                    ice_servers: advertised_ice_servers(&state.config.ice),
                })
                .into_response(),
                Err(e) => signaling_failure("Failed to create WebRTC offer", &e),
            }
        }
        SignalingPayload::Trickle(TrickleMessage::Answer { id, sdp }) => {
            match orchestrator.process_answer(id, sdp).await {
                Ok(()) => Json(json!({})).into_response(),
                Err(e) => signaling_failure("Failed to apply WebRTC answer", &e),
            }
        }
        SignalingPayload::Trickle(TrickleMessage::RemoteCandidate { id, candidates }) => {
            for candidate in candidates {
                orchestrator.add_ice_candidate(id, candidate).await;
            }
            Json(json!({})).into_response()
        }
        SignalingPayload::Offer(sdp) => match orchestrator.process_offer(sdp).await {
            Ok(answer) => Json(SignalingResponse::Answer { sdp: answer }).into_response(),
            Err(e) => signaling_failure("Failed to answer WebRTC offer", &e),
        },
    }
}

fn signaling_failure(reason: &'static str, err: &SignalingError) -> Response {
    error!("{reason}: {err}");
    (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
}

/// ICE servers echoed to clients in offers; empty unless advertising is enabled.
fn advertised_ice_servers(ice: &IceConfig) -> Vec<IceServerInfo> {
    if !ice.advertise {
        return Vec::new();
    }
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: ice.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone(),
            credential: ice.turn_credential.clone(),
        });
    }
    servers
}

/// Any other path
async fn help_page() -> Html<&'static str> {
    Html(HELP_PAGE)
}
