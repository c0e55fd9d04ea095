mod completion;
mod config;
mod engine;
mod feeder;
mod mjpeg;
mod session;
mod signaling;
mod source;
mod web;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::engine::{PeerEngine, VideoSink, WebRtcEngine};
use crate::session::PeerRegistry;
use crate::signaling::{NegotiationSettings, Orchestrator};
use crate::source::{FrameHub, FrameSource};
use crate::web::AppState;

/// How often sessions stuck in negotiation are checked for.
const REAP_INTERVAL: Duration = Duration::from_secs(15);

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/camcast.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

/// Resolves on SIGINT or SIGTERM, then closes the frame hub so open MJPEG
/// streams end and the server can drain.
async fn shutdown_signal(hub: Arc<FrameHub>) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
    hub.close();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    // Load and validate configuration
    let config = config::load_config(&config_path, port_override)?;
    config::check(&config)?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    // Shared latest-frame buffer for /snapshot and /mjpeg
    let hub = Arc::new(FrameHub::new(
        config.stream.max_viewers,
        Duration::from_millis(config.stream.snapshot_timeout_ms),
    ));

    // Connected WebRTC peers keep capture running and drive the H.264 feeder.
    let (stream_active_tx, stream_active_rx) = watch::channel(false);
    let hold_hub = Arc::clone(&hub);
    let registry = Arc::new(
        PeerRegistry::new(config.signaling.max_peers).with_stream_active_callback(
            move |active| {
                hold_hub.hold(active);
                stream_active_tx.send_replace(active);
            },
        ),
    );

    let engine = Arc::new(
        WebRtcEngine::new(&config.ice).context("Failed to initialize WebRTC engine")?,
    );
    let orchestrator = Orchestrator::new(
        Arc::clone(&engine) as Arc<dyn PeerEngine>,
        Arc::clone(&registry),
        NegotiationSettings::from(&config.signaling),
    );

    // Demo capture pipelines
    let mut feeders = Vec::new();
    match config.stream.feeder_dir.as_deref() {
        Some(dir) => {
            let frames = feeder::load_jpegs(Path::new(dir))?;
            tracing::info!(dir, frames = frames.len(), "Loaded JPEG frames");
            feeders.push(tokio::spawn(feeder::run_jpeg_feeder(
                Arc::clone(&hub),
                frames,
                config.stream.feeder_fps,
            )));
        }
        None => {
            tracing::warn!(
                "No stream.feeder_dir configured: /snapshot and /mjpeg will wait for frames \
                 that never arrive"
            );
        }
    }
    match config.signaling.h264_file.as_deref() {
        Some(path) => {
            let stream = feeder::load_h264(Path::new(path))?;
            feeders.push(tokio::spawn(feeder::run_h264_feeder(
                Arc::clone(&engine) as Arc<dyn VideoSink>,
                stream,
                config.stream.feeder_fps,
                stream_active_rx,
            )));
        }
        None => {
            tracing::warn!("No signaling.h264_file configured: WebRTC peers will receive no video");
        }
    }

    // Build app state and router
    let state = Arc::new(AppState {
        config,
        frames: Arc::clone(&hub) as Arc<dyn FrameSource>,
        orchestrator,
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    // Background task: reap peer sessions that never finish negotiating
    let negotiation_timeout = state.config.signaling.negotiation_timeout_secs;
    let reaper = if negotiation_timeout > 0 {
        let reaper_state = Arc::clone(&state);
        Some(tokio::spawn(async move {
            let max_age = Duration::from_secs(negotiation_timeout);
            loop {
                tokio::time::sleep(REAP_INTERVAL).await;
                let reaped = reaper_state.orchestrator.reap_stale(max_age).await;
                if reaped > 0 {
                    tracing::info!(
                        reaped,
                        peers = reaper_state.orchestrator.registry().len(),
                        "Reaped stale peer sessions (negotiating > {negotiation_timeout}s)"
                    );
                }
            }
        }))
    } else {
        tracing::info!("Stale negotiation reaping disabled (negotiation_timeout_secs = 0)");
        None
    };

    // Print startup banner
    tracing::info!("===========================================");
    tracing::info!("  camcast camera server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&hub)))
        .await
        .context("HTTP server error")?;

    // Graceful shutdown: release every peer connection
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    state.orchestrator.close_all().await;
    hub.close();
    for feeder in feeders {
        feeder.abort();
    }

    tracing::info!("camcast server shut down cleanly");

    Ok(())
}
