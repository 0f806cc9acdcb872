mod candidate;
mod config;
mod error;
mod media;
mod protocol;
mod registry;
mod room;
mod session;
mod socket;

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, Method},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use socketioxide::extract::SocketRef;
use socketioxide::SocketIo;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};
use crate::media::kurento::KurentoClient;
use crate::media::MediaResourceClient;
use crate::protocol::SignalSink;
use crate::registry::RoomRegistry;
use crate::room::RoomServices;
use crate::socket::SocketSink;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Config,
    pub registry: Arc<RoomRegistry>,
}

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms_active": state.registry.room_count(),
        "participants_active": state.registry.participant_count(),
        "tls_enabled": state.config.tls_enabled,
    }))
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let origins = config.cors_origins();
    if origins.is_empty() {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        return Ok(CorsLayer::permissive());
    }

    let origins = origins
        .iter()
        .map(|s| s.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid origin in GROUPCALL_ALLOWED_ORIGINS")?;
    info!("CORS: restricted to {} origin(s)", origins.len());

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static("content-type")]))
}

// ─── Logging ────────────────────────────────────────────────────────────────

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

// ─── Media server ───────────────────────────────────────────────────────────

/// Try the media server once so a misconfiguration shows up at startup; the
/// client reconnects on demand either way.
async fn connect_media_server(config: &Config) -> KurentoClient {
    match KurentoClient::open(config.media_server_uri.clone(), config.engine_keepalive).await {
        Ok(client) => {
            info!(uri = %client.uri(), "media server reachable");
            client
        }
        Err(e) => {
            warn!(uri = %config.media_server_uri, "media server not reachable yet: {e}");
            KurentoClient::new(config.media_server_uri.clone(), config.engine_keepalive)
        }
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Install rustls CryptoProvider (required by rustls 0.23+) ────────
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    // ── Load configuration ──────────────────────────────────────────────
    let cfg = Config::from_env();
    init_tracing(&cfg);
    cfg.log_summary();

    // ── Core ────────────────────────────────────────────────────────────
    let engine: Arc<dyn MediaResourceClient> = Arc::new(connect_media_server(&cfg).await);

    let (sio_layer, io) = SocketIo::builder().build_layer();
    let sink: Arc<dyn SignalSink> = Arc::new(SocketSink::new(io.clone()));

    let registry = Arc::new(RoomRegistry::new(RoomServices {
        engine,
        sink: sink.clone(),
        engine_timeout: cfg.engine_timeout,
    }));

    io.ns("/", {
        let registry = registry.clone();
        let sink = sink.clone();
        move |socket: SocketRef| {
            let registry = registry.clone();
            let sink = sink.clone();
            async move {
                socket::on_connect(socket, registry, sink).await;
            }
        }
    });

    let cors = build_cors_layer(&cfg)?;
    let bind_addr = cfg.bind_addr.clone();
    let static_dir = cfg.static_dir.clone();
    let tls = if cfg.tls_enabled {
        let cert_path = cfg
            .tls_cert_path
            .clone()
            .context("GROUPCALL_TLS_CERT_PATH must be set when TLS is enabled")?;
        let key_path = cfg
            .tls_key_path
            .clone()
            .context("GROUPCALL_TLS_KEY_PATH must be set when TLS is enabled")?;
        Some((cert_path, key_path))
    } else {
        None
    };

    let state = Arc::new(AppState {
        config: cfg,
        registry,
    });

    // ── Build router ────────────────────────────────────────────────────
    let app = Router::new()
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(&static_dir))
        .layer(sio_layer)
        .layer(cors)
        .with_state(state);

    // ── Start server (plain HTTP or HTTPS) ──────────────────────────────
    match tls {
        Some((cert_path, key_path)) => {
            info!("Loading TLS certificate from: {}", cert_path);
            info!("Loading TLS private key from:  {}", key_path);
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
                .await
                .context("failed to load TLS configuration")?;

            let addr: std::net::SocketAddr = bind_addr
                .parse()
                .with_context(|| format!("invalid bind address {bind_addr}"))?;
            info!("Group call signaling listening on https://{bind_addr}");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!("Group call signaling listening on http://{bind_addr}");
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("cannot bind {bind_addr}"))?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
