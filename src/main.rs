//! DriftBox server binary.
//!
//! Wires together the chunk buffer, the session registry, the filesystem
//! object store and the JSONL file catalog, then exposes the upload
//! pipeline over an Axum router.

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, patch, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use driftbox::background::spawn_background_tasks;
use driftbox::catalog::JsonlCatalog;
use driftbox::chunk_store::ChunkStore;
use driftbox::config::{Args, CATALOG_FILE_NAME, CHUNK_DIR_NAME, OBJECT_DIR_NAME};
use driftbox::http::{add_security_headers, build_cors_layer};
use driftbox::object_store::FsObjectStore;
use driftbox::orchestrator::UploadOrchestrator;
use driftbox::session::SessionRegistry;
use driftbox::{api, logging, version};

/// Starts the DriftBox server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let data_dir = PathBuf::from(&args.data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let store = ChunkStore::new(data_dir.join(CHUNK_DIR_NAME));
    store.ensure_root().await?;
    let objects = Arc::new(FsObjectStore::new(data_dir.join(OBJECT_DIR_NAME)));
    objects.ensure_root().await?;
    let catalog = Arc::new(JsonlCatalog::new(data_dir.join(CATALOG_FILE_NAME)));
    let orchestrator = Arc::new(UploadOrchestrator::new(
        SessionRegistry::new(store),
        objects,
        catalog,
        args.upload_limits(),
    ));

    let restored = orchestrator
        .restore_sessions()
        .await
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    if restored > 0 {
        info!(restored, "in-flight upload sessions restored");
    }

    let mut app = Router::new()
        .route("/api/upload/init", post(api::init_upload))
        .route(
            "/api/upload/chunk",
            patch(api::accept_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/status", get(api::session_status))
        .route("/api/upload/complete", post(api::complete_upload))
        .route("/api/upload/cancel", post(api::cancel_upload))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(orchestrator.clone()));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(orchestrator);
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
