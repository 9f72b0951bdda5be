#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # clipd
//!
//! Rolling network capture daemon. Browser taps stream network events to
//! `/api/tap`; the engine keeps a 24-hour rolling buffer on disk and ships
//! sanitized HAR clips of any time window to a remote object store on
//! demand, driven by an authenticated REST control plane.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use clipd::{
    auth::ApiKey, buffer::BufferManager, capture::CapturePipeline, clip::ClipBuilder,
    config::Config, config::SettingsHandle, routes, state::AppState, store::Store, ws,
};

/// Buffer manager period.
const CLEANUP_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(5 * 60);

/// Rolling network capture daemon.
#[derive(Parser)]
#[command(name = "clipd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("clipd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set CLIPD_API_KEY or update config");
    }

    let data_dir = PathBuf::from(&config.server.data_dir);
    let db_path = data_dir.join("capture.db");
    let store = match Store::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open capture store at {}: {e}", db_path.display());
            std::process::exit(1);
        }
    };
    info!("Capture store: {}", db_path.display());

    let settings = SettingsHandle::load(Path::new(&config.server.data_dir), &config.remote);

    // The persisted paused flag in store metadata is authoritative over
    // whatever the settings file says.
    match store.get_meta::<bool>("paused").await {
        Ok(Some(paused)) => {
            settings.update(|s| s.paused = paused);
            if paused {
                info!("Capture was paused before shutdown, staying paused");
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to read paused flag: {e}"),
    }

    let capture = Arc::new(CapturePipeline::new(Arc::clone(&store)));
    let buffer = Arc::new(BufferManager::new(Arc::clone(&store), settings.clone()));
    let clips = Arc::new(ClipBuilder::new(
        Arc::clone(&store),
        Arc::clone(&capture),
        settings.clone(),
        config.remote.bucket.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        store: Arc::clone(&store),
        capture: Arc::clone(&capture),
        settings: settings.clone(),
        buffer: Arc::clone(&buffer),
        clips,
    };

    // Settings watcher: pausing tears down the pipeline, a cap change
    // triggers an immediate cleanup pass.
    let watcher_capture = Arc::clone(&capture);
    let watcher_buffer = Arc::clone(&buffer);
    let mut settings_rx = settings.subscribe();
    let watcher_task = tokio::spawn(async move {
        let mut prev = settings_rx.borrow().clone();
        while settings_rx.changed().await.is_ok() {
            let current = settings_rx.borrow_and_update().clone();
            if current.paused && !prev.paused {
                info!("Capture paused, detaching all taps");
                watcher_capture.pause().await;
            }
            if current.storage_cap_class != prev.storage_cap_class {
                info!("Storage cap changed, running cleanup pass");
                watcher_buffer.run().await;
            }
            prev = current;
        }
    });

    // Periodic buffer manager pass; the first tick runs at startup.
    let sweep_buffer = Arc::clone(&buffer);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            sweep_buffer.run().await;
        }
    });

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/status", get(routes::status::get_status))
        .route("/api/capture", get(routes::status::get_capture_status))
        .route(
            "/api/buffer",
            get(routes::status::get_buffer_status).delete(routes::control::clear_buffer),
        )
        .route("/api/storage", get(routes::status::get_storage_status))
        .route("/api/clips", post(routes::clips::create_clip))
        .route("/api/capture/pause", post(routes::control::pause_capture))
        .route("/api/capture/resume", post(routes::control::resume_capture))
        .route("/api/cleanup", post(routes::control::run_cleanup))
        .route("/api/remote/test", post(routes::control::test_remote))
        .route(
            "/api/settings",
            get(routes::control::get_settings).patch(routes::control::patch_settings),
        )
        .layer(middleware::from_fn(clipd::auth::require_api_key));

    let ws_route = Router::new().route("/api/tap", get(ws::tap_upgrade));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    watcher_task.abort();
    capture.pause().await;
    store.close().await;
    info!("Goodbye");
}
