use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::http::HeaderValue;
use axum::{routing::get, Router};
use tokio::signal;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use pharmaflow_api as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    // Courier provider backend
    let courier: Arc<dyn api::provider::CourierProvider> =
        match cfg.provider_backend.to_ascii_lowercase().as_str() {
            "http" => {
                let base_url = cfg.provider_base_url.clone().ok_or_else(|| {
                    anyhow::anyhow!("provider_base_url is required for the http provider backend")
                })?;
                info!(base_url = %base_url, "using HTTP courier provider");
                Arc::new(api::provider::HttpCourierProvider::new(base_url))
            }
            _ => {
                info!("using static courier provider");
                Arc::new(api::provider::StaticCourierProvider::default())
            }
        };

    let (app_state, event_rx) = api::build_state(cfg.clone(), courier);

    // Event processing loop feeds the push fan-out and cache invalidation.
    tokio::spawn(api::events::process_events(
        event_rx,
        app_state.push.clone(),
        app_state.aggregate_cache.clone(),
    ));

    // Periodic sweeps for idempotency, event dedup and OTP rate-limit tables.
    {
        let services = app_state.services.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                services.idempotency.sweep_expired();
                services.reconciliation.sweep_expired();
            }
        });
    }

    // CORS: explicit origins, or permissive in development.
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = if let Some(origins) = configured_origins {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        warn!("no CORS origins configured; using permissive CORS (development)");
        CorsLayer::permissive()
    } else {
        anyhow::bail!("missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS in production");
    };

    let app = Router::new()
        .route("/", get(|| async { "pharmaflow-api up" }))
        .route("/health", get(|| async { "ok" }))
        .nest("/api/v1", api::api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            cfg.request_timeout_secs,
        )))
        .layer(cors_layer)
        .layer(axum::middleware::from_fn(
            api::request_id::request_id_middleware,
        ))
        .with_state(app_state);

    let addr = SocketAddr::new(cfg.host.parse()?, cfg.port);
    info!("pharmaflow-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
