use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::{
    config::server::{Config, DatabaseConfig, LogFormat},
    models::ChatGroupType,
};
use sqlx::{Executor, postgres::PgPoolOptions};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    db::{MemoryStore, PgStore, bootstrap},
    middleware::request_context::{self, RequestIdState},
    routes,
    services::{
        ChatEngine, EngineDeps,
        event_publisher::BroadcastPublisher,
        membership::{CachedMembership, GroupMembershipLookup, PgMembership, StaticMembership},
    },
    tracer,
};

/// Demo resources mirrored from `scripts/pg/seed/001_demo.sql`.
pub const DEMO_GROUP_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0001);
pub const DEMO_THREAD_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0002);

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|err| {
                    warn!(error = %err, "global metrics recorder already installed; metrics will not be exported");
                    PrometheusBuilder::new().build_recorder().handle()
                })
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Installs the global subscriber. A second call is a no-op.
pub fn initialize_tracing(config: &Config) {
    let builder = fmt::fmt()
        .with_env_filter(build_env_filter(config))
        .with_target(false)
        .with_level(true);

    let installed = match config.logging.format {
        LogFormat::Json => builder.json().with_ansi(false).try_init(),
        LogFormat::Text => builder.with_ansi(true).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .parse_lossy("")
    })
}

/// Connects the pool; every connection gets the configured statement timeout.
///
/// # Errors
/// Returns an error if no connection can be established.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let timeout_ms = db.statement_timeout_ms;
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET statement_timeout = {timeout_ms}").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect(&db.url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    metrics::gauge!("db_statement_timeout_ms").set(timeout_ms as f64);
    Ok(pool)
}

fn cached<L: GroupMembershipLookup + 'static>(
    lookup: L,
    config: &Config,
) -> Arc<dyn GroupMembershipLookup> {
    Arc::new(CachedMembership::new(
        lookup,
        Duration::from_secs(config.membership.cache_ttl_seconds),
    ))
}

/// State backed by Postgres: connects, bootstraps and probes the schema.
///
/// # Errors
/// Returns an error if the database is unreachable or bootstrap fails.
pub async fn postgres_state(config: Arc<Config>) -> anyhow::Result<Arc<AppState>> {
    let pool = create_database_pool(&config.db)
        .await
        .context("failed to connect to the database")?;
    bootstrap::ensure_liveness(&pool)
        .await
        .context("database liveness check failed")?;
    if config.db.run_bootstrap {
        bootstrap::run(&pool, &config.db)
            .await
            .context("database bootstrap failed")?;
    }
    bootstrap::ensure_readiness(&pool)
        .await
        .context("database readiness check failed")?;

    let events = Arc::new(BroadcastPublisher::new(config.events.channel_capacity));
    let deps = EngineDeps::from_store(
        Arc::new(PgStore::new(pool.clone())),
        cached(PgMembership::new(pool.clone()), &config),
        events.clone(),
    );
    let engine = ChatEngine::new(deps, &config.reconcile);

    Ok(Arc::new(AppState {
        engine,
        events,
        pool: Some(pool),
        config,
    }))
}

/// State backed by [`MemoryStore`] seeded with the demo group and thread.
/// Membership is static and starts empty.
pub async fn in_memory_state(config: Arc<Config>) -> Arc<AppState> {
    let store = Arc::new(MemoryStore::new());
    store.insert_group(DEMO_GROUP_ID, ChatGroupType::Chat).await;
    store.insert_thread(DEMO_THREAD_ID, DEMO_GROUP_ID, None).await;
    in_memory_state_with(config, store, Arc::new(StaticMembership::new()))
}

/// State over caller-supplied in-memory collaborators.
pub fn in_memory_state_with(
    config: Arc<Config>,
    store: Arc<MemoryStore>,
    membership: Arc<StaticMembership>,
) -> Arc<AppState> {
    let events = Arc::new(BroadcastPublisher::new(config.events.channel_capacity));
    let deps = EngineDeps::from_store(store, membership, events.clone());
    let engine = ChatEngine::new(deps, &config.reconcile);
    Arc::new(AppState {
        engine,
        events,
        pool: None,
        config,
    })
}

pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let request_id_state = RequestIdState::from_config(&state.config);

    Router::new()
        .nest("/api", routes::create_api_router())
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves on Ctrl+C, or when `token` is cancelled.
pub async fn create_shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutting down..."),
            Err(err) => {
                warn!(error = %err, "failed to install Ctrl+C handler");
                token.cancelled().await;
            }
        },
        () = token.cancelled() => info!("Shutdown requested"),
    }
}

/// Starts the server and blocks until shutdown.
///
/// # Errors
/// Returns an error if the state cannot be built or the listener fails.
pub async fn run(config: Config, in_memory: bool) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, in_memory, "Starting huddle server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let state = if in_memory {
        in_memory_state(config.clone()).await
    } else {
        postgres_state(config.clone()).await?
    };

    let shutdown = CancellationToken::new();
    let sweep = (config.reconcile.sweep_interval_seconds > 0).then(|| {
        state.engine.reconciler().spawn_sweep(
            Duration::from_secs(config.reconcile.sweep_interval_seconds),
            shutdown.clone(),
        )
    });

    let app = create_app_router(state.clone(), metrics_handle);
    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.server.host, config.server.port))?;
    info!(addr = %listener.local_addr()?, "Listening");

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(handle) = sweep {
        if let Err(err) = handle.await {
            warn!(error = %err, "sweep task ended abnormally");
        }
    }
    let drain = tokio::time::timeout(Duration::from_secs(5), state.engine.reconciler().settled());
    if drain.await.is_err() {
        warn!(
            pending = state.engine.reconciler().pending(),
            "shutting down with reconciliation passes still pending"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let state = in_memory_state(Arc::new(Config::default())).await;
        create_app_router(state, metrics_handle())
    }

    async fn get_status(uri: &str) -> StatusCode {
        app()
            .await
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn health_endpoints_respond_in_memory() {
        assert_eq!(get_status("/healthz").await, StatusCode::OK);
        assert_eq!(get_status("/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text() {
        let response = app()
            .await
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        assert_eq!(get_status("/api/openapi.json").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn demo_thread_is_seeded_in_memory() {
        let state = in_memory_state(Arc::new(Config::default())).await;
        let audience = state
            .engine
            .audience()
            .audience_for(DEMO_THREAD_ID)
            .await
            .unwrap();
        assert!(audience.is_empty());
    }

    #[test]
    fn env_filter_falls_back_to_configured_level() {
        let mut config = Config::default();
        config.logging.level = "not-a-level".into();
        let filter = build_env_filter(&config);
        assert!(!filter.to_string().is_empty());
    }
}
