use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigRepository, JsonConfig, StorageDriver, ThrottleSettings};
use crate::error::ThrottleResult;
use crate::handlers::{health_check, index, login, ping};
use crate::middleware::{logging_middleware, throttle, ThrottleState};
use crate::rate_limiter::RateLimiter;
use crate::storage::{DatabaseThrottleStorage, MemoryThrottleStorage, RedisThrottleStorage, ThrottleStorage};
use crate::throttle::{Role, ThrottleRequests};
use axum::routing::{get, post};
use axum::{middleware, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Throttle section used when no configuration file is given.
pub fn demo_config() -> JsonConfig {
    JsonConfig::new(json!({
        "security": { "throttle": {
            "except": ["api/*"],
            "presets": {
                "login": {
                    "ip": { "max_attempts": 10, "decay_seconds": 60 },
                    "account": { "max_attempts": 5, "decay_seconds": 300, "field": "email" }
                }
            }
        } }
    }))
}

/// Build the router around a shared throttle policy.
pub fn create_app(throttle_requests: Arc<ThrottleRequests>) -> Router {
    let login_routes = Router::new()
        .route("/login", post(login))
        .route_layer(middleware::from_fn_with_state(
            ThrottleState::new(throttle_requests.clone(), "login"),
            throttle,
        ));

    let default_routes = Router::new()
        .route("/", get(index))
        .route("/api/ping", get(ping))
        .route_layer(middleware::from_fn_with_state(
            ThrottleState::new(throttle_requests, Role::Default),
            throttle,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(login_routes)
        .merge(default_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub async fn new(config: Config) -> ThrottleResult<Self> {
        let repository: Arc<dyn ConfigRepository> = match &config.throttle_config {
            Some(path) => match JsonConfig::from_file(path) {
                Ok(document) => Arc::new(document),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to load throttle configuration, using built-in settings");
                    Arc::new(demo_config())
                }
            },
            None => Arc::new(demo_config()),
        };

        let settings = ThrottleSettings::from_repository(Some(repository.as_ref()));
        let storage = build_storage(&config, &settings).await?;
        let throttle_requests = ThrottleRequests::from_config(RateLimiter::new(storage), repository);

        Ok(Self {
            app: create_app(Arc::new(throttle_requests)),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!("Throttle guard listening on {}", self.bind_addr);
        info!("Health check available at /health");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn build_storage(config: &Config, settings: &ThrottleSettings) -> ThrottleResult<Arc<dyn ThrottleStorage>> {
    info!(driver = ?config.storage, "Selecting throttle storage");

    let storage: Arc<dyn ThrottleStorage> = match config.storage {
        StorageDriver::Memory => {
            let storage = Arc::new(MemoryThrottleStorage::new());
            spawn_cleanup(storage.clone(), config.cleanup_interval_secs);
            storage
        }
        StorageDriver::Database => {
            Arc::new(DatabaseThrottleStorage::connect(&config.database_url, &settings.table).await?)
        }
        StorageDriver::Redis => {
            let storage = RedisThrottleStorage::connect(&config.redis_url)
                .await?
                .with_prefix(settings.prefix.clone());
            info!(reply = %storage.ping().await?, "Redis throttle storage reachable");
            Arc::new(storage)
        }
    };

    Ok(storage)
}

/// Periodically drop expired records from memory storage.
fn spawn_cleanup(storage: Arc<MemoryThrottleStorage>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            storage.purge_expired(SystemClock.now());
        }
    });
}

async fn shutdown_signal() {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
