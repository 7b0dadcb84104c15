use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use pulse::api::{self, AppState};
use pulse::config::{Config, DatabaseBackend, KvTierMode};
use pulse::kv::{KvTier, MemoryKv};
use pulse::storage::{DurableStore, PostgresStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    // Shared low-latency tier
    let kv: Option<Arc<dyn KvTier>> = match config.kv_tier {
        KvTierMode::Memory => {
            info!("Using in-process shared tier");
            Some(Arc::new(MemoryKv::new()))
        }
        KvTierMode::Off => {
            info!("Shared tier disabled");
            None
        }
    };

    // Durable store
    let durable: Option<Arc<dyn DurableStore>> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.database.url);
            Some(Arc::new(
                SqliteStore::new(&config.database.url, config.database.max_connections).await?,
            ))
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL storage: {}", config.database.url);
            Some(Arc::new(PostgresStore::new(&config.database.url).await?))
        }
        DatabaseBackend::Off => {
            info!("Durable storage disabled; running memory-only");
            None
        }
    };

    if let Some(durable) = &durable {
        info!("Initializing database...");
        durable.init().await?;
        info!("Database initialized successfully");
    }

    let state = Arc::new(AppState::new(kv, durable, &config));
    let router = api::create_api_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Telemetry API listening on http://{}", addr);
    info!("   - Counter endpoints at http://{}/api/metrics/...", addr);
    info!("   - Event endpoints at http://{}/api/events", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
