use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub kv_tier: KvTierMode,
    pub rate_limits: RateLimitConfig,
    /// Controls the `Secure` attribute on the viewer-id cookie.
    pub production: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
    /// No durable store; counters, rollups and the audit log live in
    /// the shared tier / process memory only.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvTierMode {
    Memory,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-route fixed-window limits, requests per minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub write_per_min: u32,
    pub read_per_min: u32,
    pub admin_per_min: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            write_per_min: 120,
            read_per_min: 300,
            admin_per_min: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            "off" | "none" => DatabaseBackend::Off,
            "sqlite" => DatabaseBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, postgres, off"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./pulse.db".to_string());

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);

        let kv_tier = match std::env::var("KV_TIER")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "off" | "none" => KvTierMode::Off,
            "memory" => KvTierMode::Memory,
            other => {
                tracing::warn!(
                    "Unknown KV_TIER '{other}', falling back to 'memory'. Supported values: memory, off"
                );
                KvTierMode::Memory
            }
        };

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()?;

        let rate_limits = RateLimitConfig {
            write_per_min: env_u32("RATE_LIMIT_WRITE_PER_MIN", 120),
            read_per_min: env_u32("RATE_LIMIT_READ_PER_MIN", 300),
            admin_per_min: env_u32("RATE_LIMIT_ADMIN_PER_MIN", 30),
        };

        let production = std::env::var("PRODUCTION")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            server: ServerConfig { host, port },
            kv_tier,
            rate_limits,
            production,
        })
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
