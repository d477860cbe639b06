use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration, loaded from the environment (and `.env` in dev).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub providers: ProvidersConfig,
    pub observability: ObservabilityConfig,
    pub pipeline: PipelineConfig,
    /// Storage backend: "postgres" (default) or "memory" for local dev.
    pub store: StoreKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "text" or "json"
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Per-request deadline for a single upstream attempt chain.
    pub request_timeout_secs: u64,
    /// Total wall-clock budget across retries and fallbacks.
    pub total_budget_secs: u64,
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.total_budget_secs)
    }
}

/// Load configuration from the environment. Missing optional values fall
/// back to development defaults; a missing OpenAI key is tolerated at load
/// time (the adapter reports itself unavailable) so the memory-store dev
/// mode works out of the box.
pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let store = match env_or("LCP_STORE", "postgres").to_lowercase().as_str() {
        "memory" => StoreKind::Memory,
        "postgres" => StoreKind::Postgres,
        other => anyhow::bail!("LCP_STORE must be 'postgres' or 'memory', got '{}'", other),
    };

    Ok(Config {
        server: ServerConfig {
            host: env_or("LCP_HOST", "0.0.0.0"),
            port: parse_env("LCP_PORT", 8080)?,
            read_timeout_secs: parse_env("LCP_READ_TIMEOUT_SECS", 30)?,
            write_timeout_secs: parse_env("LCP_WRITE_TIMEOUT_SECS", 90)?,
            shutdown_timeout_secs: parse_env("LCP_SHUTDOWN_TIMEOUT_SECS", 15)?,
        },
        database: DatabaseConfig {
            url: env_or("DATABASE_URL", "postgres://localhost/controlplane"),
            max_open_conns: parse_env("LCP_DB_MAX_OPEN", 20)?,
            max_idle_conns: parse_env("LCP_DB_MAX_IDLE", 5)?,
            conn_max_lifetime_secs: parse_env("LCP_DB_CONN_LIFETIME_SECS", 1800)?,
        },
        providers: ProvidersConfig {
            openai: OpenAiConfig {
                api_key: env_or("OPENAI_API_KEY", ""),
                base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
                timeout_secs: parse_env("OPENAI_TIMEOUT_SECS", 30)?,
                max_retries: parse_env("OPENAI_MAX_RETRIES", 3)?,
                organization: std::env::var("OPENAI_ORGANIZATION").ok(),
            },
        },
        observability: ObservabilityConfig {
            log_level: env_or("LCP_LOG_LEVEL", "controlplane=debug,tower_http=info"),
            log_format: env_or("LCP_LOG_FORMAT", "text"),
        },
        pipeline: PipelineConfig {
            request_timeout_secs: parse_env("LCP_REQUEST_TIMEOUT_SECS", 30)?,
            total_budget_secs: parse_env("LCP_TOTAL_BUDGET_SECS", 60)?,
        },
        store,
    })
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {}: '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}
